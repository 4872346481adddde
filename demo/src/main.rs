use anyhow::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use outbox_application::command::InternalCommand;
use outbox_application::command_handler::CommandHandler;
use outbox_application::config::MessagePersistenceOptions;
use outbox_application::context::AppContext;
use outbox_application::error::AppError;
use outbox_application::notification::{
    DomainNotification, HandledMessageType, NotificationHandler,
};
use outbox_application::{
    InMemoryCommandBus, InMemoryNotificationBus, MessagePersistenceService,
    MessagePersistenceWorker, WorkerConfig,
};
use outbox_domain::dispatch::InMemoryMessagePublisher;
use outbox_domain::message::{Message, MessageContext, MessageEnvelope, MessageStatus};
use outbox_domain::persist::{
    InMemoryConnectionFactory, InMemoryMessageRepository, MessageFilter, UnitOfWork,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

type Service = MessagePersistenceService<InMemoryConnectionFactory, InMemoryMessageRepository>;

/// 出站：下单事件，交给外部代理
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: String,
    amount: i64,
}
impl Message for OrderPlaced {
    const MESSAGE_TYPE: &'static str = "orders.order_placed";
}

/// 进程内命令：预留库存
#[derive(Debug, Serialize, Deserialize)]
struct ReserveStock {
    order_id: String,
    sku: String,
    qty: u32,
}
impl Message for ReserveStock {
    const MESSAGE_TYPE: &'static str = "inventory.reserve_stock";
}
impl InternalCommand for ReserveStock {}

/// 进程内通知：下单完成
#[derive(Debug, Serialize, Deserialize)]
struct OrderAccepted {
    order_id: String,
}
impl Message for OrderAccepted {
    const MESSAGE_TYPE: &'static str = "orders.order_accepted";
}
impl DomainNotification for OrderAccepted {}

/// 入站：支付成功（来自外部代理）
#[derive(Debug, Serialize, Deserialize)]
struct PaymentCaptured {
    order_id: String,
}
impl Message for PaymentCaptured {
    const MESSAGE_TYPE: &'static str = "payments.payment_captured";
}
impl DomainNotification for PaymentCaptured {}

type Orders = Arc<Mutex<HashMap<String, i64>>>;

#[derive(Default)]
struct StockHandler {
    reserved: Mutex<HashMap<String, u32>>,
}

#[async_trait]
impl CommandHandler<ReserveStock> for StockHandler {
    async fn handle(&self, ctx: &AppContext, cmd: ReserveStock) -> Result<(), AppError> {
        let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        *reserved.entry(cmd.sku.clone()).or_default() += cmd.qty;
        info!(
            order_id = cmd.order_id,
            sku = cmd.sku,
            qty = cmd.qty,
            idempotency_key = ctx.idempotency_key.as_deref(),
            "stock reserved"
        );
        Ok(())
    }
}

struct AuditLog;

#[async_trait]
impl NotificationHandler for AuditLog {
    fn handler_name(&self) -> &str {
        "audit-log"
    }

    fn handled_message_type(&self) -> HandledMessageType {
        HandledMessageType::All
    }

    async fn handle(&self, ctx: &AppContext, envelope: &MessageEnvelope) -> anyhow::Result<()> {
        info!(
            message_type = envelope.message_type(),
            correlation_id = ctx.context.correlation_id(),
            "audit"
        );
        Ok(())
    }
}

struct PaymentProjector {
    paid: Mutex<Vec<String>>,
}

#[async_trait]
impl NotificationHandler for PaymentProjector {
    fn handler_name(&self) -> &str {
        "payment-projector"
    }

    fn handled_message_type(&self) -> HandledMessageType {
        HandledMessageType::One(PaymentCaptured::MESSAGE_TYPE.to_string())
    }

    async fn handle(&self, _ctx: &AppContext, envelope: &MessageEnvelope) -> anyhow::Result<()> {
        let captured = envelope.decode::<PaymentCaptured>()?;
        self.paid
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(captured.order_id);
        Ok(())
    }
}

/// 下单：订单写入与三条消息在同一工作单元内提交
async fn place_order(service: &Service, orders: &Orders, order_id: &str, amount: i64) -> Result<()> {
    let ctx = MessageContext::builder()
        .correlation_id(format!("cor-{order_id}"))
        .actor_type("user".to_string())
        .actor_id("u-1".to_string())
        .build();

    let mut uow = service.begin_unit_of_work().await?;

    let table = orders.clone();
    let (id, value) = (order_id.to_string(), amount);
    uow.on_commit(move || {
        table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, value);
    });

    let placed = MessageEnvelope::new(
        &OrderPlaced {
            order_id: order_id.to_string(),
            amount,
        },
        ctx.clone(),
    )?;
    service.add_publish_message(&mut uow, &placed).await?;
    service
        .add_internal_message(
            &mut uow,
            &ReserveStock {
                order_id: order_id.to_string(),
                sku: "sku-42".to_string(),
                qty: 1,
            },
            ctx.clone(),
        )
        .await?;
    service
        .add_notification(
            &mut uow,
            &OrderAccepted {
                order_id: order_id.to_string(),
            },
            ctx,
        )
        .await?;

    uow.commit().await?;
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,outbox_application=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let options = MessagePersistenceOptions::load()?;
    info!(?options, "options loaded");

    // 外部代理（内存广播）
    let broker = InMemoryMessagePublisher::new(64);
    let mut outbound = broker.subscribe();
    let consumer = tokio::spawn(async move {
        while let Some(delivered) = outbound.next().await {
            match delivered {
                Ok(envelope) => info!(
                    message_id = %envelope.message_id(),
                    message_type = envelope.message_type(),
                    "broker received"
                ),
                Err(err) => warn!(error = %err, "broker stream lagged"),
            }
        }
    });

    let commands = InMemoryCommandBus::new();
    commands.register::<ReserveStock, _>(Arc::new(StockHandler::default()))?;

    let payments = Arc::new(PaymentProjector {
        paid: Mutex::new(Vec::new()),
    });
    let notifications = InMemoryNotificationBus::new(vec![
        Arc::new(AuditLog) as Arc<dyn NotificationHandler>,
        payments.clone(),
    ]);

    let service = Arc::new(
        MessagePersistenceService::builder()
            .connection_factory(InMemoryConnectionFactory::default())
            .repository(InMemoryMessageRepository)
            .command_dispatcher(Arc::new(commands))
            .notification_dispatcher(Arc::new(notifications))
            .message_publisher(Arc::new(broker))
            .options(options.clone())
            .build(),
    );

    let orders: Orders = Arc::new(Mutex::new(HashMap::new()));
    place_order(&service, &orders, "o-1", 1_200).await?;
    place_order(&service, &orders, "o-2", 800).await?;

    // 入站消息重复投递只登记一次
    let captured = MessageEnvelope::with_id(
        Uuid::new_v4(),
        &PaymentCaptured {
            order_id: "o-1".to_string(),
        },
        MessageContext::default(),
    )?;
    for _ in 0..2 {
        let mut uow = service.begin_unit_of_work().await?;
        let outcome = service.add_received_message(&mut uow, &captured).await?;
        uow.commit().await?;
        info!(?outcome, "inbound payment registered");
    }

    let worker = Arc::new(
        MessagePersistenceWorker::builder()
            .service(service.clone())
            .config(WorkerConfig::new(
                Duration::from_millis(100),
                options.reclaim_interval(),
            )?)
            .build(),
    );
    let handle = worker.start();

    let pending = MessageFilter::builder()
        .statuses(vec![MessageStatus::Stored, MessageStatus::InProgress])
        .build();
    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match service.get_by_filter(&pending).await {
                Ok(left) if left.is_empty() => break,
                Ok(_) => tokio::time::sleep(Duration::from_millis(50)).await,
                Err(err) => {
                    warn!(error = %err, "status query failed");
                    break;
                }
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!("timed out waiting for messages to drain");
    }

    handle.shutdown();
    handle.join().await;
    consumer.abort();

    let all = service.get_by_filter(&MessageFilter::all()).await?;
    for message in &all {
        info!(
            id = %message.id(),
            message_type = message.data_type(),
            delivery_type = %message.delivery_type(),
            status = %message.message_status(),
            retry_count = message.retry_count(),
            "final state"
        );
    }
    info!(
        orders = orders.lock().unwrap_or_else(|e| e.into_inner()).len(),
        paid = payments.paid.lock().unwrap_or_else(|e| e.into_inner()).len(),
        messages = all.len(),
        "demo finished"
    );

    Ok(())
}
