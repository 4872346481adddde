//! 内存通知总线（InMemoryNotificationBus）
//!
//! 启动时登记订阅者，按类型判别名建立索引；发布时对匹配的订阅者并发执行（有上限），
//! 任一订阅者失败则整条通知视为投递失败。重试时全部订阅者会再次收到，需幂等。
//!
use crate::context::AppContext;
use crate::notification::{HandledMessageType, NotificationHandler};
use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use outbox_domain::dispatch::NotificationDispatcher;
use outbox_domain::error::{DomainError, DomainResult};
use outbox_domain::message::MessageEnvelope;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// 订阅关系：按类型判别名的订阅者，以及订阅全部通知的处理器
#[derive(Clone, Default)]
struct Subscriptions {
    by_type: HashMap<String, Vec<Arc<dyn NotificationHandler>>>,
    catch_all: Vec<Arc<dyn NotificationHandler>>,
}

impl Subscriptions {
    fn subscribe(&mut self, handler: Arc<dyn NotificationHandler>) {
        let types = match handler.handled_message_type() {
            HandledMessageType::All => {
                self.catch_all.push(handler);
                return;
            }
            HandledMessageType::One(t) => vec![t],
            HandledMessageType::Many(ts) => ts,
        };

        for t in types {
            let subscribers = self.by_type.entry(t).or_default();
            // 同一处理器对同一类型只收一次
            if !subscribers.iter().any(|s| Arc::ptr_eq(s, &handler)) {
                subscribers.push(handler.clone());
            }
        }
    }

    fn has_subscribers(&self, message_type: &str) -> bool {
        !self.catch_all.is_empty() || self.by_type.contains_key(message_type)
    }

    fn subscribers<'a>(
        &'a self,
        message_type: &str,
    ) -> impl Iterator<Item = &'a Arc<dyn NotificationHandler>> + 'a {
        self.by_type
            .get(message_type)
            .into_iter()
            .flatten()
            .chain(self.catch_all.iter())
    }
}

pub struct InMemoryNotificationBus {
    subscriptions: Subscriptions,
    concurrency: usize,
}

impl InMemoryNotificationBus {
    pub fn new(handlers: Vec<Arc<dyn NotificationHandler>>) -> Self {
        let mut subscriptions = Subscriptions::default();
        for handler in handlers {
            subscriptions.subscribe(handler);
        }

        Self {
            subscriptions,
            concurrency: 8,
        }
    }

    /// 单条通知的处理器并发上限
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

async fn notify(
    handler: Arc<dyn NotificationHandler>,
    ctx: &AppContext,
    envelope: &MessageEnvelope,
) -> Option<String> {
    let err = handler.handle(ctx, envelope).await.err()?;
    warn!(
        handler = handler.handler_name(),
        message_id = %envelope.message_id(),
        error = %err,
        "notification handler failed"
    );
    Some(format!("{}: {err}", handler.handler_name()))
}

#[async_trait]
impl NotificationDispatcher for InMemoryNotificationBus {
    fn handles(&self, message_type: &str) -> bool {
        self.subscriptions.has_subscribers(message_type)
    }

    async fn publish(&self, envelope: &MessageEnvelope) -> DomainResult<()> {
        let ctx = AppContext::from_envelope(envelope);

        let mut pending = Vec::new();
        for handler in self.subscriptions.subscribers(envelope.message_type()) {
            pending.push(notify(handler.clone(), &ctx, envelope));
        }

        let outcomes: Vec<Option<String>> = stream::iter(pending)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        let failures: Vec<String> = outcomes.into_iter().flatten().collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DomainError::dispatch(
                envelope.message_type(),
                failures.join("; "),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::DomainNotification;
    use outbox_domain::message::{Message, MessageContext};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Serialize, Deserialize)]
    struct OrderShipped {
        order_id: String,
    }
    impl Message for OrderShipped {
        const MESSAGE_TYPE: &'static str = "orders.order_shipped";
    }
    impl DomainNotification for OrderShipped {}

    #[derive(Debug, Serialize, Deserialize)]
    struct OrderPaid {
        order_id: String,
    }
    impl Message for OrderPaid {
        const MESSAGE_TYPE: &'static str = "orders.order_paid";
    }
    impl DomainNotification for OrderPaid {}

    struct SpyHandler {
        name: &'static str,
        types: HandledMessageType,
        fail: bool,
        handled: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl NotificationHandler for SpyHandler {
        fn handler_name(&self) -> &str {
            self.name
        }
        fn handled_message_type(&self) -> HandledMessageType {
            self.types.clone()
        }
        async fn handle(&self, _ctx: &AppContext, _env: &MessageEnvelope) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("fail requested");
            }
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn spy(name: &'static str, types: HandledMessageType, fail: bool) -> Arc<SpyHandler> {
        Arc::new(SpyHandler {
            name,
            types,
            fail,
            handled: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn shipped() -> MessageEnvelope {
        MessageEnvelope::new(
            &OrderShipped {
                order_id: "o-1".into(),
            },
            MessageContext::default(),
        )
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fan_out_to_one_many_and_all_subscribers() {
        let one = spy("one", HandledMessageType::One(OrderShipped::MESSAGE_TYPE.into()), false);
        let many = spy(
            "many",
            HandledMessageType::Many(vec![
                OrderShipped::MESSAGE_TYPE.into(),
                OrderPaid::MESSAGE_TYPE.into(),
            ]),
            false,
        );
        let all = spy("all", HandledMessageType::All, false);
        let other = spy("other", HandledMessageType::One(OrderPaid::MESSAGE_TYPE.into()), false);

        let bus = InMemoryNotificationBus::new(vec![
            one.clone(),
            many.clone(),
            all.clone(),
            other.clone(),
        ]);
        assert!(bus.handles(OrderShipped::MESSAGE_TYPE));

        bus.publish(&shipped()).await.unwrap();

        assert_eq!(one.handled.load(Ordering::SeqCst), 1);
        assert_eq!(many.handled.load(Ordering::SeqCst), 1);
        assert_eq!(all.handled.load(Ordering::SeqCst), 1);
        assert_eq!(other.handled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn any_failing_handler_fails_the_publish() {
        let ok = spy("ok", HandledMessageType::All, false);
        let bad = spy("bad", HandledMessageType::One(OrderShipped::MESSAGE_TYPE.into()), true);
        let bus = InMemoryNotificationBus::new(vec![ok.clone(), bad]).with_concurrency(2);

        let err = bus.publish(&shipped()).await.unwrap_err();
        match err {
            DomainError::Dispatch { reason, .. } => assert!(reason.contains("bad: fail requested")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(ok.handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn repeated_type_subscription_is_notified_once() {
        let twice = spy(
            "twice",
            HandledMessageType::Many(vec![
                OrderShipped::MESSAGE_TYPE.into(),
                OrderShipped::MESSAGE_TYPE.into(),
            ]),
            false,
        );
        let bus = InMemoryNotificationBus::new(vec![twice.clone()]);

        bus.publish(&shipped()).await.unwrap();
        assert_eq!(twice.handled.load(Ordering::SeqCst), 1);
        assert!(!bus.handles(OrderPaid::MESSAGE_TYPE));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn no_subscribers_means_not_handled() {
        let bus = InMemoryNotificationBus::new(vec![]);
        assert!(!bus.handles(OrderShipped::MESSAGE_TYPE));
    }
}
