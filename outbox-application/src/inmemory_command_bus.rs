use crate::{
    command::InternalCommand, command_handler::CommandHandler, context::AppContext,
    error::AppError,
};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use outbox_domain::dispatch::CommandDispatcher;
use outbox_domain::error::DomainResult;
use outbox_domain::message::MessageEnvelope;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

type CmdHandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + 'a>>;

type CmdHandlerFn = Arc<
    dyn for<'a> Fn(&'a MessageEnvelope, &'a AppContext) -> CmdHandlerFuture<'a> + Send + Sync,
>;

/// 基于内存的命令总线
/// - 以命令的类型判别名注册处理器，每种命令至多一个
/// - 运行时从信封还原具体命令后调用处理器
pub struct InMemoryCommandBus {
    handlers: DashMap<&'static str, CmdHandlerFn>,
}

impl Default for InMemoryCommandBus {
    fn default() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }
}

impl InMemoryCommandBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册命令处理器；同一命令重复注册返回 `AlreadyRegisteredCommand`
    pub fn register<C, H>(&self, handler: Arc<H>) -> Result<(), AppError>
    where
        C: InternalCommand,
        H: CommandHandler<C> + 'static,
    {
        let f: CmdHandlerFn = Arc::new(move |envelope, ctx| {
            let handler = handler.clone();

            Box::pin(async move {
                let cmd = envelope.decode::<C>()?;
                handler.handle(ctx, cmd).await
            })
        });

        match self.handlers.entry(C::MESSAGE_TYPE) {
            Entry::Occupied(_) => Err(AppError::AlreadyRegisteredCommand {
                command: C::MESSAGE_TYPE,
            }),
            Entry::Vacant(slot) => {
                slot.insert(f);
                Ok(())
            }
        }
    }

    /// 以应用上下文分发信封中的命令
    pub async fn dispatch(&self, ctx: &AppContext, envelope: &MessageEnvelope) -> Result<(), AppError> {
        let Some(f) = self
            .handlers
            .get(envelope.message_type())
            .map(|h| h.clone())
        else {
            return Err(AppError::HandlerNotFound(envelope.message_type().to_string()));
        };

        (f)(envelope, ctx).await
    }
}

#[async_trait]
impl CommandDispatcher for InMemoryCommandBus {
    fn handles(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type)
    }

    async fn send(&self, envelope: &MessageEnvelope) -> DomainResult<()> {
        let ctx = AppContext::from_envelope(envelope);
        self.dispatch(&ctx, envelope)
            .await
            .map_err(|e| e.into_dispatch(envelope.message_type()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outbox_domain::error::DomainError;
    use outbox_domain::message::{Message, MessageContext};
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

    #[derive(Debug, Serialize, Deserialize)]
    struct ReserveStock {
        sku: String,
        qty: u32,
    }

    impl Message for ReserveStock {
        const MESSAGE_TYPE: &'static str = "inventory.reserve_stock";
    }
    impl InternalCommand for ReserveStock {}

    #[derive(Default)]
    struct SpyHandler {
        seen: Mutex<Vec<(String, u32, Option<String>)>>,
    }

    #[async_trait]
    impl CommandHandler<ReserveStock> for SpyHandler {
        async fn handle(&self, ctx: &AppContext, cmd: ReserveStock) -> Result<(), AppError> {
            if cmd.qty == 0 {
                return Err(AppError::Validation("qty must be positive".into()));
            }
            self.seen
                .lock()
                .unwrap()
                .push((cmd.sku, cmd.qty, ctx.idempotency_key.clone()));
            Ok(())
        }
    }

    fn envelope(qty: u32) -> MessageEnvelope {
        MessageEnvelope::new(
            &ReserveStock {
                sku: "sku-1".into(),
                qty,
            },
            MessageContext::default(),
        )
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn send_routes_to_typed_handler_with_idempotency_key() {
        let bus = InMemoryCommandBus::new();
        let handler = Arc::new(SpyHandler::default());
        bus.register::<ReserveStock, _>(handler.clone()).unwrap();
        assert!(bus.handles(ReserveStock::MESSAGE_TYPE));

        let env = envelope(2);
        bus.send(&env).await.unwrap();

        let seen = handler.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "sku-1");
        assert_eq!(seen[0].2, Some(env.message_id().to_string()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_registration_is_rejected() {
        let bus = InMemoryCommandBus::new();
        bus.register::<ReserveStock, _>(Arc::new(SpyHandler::default()))
            .unwrap();

        let err = bus
            .register::<ReserveStock, _>(Arc::new(SpyHandler::default()))
            .unwrap_err();
        assert!(matches!(err, AppError::AlreadyRegisteredCommand { .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn handler_failure_becomes_dispatch_error() {
        let bus = InMemoryCommandBus::new();
        bus.register::<ReserveStock, _>(Arc::new(SpyHandler::default()))
            .unwrap();

        let err = bus.send(&envelope(0)).await.unwrap_err();
        match err {
            DomainError::Dispatch { target, reason } => {
                assert_eq!(target, ReserveStock::MESSAGE_TYPE);
                assert!(reason.contains("qty must be positive"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_command_is_not_found() {
        let bus = InMemoryCommandBus::new();
        assert!(!bus.handles(ReserveStock::MESSAGE_TYPE));

        let err = bus
            .dispatch(&AppContext::default(), &envelope(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::HandlerNotFound(_)));
    }
}
