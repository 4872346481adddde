use outbox_domain::message::{MessageContext, MessageEnvelope};

/// 应用层上下文（Application Context）
///
/// 承载一次处理器调用所需的横切信息：
/// - 链路语境（`MessageContext`）：`correlation_id`、`causation_id`、执行者类型/ID 与自定义头；
/// - 幂等键（`idempotency_key`）：投递为“至少一次”，处理器据此去重。
///
/// 典型用法：
/// ```rust
/// use outbox_application::context::AppContext;
/// use outbox_domain::message::MessageContext;
///
/// let ctx = AppContext {
///     context: MessageContext::builder()
///         .correlation_id("cor-123".to_string())
///         .actor_type("user".to_string())
///         .actor_id("u-1".to_string())
///         .build(),
///     idempotency_key: Some("idem-xyz".into()),
/// };
/// assert_eq!(ctx.context.correlation_id(), Some("cor-123"));
/// ```
#[derive(Clone, Debug, Default)]
pub struct AppContext {
    /// 链路语境（追踪、审计主体、操作因果）
    pub context: MessageContext,
    /// 幂等键（可选）
    pub idempotency_key: Option<String>,
}

impl AppContext {
    /// 由落库消息的信封构造：幂等键取消息 ID
    pub fn from_envelope(envelope: &MessageEnvelope) -> Self {
        Self {
            context: envelope.context().clone(),
            idempotency_key: Some(envelope.message_id().to_string()),
        }
    }
}
