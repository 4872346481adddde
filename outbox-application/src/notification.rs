//! 进程内通知（Domain Notification）
//!
//! 与命令不同，一条通知可被零到多个处理器订阅。
//! 处理器按类型判别名订阅某一类、多类或全部通知。
//!
use crate::context::AppContext;
use async_trait::async_trait;
use outbox_domain::message::{Message, MessageEnvelope};

/// 进程内通知载荷
pub trait DomainNotification: Message {}

#[derive(Clone, Debug)]
pub enum HandledMessageType {
    One(String),
    Many(Vec<String>),
    All,
}

/// 通知处理器：处理某一类型的通知
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    /// 处理器名称（用于日志与失败原因）
    fn handler_name(&self) -> &str;
    /// 返回该处理器订阅的类型
    fn handled_message_type(&self) -> HandledMessageType;
    /// 处理通知；载荷按需以 `envelope.decode::<T>()` 还原
    async fn handle(&self, ctx: &AppContext, envelope: &MessageEnvelope) -> anyhow::Result<()>;
}
