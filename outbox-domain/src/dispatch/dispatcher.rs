//! 进程内投递协议
//!
use crate::{error::DomainResult as Result, message::MessageEnvelope};
use async_trait::async_trait;
use std::sync::Arc;

/// 命令分发：每个命令类型至多一个处理器
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    /// 是否注册了该类型的处理器
    fn handles(&self, message_type: &str) -> bool;

    async fn send(&self, envelope: &MessageEnvelope) -> Result<()>;
}

/// 通知分发：同一类型可有多个处理器，任一失败即视为投递失败
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    fn handles(&self, message_type: &str) -> bool;

    async fn publish(&self, envelope: &MessageEnvelope) -> Result<()>;
}

#[async_trait]
impl<T> CommandDispatcher for Arc<T>
where
    T: CommandDispatcher + ?Sized,
{
    fn handles(&self, message_type: &str) -> bool {
        (**self).handles(message_type)
    }

    async fn send(&self, envelope: &MessageEnvelope) -> Result<()> {
        (**self).send(envelope).await
    }
}

#[async_trait]
impl<T> NotificationDispatcher for Arc<T>
where
    T: NotificationDispatcher + ?Sized,
{
    fn handles(&self, message_type: &str) -> bool {
        (**self).handles(message_type)
    }

    async fn publish(&self, envelope: &MessageEnvelope) -> Result<()> {
        (**self).publish(envelope).await
    }
}
