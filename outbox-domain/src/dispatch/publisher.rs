//! 出站发布协议（MessagePublisher）
//!
//! 将出站消息交给外部消息代理；返回成功即视为已交付。
//! 投递语义为“至少一次”，下游需按消息 ID 幂等处理。
//!
use crate::{error::DomainResult as Result, message::MessageEnvelope};
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, envelope: &MessageEnvelope) -> Result<()>;
}

#[async_trait]
impl<T> MessagePublisher for Arc<T>
where
    T: MessagePublisher + ?Sized,
{
    async fn publish(&self, envelope: &MessageEnvelope) -> Result<()> {
        (**self).publish(envelope).await
    }
}
