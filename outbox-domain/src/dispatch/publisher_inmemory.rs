//! 内存版出站发布器（InMemoryMessagePublisher）
//!
//! 以广播通道模拟消息代理，用于测试与本地开发。订阅者可以收取全部消息，
//! 也可以只收取某个类型判别名（相当于代理上的主题）。
//! 无订阅者时发布不报错，消息直接丢弃；订阅者落后超过缓冲区时，其流中产生 `Dispatch` 错误。
//!
use crate::dispatch::MessagePublisher;
use crate::error::{DomainError, DomainResult as Result};
use crate::message::MessageEnvelope;
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;

#[derive(Clone)]
pub struct InMemoryMessagePublisher {
    tx: broadcast::Sender<MessageEnvelope>,
}

impl InMemoryMessagePublisher {
    /// `capacity` 为广播缓冲区容量
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> BoxStream<'static, Result<MessageEnvelope>> {
        Box::pin(self.envelopes())
    }

    /// 只收取指定类型判别名的消息
    pub fn subscribe_to(
        &self,
        message_type: impl Into<String>,
    ) -> BoxStream<'static, Result<MessageEnvelope>> {
        let topic = message_type.into();
        let stream = self.envelopes().filter(move |item| {
            let keep = match item {
                Ok(envelope) => envelope.message_type() == topic,
                Err(_) => true,
            };
            std::future::ready(keep)
        });
        Box::pin(stream)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn envelopes(&self) -> impl futures_core::Stream<Item = Result<MessageEnvelope>> + Send + 'static {
        BroadcastStream::new(self.tx.subscribe()).map(|received| {
            received.map_err(|lagged| DomainError::dispatch("in-memory publisher", lagged.to_string()))
        })
    }
}

impl Default for InMemoryMessagePublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl MessagePublisher for InMemoryMessagePublisher {
    async fn publish(&self, envelope: &MessageEnvelope) -> Result<()> {
        if self.tx.send(envelope.clone()).is_err() {
            trace!(message_id = %envelope.message_id(), "no subscribers, message dropped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, MessageContext};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Shipped {
        order_id: String,
    }

    impl Message for Shipped {
        const MESSAGE_TYPE: &'static str = "order.shipped";
    }

    #[tokio::test]
    async fn subscribers_receive_published_envelopes() {
        let publisher = InMemoryMessagePublisher::new(8);
        let mut stream = publisher.subscribe();

        let env = MessageEnvelope::new(
            &Shipped {
                order_id: "o-1".into(),
            },
            MessageContext::default(),
        )
        .unwrap();
        publisher.publish(&env).await.unwrap();

        let got = stream.next().await.unwrap().unwrap();
        assert_eq!(got, env);
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Cancelled {
        order_id: String,
    }

    impl Message for Cancelled {
        const MESSAGE_TYPE: &'static str = "order.cancelled";
    }

    #[tokio::test]
    async fn topic_subscription_skips_other_types() {
        let publisher = InMemoryMessagePublisher::new(8);
        let mut shipped_only = publisher.subscribe_to(Shipped::MESSAGE_TYPE);
        assert_eq!(publisher.subscriber_count(), 1);

        let cancelled = MessageEnvelope::new(
            &Cancelled {
                order_id: "o-3".into(),
            },
            MessageContext::default(),
        )
        .unwrap();
        let shipped = MessageEnvelope::new(
            &Shipped {
                order_id: "o-3".into(),
            },
            MessageContext::default(),
        )
        .unwrap();
        publisher.publish(&cancelled).await.unwrap();
        publisher.publish(&shipped).await.unwrap();

        let got = shipped_only.next().await.unwrap().unwrap();
        assert_eq!(got.message_id(), shipped.message_id());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let publisher = InMemoryMessagePublisher::default();
        let env = MessageEnvelope::new(
            &Shipped {
                order_id: "o-2".into(),
            },
            MessageContext::default(),
        )
        .unwrap();
        assert!(publisher.publish(&env).await.is_ok());
    }
}
