//! 消息模型（message）
//!
//! - `Message`：可持久化的消息载荷协议（稳定的类型判别名 + serde）；
//! - `MessageEnvelope` / `MessageContext`：载荷、链路上下文与元数据的信封；
//! - `StoreMessage`：落库记录及其处理状态机（`MessageStatus` / `DeliveryType`）。
//!
mod message_context;
mod message_envelope;
mod message_kind;
mod message_status;
mod store_message;

pub use message_context::MessageContext;
pub use message_envelope::MessageEnvelope;
pub use message_kind::Message;
pub use message_status::{DeliveryType, MessageStatus};
pub use store_message::StoreMessage;
