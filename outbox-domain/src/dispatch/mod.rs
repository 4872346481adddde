//! 消息投递端口（dispatch）
//!
//! 处理流程只依赖这里的协议，具体实现由应用层注入：
//! - `CommandDispatcher`：进程内命令（`DeliveryType::Internal`）；
//! - `NotificationDispatcher`：进程内通知（同样以 `Internal` 落库）；
//! - `MessagePublisher`：出站消息（`DeliveryType::Outbox`）发往外部代理。
//!
//! 入站消息（`DeliveryType::Inbox`）由应用层按载荷类型路由到命令或通知处理器。
//!
mod dispatcher;
mod publisher;
mod publisher_inmemory;

pub use dispatcher::{CommandDispatcher, NotificationDispatcher};
pub use publisher::MessagePublisher;
pub use publisher_inmemory::InMemoryMessagePublisher;
