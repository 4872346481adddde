//! 消息持久化应用层（outbox-application）
//!
//! 在领域层协议之上装配可运行的处理流程：
//! - `MessagePersistenceService`：消息登记、认领、投递、回写与回收；
//! - `InMemoryCommandBus` / `InMemoryNotificationBus`：启动时注册的进程内处理器；
//! - `MessagePersistenceOptions`：基于 `config` 的配置加载；
//! - `MessagePersistenceWorker`：周期扫描与回收的后台任务。
//!
pub mod command;
pub mod command_handler;
pub mod config;
pub mod context;
pub mod error;
pub mod inmemory_command_bus;
pub mod notification;
pub mod notification_bus;
pub mod outcome;
pub mod service;
pub mod worker;

pub use inmemory_command_bus::InMemoryCommandBus;
pub use notification_bus::InMemoryNotificationBus;
pub use service::MessagePersistenceService;
pub use worker::{MessagePersistenceWorker, WorkerConfig, WorkerHandle};
