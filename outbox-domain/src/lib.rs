//! 消息持久化领域层（outbox-domain）
//!
//! 为事务性 Outbox/Inbox 提供与存储、传输解耦的基础构件：
//! - 消息模型（`message`）：信封、链路上下文、落库记录及其状态机；
//! - 持久化（`persist`）：连接工厂、显式工作单元、消息仓储与查询条件，
//!   附带内存实现与 Postgres 实现（`infra-sqlx` 特性）；
//! - 投递端口（`dispatch`）：命令分发、通知分发与出站发布协议；
//! - 统一错误类型（`error`）。
//!
//! 典型用法：
//! 1. 为载荷实现 `Message`（稳定的类型判别名）；
//! 2. 选择 `persist` 中的存储实现，或为自有存储实现仓储与工作单元协议；
//! 3. 在应用层装配处理服务与后台 worker，注入 `dispatch` 端口的实现。
//!
pub mod dispatch;
pub mod error;
pub mod message;
pub mod persist;
