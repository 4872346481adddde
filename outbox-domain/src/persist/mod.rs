//! 消息持久化（persist）
//!
//! 定义存储协议及其实现：
//! - 连接工厂与显式工作单元（`MessagePersistenceConnectionFactory` / `UnitOfWork`）；
//! - 消息仓储（`MessagePersistenceRepository`）与结构化查询条件（`MessageFilter`）；
//! - 瞬时故障重试策略（`TransientRetryPolicy`）；
//! - 内存实现（`inmemory`）与 Postgres 实现（`postgres`，需 `infra-sqlx` 特性）。
//!
mod connection;
mod filter;
mod inmemory;
#[cfg(feature = "infra-sqlx")]
mod postgres;
mod repository;

pub use connection::{MessagePersistenceConnectionFactory, TransientRetryPolicy, UnitOfWork};
pub use filter::MessageFilter;
pub use inmemory::{
    InMemoryConnectionFactory, InMemoryMessageRepository, InMemoryMessageStore,
    InMemoryUnitOfWork,
};
#[cfg(feature = "infra-sqlx")]
pub use postgres::{
    PgUnitOfWork, PostgresConnectionFactory, PostgresMessageRepository, ensure_schema,
};
pub use repository::MessagePersistenceRepository;
