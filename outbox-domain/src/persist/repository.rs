//! 消息持久化仓储协议
//!
//! 所有操作都在调用方传入的工作单元内执行；同一工作单元内的读取可见自身尚未提交的写入。
//!
use crate::{
    error::DomainResult as Result,
    message::{MessageStatus, StoreMessage},
    persist::MessageFilter,
};
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait MessagePersistenceRepository: Send + Sync {
    type UnitOfWork: Send;

    /// 插入新记录；ID 已存在时返回 `Conflict`
    async fn add(&self, uow: &mut Self::UnitOfWork, message: &StoreMessage) -> Result<()>;

    /// 按 ID 读取；不存在时返回 `NotFound`
    async fn get_by_id(&self, uow: &mut Self::UnitOfWork, id: Uuid) -> Result<StoreMessage>;

    /// 按条件查询，按 `created_at`、`id` 升序并应用分页
    async fn get_by_filter(
        &self,
        uow: &mut Self::UnitOfWork,
        filter: &MessageFilter,
    ) -> Result<Vec<StoreMessage>>;

    /// 乐观并发写入：`message.version()` 须与存储中的版本一致，否则返回 `Concurrency`
    async fn update(&self, uow: &mut Self::UnitOfWork, message: &StoreMessage) -> Result<()>;

    /// 条件状态变更（`from` → `to`），进入 `InProgress` 时记录认领时间；
    /// 返回是否实际变更
    async fn change_state(
        &self,
        uow: &mut Self::UnitOfWork,
        id: Uuid,
        from: MessageStatus,
        to: MessageStatus,
    ) -> Result<bool>;
}

#[async_trait]
impl<T> MessagePersistenceRepository for Arc<T>
where
    T: MessagePersistenceRepository + ?Sized,
{
    type UnitOfWork = T::UnitOfWork;

    async fn add(&self, uow: &mut Self::UnitOfWork, message: &StoreMessage) -> Result<()> {
        (**self).add(uow, message).await
    }

    async fn get_by_id(&self, uow: &mut Self::UnitOfWork, id: Uuid) -> Result<StoreMessage> {
        (**self).get_by_id(uow, id).await
    }

    async fn get_by_filter(
        &self,
        uow: &mut Self::UnitOfWork,
        filter: &MessageFilter,
    ) -> Result<Vec<StoreMessage>> {
        (**self).get_by_filter(uow, filter).await
    }

    async fn update(&self, uow: &mut Self::UnitOfWork, message: &StoreMessage) -> Result<()> {
        (**self).update(uow, message).await
    }

    async fn change_state(
        &self,
        uow: &mut Self::UnitOfWork,
        id: Uuid,
        from: MessageStatus,
        to: MessageStatus,
    ) -> Result<bool> {
        (**self).change_state(uow, id, from, to).await
    }
}
