//! 内存版消息存储（InMemory）
//!
//! 满足仓储与工作单元协议的轻量实现，典型用途：测试环境、示例与本地开发。
//! - 工作单元内的写入先暂存，读取可见自身暂存；
//! - 提交时在同一把锁内按版本校验全部暂存写入，任一不符则整体失败（`Conflict`/`Concurrency`），
//!   以此提供与数据库条件更新等价的认领互斥；
//! - `on_commit` 允许业务写入登记到同一工作单元，仅在提交成功后执行。
//!
use crate::error::{DomainError, DomainResult as Result};
use crate::message::{MessageStatus, StoreMessage};
use crate::persist::{
    MessageFilter, MessagePersistenceConnectionFactory, MessagePersistenceRepository, UnitOfWork,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;
use uuid::Uuid;

type Records = HashMap<Uuid, StoreMessage>;

/// 已提交记录的共享存储
#[derive(Clone, Default)]
pub struct InMemoryMessageStore {
    records: Arc<Mutex<Records>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// 已提交记录的只读快照，按 `created_at`、`id` 升序
    pub fn snapshot(&self) -> Vec<StoreMessage> {
        let mut all: Vec<StoreMessage> = self.lock().values().cloned().collect();
        sort_oldest_first(&mut all);
        all
    }
}

#[derive(Debug, Clone, Copy)]
enum Expectation {
    Absent,
    Version(i64),
}

struct Staged {
    expectation: Expectation,
    after: StoreMessage,
}

type CommitHook = Box<dyn FnOnce() + Send>;

/// 内存工作单元
pub struct InMemoryUnitOfWork {
    store: InMemoryMessageStore,
    staged: HashMap<Uuid, Staged>,
    hooks: Vec<CommitHook>,
}

impl InMemoryUnitOfWork {
    pub fn new(store: InMemoryMessageStore) -> Self {
        Self {
            store,
            staged: HashMap::new(),
            hooks: Vec::new(),
        }
    }

    /// 登记一笔业务写入，仅在本工作单元提交成功后执行
    pub fn on_commit(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.hooks.push(Box::new(hook));
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.staged.is_empty() || !self.hooks.is_empty()
    }

    fn current(&self, id: Uuid) -> Option<StoreMessage> {
        if let Some(staged) = self.staged.get(&id) {
            return Some(staged.after.clone());
        }
        self.store.lock().get(&id).cloned()
    }

    // 同一记录多次暂存时保留首次的版本期望
    fn stage(&mut self, after: StoreMessage, expectation: Expectation) {
        let id = after.id();
        match self.staged.get_mut(&id) {
            Some(existing) => existing.after = after,
            None => {
                self.staged.insert(id, Staged { expectation, after });
            }
        }
    }

    fn view(&self) -> Vec<StoreMessage> {
        let mut view: Records = self.store.lock().clone();
        for (id, staged) in &self.staged {
            view.insert(*id, staged.after.clone());
        }
        view.into_values().collect()
    }
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    async fn commit(self) -> Result<()> {
        let InMemoryUnitOfWork {
            store,
            staged,
            hooks,
        } = self;

        {
            let mut records = store.lock();

            for (id, s) in &staged {
                match (s.expectation, records.get(id)) {
                    (Expectation::Absent, None) => {}
                    (Expectation::Absent, Some(_)) => {
                        return Err(DomainError::conflict(format!("message {id} already exists")));
                    }
                    (Expectation::Version(v), Some(current)) if current.version() == v => {}
                    (Expectation::Version(_), Some(_)) => {
                        return Err(DomainError::concurrency(format!(
                            "message {id} was modified by another unit of work"
                        )));
                    }
                    (Expectation::Version(_), None) => {
                        return Err(DomainError::not_found(format!("message {id}")));
                    }
                }
            }

            let count = staged.len();
            for (id, s) in staged {
                records.insert(id, s.after);
            }
            debug!(writes = count, "in-memory unit of work committed");
        }

        for hook in hooks {
            hook();
        }

        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        debug!(
            discarded = self.staged.len(),
            "in-memory unit of work rolled back"
        );
        Ok(())
    }
}

/// 内存连接工厂
#[derive(Clone, Default)]
pub struct InMemoryConnectionFactory {
    store: InMemoryMessageStore,
}

impl InMemoryConnectionFactory {
    pub fn new(store: InMemoryMessageStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &InMemoryMessageStore {
        &self.store
    }
}

#[async_trait]
impl MessagePersistenceConnectionFactory for InMemoryConnectionFactory {
    type Connection = InMemoryMessageStore;
    type UnitOfWork = InMemoryUnitOfWork;

    async fn open_connection(&self) -> Result<Self::Connection> {
        Ok(self.store.clone())
    }

    async fn begin_unit_of_work(&self) -> Result<Self::UnitOfWork> {
        Ok(InMemoryUnitOfWork::new(self.store.clone()))
    }
}

/// 内存仓储：无自身状态，读写均经由工作单元
#[derive(Clone, Copy, Debug, Default)]
pub struct InMemoryMessageRepository;

impl InMemoryMessageRepository {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MessagePersistenceRepository for InMemoryMessageRepository {
    type UnitOfWork = InMemoryUnitOfWork;

    async fn add(&self, uow: &mut Self::UnitOfWork, message: &StoreMessage) -> Result<()> {
        if uow.current(message.id()).is_some() {
            return Err(DomainError::conflict(format!(
                "message {} already exists",
                message.id()
            )));
        }

        uow.stage(message.clone(), Expectation::Absent);
        Ok(())
    }

    async fn get_by_id(&self, uow: &mut Self::UnitOfWork, id: Uuid) -> Result<StoreMessage> {
        uow.current(id)
            .ok_or_else(|| DomainError::not_found(format!("message {id}")))
    }

    async fn get_by_filter(
        &self,
        uow: &mut Self::UnitOfWork,
        filter: &MessageFilter,
    ) -> Result<Vec<StoreMessage>> {
        let mut matched: Vec<StoreMessage> = uow
            .view()
            .into_iter()
            .filter(|m| filter.matches(m))
            .collect();
        sort_oldest_first(&mut matched);

        let page = matched
            .into_iter()
            .skip(filter.offset())
            .take(filter.limit().unwrap_or(usize::MAX))
            .collect();

        Ok(page)
    }

    async fn update(&self, uow: &mut Self::UnitOfWork, message: &StoreMessage) -> Result<()> {
        let current = uow
            .current(message.id())
            .ok_or_else(|| DomainError::not_found(format!("message {}", message.id())))?;

        if current.version() != message.version() {
            return Err(DomainError::concurrency(format!(
                "message {}: expected version {}, found {}",
                message.id(),
                message.version(),
                current.version()
            )));
        }

        let mut after = message.clone();
        after.bump_version();
        uow.stage(after, Expectation::Version(message.version()));
        Ok(())
    }

    async fn change_state(
        &self,
        uow: &mut Self::UnitOfWork,
        id: Uuid,
        from: MessageStatus,
        to: MessageStatus,
    ) -> Result<bool> {
        let current = uow
            .current(id)
            .ok_or_else(|| DomainError::not_found(format!("message {id}")))?;

        if current.message_status() != from {
            return Ok(false);
        }

        let mut after = current.clone();
        after.apply_state_change(to, Utc::now())?;
        after.bump_version();
        uow.stage(after, Expectation::Version(current.version()));
        Ok(true)
    }
}

fn sort_oldest_first(messages: &mut [StoreMessage]) {
    messages.sort_by(|a, b| {
        a.created_at()
            .cmp(&b.created_at())
            .then_with(|| a.id().cmp(&b.id()))
    });
}
