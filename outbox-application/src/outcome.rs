//! 处理结果
//!
use outbox_domain::message::MessageStatus;
use uuid::Uuid;

/// 单条消息 `process` 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// 投递成功，记录为 `Processed`
    Processed,
    /// 投递失败，记录为 `Failed`
    Failed { retry_count: u32, reason: String },
    /// 未投递
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyProcessed,
    /// 已被其他处理者认领
    InProgress,
    RetriesExhausted,
    /// 认领竞争失败，或处理期间记录已被回收
    ClaimLost,
}

impl ProcessOutcome {
    /// 本次处理后可确定的记录状态
    pub fn status(&self) -> Option<MessageStatus> {
        match self {
            ProcessOutcome::Processed => Some(MessageStatus::Processed),
            ProcessOutcome::Failed { .. } => Some(MessageStatus::Failed),
            ProcessOutcome::Skipped(SkipReason::AlreadyProcessed) => {
                Some(MessageStatus::Processed)
            }
            ProcessOutcome::Skipped(SkipReason::InProgress) => Some(MessageStatus::InProgress),
            ProcessOutcome::Skipped(SkipReason::RetriesExhausted) => Some(MessageStatus::Failed),
            ProcessOutcome::Skipped(SkipReason::ClaimLost) => None,
        }
    }
}

/// `process_all` 汇总
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessAllSummary {
    pub processed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// 存储层错误（该条消息未完成处理，留待下次扫描）
    pub errors: usize,
    /// 扫描因取消而提前结束
    pub cancelled: bool,
}

impl ProcessAllSummary {
    pub(crate) fn record(&mut self, outcome: &ProcessOutcome) {
        match outcome {
            ProcessOutcome::Processed => self.processed += 1,
            ProcessOutcome::Failed { .. } => self.failed += 1,
            ProcessOutcome::Skipped(_) => self.skipped += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.processed + self.failed + self.skipped + self.errors
    }
}

/// 入站消息登记结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Stored(Uuid),
    /// 重复投递，已存在同一去重键的记录
    Duplicate(Uuid),
}

impl ReceiveOutcome {
    pub fn id(&self) -> Uuid {
        match self {
            ReceiveOutcome::Stored(id) | ReceiveOutcome::Duplicate(id) => *id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, ReceiveOutcome::Duplicate(_))
    }
}

/// `reclaim_stuck` 汇总
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimSummary {
    pub reclaimed: usize,
    /// 回收时与正常完成竞争失败
    pub raced: usize,
    /// 存储层错误，留待下次回收
    pub errors: usize,
}
