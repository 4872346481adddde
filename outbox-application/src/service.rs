//! 消息持久化服务（MessagePersistenceService）
//!
//! 编排消息的登记与处理生命周期：
//! - 登记：`add_*` 在调用方的工作单元内写入，与业务写入同一事务提交；
//! - 处理：`process` 分三步，认领（条件状态变更，独立提交）→ 投递 → 回写结果；
//! - 扫描：`process_all` 按创建时间从旧到新处理可处理的消息，单条失败不影响其余；
//! - 回收：`reclaim_stuck` 将认领超时的消息转为 `Failed`，重新进入重试路径。
//!
//! 投递语义为“至少一次”：投递成功但回写失败时，消息会在回收后再次投递。
//!
use crate::command::InternalCommand;
use crate::config::{InboxDeduplication, MessagePersistenceOptions};
use crate::error::AppError;
use crate::notification::DomainNotification;
use crate::outcome::{ProcessAllSummary, ProcessOutcome, ReceiveOutcome, ReclaimSummary, SkipReason};
use bon::Builder;
use chrono::{DateTime, Utc};
use outbox_domain::dispatch::{CommandDispatcher, MessagePublisher, NotificationDispatcher};
use outbox_domain::error::DomainError;
use outbox_domain::message::{
    DeliveryType, MessageContext, MessageEnvelope, MessageStatus, StoreMessage,
};
use outbox_domain::persist::{
    MessageFilter, MessagePersistenceConnectionFactory, MessagePersistenceRepository, UnitOfWork,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// 回写结果时的乐观并发重试次数
const FINALIZE_ATTEMPTS: u32 = 3;

const TIMED_OUT_REASON: &str = "processing timed out";

#[derive(Builder)]
pub struct MessagePersistenceService<F, R>
where
    F: MessagePersistenceConnectionFactory,
    R: MessagePersistenceRepository<UnitOfWork = F::UnitOfWork>,
{
    connection_factory: F,
    repository: R,
    command_dispatcher: Arc<dyn CommandDispatcher>,
    notification_dispatcher: Arc<dyn NotificationDispatcher>,
    message_publisher: Arc<dyn MessagePublisher>,
    #[builder(default)]
    options: MessagePersistenceOptions,
}

enum Claim {
    Claimed(StoreMessage),
    Skipped(SkipReason),
}

enum Delivery {
    Delivered,
    Failed(String),
    /// 载荷损坏或无处理器，重试无意义
    Contract(String),
}

impl<F, R> MessagePersistenceService<F, R>
where
    F: MessagePersistenceConnectionFactory,
    R: MessagePersistenceRepository<UnitOfWork = F::UnitOfWork>,
{
    pub fn options(&self) -> &MessagePersistenceOptions {
        &self.options
    }

    pub fn connection_factory(&self) -> &F {
        &self.connection_factory
    }

    /// 开启工作单元，供调用方将业务写入与消息登记放入同一事务
    pub async fn begin_unit_of_work(&self) -> Result<F::UnitOfWork, AppError> {
        Ok(self.connection_factory.begin_unit_of_work().await?)
    }

    /// 登记出站消息（`Outbox`）
    #[instrument(skip_all, fields(message_id = %envelope.message_id(), message_type = envelope.message_type()))]
    pub async fn add_publish_message(
        &self,
        uow: &mut F::UnitOfWork,
        envelope: &MessageEnvelope,
    ) -> Result<Uuid, AppError> {
        self.add(uow, envelope, DeliveryType::Outbox).await
    }

    /// 登记入站消息（`Inbox`）；重复投递返回 `Duplicate` 而非错误
    #[instrument(skip_all, fields(message_id = %envelope.message_id(), message_type = envelope.message_type()))]
    pub async fn add_received_message(
        &self,
        uow: &mut F::UnitOfWork,
        envelope: &MessageEnvelope,
    ) -> Result<ReceiveOutcome, AppError> {
        let id = match self.options.inbox_deduplication {
            InboxDeduplication::MessageId => envelope.message_id(),
            InboxDeduplication::PayloadHash => envelope.content_id(),
        };

        let record = StoreMessage::from_envelope_with_id(id, envelope, DeliveryType::Inbox)?;
        match self.repository.add(uow, &record).await {
            Ok(()) => {
                debug!(%id, "inbox message stored");
                Ok(ReceiveOutcome::Stored(id))
            }
            Err(err) if err.is_conflict() => {
                info!(%id, "duplicate inbox message ignored");
                Ok(ReceiveOutcome::Duplicate(id))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// 登记进程内命令（`Internal`），返回消息 ID
    #[instrument(skip_all, fields(message_type = C::MESSAGE_TYPE))]
    pub async fn add_internal_message<C>(
        &self,
        uow: &mut F::UnitOfWork,
        command: &C,
        context: MessageContext,
    ) -> Result<Uuid, AppError>
    where
        C: InternalCommand,
    {
        let envelope = MessageEnvelope::new(command, context)?;
        self.add(uow, &envelope, DeliveryType::Internal).await
    }

    /// 登记进程内通知（`Internal`），返回消息 ID
    #[instrument(skip_all, fields(message_type = N::MESSAGE_TYPE))]
    pub async fn add_notification<N>(
        &self,
        uow: &mut F::UnitOfWork,
        notification: &N,
        context: MessageContext,
    ) -> Result<Uuid, AppError>
    where
        N: DomainNotification,
    {
        let envelope = MessageEnvelope::new(notification, context)?;
        self.add(uow, &envelope, DeliveryType::Internal).await
    }

    async fn add(
        &self,
        uow: &mut F::UnitOfWork,
        envelope: &MessageEnvelope,
        delivery_type: DeliveryType,
    ) -> Result<Uuid, AppError> {
        let record = StoreMessage::from_envelope(envelope, delivery_type)?;
        self.repository.add(uow, &record).await?;
        debug!(%delivery_type, "message stored");
        Ok(record.id())
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<StoreMessage, AppError> {
        let mut uow = self.begin_unit_of_work().await?;
        let message = self.repository.get_by_id(&mut uow, id).await?;
        uow.rollback().await?;
        Ok(message)
    }

    pub async fn get_by_filter(&self, filter: &MessageFilter) -> Result<Vec<StoreMessage>, AppError> {
        let mut uow = self.begin_unit_of_work().await?;
        let messages = self.repository.get_by_filter(&mut uow, filter).await?;
        uow.rollback().await?;
        Ok(messages)
    }

    /// 处理单条消息：认领、投递并回写结果
    ///
    /// 投递失败不作为错误返回，体现在 `ProcessOutcome` 中；
    /// 仅存储层错误（连接、读写）以 `Err` 返回。该入口不受消息级退避约束。
    #[instrument(skip_all, fields(message_id = %id))]
    pub async fn process(&self, id: Uuid) -> Result<ProcessOutcome, AppError> {
        let claimed = match self.claim(id).await? {
            Claim::Claimed(message) => message,
            Claim::Skipped(reason) => {
                debug!(?reason, "message skipped");
                return Ok(ProcessOutcome::Skipped(reason));
            }
        };

        let delivery = self.deliver(&claimed).await;
        self.finalize(&claimed, delivery).await
    }

    async fn claim(&self, id: Uuid) -> Result<Claim, AppError> {
        let mut uow = self.begin_unit_of_work().await?;
        let message = self.repository.get_by_id(&mut uow, id).await?;

        let skip = match message.message_status() {
            MessageStatus::Processed => Some(SkipReason::AlreadyProcessed),
            MessageStatus::InProgress => Some(SkipReason::InProgress),
            MessageStatus::Failed if !message.is_processable(self.options.max_retries) => {
                Some(SkipReason::RetriesExhausted)
            }
            _ => None,
        };
        if let Some(reason) = skip {
            uow.rollback().await?;
            return Ok(Claim::Skipped(reason));
        }

        let from = message.message_status();
        if !self
            .repository
            .change_state(&mut uow, id, from, MessageStatus::InProgress)
            .await?
        {
            uow.rollback().await?;
            return Ok(Claim::Skipped(SkipReason::ClaimLost));
        }

        let claimed = self.repository.get_by_id(&mut uow, id).await?;
        match uow.commit().await {
            Ok(()) => Ok(Claim::Claimed(claimed)),
            Err(err) if err.is_concurrency() || err.is_conflict() => {
                debug!(error = %err, "claim lost to a concurrent processor");
                Ok(Claim::Skipped(SkipReason::ClaimLost))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn deliver(&self, message: &StoreMessage) -> Delivery {
        let envelope = match message.envelope() {
            Ok(envelope) => envelope,
            Err(err) => return Delivery::Contract(format!("malformed payload: {err}")),
        };
        let message_type = envelope.message_type();

        let commands = &self.command_dispatcher;
        let notifications = &self.notification_dispatcher;

        let result = match message.delivery_type() {
            DeliveryType::Outbox => self.message_publisher.publish(&envelope).await,
            DeliveryType::Internal if commands.handles(message_type) => {
                commands.send(&envelope).await
            }
            DeliveryType::Internal if notifications.handles(message_type) => {
                notifications.publish(&envelope).await
            }
            DeliveryType::Inbox if notifications.handles(message_type) => {
                notifications.publish(&envelope).await
            }
            DeliveryType::Inbox if commands.handles(message_type) => {
                commands.send(&envelope).await
            }
            DeliveryType::Internal | DeliveryType::Inbox => {
                return Delivery::Contract(format!("no handler registered for {message_type}"));
            }
        };

        match result {
            Ok(()) => Delivery::Delivered,
            Err(
                err @ (DomainError::Serde { .. }
                | DomainError::Parse { .. }
                | DomainError::TypeMismatch { .. }),
            ) => Delivery::Contract(format!("malformed payload: {err}")),
            Err(err) => Delivery::Failed(err.to_string()),
        }
    }

    async fn finalize(
        &self,
        claimed: &StoreMessage,
        delivery: Delivery,
    ) -> Result<ProcessOutcome, AppError> {
        let id = claimed.id();

        for attempt in 1..=FINALIZE_ATTEMPTS {
            let mut uow = self.begin_unit_of_work().await?;
            let mut message = self.repository.get_by_id(&mut uow, id).await?;

            // 处理期间被回收（或回收后被再次认领）：结果由新的处理者负责
            if message.message_status() != MessageStatus::InProgress
                || message.claimed_at() != claimed.claimed_at()
            {
                uow.rollback().await?;
                warn!(status = %message.message_status(), "claim lost before result was recorded");
                return Ok(ProcessOutcome::Skipped(SkipReason::ClaimLost));
            }

            let now = Utc::now();
            let outcome = match &delivery {
                Delivery::Delivered => {
                    message.mark_processed(now)?;
                    ProcessOutcome::Processed
                }
                Delivery::Failed(reason) => {
                    message.mark_failed(reason.clone(), now)?;
                    ProcessOutcome::Failed {
                        retry_count: message.retry_count(),
                        reason: reason.clone(),
                    }
                }
                Delivery::Contract(reason) => {
                    message.park(reason.clone(), self.options.max_retries, now)?;
                    ProcessOutcome::Failed {
                        retry_count: message.retry_count(),
                        reason: reason.clone(),
                    }
                }
            };

            let written = match self.repository.update(&mut uow, &message).await {
                Ok(()) => uow.commit().await,
                Err(err) => Err(err),
            };

            match written {
                Ok(()) => {
                    log_outcome(&message, &outcome, &delivery);
                    return Ok(outcome);
                }
                Err(err) if err.is_concurrency() && attempt < FINALIZE_ATTEMPTS => {
                    debug!(attempt, "version conflict while recording result, reloading");
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(DomainError::concurrency(format!("message {id}: result could not be recorded")).into())
    }

    /// 扫描并处理可处理的消息（`Stored`、到期且未达上限的 `Failed`），按创建时间从旧到新
    ///
    /// 每条消息独立处理，失败不影响其余消息；取消令牌在两条消息之间检查。
    #[instrument(skip_all)]
    pub async fn process_all(&self, token: &CancellationToken) -> Result<ProcessAllSummary, AppError> {
        let due = self.collect_due(Utc::now()).await?;

        let mut summary = ProcessAllSummary::default();
        for id in due {
            if token.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            match self.process(id).await {
                Ok(outcome) => summary.record(&outcome),
                Err(err) => {
                    summary.errors += 1;
                    error!(message_id = %id, error = %err, "message processing aborted");
                }
            }
        }

        if summary.total() > 0 {
            info!(
                processed = summary.processed,
                failed = summary.failed,
                skipped = summary.skipped,
                errors = summary.errors,
                cancelled = summary.cancelled,
                "process_all finished"
            );
        }

        Ok(summary)
    }

    /// 按页读取可处理的消息，跳过仍在退避窗口内的 `Failed`，直到凑满一批或读完
    async fn collect_due(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, AppError> {
        let batch_size = self.options.batch_size;
        let filter = MessageFilter::processable(self.options.max_retries, batch_size);

        let mut due = Vec::with_capacity(batch_size);
        let mut offset = 0;
        loop {
            let page = self
                .get_by_filter(&filter.clone().with_offset(offset))
                .await?;
            let exhausted = page.len() < batch_size;
            offset += page.len();

            for message in page.iter().filter(|m| self.options.is_due(m, now)) {
                due.push(message.id());
                if due.len() == batch_size {
                    return Ok(due);
                }
            }

            if exhausted {
                return Ok(due);
            }
        }
    }

    /// 回收认领超时的 `InProgress` 消息：记一次失败并转为 `Failed`
    #[instrument(skip_all)]
    pub async fn reclaim_stuck(&self) -> Result<ReclaimSummary, AppError> {
        let now = Utc::now();
        let timeout = chrono::Duration::from_std(self.options.in_progress_timeout())
            .map_err(|e| AppError::Validation(format!("in_progress_timeout: {e}")))?;
        let cutoff = now - timeout;

        let stuck = self
            .get_by_filter(&MessageFilter::stuck_in_progress(cutoff, self.options.batch_size))
            .await?;

        let mut summary = ReclaimSummary::default();
        for message in stuck {
            match self.reclaim_one(message.id(), cutoff, now).await {
                Ok(true) => summary.reclaimed += 1,
                Ok(false) => summary.raced += 1,
                Err(err) => {
                    summary.errors += 1;
                    error!(message_id = %message.id(), error = %err, "stuck message reclaim aborted");
                }
            }
        }

        Ok(summary)
    }

    async fn reclaim_one(
        &self,
        id: Uuid,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut uow = self.begin_unit_of_work().await?;
        let mut message = self.repository.get_by_id(&mut uow, id).await?;

        let still_stuck = message.message_status() == MessageStatus::InProgress
            && message.claimed_at().is_some_and(|at| at < cutoff);
        if !still_stuck {
            uow.rollback().await?;
            return Ok(false);
        }

        message.mark_failed(TIMED_OUT_REASON, now)?;
        let written = match self.repository.update(&mut uow, &message).await {
            Ok(()) => uow.commit().await,
            Err(err) => Err(err),
        };

        match written {
            Ok(()) => {
                warn!(
                    message_id = %id,
                    message_type = message.data_type(),
                    retry_count = message.retry_count(),
                    "reclaimed message stuck in progress"
                );
                Ok(true)
            }
            Err(err) if err.is_concurrency() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

fn log_outcome(message: &StoreMessage, outcome: &ProcessOutcome, delivery: &Delivery) {
    match (outcome, delivery) {
        (ProcessOutcome::Processed, _) => info!(
            message_type = message.data_type(),
            delivery_type = %message.delivery_type(),
            "message processed"
        ),
        (ProcessOutcome::Failed { retry_count, reason }, Delivery::Contract(_)) => error!(
            message_type = message.data_type(),
            delivery_type = %message.delivery_type(),
            retry_count,
            reason = reason.as_str(),
            "message parked"
        ),
        (ProcessOutcome::Failed { retry_count, reason }, _) => warn!(
            message_type = message.data_type(),
            delivery_type = %message.delivery_type(),
            retry_count,
            reason = reason.as_str(),
            "message delivery failed"
        ),
        (ProcessOutcome::Skipped(_), _) => {}
    }
}
