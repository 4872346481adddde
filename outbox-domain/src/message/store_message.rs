//! 落库消息记录（StoreMessage）
//!
//! 一条信封及其投递状态的持久化形态，承载处理状态机：
//! - `mark_in_progress`：认领（`Stored`/`Failed` → `InProgress`）；
//! - `mark_processed`：投递成功（终态）；
//! - `mark_failed`：投递失败，累加重试次数并记录原因；
//! - `park`：契约错误（载荷损坏、无处理器）直接搁置，不再自动重试。
//!
use super::{DeliveryType, MessageEnvelope, MessageStatus};
use crate::error::{DomainError, DomainResult};
use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
pub struct StoreMessage {
    /// 记录唯一标识
    id: Uuid,
    /// 载荷类型判别名
    data_type: String,
    /// 序列化后的信封，对存储层不透明
    data: Value,
    #[builder(default = MessageStatus::Stored)]
    message_status: MessageStatus,
    delivery_type: DeliveryType,
    #[builder(default = Utc::now())]
    created_at: DateTime<Utc>,
    /// 失败次数
    #[builder(default)]
    retry_count: u32,
    last_retry_at: Option<DateTime<Utc>>,
    processed_at: Option<DateTime<Utc>>,
    /// 进入 `InProgress` 的时间，用于超时回收
    claimed_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
    /// 乐观并发版本，每次写入递增
    #[builder(default)]
    version: i64,
}

impl StoreMessage {
    /// 以信封创建新记录，记录 ID 取信封的消息 ID
    pub fn from_envelope(
        envelope: &MessageEnvelope,
        delivery_type: DeliveryType,
    ) -> DomainResult<Self> {
        Self::from_envelope_with_id(envelope.message_id(), envelope, delivery_type)
    }

    /// 以信封创建新记录并指定记录 ID（如入站去重键）
    pub fn from_envelope_with_id(
        id: Uuid,
        envelope: &MessageEnvelope,
        delivery_type: DeliveryType,
    ) -> DomainResult<Self> {
        Ok(StoreMessage::builder()
            .id(id)
            .data_type(envelope.message_type().to_string())
            .data(serde_json::to_value(envelope)?)
            .delivery_type(delivery_type)
            .build())
    }

    /// 还原信封；载荷损坏属于契约错误
    pub fn envelope(&self) -> DomainResult<MessageEnvelope> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// 是否可被认领处理：`Stored`，或未超过重试上限的 `Failed`
    pub fn is_processable(&self, max_retries: u32) -> bool {
        match self.message_status {
            MessageStatus::Stored => true,
            MessageStatus::Failed => self.retry_count < max_retries,
            _ => false,
        }
    }

    pub fn mark_in_progress(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(MessageStatus::InProgress)?;
        self.claimed_at = Some(now);
        Ok(())
    }

    pub fn mark_processed(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(MessageStatus::Processed)?;
        self.processed_at = Some(now);
        self.failure_reason = None;
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(MessageStatus::Failed)?;
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_retry_at = Some(now);
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    /// 失败并搁置：重试次数直接置为上限
    pub fn park(
        &mut self,
        reason: impl Into<String>,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.mark_failed(reason, now)?;
        self.retry_count = self.retry_count.max(max_retries);
        Ok(())
    }

    /// 仓储条件状态变更的窄写入：只改状态，进入 `InProgress` 时记录认领时间
    pub fn apply_state_change(&mut self, next: MessageStatus, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(next)?;
        if next == MessageStatus::InProgress {
            self.claimed_at = Some(now);
        }
        Ok(())
    }

    fn transition(&mut self, next: MessageStatus) -> DomainResult<()> {
        if !self.message_status.can_transition_to(next) {
            return Err(DomainError::invalid_state(format!(
                "message {}: {} -> {} is not allowed",
                self.id, self.message_status, next
            )));
        }
        self.message_status = next;
        Ok(())
    }

    /// 写入成功后由存储层推进版本
    pub fn bump_version(&mut self) {
        self.version += 1;
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn data_type(&self) -> &str {
        &self.data_type
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn message_status(&self) -> MessageStatus {
        self.message_status
    }

    pub fn delivery_type(&self) -> DeliveryType {
        self.delivery_type
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn last_retry_at(&self) -> Option<DateTime<Utc>> {
        self.last_retry_at
    }

    pub fn processed_at(&self) -> Option<DateTime<Utc>> {
        self.processed_at
    }

    pub fn claimed_at(&self) -> Option<DateTime<Utc>> {
        self.claimed_at
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn version(&self) -> i64 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, MessageContext};

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    impl Message for Ping {
        const MESSAGE_TYPE: &'static str = "test.ping";
    }

    fn mk_message(delivery_type: DeliveryType) -> StoreMessage {
        let env = MessageEnvelope::new(&Ping { seq: 1 }, MessageContext::default()).unwrap();
        StoreMessage::from_envelope(&env, delivery_type).unwrap()
    }

    #[test]
    fn new_record_is_stored_with_envelope_identity() {
        let env = MessageEnvelope::new(&Ping { seq: 7 }, MessageContext::default()).unwrap();
        let msg = StoreMessage::from_envelope(&env, DeliveryType::Outbox).unwrap();

        assert_eq!(msg.id(), env.message_id());
        assert_eq!(msg.data_type(), "test.ping");
        assert_eq!(msg.message_status(), MessageStatus::Stored);
        assert_eq!(msg.delivery_type(), DeliveryType::Outbox);
        assert_eq!(msg.retry_count(), 0);
        assert_eq!(msg.version(), 0);
        assert_eq!(msg.envelope().unwrap(), env);
    }

    #[test]
    fn success_path() {
        let mut msg = mk_message(DeliveryType::Internal);
        let now = Utc::now();

        msg.mark_in_progress(now).unwrap();
        assert_eq!(msg.message_status(), MessageStatus::InProgress);
        assert_eq!(msg.claimed_at(), Some(now));

        msg.mark_processed(now).unwrap();
        assert_eq!(msg.message_status(), MessageStatus::Processed);
        assert_eq!(msg.processed_at(), Some(now));
        assert!(!msg.is_processable(3));
    }

    #[test]
    fn failure_counts_attempts_until_limit() {
        let mut msg = mk_message(DeliveryType::Outbox);
        let max_retries = 2;

        for attempt in 1..=max_retries {
            assert!(msg.is_processable(max_retries));
            msg.mark_in_progress(Utc::now()).unwrap();
            msg.mark_failed("broker unavailable", Utc::now()).unwrap();
            assert_eq!(msg.retry_count(), attempt);
            assert_eq!(msg.failure_reason(), Some("broker unavailable"));
            assert!(msg.last_retry_at().is_some());
        }

        assert_eq!(msg.message_status(), MessageStatus::Failed);
        assert!(!msg.is_processable(max_retries));
    }

    #[test]
    fn processed_is_terminal() {
        let mut msg = mk_message(DeliveryType::Inbox);
        msg.mark_in_progress(Utc::now()).unwrap();
        msg.mark_processed(Utc::now()).unwrap();

        let err = msg.mark_in_progress(Utc::now()).unwrap_err();
        assert!(matches!(err, DomainError::InvalidState { .. }));
        assert!(msg.mark_failed("late", Utc::now()).is_err());
        assert_eq!(msg.message_status(), MessageStatus::Processed);
    }

    #[test]
    fn stored_cannot_skip_claim() {
        let mut msg = mk_message(DeliveryType::Outbox);
        assert!(msg.mark_processed(Utc::now()).is_err());
        assert!(msg.mark_failed("nope", Utc::now()).is_err());
    }

    #[test]
    fn park_exhausts_retries() {
        let mut msg = mk_message(DeliveryType::Internal);
        msg.mark_in_progress(Utc::now()).unwrap();
        msg.park("no handler registered", 5, Utc::now()).unwrap();

        assert_eq!(msg.message_status(), MessageStatus::Failed);
        assert_eq!(msg.retry_count(), 5);
        assert!(!msg.is_processable(5));
    }

    #[test]
    fn malformed_data_is_reported() {
        let msg = StoreMessage::builder()
            .id(Uuid::new_v4())
            .data_type("test.ping".to_string())
            .data(serde_json::json!({"garbage": true}))
            .delivery_type(DeliveryType::Outbox)
            .build();

        assert!(matches!(
            msg.envelope().unwrap_err(),
            DomainError::Serde { .. }
        ));
    }
}
