//! 结构化查询条件（MessageFilter）
//!
//! 仓储按该条件筛选并分页，结果恒按 `created_at`、`id` 升序。
//! 各存储后端需保证与 `matches` 的语义一致。
//!
use crate::message::{DeliveryType, MessageStatus, StoreMessage};
use bon::Builder;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Default, PartialEq, Builder)]
pub struct MessageFilter {
    /// 状态集合，`None` 表示不限
    statuses: Option<Vec<MessageStatus>>,
    /// 投递类型集合，`None` 表示不限
    delivery_types: Option<Vec<DeliveryType>>,
    /// `created_at >= created_from`
    created_from: Option<DateTime<Utc>>,
    /// `created_at < created_to`
    created_to: Option<DateTime<Utc>>,
    /// `retry_count < retry_count_below`
    retry_count_below: Option<u32>,
    /// `claimed_at < claimed_before`
    claimed_before: Option<DateTime<Utc>>,
    limit: Option<usize>,
    #[builder(default)]
    offset: usize,
}

impl MessageFilter {
    /// 无条件查询（仍可由调用方分页）
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_status(status: MessageStatus) -> Self {
        MessageFilter::builder().statuses(vec![status]).build()
    }

    /// 可处理的消息：`Stored` 或未达重试上限的 `Failed`
    pub fn processable(max_retries: u32, limit: usize) -> Self {
        MessageFilter::builder()
            .statuses(vec![MessageStatus::Stored, MessageStatus::Failed])
            .retry_count_below(max_retries)
            .limit(limit)
            .build()
    }

    /// 同一条件的另一页
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// 认领时间早于 `cutoff` 的处理中消息
    pub fn stuck_in_progress(cutoff: DateTime<Utc>, limit: usize) -> Self {
        MessageFilter::builder()
            .statuses(vec![MessageStatus::InProgress])
            .claimed_before(cutoff)
            .limit(limit)
            .build()
    }

    pub fn matches(&self, message: &StoreMessage) -> bool {
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&message.message_status()) {
                return false;
            }
        }

        if let Some(types) = &self.delivery_types {
            if !types.contains(&message.delivery_type()) {
                return false;
            }
        }

        if self.created_from.is_some_and(|from| message.created_at() < from) {
            return false;
        }

        if self.created_to.is_some_and(|to| message.created_at() >= to) {
            return false;
        }

        // 保持与 SQL 一致：重试上限只约束 Failed（Stored 的 retry_count 恒为 0）
        if let Some(bound) = self.retry_count_below {
            if message.message_status() == MessageStatus::Failed && message.retry_count() >= bound
            {
                return false;
            }
        }

        if let Some(cutoff) = self.claimed_before {
            match message.claimed_at() {
                Some(claimed_at) if claimed_at < cutoff => {}
                _ => return false,
            }
        }

        true
    }

    pub fn statuses(&self) -> Option<&[MessageStatus]> {
        self.statuses.as_deref()
    }

    pub fn delivery_types(&self) -> Option<&[DeliveryType]> {
        self.delivery_types.as_deref()
    }

    pub fn created_from(&self) -> Option<DateTime<Utc>> {
        self.created_from
    }

    pub fn created_to(&self) -> Option<DateTime<Utc>> {
        self.created_to
    }

    pub fn retry_count_below(&self) -> Option<u32> {
        self.retry_count_below
    }

    pub fn claimed_before(&self) -> Option<DateTime<Utc>> {
        self.claimed_before
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn offset(&self) -> usize {
        self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use uuid::Uuid;

    fn mk(status: MessageStatus, delivery_type: DeliveryType, retry_count: u32) -> StoreMessage {
        StoreMessage::builder()
            .id(Uuid::new_v4())
            .data_type("t".to_string())
            .data(json!({}))
            .message_status(status)
            .delivery_type(delivery_type)
            .retry_count(retry_count)
            .build()
    }

    #[test]
    fn empty_filter_matches_everything() {
        let f = MessageFilter::all();
        assert!(f.matches(&mk(MessageStatus::Processed, DeliveryType::Inbox, 0)));
        assert!(f.matches(&mk(MessageStatus::Failed, DeliveryType::Outbox, 9)));
    }

    #[test]
    fn processable_excludes_exhausted_and_terminal() {
        let f = MessageFilter::processable(3, 10);
        assert!(f.matches(&mk(MessageStatus::Stored, DeliveryType::Outbox, 0)));
        assert!(f.matches(&mk(MessageStatus::Failed, DeliveryType::Outbox, 2)));
        assert!(!f.matches(&mk(MessageStatus::Failed, DeliveryType::Outbox, 3)));
        assert!(!f.matches(&mk(MessageStatus::Processed, DeliveryType::Outbox, 0)));
        assert!(!f.matches(&mk(MessageStatus::InProgress, DeliveryType::Outbox, 0)));
        assert_eq!(f.limit(), Some(10));
    }

    #[test]
    fn next_page_keeps_conditions() {
        let first = MessageFilter::processable(3, 10);
        let second = first.clone().with_offset(10);
        assert_eq!(second.offset(), 10);
        assert_eq!(second.limit(), first.limit());
        assert_eq!(second.retry_count_below(), Some(3));
    }

    #[test]
    fn delivery_type_and_time_range() {
        let now = Utc::now();
        let f = MessageFilter::builder()
            .delivery_types(vec![DeliveryType::Inbox])
            .created_from(now - Duration::minutes(5))
            .created_to(now + Duration::minutes(5))
            .build();

        assert!(f.matches(&mk(MessageStatus::Stored, DeliveryType::Inbox, 0)));
        assert!(!f.matches(&mk(MessageStatus::Stored, DeliveryType::Outbox, 0)));

        let old = StoreMessage::builder()
            .id(Uuid::new_v4())
            .data_type("t".to_string())
            .data(json!({}))
            .delivery_type(DeliveryType::Inbox)
            .created_at(now - Duration::hours(1))
            .build();
        assert!(!f.matches(&old));
    }

    #[test]
    fn stuck_filter_requires_old_claim() {
        let now = Utc::now();
        let f = MessageFilter::stuck_in_progress(now - Duration::minutes(5), 10);

        let mut fresh = mk(MessageStatus::Stored, DeliveryType::Outbox, 0);
        fresh.mark_in_progress(now).unwrap();
        assert!(!f.matches(&fresh));

        let mut stale = mk(MessageStatus::Stored, DeliveryType::Outbox, 0);
        stale.mark_in_progress(now - Duration::minutes(30)).unwrap();
        assert!(f.matches(&stale));
    }
}
