use crate::error::DomainError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 消息处理状态
///
/// `Stored → InProgress → {Processed | Failed}`，`Failed → InProgress` 为重试；
/// `InProgress → Failed` 亦用于超时回收。`Processed` 为终态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Stored,
    InProgress,
    Processed,
    Failed,
}

impl MessageStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Stored => "stored",
            MessageStatus::InProgress => "in_progress",
            MessageStatus::Processed => "processed",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        use MessageStatus::*;

        matches!(
            (self, next),
            (Stored, InProgress)
                | (Failed, InProgress)
                | (InProgress, Processed)
                | (InProgress, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Processed)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stored" => Ok(MessageStatus::Stored),
            "in_progress" => Ok(MessageStatus::InProgress),
            "processed" => Ok(MessageStatus::Processed),
            "failed" => Ok(MessageStatus::Failed),
            other => Err(DomainError::Parse {
                reason: format!("unknown message status: {other}"),
            }),
        }
    }
}

/// 投递类型：内部命令/通知、出站发布、入站接收
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryType {
    Internal,
    Outbox,
    Inbox,
}

impl DeliveryType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DeliveryType::Internal => "internal",
            DeliveryType::Outbox => "outbox",
            DeliveryType::Inbox => "inbox",
        }
    }
}

impl fmt::Display for DeliveryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "internal" => Ok(DeliveryType::Internal),
            "outbox" => Ok(DeliveryType::Outbox),
            "inbox" => Ok(DeliveryType::Inbox),
            other => Err(DomainError::Parse {
                reason: format!("unknown delivery type: {other}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_transitions() {
        use MessageStatus::*;

        assert!(Stored.can_transition_to(InProgress));
        assert!(Failed.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Processed));
        assert!(InProgress.can_transition_to(Failed));

        assert!(!Stored.can_transition_to(Processed));
        assert!(!Failed.can_transition_to(Processed));
        for next in [Stored, InProgress, Processed, Failed] {
            assert!(!Processed.can_transition_to(next));
        }
    }

    #[test]
    fn storage_text_parses_back() {
        for status in [
            MessageStatus::Stored,
            MessageStatus::InProgress,
            MessageStatus::Processed,
            MessageStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<MessageStatus>().unwrap(), status);
        }
        assert!("archived".parse::<MessageStatus>().is_err());
        assert_eq!("inbox".parse::<DeliveryType>().unwrap(), DeliveryType::Inbox);
        assert!("broadcast".parse::<DeliveryType>().is_err());
    }
}
