//! 消息持久化配置（MessagePersistenceOptions）
//!
//! 加载顺序（后者覆盖前者）：
//! 1. 内置默认值；
//! 2. 可选文件 `config/message_persistence.toml`；
//! 3. 环境变量，前缀 `MESSAGE_PERSISTENCE_`，嵌套键以 `__` 分隔，
//!    如 `MESSAGE_PERSISTENCE_MAX_RETRIES=3`、`MESSAGE_PERSISTENCE_TRANSIENT_RETRY__MAX_ATTEMPTS=2`。
//!
use crate::error::AppError;
use chrono::{DateTime, Utc};
use config::{Config, Environment, File};
use outbox_domain::message::{MessageStatus, StoreMessage};
use outbox_domain::persist::TransientRetryPolicy;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// 入站消息去重键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxDeduplication {
    /// 记录 ID 取信封的消息 ID
    #[default]
    MessageId,
    /// 记录 ID 取内容指纹（类型判别名 + 载荷）
    PayloadHash,
}

/// 存储连接级瞬时故障的重试设置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransientRetryOptions {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for TransientRetryOptions {
    fn default() -> Self {
        let policy = TransientRetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MessagePersistenceOptions {
    /// 存储连接串（内存实现下可为空）
    pub connection_string: Option<String>,
    /// 失败重试上限，达到后搁置为 `Failed`
    pub max_retries: u32,
    /// 单次扫描的最大条数
    pub batch_size: usize,
    /// 消息级退避：首次失败后的等待
    pub initial_retry_delay_ms: u64,
    /// 消息级退避上限
    pub max_retry_delay_ms: u64,
    /// `InProgress` 超过该时长视为卡住
    pub in_progress_timeout_secs: u64,
    pub inbox_deduplication: InboxDeduplication,
    pub transient_retry: TransientRetryOptions,
    /// worker 扫描间隔
    pub sweep_interval_ms: u64,
    /// worker 回收卡住消息的间隔
    pub reclaim_interval_secs: u64,
}

impl Default for MessagePersistenceOptions {
    fn default() -> Self {
        Self {
            connection_string: None,
            max_retries: 5,
            batch_size: 100,
            initial_retry_delay_ms: 1_000,
            max_retry_delay_ms: 60_000,
            in_progress_timeout_secs: 300,
            inbox_deduplication: InboxDeduplication::MessageId,
            transient_retry: TransientRetryOptions::default(),
            sweep_interval_ms: 5_000,
            reclaim_interval_secs: 60,
        }
    }
}

impl MessagePersistenceOptions {
    pub fn load() -> Result<Self, AppError> {
        Self::load_from("config")
    }

    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, AppError> {
        let config = Config::builder()
            .add_source(
                File::from(config_dir.as_ref().join("message_persistence.toml")).required(false),
            )
            .add_source(
                Environment::with_prefix("MESSAGE_PERSISTENCE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Self::from_config(config)
    }

    /// 从已构建的配置源反序列化，缺省键取默认值
    pub fn from_config(config: Config) -> Result<Self, AppError> {
        let options: Self = config.try_deserialize()?;
        options.validate()?;
        Ok(options)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.max_retries == 0 {
            return Err(AppError::Validation("max_retries must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(AppError::Validation("batch_size must be at least 1".into()));
        }
        if self.sweep_interval_ms == 0 {
            return Err(AppError::Validation("sweep_interval_ms must be at least 1".into()));
        }
        if self.reclaim_interval_secs == 0 {
            return Err(AppError::Validation(
                "reclaim_interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn transient_retry_policy(&self) -> TransientRetryPolicy {
        TransientRetryPolicy {
            max_attempts: self.transient_retry.max_attempts,
            initial_delay: Duration::from_millis(self.transient_retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.transient_retry.max_delay_ms),
        }
    }

    /// 按配置的连接串与瞬时故障重试策略建立 Postgres 连接池
    #[cfg(feature = "infra-sqlx")]
    pub async fn connect_postgres(
        &self,
    ) -> Result<outbox_domain::persist::PostgresConnectionFactory, AppError> {
        let connection_string = self
            .connection_string
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| AppError::Validation("connection_string is required".into()))?;

        let factory = outbox_domain::persist::PostgresConnectionFactory::connect(
            connection_string,
            self.transient_retry_policy(),
        )
        .await?;
        Ok(factory)
    }

    pub fn in_progress_timeout(&self) -> Duration {
        Duration::from_secs(self.in_progress_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs)
    }

    /// 第 `retry_count` 次失败后的等待：`min(initial * 2^(retry_count-1), max)`
    pub fn retry_backoff(&self, retry_count: u32) -> Duration {
        let exp = retry_count.saturating_sub(1).min(31);
        Duration::from_millis(self.initial_retry_delay_ms)
            .saturating_mul(1u32 << exp)
            .min(Duration::from_millis(self.max_retry_delay_ms))
    }

    /// 扫描时是否到期：非 `Failed` 恒到期，`Failed` 需过了退避窗口
    pub fn is_due(&self, message: &StoreMessage, now: DateTime<Utc>) -> bool {
        if message.message_status() != MessageStatus::Failed {
            return true;
        }

        let Some(last) = message.last_retry_at() else {
            return true;
        };

        match chrono::Duration::from_std(self.retry_backoff(message.retry_count())) {
            Ok(backoff) => last + backoff <= now,
            Err(_) => false,
        }
    }
}
