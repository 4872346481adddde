//! 消息持久化 worker（MessagePersistenceWorker）
//!
//! 宿主进程内的长驻任务，周期性驱动处理服务：
//! - 扫描任务：按间隔调用 `process_all`，取消令牌同时传入扫描，两条消息之间即可停止；
//! - 回收任务：按间隔调用 `reclaim_stuck`，保证消息不会永久停留在 `InProgress`；
//! - 提供关闭与等待的 `WorkerHandle`。
//!
use crate::config::MessagePersistenceOptions;
use crate::error::AppError;
use crate::service::MessagePersistenceService;
use bon::Builder;
use outbox_domain::persist::{MessagePersistenceConnectionFactory, MessagePersistenceRepository};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

#[derive(Builder)]
pub struct MessagePersistenceWorker<F, R>
where
    F: MessagePersistenceConnectionFactory,
    R: MessagePersistenceRepository<UnitOfWork = F::UnitOfWork>,
{
    service: Arc<MessagePersistenceService<F, R>>,
    #[builder(default)]
    config: WorkerConfig,
}

impl<F, R> MessagePersistenceWorker<F, R>
where
    F: MessagePersistenceConnectionFactory + 'static,
    R: MessagePersistenceRepository<UnitOfWork = F::UnitOfWork> + 'static,
{
    /// 启动 worker，返回可用于关闭/等待的句柄
    pub fn start(self: Arc<Self>) -> WorkerHandle {
        let token = CancellationToken::new();
        let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(2);

        // sweep（周期任务）
        {
            let service = self.service.clone();
            let sweep_token = token.clone();

            tasks.push(spawn_periodic(
                token.clone(),
                self.config.sweep_interval,
                move || {
                    let service = service.clone();
                    let token = sweep_token.clone();
                    async move {
                        if let Err(err) = service.process_all(&token).await {
                            error!(error = %err, "message sweep failed");
                        }
                    }
                },
            ));
        }

        // reclaim（周期任务）
        {
            let service = self.service.clone();

            tasks.push(spawn_periodic(
                token.clone(),
                self.config.reclaim_interval,
                move || {
                    let service = service.clone();
                    async move {
                        match service.reclaim_stuck().await {
                            Ok(summary) if summary.reclaimed > 0 => {
                                debug!(reclaimed = summary.reclaimed, "stuck messages reclaimed");
                            }
                            Ok(_) => {}
                            Err(err) => error!(error = %err, "stuck message reclaim failed"),
                        }
                    }
                },
            ));
        }

        WorkerHandle { token, tasks }
    }
}

fn spawn_periodic<F, Fut>(token: CancellationToken, interval: Duration, mut f: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => f().await,
            }
        }
    })
}

/// worker 配置：扫描与回收间隔，均须大于零
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerConfig {
    sweep_interval: Duration,
    reclaim_interval: Duration,
}

impl WorkerConfig {
    pub fn new(sweep_interval: Duration, reclaim_interval: Duration) -> Result<Self, AppError> {
        if sweep_interval.is_zero() {
            return Err(AppError::Validation("sweep interval must be non-zero".into()));
        }
        if reclaim_interval.is_zero() {
            return Err(AppError::Validation("reclaim interval must be non-zero".into()));
        }
        Ok(Self {
            sweep_interval,
            reclaim_interval,
        })
    }

    /// `process_all` 的扫描间隔
    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    /// `reclaim_stuck` 的回收间隔
    pub fn reclaim_interval(&self) -> Duration {
        self.reclaim_interval
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
            reclaim_interval: Duration::from_secs(60),
        }
    }
}

impl TryFrom<&MessagePersistenceOptions> for WorkerConfig {
    type Error = AppError;

    fn try_from(options: &MessagePersistenceOptions) -> Result<Self, Self::Error> {
        WorkerConfig::new(options.sweep_interval(), options.reclaim_interval())
    }
}

/// worker 运行句柄：用于优雅关闭与等待任务结束
pub struct WorkerHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub async fn join(mut self) {
        let tasks = std::mem::take(&mut self.tasks);

        for t in tasks {
            if let Err(err) = t.await {
                if err.is_panic() {
                    error!(error = %err, "worker task panicked");
                } else {
                    debug!(error = %err, "worker task cancelled");
                }
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_intervals_are_rejected() {
        let second = Duration::from_secs(1);
        assert!(WorkerConfig::new(Duration::ZERO, second).is_err());
        assert!(WorkerConfig::new(second, Duration::ZERO).is_err());
        assert!(WorkerConfig::new(second, second).is_ok());
    }

    #[test]
    fn config_follows_options() {
        let options = MessagePersistenceOptions {
            sweep_interval_ms: 250,
            reclaim_interval_secs: 7,
            ..Default::default()
        };
        let config = WorkerConfig::try_from(&options).unwrap();
        assert_eq!(config.sweep_interval(), Duration::from_millis(250));
        assert_eq!(config.reclaim_interval(), Duration::from_secs(7));
        assert_eq!(
            WorkerConfig::try_from(&MessagePersistenceOptions::default()).unwrap(),
            WorkerConfig::default()
        );

        let broken = MessagePersistenceOptions {
            sweep_interval_ms: 0,
            ..Default::default()
        };
        assert!(WorkerConfig::try_from(&broken).is_err());
    }
}
