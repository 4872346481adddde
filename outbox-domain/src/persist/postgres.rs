//! Postgres 存储后端（需启用 `infra-sqlx` 特性）
//!
//! - `PostgresConnectionFactory`：连接池与事务，连接级瞬时故障按 `TransientRetryPolicy` 退避；
//! - `PgUnitOfWork`：一次数据库事务，业务表可通过 `connection()` 在同一事务内写入；
//! - `PostgresMessageRepository`：`store_messages` 表上的仓储实现。
//!
use crate::error::{DomainError, DomainResult as Result};
use crate::message::{DeliveryType, MessageStatus, StoreMessage};
use crate::persist::{
    MessageFilter, MessagePersistenceConnectionFactory, MessagePersistenceRepository,
    TransientRetryPolicy, UnitOfWork,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

const COLUMNS: &str = "id, data_type, data, message_status, delivery_type, created_at, \
     retry_count, last_retry_at, processed_at, claimed_at, failure_reason, version";

/// 建表与索引（幂等）
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS store_messages (
            id              UUID PRIMARY KEY,
            data_type       TEXT NOT NULL,
            data            JSONB NOT NULL,
            message_status  TEXT NOT NULL,
            delivery_type   TEXT NOT NULL,
            created_at      TIMESTAMPTZ NOT NULL,
            retry_count     INTEGER NOT NULL DEFAULT 0,
            last_retry_at   TIMESTAMPTZ NULL,
            processed_at    TIMESTAMPTZ NULL,
            claimed_at      TIMESTAMPTZ NULL,
            failure_reason  TEXT NULL,
            version         BIGINT NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS ix_store_messages_status_created \
         ON store_messages (message_status, created_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Postgres 连接工厂
#[derive(Clone)]
pub struct PostgresConnectionFactory {
    pool: PgPool,
    retry: TransientRetryPolicy,
}

impl PostgresConnectionFactory {
    pub fn new(pool: PgPool, retry: TransientRetryPolicy) -> Self {
        Self { pool, retry }
    }

    /// 建立连接池；首次连接同样按重试策略退避
    pub async fn connect(connection_string: &str, retry: TransientRetryPolicy) -> Result<Self> {
        let pool = retry
            .retry("connect", || async {
                Ok::<_, DomainError>(
                    PgPoolOptions::new()
                        .max_connections(10)
                        .connect(connection_string)
                        .await?,
                )
            })
            .await?;

        Ok(Self::new(pool, retry))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MessagePersistenceConnectionFactory for PostgresConnectionFactory {
    type Connection = PoolConnection<Postgres>;
    type UnitOfWork = PgUnitOfWork;

    async fn open_connection(&self) -> Result<Self::Connection> {
        self.retry
            .retry("open_connection", || async { Ok::<_, DomainError>(self.pool.acquire().await?) })
            .await
    }

    async fn begin_unit_of_work(&self) -> Result<Self::UnitOfWork> {
        let tx = self
            .retry
            .retry("begin_unit_of_work", || async { Ok::<_, DomainError>(self.pool.begin().await?) })
            .await?;

        Ok(PgUnitOfWork { tx })
    }
}

/// 一次数据库事务
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

impl PgUnitOfWork {
    /// 事务内连接，供业务表写入共享同一事务
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut *self.tx
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

/// `store_messages` 表仓储
#[derive(Clone, Copy, Debug, Default)]
pub struct PostgresMessageRepository;

impl PostgresMessageRepository {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MessagePersistenceRepository for PostgresMessageRepository {
    type UnitOfWork = PgUnitOfWork;

    async fn add(&self, uow: &mut Self::UnitOfWork, message: &StoreMessage) -> Result<()> {
        let retry_count = i32::try_from(message.retry_count())?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO store_messages (
                id, data_type, data, message_status, delivery_type, created_at,
                retry_count, last_retry_at, processed_at, claimed_at, failure_reason, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(message.id())
        .bind(message.data_type())
        .bind(message.data())
        .bind(message.message_status().as_str())
        .bind(message.delivery_type().as_str())
        .bind(message.created_at())
        .bind(retry_count)
        .bind(message.last_retry_at())
        .bind(message.processed_at())
        .bind(message.claimed_at())
        .bind(message.failure_reason())
        .bind(message.version())
        .execute(uow.connection())
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(DomainError::conflict(format!(
                "message {} already exists",
                message.id()
            )));
        }

        Ok(())
    }

    async fn get_by_id(&self, uow: &mut Self::UnitOfWork, id: Uuid) -> Result<StoreMessage> {
        let sql = format!("SELECT {COLUMNS} FROM store_messages WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(uow.connection())
            .await?
            .ok_or_else(|| DomainError::not_found(format!("message {id}")))?;

        decode_row(&row)
    }

    async fn get_by_filter(
        &self,
        uow: &mut Self::UnitOfWork,
        filter: &MessageFilter,
    ) -> Result<Vec<StoreMessage>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {COLUMNS} FROM store_messages WHERE 1=1"
        ));

        if let Some(statuses) = filter.statuses() {
            let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
            qb.push(" AND message_status = ANY(")
                .push_bind(statuses)
                .push(")");
        }
        if let Some(types) = filter.delivery_types() {
            let types: Vec<String> = types.iter().map(|t| t.as_str().to_string()).collect();
            qb.push(" AND delivery_type = ANY(").push_bind(types).push(")");
        }
        if let Some(from) = filter.created_from() {
            qb.push(" AND created_at >= ").push_bind(from);
        }
        if let Some(to) = filter.created_to() {
            qb.push(" AND created_at < ").push_bind(to);
        }
        if let Some(bound) = filter.retry_count_below() {
            qb.push(" AND (message_status <> ")
                .push_bind(MessageStatus::Failed.as_str())
                .push(" OR retry_count < ")
                .push_bind(i64::from(bound))
                .push(")");
        }
        if let Some(cutoff) = filter.claimed_before() {
            qb.push(" AND claimed_at < ").push_bind(cutoff);
        }

        qb.push(" ORDER BY created_at ASC, id ASC");
        if let Some(limit) = filter.limit() {
            qb.push(" LIMIT ").push_bind(i64::try_from(limit)?);
        }
        if filter.offset() > 0 {
            qb.push(" OFFSET ").push_bind(i64::try_from(filter.offset())?);
        }

        let rows = qb.build().fetch_all(uow.connection()).await?;
        rows.iter().map(decode_row).collect()
    }

    async fn update(&self, uow: &mut Self::UnitOfWork, message: &StoreMessage) -> Result<()> {
        let retry_count = i32::try_from(message.retry_count())?;

        let updated = sqlx::query(
            r#"
            UPDATE store_messages
            SET message_status = $3,
                retry_count    = $4,
                last_retry_at  = $5,
                processed_at   = $6,
                claimed_at     = $7,
                failure_reason = $8,
                version        = version + 1
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(message.id())
        .bind(message.version())
        .bind(message.message_status().as_str())
        .bind(retry_count)
        .bind(message.last_retry_at())
        .bind(message.processed_at())
        .bind(message.claimed_at())
        .bind(message.failure_reason())
        .execute(uow.connection())
        .await?
        .rows_affected();

        if updated == 1 {
            return Ok(());
        }

        // 区分记录不存在与版本冲突
        let exists = sqlx::query("SELECT 1 FROM store_messages WHERE id = $1")
            .bind(message.id())
            .fetch_optional(uow.connection())
            .await?
            .is_some();

        if exists {
            Err(DomainError::concurrency(format!(
                "message {}: expected version {}",
                message.id(),
                message.version()
            )))
        } else {
            Err(DomainError::not_found(format!("message {}", message.id())))
        }
    }

    async fn change_state(
        &self,
        uow: &mut Self::UnitOfWork,
        id: Uuid,
        from: MessageStatus,
        to: MessageStatus,
    ) -> Result<bool> {
        if !from.can_transition_to(to) {
            return Err(DomainError::invalid_state(format!(
                "message {id}: {from} -> {to} is not allowed"
            )));
        }

        let changed = sqlx::query(
            r#"
            UPDATE store_messages
            SET message_status = $3,
                claimed_at = CASE WHEN $3 = 'in_progress' THEN $4 ELSE claimed_at END,
                version = version + 1
            WHERE id = $1 AND message_status = $2
            "#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(Utc::now())
        .execute(uow.connection())
        .await?
        .rows_affected();

        debug!(%id, %from, %to, changed, "conditional state change");
        Ok(changed == 1)
    }
}

fn decode_row(row: &PgRow) -> Result<StoreMessage> {
    let status: String = row.try_get("message_status")?;
    let delivery_type: String = row.try_get("delivery_type")?;
    let retry_count: i32 = row.try_get("retry_count")?;
    let data: Value = row.try_get("data")?;

    Ok(StoreMessage::builder()
        .id(row.try_get::<Uuid, _>("id")?)
        .data_type(row.try_get::<String, _>("data_type")?)
        .data(data)
        .message_status(status.parse::<MessageStatus>()?)
        .delivery_type(delivery_type.parse::<DeliveryType>()?)
        .created_at(row.try_get::<DateTime<Utc>, _>("created_at")?)
        .retry_count(u32::try_from(retry_count)?)
        .maybe_last_retry_at(row.try_get("last_retry_at")?)
        .maybe_processed_at(row.try_get("processed_at")?)
        .maybe_claimed_at(row.try_get("claimed_at")?)
        .maybe_failure_reason(row.try_get("failure_reason")?)
        .version(row.try_get::<i64, _>("version")?)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn factory() -> PostgresConnectionFactory {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let factory = PostgresConnectionFactory::connect(&url, TransientRetryPolicy::default())
            .await
            .unwrap();
        ensure_schema(factory.pool()).await.unwrap();
        factory
    }

    fn mk() -> StoreMessage {
        StoreMessage::builder()
            .id(Uuid::new_v4())
            .data_type("test.ping".to_string())
            .data(json!({"seq": 1}))
            .delivery_type(DeliveryType::Outbox)
            .build()
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn insert_read_and_conflict() {
        let factory = factory().await;
        let repo = PostgresMessageRepository;
        let msg = mk();

        let mut uow = factory.begin_unit_of_work().await.unwrap();
        repo.add(&mut uow, &msg).await.unwrap();
        uow.commit().await.unwrap();

        let mut uow = factory.begin_unit_of_work().await.unwrap();
        let loaded = repo.get_by_id(&mut uow, msg.id()).await.unwrap();
        assert_eq!(loaded.data_type(), "test.ping");
        assert_eq!(loaded.message_status(), MessageStatus::Stored);
        assert!(repo.add(&mut uow, &msg).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn rollback_discards_insert() {
        let factory = factory().await;
        let repo = PostgresMessageRepository;
        let msg = mk();

        let mut uow = factory.begin_unit_of_work().await.unwrap();
        repo.add(&mut uow, &msg).await.unwrap();
        uow.rollback().await.unwrap();

        let mut uow = factory.begin_unit_of_work().await.unwrap();
        assert!(
            repo.get_by_id(&mut uow, msg.id())
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn claim_and_versioned_update() {
        let factory = factory().await;
        let repo = PostgresMessageRepository;
        let msg = mk();

        let mut uow = factory.begin_unit_of_work().await.unwrap();
        repo.add(&mut uow, &msg).await.unwrap();
        uow.commit().await.unwrap();

        let mut uow = factory.begin_unit_of_work().await.unwrap();
        assert!(
            repo.change_state(&mut uow, msg.id(), MessageStatus::Stored, MessageStatus::InProgress)
                .await
                .unwrap()
        );
        assert!(
            !repo
                .change_state(&mut uow, msg.id(), MessageStatus::Stored, MessageStatus::InProgress)
                .await
                .unwrap()
        );
        let mut claimed = repo.get_by_id(&mut uow, msg.id()).await.unwrap();
        assert!(claimed.claimed_at().is_some());
        assert_eq!(claimed.version(), 1);

        claimed.mark_processed(Utc::now()).unwrap();
        repo.update(&mut uow, &claimed).await.unwrap();
        // 旧版本再次写入
        assert!(
            repo.update(&mut uow, &claimed)
                .await
                .unwrap_err()
                .is_concurrency()
        );
        uow.commit().await.unwrap();
    }
}
