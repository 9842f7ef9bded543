//! # NotificationLogRepository
//!
//! 通知ログの永続化を担当するリポジトリ。
//!
//! ## 設計方針
//!
//! - **fire-and-forget ログ**: 送信成功・失敗どちらも記録する
//! - **再送キュー**: `status = 'failed'` かつ `next_retry_at <= now` のログが再送対象
//! - **保持期間**: 作成から一定期間を過ぎたログはスケジュールジョブが削除する

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use repairflow_domain::notification::{NotificationLog, NotificationLogId};
use sqlx::{PgPool, types::Json};

use crate::error::InfraError;

/// 通知ログリポジトリトレイト
#[async_trait]
pub trait NotificationLogRepository: Send + Sync {
    /// 通知ログを挿入する
    async fn insert(&self, log: &NotificationLog) -> Result<(), InfraError>;

    /// 送信結果を反映する
    async fn update(&self, log: &NotificationLog) -> Result<(), InfraError>;

    /// ID で通知ログを取得する
    async fn find_by_id(&self, id: &NotificationLogId)
    -> Result<Option<NotificationLog>, InfraError>;

    /// 再送予定時刻を過ぎた失敗ログを取得する
    async fn find_retry_due(&self, now: DateTime<Utc>) -> Result<Vec<NotificationLog>, InfraError>;

    /// 指定日時より前に作成されたログを削除し、削除件数を返す
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, InfraError>;
}

/// PostgreSQL 実装の NotificationLogRepository
#[derive(Debug, Clone)]
pub struct PostgresNotificationLogRepository {
    pool: PgPool,
}

impl PostgresNotificationLogRepository {
    /// 新しいリポジトリインスタンスを作成
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationLogRepository for PostgresNotificationLogRepository {
    #[tracing::instrument(skip_all, level = "debug", fields(id = %log.id()))]
    async fn insert(&self, log: &NotificationLog) -> Result<(), InfraError> {
        sqlx::query(
            r#"
            INSERT INTO notification_logs (id, status, next_retry_at, body, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(*log.id().as_uuid())
        .bind(log.status().to_string())
        .bind(log.next_retry_at())
        .bind(Json(log))
        .bind(log.created_at())
        .bind(log.updated_at())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip_all, level = "debug", fields(id = %log.id(), status = %log.status()))]
    async fn update(&self, log: &NotificationLog) -> Result<(), InfraError> {
        sqlx::query(
            r#"
            UPDATE notification_logs
            SET status = $2, next_retry_at = $3, body = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(*log.id().as_uuid())
        .bind(log.status().to_string())
        .bind(log.next_retry_at())
        .bind(Json(log))
        .bind(log.updated_at())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip_all, level = "debug", fields(%id))]
    async fn find_by_id(
        &self,
        id: &NotificationLogId,
    ) -> Result<Option<NotificationLog>, InfraError> {
        let row: Option<(Json<NotificationLog>,)> =
            sqlx::query_as("SELECT body FROM notification_logs WHERE id = $1")
                .bind(*id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(Json(log),)| log))
    }

    #[tracing::instrument(skip_all, level = "debug", fields(%now))]
    async fn find_retry_due(&self, now: DateTime<Utc>) -> Result<Vec<NotificationLog>, InfraError> {
        let rows: Vec<(Json<NotificationLog>,)> = sqlx::query_as(
            r#"
            SELECT body FROM notification_logs
            WHERE status = 'failed' AND next_retry_at <= $1
            ORDER BY next_retry_at
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(Json(log),)| log).collect())
    }

    #[tracing::instrument(skip_all, level = "debug", fields(%cutoff))]
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, InfraError> {
        let result = sqlx::query("DELETE FROM notification_logs WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
