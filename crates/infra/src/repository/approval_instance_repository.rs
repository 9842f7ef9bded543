//! # ApprovalInstanceRepository
//!
//! 承認インスタンスの永続化を担当するリポジトリ。
//!
//! ## 設計方針
//!
//! - **楽観的ロック**: `update_with_version_check` による compare-and-swap
//! - **文書ごとに 1 件**: 決裁待ち（pending / escalated）のインスタンスは文書ごとに最大 1 件。
//!   部分一意インデックスで保証し、違反時は `Conflict` を返す

use async_trait::async_trait;
use repairflow_domain::{
    approval::{ApprovalInstance, ApprovalInstanceId, ApprovalInstanceRecord},
    document::DocumentId,
    value_objects::Version,
};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, types::Json};
use uuid::Uuid;

use super::restore_rows;
use crate::error::InfraError;

const ENTITY_NAME: &str = "ApprovalInstance";

/// 承認インスタンスリポジトリトレイト
#[async_trait]
pub trait ApprovalInstanceRepository: Send + Sync {
    /// インスタンスを新規作成する
    ///
    /// 同じ文書に決裁待ちのインスタンスが既にある場合は `Conflict`。
    async fn insert(&self, instance: &ApprovalInstance) -> Result<(), InfraError>;

    /// 楽観的ロック付きでインスタンスを更新する
    async fn update_with_version_check(
        &self,
        instance: &ApprovalInstance,
        expected_version: Version,
    ) -> Result<(), InfraError>;

    /// ID でインスタンスを取得
    async fn find_by_id(
        &self,
        id: &ApprovalInstanceId,
    ) -> Result<Option<ApprovalInstance>, InfraError>;

    /// 決裁待ちのインスタンス一覧を取得（タイムアウト判定用）
    async fn find_open(&self) -> Result<Vec<ApprovalInstance>, InfraError>;

    /// 文書の決裁待ちインスタンスを取得
    async fn find_open_by_document(
        &self,
        document_id: &DocumentId,
    ) -> Result<Option<ApprovalInstance>, InfraError>;

    /// コンテキストパッチが配信待ちのインスタンス一覧を取得（再配信用）
    async fn find_with_pending_patch(&self) -> Result<Vec<ApprovalInstance>, InfraError>;
}

/// PostgreSQL 実装の ApprovalInstanceRepository
#[derive(Debug, Clone)]
pub struct PostgresApprovalInstanceRepository {
    pool: PgPool,
}

impl PostgresApprovalInstanceRepository {
    /// 新しいリポジトリインスタンスを作成
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn restore(
    row: Option<(Json<ApprovalInstanceRecord>,)>,
) -> Result<Option<ApprovalInstance>, InfraError> {
    Ok(row
        .map(|(Json(record),)| ApprovalInstance::from_db(record))
        .transpose()?)
}

#[async_trait]
impl ApprovalInstanceRepository for PostgresApprovalInstanceRepository {
    #[tracing::instrument(skip_all, level = "debug", fields(id = %instance.id(), document_id = %instance.document_id()))]
    async fn insert(&self, instance: &ApprovalInstance) -> Result<(), InfraError> {
        let result = sqlx::query(
            r#"
            INSERT INTO approval_instances (
                id, document_id, case_id, status, version, body, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(*instance.id().as_uuid())
        .bind(*instance.document_id().as_uuid())
        .bind(*instance.case_id().as_uuid())
        .bind(instance.status().to_string())
        .bind(instance.version().as_i64())
        .bind(Json(instance.to_record()))
        .bind(instance.created_at())
        .bind(instance.updated_at())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(InfraError::conflict(
                ENTITY_NAME,
                instance.document_id().to_string(),
            ));
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, level = "debug", fields(id = %instance.id(), %expected_version))]
    async fn update_with_version_check(
        &self,
        instance: &ApprovalInstance,
        expected_version: Version,
    ) -> Result<(), InfraError> {
        let result = sqlx::query(
            r#"
            UPDATE approval_instances
            SET status = $3, version = $4, body = $5, updated_at = $6
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(*instance.id().as_uuid())
        .bind(expected_version.as_i64())
        .bind(instance.status().to_string())
        .bind(instance.version().as_i64())
        .bind(Json(instance.to_record()))
        .bind(instance.updated_at())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(InfraError::conflict(
                ENTITY_NAME,
                instance.id().to_string(),
            ));
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, level = "debug", fields(%id))]
    async fn find_by_id(
        &self,
        id: &ApprovalInstanceId,
    ) -> Result<Option<ApprovalInstance>, InfraError> {
        let row = sqlx::query_as("SELECT body FROM approval_instances WHERE id = $1")
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        restore(row)
    }

    #[tracing::instrument(skip_all, level = "debug")]
    async fn find_open(&self) -> Result<Vec<ApprovalInstance>, InfraError> {
        let rows: Vec<(Uuid, JsonValue)> = sqlx::query_as(
            r#"
            SELECT id, body FROM approval_instances
            WHERE status IN ('pending', 'escalated')
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(restore_rows(ENTITY_NAME, rows, ApprovalInstance::from_db))
    }

    #[tracing::instrument(skip_all, level = "debug", fields(%document_id))]
    async fn find_open_by_document(
        &self,
        document_id: &DocumentId,
    ) -> Result<Option<ApprovalInstance>, InfraError> {
        let row = sqlx::query_as(
            r#"
            SELECT body FROM approval_instances
            WHERE document_id = $1 AND status IN ('pending', 'escalated')
            "#,
        )
        .bind(*document_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        restore(row)
    }

    #[tracing::instrument(skip_all, level = "debug")]
    async fn find_with_pending_patch(&self) -> Result<Vec<ApprovalInstance>, InfraError> {
        let rows: Vec<(Uuid, JsonValue)> = sqlx::query_as(
            r#"
            SELECT id, body FROM approval_instances
            WHERE body ? 'pending_patch'
            ORDER BY updated_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(restore_rows(ENTITY_NAME, rows, ApprovalInstance::from_db))
    }
}
