//! # WorkflowInstanceRepository
//!
//! ワークフローインスタンスの永続化を担当するリポジトリ。
//!
//! ## 設計方針
//!
//! - **楽観的ロック**: 更新は `update_with_version_check` のみ。期待バージョンと一致しない場合は
//!   `Conflict` を返し、呼び出し側が再読み込みして再試行する
//! - **JSONB 本体**: 定義スナップショット・コンテキスト・履歴を含む
//!   [`WorkflowInstanceRecord`] を `body` に保存する。`status` / `case_id` / `version` は検索列

use async_trait::async_trait;
use repairflow_domain::{
    value_objects::{CaseId, Version},
    workflow::{WorkflowInstance, WorkflowInstanceId, WorkflowInstanceRecord},
};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, types::Json};
use uuid::Uuid;

use super::restore_rows;
use crate::error::InfraError;

const ENTITY_NAME: &str = "WorkflowInstance";

/// ワークフローインスタンスリポジトリトレイト
#[async_trait]
pub trait WorkflowInstanceRepository: Send + Sync {
    /// インスタンスを新規作成する
    async fn insert(&self, instance: &WorkflowInstance) -> Result<(), InfraError>;

    /// 楽観的ロック付きでインスタンスを更新する
    ///
    /// # 引数
    ///
    /// - `instance`: 更新後のインスタンス
    /// - `expected_version`: 読み込み時のバージョン
    ///
    /// # 戻り値
    ///
    /// - `Ok(())`: 更新成功
    /// - `Err(InfraErrorKind::Conflict)`: 他の更新が先に行われた
    async fn update_with_version_check(
        &self,
        instance: &WorkflowInstance,
        expected_version: Version,
    ) -> Result<(), InfraError>;

    /// ID でインスタンスを取得
    async fn find_by_id(
        &self,
        id: &WorkflowInstanceId,
    ) -> Result<Option<WorkflowInstance>, InfraError>;

    /// 実行中のインスタンス一覧を取得（タイムアウト判定用）
    async fn find_running(&self) -> Result<Vec<WorkflowInstance>, InfraError>;

    /// 案件の実行中インスタンスを取得
    async fn find_running_by_case(
        &self,
        case_id: &CaseId,
    ) -> Result<Vec<WorkflowInstance>, InfraError>;
}

/// PostgreSQL 実装の WorkflowInstanceRepository
#[derive(Debug, Clone)]
pub struct PostgresWorkflowInstanceRepository {
    pool: PgPool,
}

impl PostgresWorkflowInstanceRepository {
    /// 新しいリポジトリインスタンスを作成
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkflowInstanceRepository for PostgresWorkflowInstanceRepository {
    #[tracing::instrument(skip_all, level = "debug", fields(id = %instance.id()))]
    async fn insert(&self, instance: &WorkflowInstance) -> Result<(), InfraError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_instances (id, case_id, status, version, body, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(*instance.id().as_uuid())
        .bind(*instance.case_id().as_uuid())
        .bind(instance.status().to_string())
        .bind(instance.version().as_i64())
        .bind(Json(instance.to_record()))
        .bind(instance.created_at())
        .bind(instance.updated_at())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip_all, level = "debug", fields(id = %instance.id(), %expected_version))]
    async fn update_with_version_check(
        &self,
        instance: &WorkflowInstance,
        expected_version: Version,
    ) -> Result<(), InfraError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
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
                "WorkflowInstance",
                instance.id().to_string(),
            ));
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, level = "debug", fields(%id))]
    async fn find_by_id(
        &self,
        id: &WorkflowInstanceId,
    ) -> Result<Option<WorkflowInstance>, InfraError> {
        let row: Option<(Json<WorkflowInstanceRecord>,)> =
            sqlx::query_as("SELECT body FROM workflow_instances WHERE id = $1")
                .bind(*id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;

        Ok(row
            .map(|(Json(record),)| WorkflowInstance::from_db(record))
            .transpose()?)
    }

    #[tracing::instrument(skip_all, level = "debug")]
    async fn find_running(&self) -> Result<Vec<WorkflowInstance>, InfraError> {
        let rows: Vec<(Uuid, JsonValue)> = sqlx::query_as(
            "SELECT id, body FROM workflow_instances WHERE status = 'running' ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(restore_rows(ENTITY_NAME, rows, WorkflowInstance::from_db))
    }

    #[tracing::instrument(skip_all, level = "debug", fields(%case_id))]
    async fn find_running_by_case(
        &self,
        case_id: &CaseId,
    ) -> Result<Vec<WorkflowInstance>, InfraError> {
        let rows: Vec<(Uuid, JsonValue)> = sqlx::query_as(
            r#"
            SELECT id, body FROM workflow_instances
            WHERE case_id = $1 AND status = 'running'
            ORDER BY created_at
            "#,
        )
        .bind(*case_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        Ok(restore_rows(ENTITY_NAME, rows, WorkflowInstance::from_db))
    }
}
