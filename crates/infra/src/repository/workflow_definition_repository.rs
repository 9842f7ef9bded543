//! # WorkflowDefinitionRepository
//!
//! ワークフロー定義の永続化を担当するリポジトリ。
//!
//! ## 設計方針
//!
//! - **名前 + バージョンで一意**: `(name, version)` に一意制約を持つ
//! - **JSONB 本体**: 型付きグラフを含む [`WorkflowDefinitionRecord`] を `body` に保存する。
//!   `name` / `version` / `status` は検索用の列として重複して持つ

use async_trait::async_trait;
use repairflow_domain::{
    value_objects::{Version, WorkflowName},
    workflow::{WorkflowDefinition, WorkflowDefinitionId, WorkflowDefinitionRecord},
};
use sqlx::{PgPool, types::Json};

use crate::error::InfraError;

/// ワークフロー定義リポジトリトレイト
#[async_trait]
pub trait WorkflowDefinitionRepository: Send + Sync {
    /// 定義を新規作成する
    ///
    /// 同じ名前・バージョンの定義が既にある場合は `Conflict`。
    async fn insert(&self, definition: &WorkflowDefinition) -> Result<(), InfraError>;

    /// 定義のステータスを更新する（公開・アーカイブ）
    async fn update(&self, definition: &WorkflowDefinition) -> Result<(), InfraError>;

    /// ID で定義を取得
    async fn find_by_id(
        &self,
        id: &WorkflowDefinitionId,
    ) -> Result<Option<WorkflowDefinition>, InfraError>;

    /// 名前とバージョンで定義を取得
    async fn find_by_name_and_version(
        &self,
        name: &WorkflowName,
        version: Version,
    ) -> Result<Option<WorkflowDefinition>, InfraError>;

    /// 名前に対する最新の公開済み定義を取得
    async fn find_latest_published(
        &self,
        name: &WorkflowName,
    ) -> Result<Option<WorkflowDefinition>, InfraError>;

    /// 名前に対する最新バージョン（ステータスを問わない）
    async fn latest_version(&self, name: &WorkflowName) -> Result<Option<Version>, InfraError>;
}

/// PostgreSQL 実装の WorkflowDefinitionRepository
#[derive(Debug, Clone)]
pub struct PostgresWorkflowDefinitionRepository {
    pool: PgPool,
}

impl PostgresWorkflowDefinitionRepository {
    /// 新しいリポジトリインスタンスを作成
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn restore(row: Option<(Json<WorkflowDefinitionRecord>,)>) -> Option<WorkflowDefinition> {
    row.map(|(Json(record),)| WorkflowDefinition::from_db(record))
}

#[async_trait]
impl WorkflowDefinitionRepository for PostgresWorkflowDefinitionRepository {
    #[tracing::instrument(skip_all, level = "debug", fields(name = %definition.name(), version = %definition.version()))]
    async fn insert(&self, definition: &WorkflowDefinition) -> Result<(), InfraError> {
        let result = sqlx::query(
            r#"
            INSERT INTO workflow_definitions (id, name, version, status, body, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (name, version) DO NOTHING
            "#,
        )
        .bind(*definition.id().as_uuid())
        .bind(definition.name().as_str())
        .bind(definition.version().as_i64())
        .bind(definition.status().to_string())
        .bind(Json(definition.to_record()))
        .bind(definition.created_at())
        .bind(definition.updated_at())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(InfraError::conflict(
                "WorkflowDefinition",
                format!("{} {}", definition.name(), definition.version()),
            ));
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, level = "debug", fields(id = %definition.id()))]
    async fn update(&self, definition: &WorkflowDefinition) -> Result<(), InfraError> {
        sqlx::query(
            r#"
            UPDATE workflow_definitions
            SET status = $2, body = $3, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(*definition.id().as_uuid())
        .bind(definition.status().to_string())
        .bind(Json(definition.to_record()))
        .bind(definition.updated_at())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip_all, level = "debug", fields(%id))]
    async fn find_by_id(
        &self,
        id: &WorkflowDefinitionId,
    ) -> Result<Option<WorkflowDefinition>, InfraError> {
        let row = sqlx::query_as("SELECT body FROM workflow_definitions WHERE id = $1")
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        Ok(restore(row))
    }

    #[tracing::instrument(skip_all, level = "debug", fields(%name, %version))]
    async fn find_by_name_and_version(
        &self,
        name: &WorkflowName,
        version: Version,
    ) -> Result<Option<WorkflowDefinition>, InfraError> {
        let row = sqlx::query_as(
            "SELECT body FROM workflow_definitions WHERE name = $1 AND version = $2",
        )
        .bind(name.as_str())
        .bind(version.as_i64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(restore(row))
    }

    #[tracing::instrument(skip_all, level = "debug", fields(%name))]
    async fn find_latest_published(
        &self,
        name: &WorkflowName,
    ) -> Result<Option<WorkflowDefinition>, InfraError> {
        let row = sqlx::query_as(
            r#"
            SELECT body FROM workflow_definitions
            WHERE name = $1 AND status = 'published'
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(name.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(restore(row))
    }

    #[tracing::instrument(skip_all, level = "debug", fields(%name))]
    async fn latest_version(&self, name: &WorkflowName) -> Result<Option<Version>, InfraError> {
        let latest: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM workflow_definitions WHERE name = $1")
                .bind(name.as_str())
                .fetch_one(&self.pool)
                .await?;

        Ok(latest.map(Version::try_from).transpose()?)
    }
}
