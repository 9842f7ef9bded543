//! # WorkflowConfigurationRepository
//!
//! 案件属性からワークフロー定義を選ぶ構成レコードの永続化を担当するリポジトリ。
//!
//! 構成の選択ロジックはドメイン層の [`select`](repairflow_domain::workflow::select) が持ち、
//! ここでは有効な構成の一覧を返すだけにする。

use async_trait::async_trait;
use repairflow_domain::workflow::{WorkflowConfiguration, WorkflowConfigurationId};
use sqlx::{PgPool, types::Json};

use crate::error::InfraError;

/// ワークフロー構成リポジトリトレイト
#[async_trait]
pub trait WorkflowConfigurationRepository: Send + Sync {
    /// 構成を保存する（新規作成または更新）
    async fn save(&self, configuration: &WorkflowConfiguration) -> Result<(), InfraError>;

    /// ID で構成を取得
    async fn find_by_id(
        &self,
        id: &WorkflowConfigurationId,
    ) -> Result<Option<WorkflowConfiguration>, InfraError>;

    /// 有効な構成の一覧を取得
    async fn find_active(&self) -> Result<Vec<WorkflowConfiguration>, InfraError>;
}

/// PostgreSQL 実装の WorkflowConfigurationRepository
#[derive(Debug, Clone)]
pub struct PostgresWorkflowConfigurationRepository {
    pool: PgPool,
}

impl PostgresWorkflowConfigurationRepository {
    /// 新しいリポジトリインスタンスを作成
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkflowConfigurationRepository for PostgresWorkflowConfigurationRepository {
    #[tracing::instrument(skip_all, level = "debug", fields(id = %configuration.id))]
    async fn save(&self, configuration: &WorkflowConfiguration) -> Result<(), InfraError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_configurations (id, is_active, priority, body, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                is_active = EXCLUDED.is_active,
                priority = EXCLUDED.priority,
                body = EXCLUDED.body
            "#,
        )
        .bind(*configuration.id.as_uuid())
        .bind(configuration.is_active)
        .bind(configuration.priority)
        .bind(Json(configuration))
        .bind(configuration.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip_all, level = "debug", fields(%id))]
    async fn find_by_id(
        &self,
        id: &WorkflowConfigurationId,
    ) -> Result<Option<WorkflowConfiguration>, InfraError> {
        let row: Option<(Json<WorkflowConfiguration>,)> =
            sqlx::query_as("SELECT body FROM workflow_configurations WHERE id = $1")
                .bind(*id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(Json(configuration),)| configuration))
    }

    #[tracing::instrument(skip_all, level = "debug")]
    async fn find_active(&self) -> Result<Vec<WorkflowConfiguration>, InfraError> {
        let rows: Vec<(Json<WorkflowConfiguration>,)> = sqlx::query_as(
            "SELECT body FROM workflow_configurations WHERE is_active ORDER BY priority DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(Json(c),)| c).collect())
    }
}
