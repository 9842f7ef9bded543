//! # ApprovalWorkflowRepository
//!
//! 文書種別ごとの承認ワークフロー設定の永続化を担当するリポジトリ。

use async_trait::async_trait;
use repairflow_domain::approval::{ApprovalWorkflow, ApprovalWorkflowId};
use sqlx::{PgPool, types::Json};

use crate::error::InfraError;

/// 承認ワークフローリポジトリトレイト
#[async_trait]
pub trait ApprovalWorkflowRepository: Send + Sync {
    /// 設定を保存する（新規作成または更新）
    ///
    /// 実行中の承認インスタンスは申請時のスナップショットを持つため、更新の影響を受けない。
    async fn save(&self, workflow: &ApprovalWorkflow) -> Result<(), InfraError>;

    /// ID で設定を取得
    async fn find_by_id(&self, id: &ApprovalWorkflowId)
    -> Result<Option<ApprovalWorkflow>, InfraError>;
}

/// PostgreSQL 実装の ApprovalWorkflowRepository
#[derive(Debug, Clone)]
pub struct PostgresApprovalWorkflowRepository {
    pool: PgPool,
}

impl PostgresApprovalWorkflowRepository {
    /// 新しいリポジトリインスタンスを作成
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ApprovalWorkflowRepository for PostgresApprovalWorkflowRepository {
    #[tracing::instrument(skip_all, level = "debug", fields(id = %workflow.id))]
    async fn save(&self, workflow: &ApprovalWorkflow) -> Result<(), InfraError> {
        sqlx::query(
            r#"
            INSERT INTO approval_workflows (id, name, is_active, body)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                is_active = EXCLUDED.is_active,
                body = EXCLUDED.body
            "#,
        )
        .bind(*workflow.id.as_uuid())
        .bind(&workflow.name)
        .bind(workflow.is_active)
        .bind(Json(workflow))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip_all, level = "debug", fields(%id))]
    async fn find_by_id(
        &self,
        id: &ApprovalWorkflowId,
    ) -> Result<Option<ApprovalWorkflow>, InfraError> {
        let row: Option<(Json<ApprovalWorkflow>,)> =
            sqlx::query_as("SELECT body FROM approval_workflows WHERE id = $1")
                .bind(*id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;

        // 読み込み時にも検証する（レベル順の整列を含む）
        Ok(row
            .map(|(Json(workflow),)| workflow.validated())
            .transpose()?)
    }
}
