//! # DocumentRepository
//!
//! 修理案件に紐づく文書（見積書・請求書など）の永続化を担当するリポジトリ。
//!
//! 承認エンジンは文書の内容を読み、承認結果に応じてステータスだけを更新する。
//! 文書内容の編集やファイル保管はこのクレートの範囲外。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use repairflow_domain::{
    document::{Document, DocumentId, DocumentStatus},
    value_objects::CaseId,
};
use sqlx::{PgPool, types::Json};

use crate::error::InfraError;

/// 文書リポジトリトレイト
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    /// ID で文書を取得する
    async fn find_by_id(&self, id: &DocumentId) -> Result<Option<Document>, InfraError>;

    /// 案件の指定種別の文書を取得する（新しいもの優先）
    ///
    /// ワークフロー定義の `update_document_status` アクションの対象解決に使う。
    async fn find_by_case_and_type(
        &self,
        case_id: &CaseId,
        document_type_id: &str,
    ) -> Result<Option<Document>, InfraError>;

    /// 文書を作成する
    async fn insert(&self, document: &Document) -> Result<(), InfraError>;

    /// 文書のステータスを更新する
    ///
    /// 文書が存在しない場合は何もしない。
    async fn update_status(
        &self,
        id: &DocumentId,
        status: DocumentStatus,
        now: DateTime<Utc>,
    ) -> Result<(), InfraError>;
}

/// PostgreSQL 実装の DocumentRepository
#[derive(Debug, Clone)]
pub struct PostgresDocumentRepository {
    pool: PgPool,
}

impl PostgresDocumentRepository {
    /// 新しいリポジトリインスタンスを作成
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentRepository for PostgresDocumentRepository {
    #[tracing::instrument(skip_all, level = "debug", fields(%id))]
    async fn find_by_id(&self, id: &DocumentId) -> Result<Option<Document>, InfraError> {
        let row: Option<(Json<Document>,)> =
            sqlx::query_as("SELECT body FROM documents WHERE id = $1")
                .bind(*id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(Json(document),)| document))
    }

    #[tracing::instrument(skip_all, level = "debug", fields(%case_id, document_type_id))]
    async fn find_by_case_and_type(
        &self,
        case_id: &CaseId,
        document_type_id: &str,
    ) -> Result<Option<Document>, InfraError> {
        let row: Option<(Json<Document>,)> = sqlx::query_as(
            r#"
            SELECT body FROM documents
            WHERE case_id = $1 AND document_type_id = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(*case_id.as_uuid())
        .bind(document_type_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(Json(document),)| document))
    }

    #[tracing::instrument(skip_all, level = "debug", fields(id = %document.id()))]
    async fn insert(&self, document: &Document) -> Result<(), InfraError> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, case_id, document_type_id, status, body, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(*document.id().as_uuid())
        .bind(*document.case_id().as_uuid())
        .bind(document.document_type_id())
        .bind(<&str>::from(document.status()))
        .bind(Json(document))
        .bind(document.created_at())
        .bind(document.updated_at())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip_all, level = "debug", fields(%id, %status))]
    async fn update_status(
        &self,
        id: &DocumentId,
        status: DocumentStatus,
        now: DateTime<Utc>,
    ) -> Result<(), InfraError> {
        let Some(document) = self.find_by_id(id).await? else {
            return Ok(());
        };
        let document = document.with_status(status, now);

        sqlx::query(
            r#"
            UPDATE documents
            SET status = $2, body = $3, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(*id.as_uuid())
        .bind(<&str>::from(status))
        .bind(Json(&document))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
