//! # 文書ユースケース
//!
//! 案件に紐づく文書の作成・取得・ステータス更新。
//! 承認とワークフローアクションはリポジトリを直接使い、ここは外部からの操作の入口になる。

use std::sync::Arc;

use repairflow_domain::{
    clock::Clock,
    document::{Document, DocumentId, DocumentStatus, NewDocument},
    value_objects::CaseId,
};
use repairflow_infra::repository::DocumentRepository;
use serde_json::Value as JsonValue;

use super::helpers::FindResultExt;
use crate::error::CoreError;

/// 文書ユースケース
pub struct DocumentUseCaseImpl {
    document_repo: Arc<dyn DocumentRepository>,
    clock:         Arc<dyn Clock>,
}

impl DocumentUseCaseImpl {
    pub fn new(document_repo: Arc<dyn DocumentRepository>, clock: Arc<dyn Clock>) -> Self {
        Self {
            document_repo,
            clock,
        }
    }

    /// 下書き状態の文書を作成する
    pub async fn create_document(
        &self,
        case_id: CaseId,
        document_type_id: &str,
        content: JsonValue,
    ) -> Result<Document, CoreError> {
        let document_type_id = document_type_id.trim();
        if document_type_id.is_empty() {
            return Err(CoreError::BadRequest("文書種別は必須です".to_string()));
        }

        let document = Document::new(NewDocument {
            id: DocumentId::new(),
            case_id,
            document_type_id: document_type_id.to_string(),
            content,
            now: self.clock.now(),
        });
        self.document_repo
            .insert(&document)
            .await
            .map_err(|e| CoreError::Internal(format!("文書の保存に失敗: {}", e)))?;

        tracing::info!(
            document_id = %document.id(),
            case_id = %document.case_id(),
            document_type_id,
            "文書を作成"
        );
        Ok(document)
    }

    /// ID で文書を取得（存在しなければ `None`）
    pub async fn get_document(&self, id: &DocumentId) -> Result<Option<Document>, CoreError> {
        self.document_repo
            .find_by_id(id)
            .await
            .map_err(|e| CoreError::Internal(format!("文書の取得に失敗: {}", e)))
    }

    /// 文書のステータスを更新し、更新後の文書を返す
    pub async fn update_status(
        &self,
        id: &DocumentId,
        status: DocumentStatus,
    ) -> Result<Document, CoreError> {
        let document = self.document_repo.find_by_id(id).await.or_not_found("文書")?;
        let now = self.clock.now();

        self.document_repo
            .update_status(id, status, now)
            .await
            .map_err(|e| CoreError::Internal(format!("文書ステータスの更新に失敗: {}", e)))?;

        Ok(document.with_status(status, now))
    }
}
