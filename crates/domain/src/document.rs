//! # 文書
//!
//! 修理案件に紐づく文書（受付票、見積書、点検報告書など）のドメインモデル。
//!
//! 文書の作成・内容編集は CRUD 層の責務で、本クレートが扱うのはステータスのみ。
//! 承認エンジンとワークフローアクション（`update_document_status`）が
//! ステータスを書き換える。
//!
//! 状態遷移の例: `draft` → `pending_approval` → `approved` / `rejected` → `issued`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use strum::IntoStaticStr;

use crate::{DomainError, value_objects::CaseId};

define_uuid_id! {
    /// 文書 ID
    pub struct DocumentId;
}

/// 文書ステータス
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, IntoStaticStr, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DocumentStatus {
    /// 作成中
    Draft,
    /// 承認待ち
    PendingApproval,
    /// 承認済み
    Approved,
    /// 却下
    Rejected,
    /// 顧客へ発行済み
    Issued,
    /// アーカイブ済み
    Archived,
}

impl std::str::FromStr for DocumentStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "pending_approval" => Ok(Self::PendingApproval),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "issued" => Ok(Self::Issued),
            "archived" => Ok(Self::Archived),
            _ => Err(DomainError::Validation(format!(
                "不正な文書ステータス: {s}"
            ))),
        }
    }
}

/// 文書エンティティ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    id:               DocumentId,
    case_id:          CaseId,
    /// 文書種別（例: `"quotation"`）。承認ワークフローの選択とコンテキストパッチのキーに使う
    document_type_id: String,
    content:          JsonValue,
    status:           DocumentStatus,
    created_at:       DateTime<Utc>,
    updated_at:       DateTime<Utc>,
}

/// 文書の新規作成パラメータ
pub struct NewDocument {
    pub id:               DocumentId,
    pub case_id:          CaseId,
    pub document_type_id: String,
    pub content:          JsonValue,
    pub now:              DateTime<Utc>,
}

impl Document {
    /// 下書き状態の文書を作成する
    pub fn new(params: NewDocument) -> Self {
        Self {
            id:               params.id,
            case_id:          params.case_id,
            document_type_id: params.document_type_id,
            content:          params.content,
            status:           DocumentStatus::Draft,
            created_at:       params.now,
            updated_at:       params.now,
        }
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn case_id(&self) -> &CaseId {
        &self.case_id
    }

    pub fn document_type_id(&self) -> &str {
        &self.document_type_id
    }

    pub fn content(&self) -> &JsonValue {
        &self.content
    }

    pub fn status(&self) -> DocumentStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// ステータスを変更した新しい文書を返す
    pub fn with_status(self, status: DocumentStatus, now: DateTime<Utc>) -> Self {
        Self {
            status,
            updated_at: now,
            ..self
        }
    }
}
