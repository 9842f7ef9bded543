//! # Core Service エラー定義
//!
//! ユースケース層のエラーと、呼び出し元（API 層）向けのステータスコードへの対応を定義する。

use repairflow_domain::DomainError;
use repairflow_infra::{InfraError, error::InfraErrorKind};
use thiserror::Error;

/// Core Service で発生するエラー
#[derive(Debug, Error)]
pub enum CoreError {
    /// リソースが見つからない
    #[error("リソースが見つかりません: {0}")]
    NotFound(String),

    /// 不正なリクエスト
    #[error("不正なリクエスト: {0}")]
    BadRequest(String),

    /// 権限不足（承認権限のない決裁を含む）
    #[error("権限がありません: {0}")]
    Forbidden(String),

    /// 競合（楽観的ロック失敗、決裁待ちの二重申請）
    #[error("競合が発生しました: {0}")]
    Conflict(String),

    /// 自動遷移の循環（インスタンスは凍結済み）
    #[error("自動遷移の循環を検出しました: {0}")]
    CycleDetected(String),

    /// データベースエラー
    #[error("データベースエラー: {0}")]
    Database(InfraError),

    /// 内部エラー
    #[error("内部エラー: {0}")]
    Internal(String),
}

impl CoreError {
    /// API 層で使う HTTP ステータスコード
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::BadRequest(_) => 400,
            Self::Forbidden(_) => 403,
            Self::Conflict(_) => 409,
            Self::CycleDetected(_) => 422,
            Self::Database(_) | Self::Internal(_) => 500,
        }
    }
}

impl From<InfraError> for CoreError {
    fn from(e: InfraError) -> Self {
        match e.kind() {
            InfraErrorKind::Conflict { entity, id } => Self::Conflict(format!(
                "{entity} は既に更新されています。最新の状態を取得してください: {id}"
            )),
            _ => Self::Database(e),
        }
    }
}

impl From<DomainError> for CoreError {
    fn from(e: DomainError) -> Self {
        match e {
            DomainError::Validation(_) => Self::BadRequest(e.to_string()),
            DomainError::NotFound { .. } => Self::NotFound(e.to_string()),
            DomainError::Conflict(_) => Self::Conflict(e.to_string()),
            DomainError::Forbidden(_) | DomainError::IneligibleApprover { .. } => {
                Self::Forbidden(e.to_string())
            }
            DomainError::CycleDetected { .. } => Self::CycleDetected(e.to_string()),
        }
    }
}
