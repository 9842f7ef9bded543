//! # ドメイン層エラー定義
//!
//! ビジネスルール違反やドメイン固有の例外状態を表現するエラー型。
//!
//! ## エラーの種類と HTTP ステータスの対応
//!
//! | エラー種別 | HTTP ステータス | 用途 |
//! |-----------|----------------|------|
//! | `Validation` | 400 Bad Request | 入力値・定義の検証失敗 |
//! | `NotFound` | 404 Not Found | エンティティが存在しない |
//! | `Conflict` | 409 Conflict | 楽観的ロックの失敗、二重申請 |
//! | `Forbidden` | 403 Forbidden | 権限不足 |
//! | `IneligibleApprover` | 403 Forbidden | 現在の承認レベルに対する決裁権限がない |
//! | `CycleDetected` | 422 Unprocessable Entity | 自動遷移の循環（インスタンスは凍結される） |
//!
//! 条件式の構文エラーは [`ExpressionError`](crate::condition::ExpressionError) として
//! 別に定義し、定義登録時にのみ発生させる。
//!
//! ## 使用例
//!
//! ```rust
//! use repairflow_domain::DomainError;
//!
//! fn validate_name(name: &str) -> Result<(), DomainError> {
//!     if name.is_empty() {
//!         return Err(DomainError::Validation("名前は必須です".to_string()));
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// ドメイン層で発生するエラー
///
/// ビジネスロジックの実行中に発生する例外状態を表現する。
/// ユースケース層でこのエラーを受け取り、呼び出し元向けのエラーに変換する。
#[derive(Debug, Error)]
pub enum DomainError {
    /// バリデーションエラー
    ///
    /// 入力値がビジネスルールに違反している場合に使用する。
    ///
    /// # 例
    ///
    /// - 必須フィールドが未入力
    /// - 終了済みインスタンスへの操作
    /// - 不正なステータス文字列
    #[error("バリデーションエラー: {0}")]
    Validation(String),

    /// エンティティが見つからない
    #[error("{entity_type} が見つかりません: {id}")]
    NotFound {
        /// エンティティの種類（"WorkflowDefinition", "Document" など）
        entity_type: &'static str,
        /// 検索に使用した識別子
        id:          String,
    },

    /// 競合エラー
    ///
    /// 同一文書への二重申請など、現在の状態と矛盾する操作を表す。
    /// 楽観的ロック失敗はインフラ層で検出し、ユースケース層で同じ扱いにする。
    #[error("競合が発生しました: {0}")]
    Conflict(String),

    /// 権限エラー
    #[error("権限がありません: {0}")]
    Forbidden(String),

    /// 承認権限のないユーザーによる決裁
    ///
    /// `approver_ids` に含まれず、有効な委任も受けていないユーザーが
    /// 承認・却下・委任を行おうとした場合に使用する。
    #[error("承認レベル {level} に対する決裁権限がありません: {approver_id}")]
    IneligibleApprover {
        /// 操作しようとしたユーザー
        approver_id: String,
        /// 現在の承認レベル
        level:       u32,
    },

    /// 自動遷移の循環検出
    ///
    /// automatic ステップの連鎖がホップ上限を超えた場合に発生する。
    /// 定義の不備を示すため、インスタンスは凍結して手動調査に回す。
    #[error("自動遷移が {hops} ホップを超えました（最後のステップ: {step_id}）")]
    CycleDetected {
        /// 上限到達時に滞在していたステップ
        step_id: String,
        /// 到達したホップ数
        hops:    usize,
    },
}
