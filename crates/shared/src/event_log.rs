//! # ビジネスイベントログの構造化ヘルパー
//!
//! `jq` で効率的に調査できるよう、ログフィールドの命名規約と
//! ヘルパーマクロを提供する。
//!
//! ## ビジネスイベント
//!
//! [`log_business_event!`] マクロで出力する。`event.kind = "business_event"` マーカーが
//! 自動付与され、`jq 'select(.["event.kind"] == "business_event")'` でフィルタできる。
//!
//! ## フィールド命名規約
//!
//! ドット記法（`event.category`、`error.kind`）を使用。tracing の
//! `$($field:ident).+` パターンでサポートされ、JSON 出力でフラットなキーになる。

/// ビジネスイベントを構造化ログとして出力する。
///
/// `event.kind = "business_event"` マーカーを自動付与し、
/// `tracing::info!` レベルで出力する。
///
/// ## 必須フィールド（慣例）
///
/// - `event.category`: イベントカテゴリ（[`event::category`] の定数を使用）
/// - `event.action`: アクション名（[`event::action`] の定数を使用）
/// - `event.result`: 結果（[`event::result`] の定数を使用）
///
/// ## 推奨フィールド
///
/// - `event.entity_type`: エンティティ種別（[`event::entity_type`] の定数を使用）
/// - `event.entity_id`: エンティティ ID
/// - `event.actor_id`: 操作者 ID
#[macro_export]
macro_rules! log_business_event {
    ($($args:tt)*) => {
        ::tracing::info!(
            event.kind = "business_event",
            $($args)*
        )
    };
}

/// イベントフィールドの定数
pub mod event {
    /// イベントカテゴリ
    pub mod category {
        pub const WORKFLOW: &str = "workflow";
        pub const APPROVAL: &str = "approval";
        pub const NOTIFICATION: &str = "notification";
        pub const SCHEDULER: &str = "scheduler";
    }

    /// イベントアクション
    pub mod action {
        // ワークフロー定義
        pub const DEFINITION_REGISTERED: &str = "definition.registered";
        pub const DEFINITION_PUBLISHED: &str = "definition.published";
        pub const DEFINITION_ARCHIVED: &str = "definition.archived";

        // ワークフローインスタンス
        pub const WORKFLOW_STARTED: &str = "workflow.started";
        pub const WORKFLOW_ADVANCED: &str = "workflow.advanced";
        pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
        pub const WORKFLOW_CANCELLED: &str = "workflow.cancelled";
        pub const WORKFLOW_FROZEN: &str = "workflow.frozen";
        pub const WORKFLOW_ESCALATED: &str = "workflow.escalated";

        // 承認
        pub const APPROVAL_SUBMITTED: &str = "approval.submitted";
        pub const APPROVAL_APPROVED: &str = "approval.approved";
        pub const APPROVAL_REJECTED: &str = "approval.rejected";
        pub const APPROVAL_DELEGATED: &str = "approval.delegated";
        pub const APPROVAL_ESCALATED: &str = "approval.escalated";
        pub const APPROVAL_COMPLETED: &str = "approval.completed";
        pub const APPROVAL_PATCH_DELIVERED: &str = "approval.patch_delivered";

        // 通知
        pub const NOTIFICATION_SENT: &str = "notification.sent";
        pub const NOTIFICATION_FAILED: &str = "notification.failed";
        pub const NOTIFICATION_RETRIED: &str = "notification.retried";
        pub const NOTIFICATION_ABANDONED: &str = "notification.abandoned";
        pub const NOTIFICATION_PURGED: &str = "notification.purged";

        // スケジューラ
        pub const SWEEP_COMPLETED: &str = "scheduler.sweep_completed";
    }

    /// エンティティ種別
    pub mod entity_type {
        pub const WORKFLOW_DEFINITION: &str = "workflow_definition";
        pub const WORKFLOW_INSTANCE: &str = "workflow_instance";
        pub const APPROVAL_INSTANCE: &str = "approval_instance";
        pub const NOTIFICATION_LOG: &str = "notification_log";
    }

    /// イベント結果
    pub mod result {
        pub const SUCCESS: &str = "success";
        pub const FAILURE: &str = "failure";
    }
}

/// エラーコンテキストフィールドの定数
pub mod error {
    /// エラーカテゴリ
    pub mod category {
        /// インフラストラクチャ（DB）
        pub const INFRASTRUCTURE: &str = "infrastructure";
        /// 外部サービス呼び出し（SMTP、SES、Webhook）
        pub const EXTERNAL_SERVICE: &str = "external_service";
        /// ワークフロー定義の不整合
        pub const DEFINITION: &str = "definition";
    }

    /// エラー種別
    pub mod kind {
        pub const DATABASE: &str = "database";
        pub const VERSION_CONFLICT: &str = "version_conflict";
        pub const CYCLE_DETECTED: &str = "cycle_detected";
        pub const TIMEOUT: &str = "timeout";
        pub const INTERNAL: &str = "internal";
    }
}
