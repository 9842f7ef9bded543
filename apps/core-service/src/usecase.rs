//! # ユースケース層
//!
//! ドメイン層の純粋なエンジンをリポジトリ・通知送信と結線する。
//!
//! ## 設計方針
//!
//! - **依存性注入**: リポジトリ・通知サービス・時計を `Arc<dyn Trait>` で外部から注入
//! - **1 操作 1 インスタンス**: 各操作はインスタンスを 1 件読み込み、エンジンを実行し、
//!   読み込み時のバージョンで compare-and-swap 保存する
//! - **副作用は fire-and-forget**: 通知・文書ステータス更新の失敗はログ出力のみで、
//!   インスタンスの状態遷移は巻き戻さない
//!
//! ## モジュール構成
//!
//! - `workflow_definition`: 定義の登録・公開・アーカイブ
//! - `configuration`: 案件属性からのワークフロー構成選択
//! - `workflow_execution`: 案件ワークフローインスタンスの実行
//! - `approval`: 文書の多段階承認
//! - `document`: 案件に紐づく文書
//! - `notification`: 通知の描画・送信・再送
//! - `scheduled_jobs`: タイムアウト判定・コンテキストパッチ再配信・通知再送の定期実行

pub(crate) mod helpers;

pub mod approval;
pub mod configuration;
pub mod document;
pub mod notification;
pub mod scheduled_jobs;
pub mod workflow_definition;
pub mod workflow_execution;

pub use approval::{
    ApprovalUseCaseImpl,
    ContextPatchPublisher,
    PatchRedeliveryReport,
    SubmitApprovalInput,
};
pub use configuration::ConfigurationUseCaseImpl;
pub use document::DocumentUseCaseImpl;
pub use notification::{NotificationService, TemplateRenderer};
pub use scheduled_jobs::{JobReport, ScheduledJobsRunner};
pub use workflow_definition::WorkflowDefinitionUseCaseImpl;
pub use workflow_execution::WorkflowExecutionUseCaseImpl;

/// タイムアウト一括判定の集計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// 判定したインスタンス数
    pub checked:   usize,
    /// エスカレーション・強制遷移を行ったインスタンス数
    pub escalated: usize,
    /// エラーになったインスタンス数
    pub failed:    usize,
    /// 処理時間の上限を超えたインスタンス数
    pub timed_out: usize,
}

/// 定期ジョブで 1 インスタンスあたりに許す処理時間の既定値
pub const DEFAULT_SWEEP_INSTANCE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
