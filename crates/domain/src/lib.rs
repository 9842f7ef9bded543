//! # RepairFlow ドメイン層
//!
//! 修理案件ワークフローと文書承認の中核となるドメインモデルを定義する。
//!
//! ## 設計方針
//!
//! - **純粋なステートマシン**: ワークフロー実行エンジン・承認エンジンは I/O を持たず、
//!   ロード済みのエンティティと現在時刻を受け取り、新しいエンティティと副作用（通知・
//!   文書ステータス更新など）のリストを返す
//! - **定義は登録時に型付きグラフへ変換**: JSON 定義はバリデーション後に
//!   [`workflow::WorkflowGraph`] に変換し、実行中のインスタンスはそのスナップショットを保持する
//! - **楽観的ロック**: すべてのインスタンスが [`value_objects::Version`] を持ち、
//!   保存時の compare-and-swap はインフラ層で行う
//!
//! ## 依存関係の方向
//!
//! ```text
//! core-service → infra → domain → shared
//! ```
//!
//! ## モジュール構成
//!
//! - [`condition`] - 遷移・スキップ条件の式言語
//! - [`workflow`] - ワークフロー定義、設定選択、インスタンス、実行エンジン
//! - [`approval`] - 多段階文書承認
//! - [`document`] - 修理案件に紐づく文書
//! - [`notification`] - 通知リクエストと通知ログ
//! - [`context`] - インスタンスコンテキストのマージとコンテキストパッチ
//! - [`clock`] - 時刻プロバイダ
//!
//! ## 使用例
//!
//! ```rust
//! use repairflow_domain::DomainError;
//!
//! let error = DomainError::NotFound {
//!     entity_type: "WorkflowDefinition",
//!     id:          "smartphone_repair v2".to_string(),
//! };
//! assert!(error.to_string().contains("smartphone_repair"));
//! ```

#[macro_use]
mod macros;

pub mod approval;
pub mod clock;
pub mod condition;
pub mod context;
pub mod document;
pub mod error;
pub mod notification;
pub mod value_objects;
pub mod workflow;

pub use error::DomainError;
