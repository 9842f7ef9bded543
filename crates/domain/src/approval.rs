//! # 文書承認
//!
//! 見積書・請求書などの文書を、レベル順の多段承認に回す。
//!
//! ## 概念モデル
//!
//! - **ApprovalWorkflow**: 文書種別ごとの承認レベル・エスカレーション・委任・通知の設定
//! - **ApprovalInstance**: 文書 1 件の承認状態。申請時点の設定をスナップショットとして保持する
//! - **Approver**: 決裁しようとしているユーザー（ID と保有ロール）
//!
//! ## 設計方針
//!
//! - 必要承認数は「異なる決裁者」で数える。委任を受けた決裁は委任元の 1 票として扱う
//! - スキップ条件は申請時のコンテキスト（文書内容を含む）に対して評価し、スキップしたレベルは記録に残す
//! - 承認完了・却下時は案件のワークフローインスタンスへ [`ContextPatch`](crate::context::ContextPatch)
//!   を発行し、ワークフロー側の遷移条件（`quotation.status == approved` など）から参照できるようにする

mod config;
mod instance;

pub use config::*;
pub use instance::*;
