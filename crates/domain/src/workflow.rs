//! # ワークフロー
//!
//! 修理案件を流すワークフローの定義・構成選択・インスタンス・実行エンジンを管理する。
//!
//! ## 概念モデル
//!
//! - **WorkflowDefinition**: 名前 + バージョンで管理されるワークフローのテンプレート
//! - **WorkflowConfiguration**: 案件の属性から定義を選ぶためのルール
//! - **WorkflowInstance**: 定義のスナップショットから生成された案件ごとの実行状態
//! - **engine**: インスタンスを進める純粋関数群（副作用は [`EngineEffect`] として返す）
//!
//! ## 使用例
//!
//! ```rust
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use repairflow_domain::{
//!     value_objects::{CaseId, StepId, Version, WorkflowName},
//!     workflow::{
//!         NewWorkflowDefinition, WorkflowDefinition, WorkflowDefinitionId, WorkflowGraph,
//!         engine,
//!     },
//! };
//! use serde_json::json;
//!
//! let now = chrono::Utc::now();
//! let graph = WorkflowGraph::parse(&json!({
//!     "steps": [
//!         {"id": "start", "name": "開始", "type": "start_event",
//!          "transitions": [{"to": "registration"}]},
//!         {"id": "registration", "name": "受付", "type": "manual",
//!          "transitions": [{"to": "end", "condition": "status == 'done'"}]},
//!         {"id": "end", "name": "完了", "type": "end_event"}
//!     ]
//! }))?;
//! let definition = WorkflowDefinition::new(NewWorkflowDefinition {
//!     id: WorkflowDefinitionId::new(),
//!     name: WorkflowName::new("smartphone_repair")?,
//!     version: Version::initial(),
//!     metadata: json!({}),
//!     graph,
//!     now,
//! })
//! .published(now)?;
//!
//! let outcome = engine::start(&definition, CaseId::new(), &json!({}), now)?;
//! assert_eq!(outcome.instance.current_step_id(), &StepId::new("registration"));
//! # Ok(())
//! # }
//! ```

mod configuration;
mod definition;
mod definition_validator;
pub mod engine;
mod instance;
mod step;

pub use configuration::*;
pub use definition::*;
pub use definition_validator::*;
pub use engine::{AdvanceResult, EngineEffect, EngineOutcome, TimeoutResult};
pub use instance::*;
pub use step::*;
