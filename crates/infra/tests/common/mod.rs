//! テスト共通フィクスチャ
//!
//! DB を使用する統合テストで共通利用するエンティティ生成ヘルパー。
//! Rust の統合テスト規約に従い `tests/common/mod.rs` に配置。

// 各テストファイルが独立したクレートとしてコンパイルされるため、
// 使用しない関数に dead_code 警告が出る。モジュール全体で抑制する。
#![allow(dead_code)]

use chrono::{DateTime, Utc};
use repairflow_domain::{
    approval::{ApprovalInstance, ApprovalInstanceId, ApprovalWorkflow, NewApprovalInstance},
    document::{Document, DocumentId, NewDocument},
    value_objects::{CaseId, Version, WorkflowName},
    workflow::{
        NewWorkflowDefinition,
        NewWorkflowInstance,
        WorkflowDefinition,
        WorkflowDefinitionId,
        WorkflowGraph,
        WorkflowInstance,
        WorkflowInstanceId,
    },
};
use serde_json::{Value as JsonValue, json};

/// テスト用の固定日時
pub fn test_now() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

/// 受付 → 完了 の最小構成の定義グラフ
pub fn simple_graph_json() -> JsonValue {
    json!({
        "start_event": "start",
        "end_events": ["end"],
        "steps": [
            {"id": "start", "name": "開始", "type": "start_event",
             "transitions": [{"to": "registration", "condition": "always"}]},
            {"id": "registration", "name": "受付", "type": "manual", "timeout_hours": 4,
             "transitions": [{"to": "end", "condition": "status == 'completed'"}]},
            {"id": "end", "name": "完了", "type": "end_event"}
        ]
    })
}

/// 下書きの定義を作成
pub fn create_test_definition(name: &str, version: u32) -> WorkflowDefinition {
    WorkflowDefinition::new(NewWorkflowDefinition {
        id:       WorkflowDefinitionId::new(),
        name:     WorkflowName::new(name).unwrap(),
        version:  Version::new(version).unwrap(),
        metadata: json!({"category": "repair"}),
        graph:    WorkflowGraph::parse(&simple_graph_json()).unwrap(),
        now:      test_now(),
    })
}

/// 開始ステップに滞在する実行中インスタンスを作成
pub fn create_test_instance(case_id: CaseId) -> WorkflowInstance {
    let definition = create_test_definition("smartphone_repair", 1);
    WorkflowInstance::new(NewWorkflowInstance {
        id: WorkflowInstanceId::new(),
        case_id,
        definition_id: definition.id().clone(),
        definition_name: definition.name().clone(),
        definition_version: definition.version(),
        definition: definition.graph().clone(),
        context: json!({"device_type": "smartphone"}),
        now: test_now(),
    })
    .unwrap()
}

/// 1 段階承認の設定
pub fn create_test_approval_workflow() -> ApprovalWorkflow {
    ApprovalWorkflow::parse(&json!({
        "id": "0190a0b0-0000-7000-8000-000000000020",
        "name": "見積承認",
        "document_type_ids": ["quotation"],
        "levels": [
            {"level": 1, "name": "店長承認", "approver_type": "role",
             "approver_ids": ["store_manager"], "timeout_hours": 24}
        ]
    }))
    .unwrap()
}

/// 見積書を作成
pub fn create_test_document(case_id: CaseId) -> Document {
    Document::new(NewDocument {
        id: DocumentId::new(),
        case_id,
        document_type_id: "quotation".to_string(),
        content: json!({"total_amount": 12000}),
        now: test_now(),
    })
}

/// 文書の承認インスタンスを申請状態で作成
pub fn create_test_approval_instance(document: &Document) -> ApprovalInstance {
    ApprovalInstance::submit(NewApprovalInstance {
        id:               ApprovalInstanceId::new(),
        document_id:      document.id().clone(),
        document_type_id: document.document_type_id().to_string(),
        case_id:          document.case_id().clone(),
        workflow:         create_test_approval_workflow(),
        submitted_by:     "reception-1".to_string(),
        context:          document.content().clone(),
        now:              test_now(),
    })
    .unwrap()
    .instance
}
