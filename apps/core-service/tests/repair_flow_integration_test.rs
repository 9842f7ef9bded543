//! 修理案件の統合テスト
//!
//! ワークフロー定義の登録から案件の完了までを、承認・定期ジョブを含めて通しで検証する。
//!
//! ## テストケース
//!
//! - 見積承認が完了すると案件が修理ステップへ進み、完了時に請求書が発行済みになる
//! - 見積が却下されると案件が見積修正ステップへ進む
//! - 承認レベルの期限切れは定期ジョブで自動承認され、案件が進む
//! - 承認結果の反映が競合しても再試行で案件が進む
//! - 承認結果を反映できなかった場合は定期ジョブが再配信して案件が進む
//! - 古いバージョンでの保存は競合になる
//! - 構成が一致しない案件は開始できない

mod helpers;

use chrono::Duration as ChronoDuration;
use helpers::{RepairFlowSystem, RepairFlowTestBuilder};
use pretty_assertions::assert_eq;
use repairflow_core_service::{error::CoreError, usecase::SubmitApprovalInput};
use repairflow_domain::{
    approval::{ApprovalAction, ApprovalInstance, ApprovalStatus, ApprovalWorkflow, Approver},
    clock::Clock,
    document::{Document, DocumentStatus},
    value_objects::{CaseId, WorkflowName},
    workflow::{
        SelectionCriteria,
        WorkflowConfiguration,
        WorkflowConfigurationId,
        WorkflowInstance,
        WorkflowInstanceStatus,
    },
};
use repairflow_infra::repository::{ApprovalWorkflowRepository, WorkflowInstanceRepository};
use serde_json::{Value as JsonValue, json};

// --- テストヘルパー ---

fn repair_definition() -> JsonValue {
    json!({
        "start_event": "start",
        "end_events": ["completed", "cancelled"],
        "steps": [
            {"id": "start", "name": "開始", "type": "start_event",
             "transitions": [{"to": "registration"}]},
            {"id": "registration", "name": "受付", "type": "manual",
             "assignment": {"roles": ["reception"]},
             "transitions": [{"to": "diagnosis", "condition": "registration.status == 'done'"}]},
            {"id": "diagnosis", "name": "診断", "type": "manual",
             "assignment": {"roles": ["technician"]},
             "transitions": [{"to": "quotation_approval", "condition": "diagnosis.status == 'done'"}]},
            {"id": "quotation_approval", "name": "見積承認待ち", "type": "manual",
             "transitions": [
                 {"to": "repair", "condition": "quotation.status == 'approved'"},
                 {"to": "quotation_revision", "condition": "quotation.status == 'rejected'"}
             ]},
            {"id": "quotation_revision", "name": "見積修正", "type": "manual",
             "transitions": [{"to": "cancelled", "condition": "revision.status == 'abandoned'"}]},
            {"id": "repair", "name": "修理", "type": "manual",
             "chargeable": true,
             "transitions": [{"to": "completed", "condition": "repair.status == 'done'"}]},
            {"id": "completed", "name": "完了", "type": "end_event",
             "actions": [
                 {"type": "update_document_status", "document_type": "invoice", "status": "issued"}
             ]},
            {"id": "cancelled", "name": "取り消し", "type": "end_event",
             "final_status": "cancelled"}
        ]
    })
}

/// レベル 1: 技術リーダー 3 名中 2 名（5 万円未満はスキップ）
/// レベル 2: 店長ロール（24 時間で自動承認）
fn quotation_approval_workflow() -> ApprovalWorkflow {
    ApprovalWorkflow::parse(&json!({
        "id": "0190a0b0-0000-7000-8000-000000000020",
        "name": "見積承認",
        "document_type_ids": ["quotation"],
        "levels": [
            {"level": 1, "name": "技術リーダー承認", "approver_type": "user",
             "approver_ids": ["lead-1", "lead-2", "lead-3"], "required_approvals": 2,
             "is_parallel": true,
             "skip_conditions": ["total_amount < 50000"]},
            {"level": 2, "name": "店長承認", "approver_type": "role",
             "approver_ids": ["store_manager"], "timeout_hours": 24}
        ],
        "escalation_rules": [
            {"from_level": 2, "auto_approve": true}
        ]
    }))
    .unwrap()
}

fn smartphone_criteria() -> SelectionCriteria {
    SelectionCriteria {
        device_type: "smartphone".to_string(),
        service_type: "screen_repair".to_string(),
        customer_tier: Some("gold".to_string()),
        ..Default::default()
    }
}

fn store_manager() -> Approver {
    Approver::new("manager-1", vec!["store_manager".to_string()])
}

struct Case {
    case_id:   CaseId,
    instance:  WorkflowInstance,
    quotation: Document,
    invoice:   Document,
}

/// 定義の登録・公開と構成の保存を行い、見積承認待ちまで案件を進める
async fn case_awaiting_quotation(system: &RepairFlowSystem, total_amount: u64) -> Case {
    let definition = system
        .definitions
        .register(
            WorkflowName::new("smartphone_repair").unwrap(),
            &repair_definition(),
            json!({"category": "repair"}),
        )
        .await
        .unwrap();
    system.definitions.publish(definition.id()).await.unwrap();
    system
        .configuration
        .save(&WorkflowConfiguration {
            id: WorkflowConfigurationId::new(),
            name: "スマートフォン修理".to_string(),
            definition_name: definition.name().clone(),
            definition_version: None,
            device_types: vec!["smartphone".to_string()],
            service_types: Vec::new(),
            customer_tiers: Vec::new(),
            conditions: Vec::new(),
            priority: 10,
            is_active: true,
            created_at: system.clock.now(),
        })
        .await
        .unwrap();
    system
        .approval_workflow_repo
        .save(&quotation_approval_workflow())
        .await
        .unwrap();

    let case_id = CaseId::new();
    let instance = system
        .execution
        .start_for_case(
            case_id.clone(),
            &smartphone_criteria(),
            &json!({"customer": {"name": "山田太郎"}}),
        )
        .await
        .unwrap();
    let quotation = system
        .documents
        .create_document(case_id.clone(), "quotation", json!({"total_amount": total_amount}))
        .await
        .unwrap();
    let invoice = system
        .documents
        .create_document(case_id.clone(), "invoice", json!({"total_amount": total_amount}))
        .await
        .unwrap();

    for payload in [
        json!({"registration": {"status": "done"}}),
        json!({"diagnosis": {"status": "done", "notes": "液晶割れ"}}),
    ] {
        system
            .execution
            .advance(instance.id(), &payload)
            .await
            .unwrap();
    }

    Case {
        case_id,
        instance,
        quotation,
        invoice,
    }
}

async fn submit_quotation(system: &RepairFlowSystem, case: &Case) -> ApprovalInstance {
    system
        .approval
        .submit_for_approval(SubmitApprovalInput {
            document_id:  case.quotation.id().clone(),
            workflow_id:  quotation_approval_workflow().id,
            submitted_by: "reception-1".to_string(),
            context:      json!({}),
        })
        .await
        .unwrap()
        .instance
}

async fn current_step(system: &RepairFlowSystem, case: &Case) -> String {
    system
        .execution
        .find(case.instance.id())
        .await
        .unwrap()
        .current_step_id()
        .to_string()
}

// --- テストケース ---

#[tokio::test]
async fn test_見積承認が完了すると修理に進み完了時に請求書を発行する() {
    let system = RepairFlowTestBuilder::new().build();
    let case = case_awaiting_quotation(&system, 80_000).await;
    assert_eq!(current_step(&system, &case).await, "quotation_approval");
    assert_eq!(
        case.instance.context()["device_type"],
        json!("smartphone"),
        "案件の属性が初期コンテキストに入る"
    );

    let approval = submit_quotation(&system, &case).await;
    for approver in [Approver::user("lead-1"), Approver::user("lead-2"), store_manager()] {
        system
            .approval
            .process(approval.id(), &approver, ApprovalAction::Approve, None)
            .await
            .unwrap();
    }

    let approval = system.approval.find(approval.id()).await.unwrap();
    assert_eq!(approval.status(), ApprovalStatus::Completed);
    assert_eq!(current_step(&system, &case).await, "repair");
    let quotation = system
        .documents
        .get_document(case.quotation.id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(quotation.status(), DocumentStatus::Approved);

    let outcome = system
        .execution
        .advance(case.instance.id(), &json!({"repair": {"status": "done"}}))
        .await
        .unwrap();

    assert_eq!(outcome.instance.status(), WorkflowInstanceStatus::Completed);
    assert_eq!(outcome.instance.context()["quotation"]["status"], json!("approved"));
    let invoice = system
        .documents
        .get_document(case.invoice.id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(invoice.status(), DocumentStatus::Issued);
}

#[tokio::test]
async fn test_見積が却下されると見積修正に進む() {
    let system = RepairFlowTestBuilder::new().build();
    let case = case_awaiting_quotation(&system, 80_000).await;
    let approval = submit_quotation(&system, &case).await;

    system
        .approval
        .process(
            approval.id(),
            &Approver::user("lead-2"),
            ApprovalAction::Reject,
            Some("部品代の見直しが必要".to_string()),
        )
        .await
        .unwrap();

    assert_eq!(current_step(&system, &case).await, "quotation_revision");
    let quotation = system
        .documents
        .get_document(case.quotation.id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(quotation.status(), DocumentStatus::Rejected);

    let cancelled = system
        .execution
        .advance(case.instance.id(), &json!({"revision": {"status": "abandoned"}}))
        .await
        .unwrap();
    assert_eq!(cancelled.instance.status(), WorkflowInstanceStatus::Cancelled);
}

#[tokio::test]
async fn test_承認期限切れは定期ジョブで自動承認され案件が進む() {
    let system = RepairFlowTestBuilder::new().build();
    // 5 万円未満のためレベル 1 はスキップされ、店長承認から始まる
    let case = case_awaiting_quotation(&system, 30_000).await;
    let approval = submit_quotation(&system, &case).await;
    assert_eq!(approval.current_level(), 2);

    system.clock.advance(ChronoDuration::hours(12));
    let early = system.runner.run_once().await;
    system.clock.advance(ChronoDuration::hours(13));
    let report = system.runner.run_once().await;

    assert_eq!(early.approval_timeouts.escalated, 0);
    assert_eq!(report.approval_timeouts.escalated, 1);
    assert_eq!(report.errors, 0);
    let approval = system.approval.find(approval.id()).await.unwrap();
    assert_eq!(approval.status(), ApprovalStatus::Completed);
    assert_eq!(current_step(&system, &case).await, "repair");
}

#[tokio::test]
async fn test_承認結果の反映が競合しても再試行で修理に進む() {
    let system = RepairFlowTestBuilder::new().build();
    let case = case_awaiting_quotation(&system, 30_000).await;
    let approval = submit_quotation(&system, &case).await;
    system.instance_repo.conflict_next_updates(1);

    system
        .approval
        .process(approval.id(), &store_manager(), ApprovalAction::Approve, None)
        .await
        .unwrap();

    assert_eq!(current_step(&system, &case).await, "repair");
    let approval = system.approval.find(approval.id()).await.unwrap();
    assert_eq!(approval.pending_patch(), None);
}

#[tokio::test]
async fn test_反映できなかった承認結果は定期ジョブが再配信する() {
    let system = RepairFlowTestBuilder::new().build();
    let case = case_awaiting_quotation(&system, 30_000).await;
    let approval = submit_quotation(&system, &case).await;
    system.instance_repo.conflict_next_updates(3);

    system
        .approval
        .process(approval.id(), &store_manager(), ApprovalAction::Approve, None)
        .await
        .unwrap();

    assert_eq!(current_step(&system, &case).await, "quotation_approval");
    let pending = system.approval.find(approval.id()).await.unwrap();
    assert_eq!(pending.status(), ApprovalStatus::Completed);
    assert!(pending.pending_patch().is_some());

    system.clock.advance(ChronoDuration::hours(100));
    let report = system.runner.run_once().await;

    assert_eq!(report.patch_redeliveries.delivered, 1);
    assert_eq!(report.errors, 0);
    assert_eq!(current_step(&system, &case).await, "repair");
    let approval = system.approval.find(approval.id()).await.unwrap();
    assert_eq!(approval.pending_patch(), None);
}

#[tokio::test]
async fn test_古いバージョンでの保存は競合になる() {
    let system = RepairFlowTestBuilder::new().build();
    let case = case_awaiting_quotation(&system, 80_000).await;
    let stale = system.execution.find(case.instance.id()).await.unwrap();

    system
        .execution
        .cancel(case.instance.id(), Some("顧客都合".to_string()))
        .await
        .unwrap();
    let result = system
        .instance_repo
        .update_with_version_check(&stale, stale.version())
        .await;

    assert!(result.unwrap_err().as_conflict().is_some());
    let running = system
        .instance_repo
        .find_running_by_case(&case.case_id)
        .await
        .unwrap();
    assert!(running.is_empty());
}

#[tokio::test]
async fn test_構成が一致しない案件は開始できない() {
    let system = RepairFlowTestBuilder::new().build();
    case_awaiting_quotation(&system, 80_000).await;

    let result = system
        .execution
        .start_for_case(
            CaseId::new(),
            &SelectionCriteria {
                device_type: "laptop".to_string(),
                service_type: "battery_replacement".to_string(),
                ..Default::default()
            },
            &json!({}),
        )
        .await;

    assert!(matches!(result, Err(CoreError::NotFound(_))));
}
