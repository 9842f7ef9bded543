//! # ワークフロー実行エンジン
//!
//! インスタンスと現在時刻を受け取り、次のインスタンスと副作用を返す純粋な関数群。
//! 永続化・通知送信・文書更新はユースケース層が [`EngineEffect`] を見て行う。
//!
//! ## 自動進行
//!
//! ステップに入った直後に次の順で判定し、条件が続く限り遷移を繰り返す:
//!
//! 1. 終了ステップ: `final_status` に従って完了または取り消しにし、アクションを副作用として返す
//! 2. スキップ条件がすべて成立: 最初に成立する遷移に進む（履歴は `skipped`）
//! 3. `automatic` / `start_event`: 最初に成立する遷移に進む（履歴は `auto_transitioned`）
//!
//! 1 操作あたりの自動遷移は [`MAX_AUTO_HOPS`] 回まで。超えた場合は
//! `DomainError::CycleDetected` を返し、呼び出し側が操作前のインスタンスを凍結する。

use chrono::{DateTime, Duration, Utc};
use serde_json::{Value as JsonValue, json};

use super::{
    definition::WorkflowDefinition,
    definition::WorkflowDefinitionStatus,
    instance::{HistoryOutcome, NewWorkflowInstance, WorkflowInstance, WorkflowInstanceId},
    step::{FinalStatus, StepAction, StepDefinition},
};
use crate::{
    DomainError,
    context::deep_merge,
    document::DocumentStatus,
    notification::{NotificationChannel, NotificationRequest, Recipient},
    value_objects::{CaseId, StepId},
};

/// 1 操作あたりの自動遷移の上限
pub const MAX_AUTO_HOPS: usize = 50;

/// ステップタイムアウト時の既定通知テンプレート
pub const STEP_TIMEOUT_TEMPLATE: &str = "step_timeout";

/// エスカレーション段階の通知テンプレート
pub const STEP_ESCALATION_TEMPLATE: &str = "step_escalation";

/// エンジンが返す副作用
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEffect {
    /// 通知を送信する
    Notify(NotificationRequest),
    /// 案件の文書ステータスを更新する
    UpdateDocumentStatus {
        document_type: String,
        status:        DocumentStatus,
    },
    /// 監査ログを記録する
    Audit { event: String, step_id: StepId },
}

/// エンジン操作の結果
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOutcome<R> {
    pub instance: WorkflowInstance,
    pub effects:  Vec<EngineEffect>,
    pub result:   R,
}

/// `advance` の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceResult {
    /// 遷移した（`to` は自動進行後に落ち着いたステップ）
    Transitioned { from: StepId, to: StepId },
    /// 成立する遷移がなく、インスタンスは変更されていない
    NoTransitionMatched,
}

/// `check_timeouts` の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutResult {
    /// 対応不要（期限内、または発火済み）
    NoAction,
    /// エスカレーションを発火した
    Handled {
        /// 発火した段階（定義内のインデックス。既定通知は 0）
        escalated_levels:     Vec<u32>,
        /// 強制遷移した場合の遷移先（自動進行後）
        auto_transitioned_to: Option<StepId>,
    },
}

// =========================================================================
// 公開操作
// =========================================================================

/// 公開済み定義から案件のインスタンスを開始する
///
/// 初期コンテキストにビジネスルールを適用し、開始ステップから自動進行する。
///
/// # Errors
///
/// - `DomainError::Validation`: 定義が公開済みでない
/// - `DomainError::CycleDetected`: 自動遷移が上限を超えた
pub fn start(
    definition: &WorkflowDefinition,
    case_id: CaseId,
    initial_context: &JsonValue,
    now: DateTime<Utc>,
) -> Result<EngineOutcome<()>, DomainError> {
    if definition.status() != WorkflowDefinitionStatus::Published {
        return Err(DomainError::Validation(format!(
            "公開済みでない定義からは開始できません: {} {}",
            definition.name(),
            definition.version()
        )));
    }

    let mut context = json!({});
    deep_merge(&mut context, initial_context);
    definition.graph().apply_business_rules(&mut context);

    let instance = WorkflowInstance::new(NewWorkflowInstance {
        id: WorkflowInstanceId::new(),
        case_id,
        definition_id: definition.id().clone(),
        definition_name: definition.name().clone(),
        definition_version: definition.version(),
        definition: definition.graph().clone(),
        context,
        now,
    })?;

    let mut effects = Vec::new();
    let instance = settle(instance, &mut effects, 0, now)?;

    Ok(EngineOutcome {
        instance,
        effects,
        result: (),
    })
}

/// イベントを適用してインスタンスを進める
///
/// ペイロードをコンテキストにディープマージし、ビジネスルールを適用してから
/// 現在ステップの遷移を定義順に評価する。成立する遷移がなければ
/// 元のインスタンス（コンテキストを含む）をそのまま返すため、同じイベントの再送は冪等。
///
/// # Errors
///
/// - `DomainError::Validation`: 実行中でない
/// - `DomainError::CycleDetected`: 自動遷移が上限を超えた
pub fn advance(
    instance: WorkflowInstance,
    payload: &JsonValue,
    now: DateTime<Utc>,
) -> Result<EngineOutcome<AdvanceResult>, DomainError> {
    ensure_running(&instance)?;

    let mut context = instance.context().clone();
    deep_merge(&mut context, payload);
    instance.definition().apply_business_rules(&mut context);

    let from = instance.current_step_id().clone();
    let Some(to) = current_step(&instance)?
        .first_matching_transition(&context)
        .map(|t| t.to.clone())
    else {
        return Ok(EngineOutcome {
            instance,
            effects: Vec::new(),
            result: AdvanceResult::NoTransitionMatched,
        });
    };

    let moved = instance
        .with_context(context)
        .moved_to(to, HistoryOutcome::Transitioned, now)?;
    let mut effects = Vec::new();
    let settled = settle(moved, &mut effects, 0, now)?;

    Ok(EngineOutcome {
        result: AdvanceResult::Transitioned {
            from,
            to: settled.current_step_id().clone(),
        },
        instance: settled.touched(now),
        effects,
    })
}

/// 現在ステップのタイムアウトを判定し、エスカレーションを発火する
///
/// エスカレーション段階と強制遷移の `after_hours` はタイムアウト期限から測る。
/// 各段階は 1 回だけ発火する。ルールのないステップは担当ロールへの既定通知を 1 回だけ送る。
///
/// # Errors
///
/// - `DomainError::CycleDetected`: 強制遷移後の自動遷移が上限を超えた
pub fn check_timeouts(
    instance: WorkflowInstance,
    now: DateTime<Utc>,
) -> Result<EngineOutcome<TimeoutResult>, DomainError> {
    let no_action =
        |instance: WorkflowInstance| -> Result<EngineOutcome<TimeoutResult>, DomainError> {
            Ok(EngineOutcome {
                instance,
                effects: Vec::new(),
                result: TimeoutResult::NoAction,
            })
        };

    let Some(entered_at) = instance.step_entered_at() else {
        return no_action(instance);
    };
    let step = current_step(&instance)?;
    let Some(timeout_hours) = step.timeout_hours else {
        return no_action(instance);
    };
    let deadline = entered_at + Duration::hours(i64::from(timeout_hours));
    if now <= deadline {
        return no_action(instance);
    }
    let overdue = now - deadline;

    let mut effects = Vec::new();
    let mut fired = Vec::new();
    let mut auto_to = None;

    match instance.definition().escalation_rule_for(&step.id) {
        Some(rule) => {
            for (index, level) in rule.escalation_levels.iter().enumerate() {
                let index = u32::try_from(index).unwrap_or(u32::MAX);
                let elapsed = overdue >= Duration::hours(i64::from(level.after_hours));
                if elapsed && !instance.escalations_fired().contains(&index) {
                    effects.push(EngineEffect::Notify(NotificationRequest {
                        recipients: level.notify_roles.iter().map(Recipient::role).collect(),
                        channel:    level.channel,
                        template:   STEP_ESCALATION_TEMPLATE.to_string(),
                        payload:    timeout_payload(&instance, step, overdue, Some(index + 1)),
                    }));
                    fired.push(index);
                }
            }
            if let Some(auto) = &rule.auto_transition
                && overdue >= Duration::hours(i64::from(auto.after_hours))
            {
                auto_to = Some(auto.to.clone());
            }
        }
        None => {
            if instance.escalations_fired().is_empty() {
                effects.push(EngineEffect::Notify(NotificationRequest {
                    recipients: step.assignment.recipients(),
                    channel:    NotificationChannel::InApp,
                    template:   STEP_TIMEOUT_TEMPLATE.to_string(),
                    payload:    timeout_payload(&instance, step, overdue, None),
                }));
                fired.push(0);
            }
        }
    }

    if fired.is_empty() && auto_to.is_none() {
        return no_action(instance);
    }

    let mut instance = instance;
    for level in &fired {
        instance = instance.with_escalation_fired(*level, now)?;
    }

    let auto_transitioned_to = match auto_to {
        Some(to) => {
            let moved = instance.moved_to(to, HistoryOutcome::TimedOut, now)?;
            instance = settle(moved, &mut effects, 0, now)?;
            Some(instance.current_step_id().clone())
        }
        None => None,
    };

    Ok(EngineOutcome {
        instance: instance.touched(now),
        effects,
        result: TimeoutResult::Handled {
            escalated_levels: fired,
            auto_transitioned_to,
        },
    })
}

/// インスタンスを取り消す
///
/// 定義に final_status が cancelled の終了ステップがあれば、そのアクションを副作用として返す。
///
/// # Errors
///
/// - `DomainError::Validation`: 既に終了している
pub fn cancel(
    instance: WorkflowInstance,
    reason: Option<String>,
    now: DateTime<Utc>,
) -> Result<EngineOutcome<()>, DomainError> {
    let effects = instance
        .definition()
        .cancellation_step()
        .map(|step| action_effects(&instance, step))
        .unwrap_or_default();
    let cancelled = instance.cancelled(reason, now)?;

    Ok(EngineOutcome {
        instance: cancelled.touched(now),
        effects,
        result: (),
    })
}

/// インスタンスを凍結する
///
/// 自動遷移の循環を検出した場合に、操作前のインスタンスに対して使う。
pub fn freeze(
    instance: WorkflowInstance,
    reason: String,
    now: DateTime<Utc>,
) -> Result<EngineOutcome<()>, DomainError> {
    let step_id = instance.current_step_id().clone();
    let frozen = instance.frozen(reason, now)?;

    Ok(EngineOutcome {
        instance: frozen.touched(now),
        effects:  vec![EngineEffect::Audit {
            event: "instance_frozen".to_string(),
            step_id,
        }],
        result:   (),
    })
}

// =========================================================================
// 自動進行
// =========================================================================

/// 現在ステップでの自動進行の判定結果
enum Settle {
    /// 外部入力を待つ
    Wait,
    /// 終了ステップに到達
    Finish(FinalStatus, Vec<EngineEffect>),
    /// 次のステップへ進む
    Hop(StepId, HistoryOutcome),
}

/// 自動進行を繰り返し、外部入力を待つステップか終了ステップで止まる
fn settle(
    mut instance: WorkflowInstance,
    effects: &mut Vec<EngineEffect>,
    mut hops: usize,
    now: DateTime<Utc>,
) -> Result<WorkflowInstance, DomainError> {
    loop {
        let decision = {
            let step = current_step(&instance)?;
            if step.is_end() {
                Settle::Finish(step.final_status(), action_effects(&instance, step))
            } else {
                let outcome = if step.should_skip(instance.context()) {
                    Some(HistoryOutcome::Skipped)
                } else if step.is_auto_advancing() {
                    Some(HistoryOutcome::AutoTransitioned)
                } else {
                    None
                };
                match (outcome, step.first_matching_transition(instance.context())) {
                    (Some(outcome), Some(transition)) => {
                        Settle::Hop(transition.to.clone(), outcome)
                    }
                    _ => Settle::Wait,
                }
            }
        };

        match decision {
            Settle::Wait => return Ok(instance),
            Settle::Finish(final_status, actions) => {
                effects.extend(actions);
                return match final_status {
                    FinalStatus::Completed => instance.completed(now),
                    FinalStatus::Cancelled => instance.cancelled(None, now),
                };
            }
            Settle::Hop(to, outcome) => {
                hops += 1;
                if hops > MAX_AUTO_HOPS {
                    return Err(DomainError::CycleDetected {
                        step_id: instance.current_step_id().to_string(),
                        hops,
                    });
                }
                instance = instance.moved_to(to, outcome, now)?;
            }
        }
    }
}

// =========================================================================
// ヘルパー
// =========================================================================

fn ensure_running(instance: &WorkflowInstance) -> Result<(), DomainError> {
    if instance.is_running() {
        return Ok(());
    }
    Err(DomainError::Validation(format!(
        "実行中のインスタンスのみ進行できます（現在: {}）",
        instance.status()
    )))
}

fn current_step(instance: &WorkflowInstance) -> Result<&StepDefinition, DomainError> {
    instance.current_step().ok_or_else(|| {
        DomainError::Validation(format!(
            "現在ステップ '{}' が定義に存在しません",
            instance.current_step_id()
        ))
    })
}

/// ステップのアクションを副作用に変換する
fn action_effects(instance: &WorkflowInstance, step: &StepDefinition) -> Vec<EngineEffect> {
    step.actions
        .iter()
        .map(|action| match action {
            StepAction::Notify {
                recipients,
                channel,
                template,
            } => EngineEffect::Notify(NotificationRequest {
                recipients: recipients.clone(),
                channel:    *channel,
                template:   template.clone(),
                payload:    json!({
                    "case_id": instance.case_id(),
                    "instance_id": instance.id(),
                    "step_id": step.id,
                    "step_name": step.name,
                    "context": instance.context(),
                }),
            }),
            StepAction::UpdateDocumentStatus {
                document_type,
                status,
            } => EngineEffect::UpdateDocumentStatus {
                document_type: document_type.clone(),
                status:        *status,
            },
            StepAction::Audit { event } => EngineEffect::Audit {
                event:   event.clone(),
                step_id: step.id.clone(),
            },
        })
        .collect()
}

fn timeout_payload(
    instance: &WorkflowInstance,
    step: &StepDefinition,
    overdue: Duration,
    level: Option<u32>,
) -> JsonValue {
    json!({
        "case_id": instance.case_id(),
        "instance_id": instance.id(),
        "step_id": step.id,
        "step_name": step.name,
        "timeout_hours": step.timeout_hours,
        "overdue_hours": overdue.num_hours(),
        "escalation_level": level,
    })
}
