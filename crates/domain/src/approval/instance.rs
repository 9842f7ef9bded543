//! # 承認インスタンス
//!
//! 文書 1 件ごとの多段承認の実行状態。申請時点の [`ApprovalWorkflow`] をスナップショットとして保持し、
//! 承認・却下・委任・エスカレーションを所有権を消費する遷移メソッドで表現する。
//!
//! 遷移メソッドは新しいインスタンスと副作用（[`ApprovalEffect`]）を返す。
//! 文書ステータス更新・通知・案件コンテキストへのパッチ発行はユースケース層が副作用を見て行う。
//!
//! ## 状態遷移
//!
//! ```text
//! submit ──▶ pending ◀──────────┐
//!    │         │  ▲             │ 次のレベルへ
//!    │         ▼  │ escalate    │
//!    │       escalated ─────────┘
//!    │         │
//!    ▼         ▼
//! approved   completed / rejected
//! （全レベルスキップ）
//! ```

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use strum::IntoStaticStr;

use super::config::{ApprovalEvent, ApprovalLevel, ApprovalWorkflow, ApprovalWorkflowId, Approver};
use crate::{
    DomainError,
    context::ContextPatch,
    document::{DocumentId, DocumentStatus},
    notification::{NotificationRequest, Recipient},
    value_objects::{CaseId, Version},
};

define_uuid_id! {
    /// 承認インスタンス ID
    pub struct ApprovalInstanceId;
}

/// エスカレーションによる自動承認の決裁者
pub const ESCALATION_APPROVER_ID: &str = "system:escalation";

/// 承認ステータス
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, IntoStaticStr, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ApprovalStatus {
    /// 承認待ち
    Pending,
    /// 全レベルがスキップされ、人の決裁なしで承認
    Approved,
    /// 却下
    Rejected,
    /// エスカレーション済み（決裁待ちは継続）
    Escalated,
    /// 最終レベルまで承認
    Completed,
}

impl ApprovalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::Completed)
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "escalated" => Ok(Self::Escalated),
            "completed" => Ok(Self::Completed),
            _ => Err(DomainError::Validation(format!("不正な承認ステータス: {s}"))),
        }
    }
}

/// 決裁内容
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
    Pending,
}

/// 承認者の操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    Approve,
    Reject,
}

impl ApprovalAction {
    pub fn decision(&self) -> Decision {
        match self {
            Self::Approve => Decision::Approved,
            Self::Reject => Decision::Rejected,
        }
    }
}

/// 委任・エスカレーションの契機
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TriggeredBy {
    Timeout,
    Manual,
}

/// 決裁記録（レベル内で追記のみ）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    /// 操作したユーザー
    pub approver_id:     String,
    /// 委任を受けて決裁した場合の委任元
    #[serde(default)]
    pub on_behalf_of:    Option<String>,
    pub level:           u32,
    pub decision:        Decision,
    #[serde(default)]
    pub comments:        Option<String>,
    pub decided_at:      Option<DateTime<Utc>>,
    /// レベル到着から決裁までの秒数
    pub time_spent_secs: Option<i64>,
    /// エスカレーションによる自動承認
    #[serde(default)]
    pub synthetic:       bool,
}

impl ApprovalRecord {
    /// 承認数の集計に使う決裁者（委任時は委任元）
    pub fn effective_approver(&self) -> &str {
        self.on_behalf_of.as_deref().unwrap_or(&self.approver_id)
    }
}

/// エスカレーション記録
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub from_level:    u32,
    pub to_level:      Option<u32>,
    pub reason:        String,
    pub triggered_by:  TriggeredBy,
    pub auto_approved: bool,
    pub at:            DateTime<Utc>,
}

/// 委任記録
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationRecord {
    pub from_user:    String,
    pub to_user:      String,
    pub level:        u32,
    pub reason:       String,
    pub triggered_by: TriggeredBy,
    pub valid_until:  Option<DateTime<Utc>>,
    pub at:           DateTime<Utc>,
}

impl DelegationRecord {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_until.is_none_or(|until| now < until)
    }
}

/// レベルのスキップ記録
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipRecord {
    pub level:     u32,
    pub condition: String,
    pub at:        DateTime<Utc>,
}

/// 承認インスタンスの状態（ADT ベースステートマシン）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalState {
    Pending(ActiveLevelState),
    Escalated(ActiveLevelState),
    Approved(FinishedState),
    Rejected(FinishedState),
    Completed(FinishedState),
}

/// 決裁待ち状態の固有フィールド
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveLevelState {
    pub current_level:    u32,
    /// タイムアウト判定と所要時間の起点（延長時は未来の日時になる）
    pub level_entered_at: DateTime<Utc>,
}

/// 終了状態の固有フィールド
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedState {
    pub current_level: u32,
    pub finished_at:   DateTime<Utc>,
}

/// 承認エンジンが返す副作用
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalEffect {
    Notify(NotificationRequest),
    UpdateDocumentStatus {
        document_id: DocumentId,
        status:      DocumentStatus,
    },
    /// 案件のワークフローインスタンスに渡すコンテキストパッチ
    PublishContextPatch(ContextPatch),
}

/// 遷移の結果
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalTransition<R> {
    pub instance: ApprovalInstance,
    pub effects:  Vec<ApprovalEffect>,
    pub result:   R,
}

/// 申請の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitResult {
    /// 指定レベルで決裁待ち
    AwaitingLevel(u32),
    /// 全レベルがスキップされて承認済み
    ApprovedWithoutReview,
}

/// 決裁の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    /// 記録したが必要承認数に未達
    Recorded,
    /// 次のレベルへ進んだ
    LevelAdvanced { from: u32, to: u32 },
    /// 最終レベルまで承認された
    Completed,
    /// 却下された
    Rejected,
    /// 同じ決裁者が同じレベルで決裁済み（何も変更しない）
    AlreadyDecided,
}

/// エスカレーションの結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalateResult {
    /// 自動承認によりレベルを通過した
    AutoApproved(ProcessResult),
    /// 上位レベルへ移った
    MovedToLevel(u32),
    /// 通知して待ち時間を再開した
    ClockRestarted { level_entered_at: DateTime<Utc> },
}

/// 承認インスタンスエンティティ
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalInstance {
    id:               ApprovalInstanceId,
    document_id:      DocumentId,
    document_type_id: String,
    case_id:          CaseId,
    workflow:         ApprovalWorkflow,
    submitted_by:     String,
    context:          JsonValue,
    records:          Vec<ApprovalRecord>,
    escalations:      Vec<EscalationRecord>,
    delegations:      Vec<DelegationRecord>,
    skips:            Vec<SkipRecord>,
    /// 案件ワークフローへの配信が済んでいないコンテキストパッチ
    pending_patch:    Option<ContextPatch>,
    version:          Version,
    created_at:       DateTime<Utc>,
    updated_at:       DateTime<Utc>,
    state:            ApprovalState,
}

/// 申請パラメータ
pub struct NewApprovalInstance {
    pub id:               ApprovalInstanceId,
    pub document_id:      DocumentId,
    pub document_type_id: String,
    pub case_id:          CaseId,
    pub workflow:         ApprovalWorkflow,
    pub submitted_by:     String,
    /// スキップ条件の評価対象（文書内容と申請時コンテキストをマージしたもの）
    pub context:          JsonValue,
    pub now:              DateTime<Utc>,
}

/// 承認インスタンスの DB 復元パラメータ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalInstanceRecord {
    pub id:               ApprovalInstanceId,
    pub document_id:      DocumentId,
    pub document_type_id: String,
    pub case_id:          CaseId,
    pub workflow:         ApprovalWorkflow,
    pub submitted_by:     String,
    pub context:          JsonValue,
    pub records:          Vec<ApprovalRecord>,
    pub escalations:      Vec<EscalationRecord>,
    pub delegations:      Vec<DelegationRecord>,
    pub skips:            Vec<SkipRecord>,
    pub status:           ApprovalStatus,
    pub current_level:    u32,
    pub level_entered_at: Option<DateTime<Utc>>,
    pub finished_at:      Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_patch:    Option<ContextPatch>,
    pub version:          Version,
    pub created_at:       DateTime<Utc>,
    pub updated_at:       DateTime<Utc>,
}

impl ApprovalInstance {
    /// 文書を承認に回す
    ///
    /// レベル 1 から順にスキップ条件を評価し、最初にスキップされないレベルで決裁待ちにする。
    /// すべてスキップされた場合は人の決裁なしで承認済みになる。
    ///
    /// # Errors
    ///
    /// - `DomainError::Validation`: ワークフローが無効、または文書種別に適用できない
    pub fn submit(
        params: NewApprovalInstance,
    ) -> Result<ApprovalTransition<SubmitResult>, DomainError> {
        let workflow = params.workflow;
        if !workflow.is_active {
            return Err(DomainError::Validation(format!(
                "無効な承認ワークフローです: {}",
                workflow.name
            )));
        }
        if !workflow.applies_to(&params.document_type_id) {
            return Err(DomainError::Validation(format!(
                "承認ワークフロー '{}' は文書種別 '{}' に適用できません",
                workflow.name, params.document_type_id
            )));
        }

        let mut skips = Vec::new();
        let landing = first_unskipped(&workflow, None, &params.context, params.now, &mut skips);
        let last_level = workflow.levels.last().map_or(0, |l| l.level);
        let state = match landing {
            Some(level) => ApprovalState::Pending(ActiveLevelState {
                current_level:    level,
                level_entered_at: params.now,
            }),
            None => ApprovalState::Approved(FinishedState {
                current_level: last_level,
                finished_at:   params.now,
            }),
        };

        let mut instance = Self {
            id: params.id,
            document_id: params.document_id,
            document_type_id: params.document_type_id,
            case_id: params.case_id,
            workflow,
            submitted_by: params.submitted_by,
            context: params.context,
            records: Vec::new(),
            escalations: Vec::new(),
            delegations: Vec::new(),
            skips,
            pending_patch: None,
            version: Version::initial(),
            created_at: params.now,
            updated_at: params.now,
            state,
        };

        let mut effects = Vec::new();
        let result = match landing {
            Some(level) => {
                effects.push(instance.document_status_effect(DocumentStatus::PendingApproval));
                effects.extend(instance.approval_request(level));
                SubmitResult::AwaitingLevel(level)
            }
            None => {
                effects.extend(instance.mark_finished(Decision::Approved));
                SubmitResult::ApprovedWithoutReview
            }
        };

        Ok(ApprovalTransition {
            instance,
            effects,
            result,
        })
    }

    /// 既存のデータから復元する
    ///
    /// # Errors
    ///
    /// - `DomainError::Validation`: 状態に必要な日時の欠落、または現在レベルが設定に存在しない
    pub fn from_db(record: ApprovalInstanceRecord) -> Result<Self, DomainError> {
        if record.workflow.level(record.current_level).is_none() {
            return Err(DomainError::Validation(format!(
                "現在レベル {} が承認ワークフローに存在しません",
                record.current_level
            )));
        }

        let status = record.status;
        let active = || {
            record
                .level_entered_at
                .map(|level_entered_at| ActiveLevelState {
                    current_level: record.current_level,
                    level_entered_at,
                })
                .ok_or_else(|| {
                    DomainError::Validation(format!(
                        "{status} インスタンスには level_entered_at が必要です"
                    ))
                })
        };
        let finished = || {
            record
                .finished_at
                .map(|finished_at| FinishedState {
                    current_level: record.current_level,
                    finished_at,
                })
                .ok_or_else(|| {
                    DomainError::Validation(format!(
                        "{status} インスタンスには finished_at が必要です"
                    ))
                })
        };

        let state = match status {
            ApprovalStatus::Pending => ApprovalState::Pending(active()?),
            ApprovalStatus::Escalated => ApprovalState::Escalated(active()?),
            ApprovalStatus::Approved => ApprovalState::Approved(finished()?),
            ApprovalStatus::Rejected => ApprovalState::Rejected(finished()?),
            ApprovalStatus::Completed => ApprovalState::Completed(finished()?),
        };

        Ok(Self {
            id: record.id,
            document_id: record.document_id,
            document_type_id: record.document_type_id,
            case_id: record.case_id,
            workflow: record.workflow,
            submitted_by: record.submitted_by,
            context: record.context,
            records: record.records,
            escalations: record.escalations,
            delegations: record.delegations,
            skips: record.skips,
            pending_patch: record.pending_patch,
            version: record.version,
            created_at: record.created_at,
            updated_at: record.updated_at,
            state,
        })
    }

    /// DB 保存用のレコードに変換する
    pub fn to_record(&self) -> ApprovalInstanceRecord {
        ApprovalInstanceRecord {
            id: self.id.clone(),
            document_id: self.document_id.clone(),
            document_type_id: self.document_type_id.clone(),
            case_id: self.case_id.clone(),
            workflow: self.workflow.clone(),
            submitted_by: self.submitted_by.clone(),
            context: self.context.clone(),
            records: self.records.clone(),
            escalations: self.escalations.clone(),
            delegations: self.delegations.clone(),
            skips: self.skips.clone(),
            status: self.status(),
            current_level: self.current_level(),
            level_entered_at: self.level_entered_at(),
            finished_at: self.finished_at(),
            pending_patch: self.pending_patch.clone(),
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    // Getter メソッド

    pub fn id(&self) -> &ApprovalInstanceId {
        &self.id
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    pub fn document_type_id(&self) -> &str {
        &self.document_type_id
    }

    pub fn case_id(&self) -> &CaseId {
        &self.case_id
    }

    /// 申請時点の承認ワークフロー
    pub fn workflow(&self) -> &ApprovalWorkflow {
        &self.workflow
    }

    pub fn workflow_id(&self) -> &ApprovalWorkflowId {
        &self.workflow.id
    }

    pub fn submitted_by(&self) -> &str {
        &self.submitted_by
    }

    pub fn context(&self) -> &JsonValue {
        &self.context
    }

    pub fn records(&self) -> &[ApprovalRecord] {
        &self.records
    }

    pub fn escalations(&self) -> &[EscalationRecord] {
        &self.escalations
    }

    pub fn delegations(&self) -> &[DelegationRecord] {
        &self.delegations
    }

    pub fn skips(&self) -> &[SkipRecord] {
        &self.skips
    }

    /// 案件ワークフローへの配信待ちのコンテキストパッチ
    pub fn pending_patch(&self) -> Option<&ContextPatch> {
        self.pending_patch.as_ref()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// 状態への直接アクセス（パターンマッチ用）
    pub fn state(&self) -> &ApprovalState {
        &self.state
    }

    pub fn status(&self) -> ApprovalStatus {
        match &self.state {
            ApprovalState::Pending(_) => ApprovalStatus::Pending,
            ApprovalState::Escalated(_) => ApprovalStatus::Escalated,
            ApprovalState::Approved(_) => ApprovalStatus::Approved,
            ApprovalState::Rejected(_) => ApprovalStatus::Rejected,
            ApprovalState::Completed(_) => ApprovalStatus::Completed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn current_level(&self) -> u32 {
        match &self.state {
            ApprovalState::Pending(s) | ApprovalState::Escalated(s) => s.current_level,
            ApprovalState::Approved(s) | ApprovalState::Rejected(s) | ApprovalState::Completed(s) => {
                s.current_level
            }
        }
    }

    pub fn level_entered_at(&self) -> Option<DateTime<Utc>> {
        self.active_level().map(|s| s.level_entered_at)
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        match &self.state {
            ApprovalState::Pending(_) | ApprovalState::Escalated(_) => None,
            ApprovalState::Approved(s) | ApprovalState::Rejected(s) | ApprovalState::Completed(s) => {
                Some(s.finished_at)
            }
        }
    }

    fn active_level(&self) -> Option<&ActiveLevelState> {
        match &self.state {
            ApprovalState::Pending(s) | ApprovalState::Escalated(s) => Some(s),
            _ => None,
        }
    }

    /// 現在レベルのタイムアウトが経過しているか
    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        let Some(active) = self.active_level() else {
            return false;
        };
        self.workflow
            .level(active.current_level)
            .and_then(|l| l.timeout_hours)
            .is_some_and(|hours| now >= active.level_entered_at + Duration::hours(i64::from(hours)))
    }

    // ビジネスロジックメソッド

    /// 現在レベルで承認または却下する
    ///
    /// 同じ決裁者（委任時は委任元）の同一レベルでの 2 回目以降の決裁は何も変更しない。
    ///
    /// # Errors
    ///
    /// - `DomainError::Validation`: 終了済み
    /// - `DomainError::IneligibleApprover`: 承認者でも有効な委任先でもない
    pub fn process(
        mut self,
        approver: &Approver,
        action: ApprovalAction,
        comments: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalTransition<ProcessResult>, DomainError> {
        let active = self.require_active("決裁")?;
        let level = self.current_level_definition(active.current_level)?;

        let Some((effective, on_behalf_of)) = self.resolve_authority(approver, level, now) else {
            return Err(DomainError::IneligibleApprover {
                approver_id: approver.user_id.clone(),
                level:       active.current_level,
            });
        };

        if self.has_decided(active.current_level, &effective) {
            return Ok(ApprovalTransition {
                instance: self,
                effects:  Vec::new(),
                result:   ProcessResult::AlreadyDecided,
            });
        }

        let required = level.required_approvals;
        self.records.push(ApprovalRecord {
            approver_id: approver.user_id.clone(),
            on_behalf_of,
            level: active.current_level,
            decision: action.decision(),
            comments,
            decided_at: Some(now),
            time_spent_secs: Some(time_spent(&active, now)),
            synthetic: false,
        });

        let mut effects = Vec::new();
        let (instance, result) = match action {
            ApprovalAction::Reject => {
                let mut rejected = Self {
                    state: ApprovalState::Rejected(FinishedState {
                        current_level: active.current_level,
                        finished_at:   now,
                    }),
                    ..self
                };
                effects.extend(rejected.mark_finished(Decision::Rejected));
                (rejected, ProcessResult::Rejected)
            }
            ApprovalAction::Approve => {
                if self.approved_count(active.current_level) >= required {
                    self.level_satisfied(active.current_level, now, &mut effects)
                } else {
                    (self, ProcessResult::Recorded)
                }
            }
        };

        Ok(ApprovalTransition {
            instance: instance.touched(now),
            effects,
            result,
        })
    }

    /// 現在レベルの決裁権限を委任する
    ///
    /// # Errors
    ///
    /// - `DomainError::IneligibleApprover`: 委任元が現在レベルの承認者でない
    /// - `DomainError::Validation`: 終了済み、委任先が不正、有効期限が過去、委任元が決裁済み
    pub fn delegate(
        mut self,
        from: &Approver,
        to_user: &str,
        reason: String,
        valid_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalTransition<()>, DomainError> {
        let active = self.require_active("委任")?;
        let level = self.current_level_definition(active.current_level)?;

        if !level.is_eligible(from) {
            return Err(DomainError::IneligibleApprover {
                approver_id: from.user_id.clone(),
                level:       active.current_level,
            });
        }
        let to_user = to_user.trim();
        if to_user.is_empty() || to_user == from.user_id {
            return Err(DomainError::Validation(
                "委任先には委任元以外のユーザーを指定してください".to_string(),
            ));
        }
        if valid_until.is_some_and(|until| until <= now) {
            return Err(DomainError::Validation(
                "委任の有効期限は現在より後である必要があります".to_string(),
            ));
        }
        if self.has_decided(active.current_level, &from.user_id) {
            return Err(DomainError::Validation(format!(
                "{} はレベル {} で決裁済みのため委任できません",
                from.user_id, active.current_level
            )));
        }

        self.delegations.push(DelegationRecord {
            from_user: from.user_id.clone(),
            to_user: to_user.to_string(),
            level: active.current_level,
            reason,
            triggered_by: TriggeredBy::Manual,
            valid_until,
            at: now,
        });
        let effects = self
            .notify(
                ApprovalEvent::Delegated,
                vec![Recipient::user(to_user)],
                json!({"delegated_by": from.user_id, "valid_until": valid_until}),
            )
            .into_iter()
            .collect();

        Ok(ApprovalTransition {
            instance: self.touched(now),
            effects,
            result: (),
        })
    }

    /// 現在レベルをエスカレーションする
    ///
    /// `from_level` が現在レベルのルールを適用する。ルールがなければ現在レベルの承認者に
    /// 再通知して待ち時間を再開する。
    ///
    /// # Errors
    ///
    /// - `DomainError::Validation`: 終了済み
    pub fn escalate(
        mut self,
        reason: String,
        triggered_by: TriggeredBy,
        now: DateTime<Utc>,
    ) -> Result<ApprovalTransition<EscalateResult>, DomainError> {
        let active = self.require_active("エスカレーション")?;
        let current = active.current_level;
        let rule = self.workflow.escalation_rule_for(current).cloned();
        let mut effects = Vec::new();

        // 自動承認: システム決裁を合成して通常の承認と同じように進める
        if let Some(rule) = rule.as_ref().filter(|r| r.auto_approve) {
            self.escalations.push(EscalationRecord {
                from_level: current,
                to_level: rule.to_level,
                reason: reason.clone(),
                triggered_by,
                auto_approved: true,
                at: now,
            });
            self.records.push(ApprovalRecord {
                approver_id:     ESCALATION_APPROVER_ID.to_string(),
                on_behalf_of:    None,
                level:           current,
                decision:        Decision::Approved,
                comments:        Some(reason),
                decided_at:      Some(now),
                time_spent_secs: Some(time_spent(&active, now)),
                synthetic:       true,
            });
            let (instance, result) = self.level_satisfied(current, now, &mut effects);
            return Ok(ApprovalTransition {
                instance: instance.touched(now),
                effects,
                result: EscalateResult::AutoApproved(result),
            });
        }

        let notify_users: Vec<Recipient> = rule
            .as_ref()
            .map(|r| r.notify_users.iter().map(Recipient::user).collect())
            .unwrap_or_default();
        let jump_to = rule
            .as_ref()
            .and_then(|r| r.to_level)
            .filter(|to| *to > current);

        self.escalations.push(EscalationRecord {
            from_level: current,
            to_level: jump_to,
            reason: reason.clone(),
            triggered_by,
            auto_approved: false,
            at: now,
        });

        let (state, result) = match jump_to {
            Some(to) => (
                ActiveLevelState {
                    current_level:    to,
                    level_entered_at: now,
                },
                EscalateResult::MovedToLevel(to),
            ),
            None => {
                let extend = rule.as_ref().and_then(|r| r.extend_hours).unwrap_or(0);
                let level_entered_at = now + Duration::hours(i64::from(extend));
                (
                    ActiveLevelState {
                        current_level: current,
                        level_entered_at,
                    },
                    EscalateResult::ClockRestarted { level_entered_at },
                )
            }
        };
        let landed = state.current_level;
        let instance = Self {
            state: ApprovalState::Escalated(state),
            ..self
        };

        let escalated_recipients = match (notify_users.is_empty(), jump_to) {
            (false, _) => notify_users,
            // 通知先の指定がなく同じレベルに留まる場合は承認者に再通知する
            (true, None) => instance
                .workflow
                .level(current)
                .map(ApprovalLevel::recipients)
                .unwrap_or_default(),
            (true, Some(_)) => Vec::new(),
        };
        effects.extend(instance.notify(
            ApprovalEvent::Escalated,
            escalated_recipients,
            json!({"reason": reason, "from_level": current, "to_level": landed}),
        ));
        if jump_to.is_some() {
            effects.extend(instance.approval_request(landed));
        }

        Ok(ApprovalTransition {
            instance: instance.touched(now),
            effects,
            result,
        })
    }

    /// 配信待ちのコンテキストパッチを配信済みにする
    ///
    /// 配信待ちがなければ `None`（保存は不要）。
    pub fn patch_delivered(self, now: DateTime<Utc>) -> Option<Self> {
        self.pending_patch.as_ref()?;
        Some(
            Self {
                pending_patch: None,
                ..self
            }
            .touched(now),
        )
    }

    // ---------------------------------------------------------------------
    // 内部ヘルパー
    // ---------------------------------------------------------------------

    fn require_active(&self, operation: &str) -> Result<ActiveLevelState, DomainError> {
        self.active_level().cloned().ok_or_else(|| {
            DomainError::Validation(format!(
                "{operation}は決裁待ちの承認でのみ可能です（現在: {}）",
                self.status()
            ))
        })
    }

    fn current_level_definition(&self, level: u32) -> Result<&ApprovalLevel, DomainError> {
        self.workflow.level(level).ok_or_else(|| {
            DomainError::Validation(format!("承認レベル {level} が設定に存在しません"))
        })
    }

    /// 決裁権限を解決する
    ///
    /// 承認者本人なら `(本人, None)`、委任を受けていれば `(委任元, Some(委任元))` を返す。
    fn resolve_authority(
        &self,
        approver: &Approver,
        level: &ApprovalLevel,
        now: DateTime<Utc>,
    ) -> Option<(String, Option<String>)> {
        if level.is_eligible(approver) {
            return Some((approver.user_id.clone(), None));
        }

        let delegated = self
            .delegations
            .iter()
            .find(|d| d.to_user == approver.user_id && d.level == level.level && d.is_valid_at(now))
            .map(|d| d.from_user.clone());

        let standing = || {
            self.workflow
                .delegation_rules
                .iter()
                .find(|r| {
                    r.to_user == approver.user_id
                        && r.is_valid_at(now)
                        && match r.level {
                            Some(l) => l == level.level,
                            None => level.lists_user(&r.from_user),
                        }
                })
                .map(|r| r.from_user.clone())
        };

        delegated
            .or_else(standing)
            .map(|from| (from.clone(), Some(from)))
    }

    fn has_decided(&self, level: u32, effective_approver: &str) -> bool {
        self.records
            .iter()
            .any(|r| r.level == level && !r.synthetic && r.effective_approver() == effective_approver)
    }

    /// レベル内で承認した決裁者の数（重複は 1 とする）
    fn approved_count(&self, level: u32) -> u32 {
        let approvers: HashSet<&str> = self
            .records
            .iter()
            .filter(|r| r.level == level && r.decision == Decision::Approved)
            .map(ApprovalRecord::effective_approver)
            .collect();
        u32::try_from(approvers.len()).unwrap_or(u32::MAX)
    }

    /// 現在レベルを通過させ、次のスキップされないレベルへ進めるか完了にする
    fn level_satisfied(
        mut self,
        current: u32,
        now: DateTime<Utc>,
        effects: &mut Vec<ApprovalEffect>,
    ) -> (Self, ProcessResult) {
        let next = first_unskipped(
            &self.workflow,
            Some(current),
            &self.context,
            now,
            &mut self.skips,
        );
        match next {
            Some(to) => {
                let advanced = Self {
                    state: ApprovalState::Pending(ActiveLevelState {
                        current_level:    to,
                        level_entered_at: now,
                    }),
                    ..self
                };
                effects.extend(advanced.notify(
                    ApprovalEvent::Approved,
                    vec![Recipient::user(&advanced.submitted_by)],
                    json!({"approved_level": current, "next_level": to}),
                ));
                effects.extend(advanced.approval_request(to));
                (advanced, ProcessResult::LevelAdvanced { from: current, to })
            }
            None => {
                let mut completed = Self {
                    state: ApprovalState::Completed(FinishedState {
                        current_level: current,
                        finished_at:   now,
                    }),
                    ..self
                };
                effects.extend(completed.mark_finished(Decision::Approved));
                (completed, ProcessResult::Completed)
            }
        }
    }

    fn touched(self, now: DateTime<Utc>) -> Self {
        Self {
            version: self.version.next(),
            updated_at: now,
            ..self
        }
    }

    /// 終了時の副作用（文書ステータス・コンテキストパッチ・申請者への通知）を返す
    ///
    /// コンテキストパッチは配信が確認されるまで `pending_patch` にも保持する。
    fn mark_finished(&mut self, decision: Decision) -> Vec<ApprovalEffect> {
        let (status, event) = match decision {
            Decision::Rejected => (DocumentStatus::Rejected, ApprovalEvent::Rejected),
            Decision::Approved | Decision::Pending => {
                (DocumentStatus::Approved, ApprovalEvent::Completed)
            }
        };
        let patch = self.context_patch(decision);
        self.pending_patch = Some(patch.clone());
        let mut effects = vec![
            self.document_status_effect(status),
            ApprovalEffect::PublishContextPatch(patch),
        ];
        effects.extend(self.notify(
            event,
            vec![Recipient::user(&self.submitted_by)],
            json!({"decision": decision.to_string()}),
        ));
        effects
    }

    fn document_status_effect(&self, status: DocumentStatus) -> ApprovalEffect {
        ApprovalEffect::UpdateDocumentStatus {
            document_id: self.document_id.clone(),
            status,
        }
    }

    /// 案件コンテキストへのパッチ（`{<文書種別>: {status, document_id}}`）
    fn context_patch(&self, decision: Decision) -> ContextPatch {
        let mut patch = serde_json::Map::new();
        patch.insert(
            self.document_type_id.clone(),
            json!({
                "status": decision.to_string(),
                "document_id": self.document_id,
                "approval_instance_id": self.id,
            }),
        );
        ContextPatch {
            case_id:     self.case_id.clone(),
            document_id: self.document_id.clone(),
            patch:       JsonValue::Object(patch),
        }
    }

    fn approval_request(&self, level: u32) -> Option<ApprovalEffect> {
        let definition = self.workflow.level(level)?;
        self.notify(
            ApprovalEvent::ApprovalRequest,
            definition.recipients(),
            json!({"level": level, "level_name": definition.name}),
        )
    }

    /// 通知の副作用を組み立てる（宛先がなければ `None`）
    fn notify(
        &self,
        event: ApprovalEvent,
        recipients: Vec<Recipient>,
        extra: JsonValue,
    ) -> Option<ApprovalEffect> {
        if recipients.is_empty() {
            return None;
        }
        let (channel, template) = self.workflow.notification_for(event);
        let mut payload = json!({
            "event": event.to_string(),
            "approval_instance_id": self.id,
            "document_id": self.document_id,
            "document_type_id": self.document_type_id,
            "case_id": self.case_id,
            "workflow_name": self.workflow.name,
            "submitted_by": self.submitted_by,
            "current_level": self.current_level(),
        });
        crate::context::deep_merge(&mut payload, &extra);
        Some(ApprovalEffect::Notify(NotificationRequest {
            recipients,
            channel,
            template,
            payload,
        }))
    }
}

/// `after` より後で最初にスキップされないレベルを返す
///
/// スキップしたレベルは `skips` に記録する。
fn first_unskipped(
    workflow: &ApprovalWorkflow,
    after: Option<u32>,
    context: &JsonValue,
    now: DateTime<Utc>,
    skips: &mut Vec<SkipRecord>,
) -> Option<u32> {
    for level in workflow
        .levels
        .iter()
        .filter(|l| after.is_none_or(|a| l.level > a))
    {
        if !level.should_skip(context) {
            return Some(level.level);
        }
        skips.push(SkipRecord {
            level:     level.level,
            condition: level.skip_condition_text(),
            at:        now,
        });
    }
    None
}

fn time_spent(active: &ActiveLevelState, now: DateTime<Utc>) -> i64 {
    (now - active.level_entered_at).num_seconds().max(0)
}
