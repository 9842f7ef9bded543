//! # ワークフローインスタンス
//!
//! 修理案件ごとに生成される実行中のワークフロー。
//! 定義のスナップショット・案件コンテキスト・現在ステップ・ステップ履歴を保持する。
//!
//! 状態遷移は ADT（代数的データ型）で表現し、不正な状態を型レベルで防止する。
//! 遷移メソッドは所有権を消費して新しいインスタンスを返す。
//! バージョンのインクリメントはエンジンが 1 操作につき 1 回だけ行う（[`WorkflowInstance::touched`]）。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use strum::IntoStaticStr;

use super::{
    definition::{WorkflowDefinitionId, WorkflowGraph},
    step::StepDefinition,
};
use crate::{
    DomainError,
    value_objects::{CaseId, StepId, Version, WorkflowName},
};

define_uuid_id! {
    /// ワークフローインスタンス ID
    pub struct WorkflowInstanceId;
}

/// ワークフローインスタンスステータス
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, IntoStaticStr, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WorkflowInstanceStatus {
    /// 実行中
    Running,
    /// 完了
    Completed,
    /// 取り消し
    Cancelled,
    /// 凍結（自動遷移の循環を検出）
    Frozen,
}

impl std::str::FromStr for WorkflowInstanceStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "frozen" => Ok(Self::Frozen),
            _ => Err(DomainError::Validation(format!(
                "不正なワークフローインスタンスステータス: {s}"
            ))),
        }
    }
}

/// ステップ履歴の結果
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, IntoStaticStr, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HistoryOutcome {
    /// 滞在中
    Active,
    /// 遷移条件の成立により退出
    Transitioned,
    /// スキップ条件の成立により素通り
    Skipped,
    /// automatic / start_event ステップからの自動遷移
    AutoTransitioned,
    /// タイムアウト後の強制遷移
    TimedOut,
    /// 終了ステップに到達して完了
    Completed,
    /// 取り消し
    Cancelled,
    /// 凍結
    Frozen,
}

/// ステップ履歴エントリ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step_id:    StepId,
    pub entered_at: DateTime<Utc>,
    pub exited_at:  Option<DateTime<Utc>>,
    pub outcome:    HistoryOutcome,
}

/// ワークフローインスタンスの状態（ADT ベースステートマシン）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowInstanceState {
    Running(RunningState),
    Completed(CompletedState),
    Cancelled(CancelledState),
    Frozen(FrozenState),
}

/// Running 状態の固有フィールド
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningState {
    pub current_step_id:   StepId,
    /// タイムアウト判定の起点
    pub step_entered_at:   DateTime<Utc>,
    /// 発火済みのエスカレーション段階（定義内のインデックス）
    pub escalations_fired: Vec<u32>,
}

/// Completed 状態の固有フィールド
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedState {
    pub current_step_id: StepId,
    pub completed_at:    DateTime<Utc>,
}

/// Cancelled 状態の固有フィールド
///
/// final_status が cancelled の終了ステップに到達した場合は理由なし。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelledState {
    pub current_step_id: StepId,
    pub cancelled_at:    DateTime<Utc>,
    pub reason:          Option<String>,
}

/// Frozen 状態の固有フィールド
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrozenState {
    pub current_step_id: StepId,
    pub frozen_at:       DateTime<Utc>,
    pub reason:          String,
}

/// ワークフローインスタンスエンティティ
///
/// `version` フィールドにより、並行更新時の競合を検出する。
/// 保存時は読み込み時の version と DB の version を比較し、
/// 一致しない場合は競合エラーを返す。
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowInstance {
    id:                 WorkflowInstanceId,
    case_id:            CaseId,
    definition_id:      WorkflowDefinitionId,
    definition_name:    WorkflowName,
    definition_version: Version,
    definition:         WorkflowGraph,
    context:            JsonValue,
    history:            Vec<HistoryEntry>,
    version:            Version,
    created_at:         DateTime<Utc>,
    updated_at:         DateTime<Utc>,
    state:              WorkflowInstanceState,
}

/// ワークフローインスタンスの新規作成パラメータ
pub struct NewWorkflowInstance {
    pub id:                 WorkflowInstanceId,
    pub case_id:            CaseId,
    pub definition_id:      WorkflowDefinitionId,
    pub definition_name:    WorkflowName,
    pub definition_version: Version,
    pub definition:         WorkflowGraph,
    pub context:            JsonValue,
    pub now:                DateTime<Utc>,
}

/// ワークフローインスタンスの DB 復元パラメータ
///
/// 永続化用のフラット構造。`from_db()` で不変条件を検証して ADT に変換する。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstanceRecord {
    pub id:                 WorkflowInstanceId,
    pub case_id:            CaseId,
    pub definition_id:      WorkflowDefinitionId,
    pub definition_name:    WorkflowName,
    pub definition_version: Version,
    pub definition:         WorkflowGraph,
    pub context:            JsonValue,
    pub history:            Vec<HistoryEntry>,
    pub status:             WorkflowInstanceStatus,
    pub current_step_id:    StepId,
    pub step_entered_at:    Option<DateTime<Utc>>,
    #[serde(default)]
    pub escalations_fired:  Vec<u32>,
    /// 完了・取り消し・凍結の日時
    pub finished_at:        Option<DateTime<Utc>>,
    pub reason:             Option<String>,
    pub version:            Version,
    pub created_at:         DateTime<Utc>,
    pub updated_at:         DateTime<Utc>,
}

impl WorkflowInstance {
    /// 開始ステップに滞在する新しいインスタンスを作成する
    ///
    /// # Errors
    ///
    /// - `DomainError::Validation`: 定義に開始ステップがない場合
    pub fn new(params: NewWorkflowInstance) -> Result<Self, DomainError> {
        let start_step_id = params
            .definition
            .start_step()
            .map(|s| s.id.clone())
            .ok_or_else(|| DomainError::Validation("定義に開始ステップがありません".to_string()))?;

        Ok(Self {
            id:                 params.id,
            case_id:            params.case_id,
            definition_id:      params.definition_id,
            definition_name:    params.definition_name,
            definition_version: params.definition_version,
            definition:         params.definition,
            context:            params.context,
            history:            vec![HistoryEntry {
                step_id:    start_step_id.clone(),
                entered_at: params.now,
                exited_at:  None,
                outcome:    HistoryOutcome::Active,
            }],
            version:            Version::initial(),
            created_at:         params.now,
            updated_at:         params.now,
            state:              WorkflowInstanceState::Running(RunningState {
                current_step_id:   start_step_id,
                step_entered_at:   params.now,
                escalations_fired: Vec::new(),
            }),
        })
    }

    /// 既存のデータから復元する
    ///
    /// # Errors
    ///
    /// - `DomainError::Validation`: 状態に必要な日時の欠落、または現在ステップが定義に存在しない
    pub fn from_db(record: WorkflowInstanceRecord) -> Result<Self, DomainError> {
        if !record.definition.contains_step(&record.current_step_id) {
            return Err(DomainError::Validation(format!(
                "現在ステップ '{}' が定義のスナップショットに存在しません",
                record.current_step_id
            )));
        }

        let finished_at = |status: WorkflowInstanceStatus| {
            record.finished_at.ok_or_else(|| {
                DomainError::Validation(format!("{status} インスタンスには finished_at が必要です"))
            })
        };

        let state = match record.status {
            WorkflowInstanceStatus::Running => {
                let step_entered_at = record.step_entered_at.ok_or_else(|| {
                    DomainError::Validation(
                        "running インスタンスには step_entered_at が必要です".to_string(),
                    )
                })?;
                WorkflowInstanceState::Running(RunningState {
                    current_step_id: record.current_step_id,
                    step_entered_at,
                    escalations_fired: record.escalations_fired,
                })
            }
            WorkflowInstanceStatus::Completed => {
                WorkflowInstanceState::Completed(CompletedState {
                    completed_at:    finished_at(record.status)?,
                    current_step_id: record.current_step_id,
                })
            }
            WorkflowInstanceStatus::Cancelled => {
                WorkflowInstanceState::Cancelled(CancelledState {
                    cancelled_at:    finished_at(record.status)?,
                    current_step_id: record.current_step_id,
                    reason:          record.reason,
                })
            }
            WorkflowInstanceStatus::Frozen => {
                let frozen_at = finished_at(record.status)?;
                let reason = record.reason.ok_or_else(|| {
                    DomainError::Validation("frozen インスタンスには reason が必要です".to_string())
                })?;
                WorkflowInstanceState::Frozen(FrozenState {
                    current_step_id: record.current_step_id,
                    frozen_at,
                    reason,
                })
            }
        };

        Ok(Self {
            id: record.id,
            case_id: record.case_id,
            definition_id: record.definition_id,
            definition_name: record.definition_name,
            definition_version: record.definition_version,
            definition: record.definition,
            context: record.context,
            history: record.history,
            version: record.version,
            created_at: record.created_at,
            updated_at: record.updated_at,
            state,
        })
    }

    /// DB 保存用のレコードに変換する
    pub fn to_record(&self) -> WorkflowInstanceRecord {
        let (step_entered_at, escalations_fired, reason) = match &self.state {
            WorkflowInstanceState::Running(running) => (
                Some(running.step_entered_at),
                running.escalations_fired.clone(),
                None,
            ),
            WorkflowInstanceState::Completed(_) => (None, Vec::new(), None),
            WorkflowInstanceState::Cancelled(cancelled) => {
                (None, Vec::new(), cancelled.reason.clone())
            }
            WorkflowInstanceState::Frozen(frozen) => {
                (None, Vec::new(), Some(frozen.reason.clone()))
            }
        };

        WorkflowInstanceRecord {
            id: self.id.clone(),
            case_id: self.case_id.clone(),
            definition_id: self.definition_id.clone(),
            definition_name: self.definition_name.clone(),
            definition_version: self.definition_version,
            definition: self.definition.clone(),
            context: self.context.clone(),
            history: self.history.clone(),
            status: self.status(),
            current_step_id: self.current_step_id().clone(),
            step_entered_at,
            escalations_fired,
            finished_at: self.finished_at(),
            reason,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    // Getter メソッド

    pub fn id(&self) -> &WorkflowInstanceId {
        &self.id
    }

    pub fn case_id(&self) -> &CaseId {
        &self.case_id
    }

    pub fn definition_id(&self) -> &WorkflowDefinitionId {
        &self.definition_id
    }

    pub fn definition_name(&self) -> &WorkflowName {
        &self.definition_name
    }

    pub fn definition_version(&self) -> Version {
        self.definition_version
    }

    /// 開始時点の定義スナップショット
    pub fn definition(&self) -> &WorkflowGraph {
        &self.definition
    }

    pub fn context(&self) -> &JsonValue {
        &self.context
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
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
    pub fn state(&self) -> &WorkflowInstanceState {
        &self.state
    }

    /// ステータス（状態から導出）
    pub fn status(&self) -> WorkflowInstanceStatus {
        match &self.state {
            WorkflowInstanceState::Running(_) => WorkflowInstanceStatus::Running,
            WorkflowInstanceState::Completed(_) => WorkflowInstanceStatus::Completed,
            WorkflowInstanceState::Cancelled(_) => WorkflowInstanceStatus::Cancelled,
            WorkflowInstanceState::Frozen(_) => WorkflowInstanceStatus::Frozen,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, WorkflowInstanceState::Running(_))
    }

    /// 現在（または最後）のステップ ID（状態から導出）
    pub fn current_step_id(&self) -> &StepId {
        match &self.state {
            WorkflowInstanceState::Running(s) => &s.current_step_id,
            WorkflowInstanceState::Completed(s) => &s.current_step_id,
            WorkflowInstanceState::Cancelled(s) => &s.current_step_id,
            WorkflowInstanceState::Frozen(s) => &s.current_step_id,
        }
    }

    /// 現在ステップの定義
    pub fn current_step(&self) -> Option<&StepDefinition> {
        self.definition.step(self.current_step_id())
    }

    /// 現在ステップへの到着日時（Running の場合のみ）
    pub fn step_entered_at(&self) -> Option<DateTime<Utc>> {
        match &self.state {
            WorkflowInstanceState::Running(s) => Some(s.step_entered_at),
            _ => None,
        }
    }

    /// 発火済みのエスカレーション段階（Running の場合のみ）
    pub fn escalations_fired(&self) -> &[u32] {
        match &self.state {
            WorkflowInstanceState::Running(s) => &s.escalations_fired,
            _ => &[],
        }
    }

    /// 完了・取り消し・凍結の日時（状態から導出）
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        match &self.state {
            WorkflowInstanceState::Running(_) => None,
            WorkflowInstanceState::Completed(s) => Some(s.completed_at),
            WorkflowInstanceState::Cancelled(s) => Some(s.cancelled_at),
            WorkflowInstanceState::Frozen(s) => Some(s.frozen_at),
        }
    }

    // ビジネスロジックメソッド

    /// コンテキストを差し替えた新しいインスタンスを返す
    pub fn with_context(self, context: JsonValue) -> Self {
        Self { context, ..self }
    }

    /// 別のステップに移動した新しいインスタンスを返す
    ///
    /// 現在ステップの履歴を `outcome` で閉じ、移動先の履歴を追加する。
    ///
    /// # Errors
    ///
    /// - `DomainError::Validation`: Running 以外、または移動先が定義に存在しない
    pub fn moved_to(
        self,
        to: StepId,
        outcome: HistoryOutcome,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        if !self.definition.contains_step(&to) {
            return Err(DomainError::Validation(format!(
                "遷移先ステップ '{to}' が定義に存在しません"
            )));
        }
        match self.state {
            WorkflowInstanceState::Running(_) => {
                let mut history = close_active(self.history, outcome, now);
                history.push(HistoryEntry {
                    step_id:    to.clone(),
                    entered_at: now,
                    exited_at:  None,
                    outcome:    HistoryOutcome::Active,
                });
                Ok(Self {
                    state: WorkflowInstanceState::Running(RunningState {
                        current_step_id:   to,
                        step_entered_at:   now,
                        escalations_fired: Vec::new(),
                    }),
                    history,
                    updated_at: now,
                    ..self
                })
            }
            _ => Err(DomainError::Validation(format!(
                "ステップ遷移は実行中のインスタンスでのみ可能です（現在: {}）",
                self.status()
            ))),
        }
    }

    /// エスカレーション段階を発火済みとして記録した新しいインスタンスを返す
    pub fn with_escalation_fired(self, level: u32, now: DateTime<Utc>) -> Result<Self, DomainError> {
        match self.state {
            WorkflowInstanceState::Running(mut running) => {
                if !running.escalations_fired.contains(&level) {
                    running.escalations_fired.push(level);
                }
                Ok(Self {
                    state: WorkflowInstanceState::Running(running),
                    updated_at: now,
                    ..self
                })
            }
            _ => Err(DomainError::Validation(
                "エスカレーションは実行中のインスタンスでのみ記録できます".to_string(),
            )),
        }
    }

    /// 終了ステップに到達して完了した新しいインスタンスを返す
    pub fn completed(self, now: DateTime<Utc>) -> Result<Self, DomainError> {
        match self.state {
            WorkflowInstanceState::Running(running) => Ok(Self {
                state: WorkflowInstanceState::Completed(CompletedState {
                    current_step_id: running.current_step_id,
                    completed_at:    now,
                }),
                history: close_active(self.history, HistoryOutcome::Completed, now),
                updated_at: now,
                ..self
            }),
            _ => Err(DomainError::Validation(format!(
                "完了は実行中のインスタンスでのみ可能です（現在: {}）",
                self.status()
            ))),
        }
    }

    /// 取り消した新しいインスタンスを返す
    ///
    /// Running / Frozen から遷移可能。
    pub fn cancelled(self, reason: Option<String>, now: DateTime<Utc>) -> Result<Self, DomainError> {
        let current_step_id = match self.state {
            WorkflowInstanceState::Running(running) => running.current_step_id,
            WorkflowInstanceState::Frozen(frozen) => frozen.current_step_id,
            WorkflowInstanceState::Completed(_) | WorkflowInstanceState::Cancelled(_) => {
                return Err(DomainError::Validation(
                    "終了済みのワークフローは取り消せません".to_string(),
                ));
            }
        };
        Ok(Self {
            state: WorkflowInstanceState::Cancelled(CancelledState {
                current_step_id,
                cancelled_at: now,
                reason,
            }),
            history: close_active(self.history, HistoryOutcome::Cancelled, now),
            updated_at: now,
            ..self
        })
    }

    /// 凍結した新しいインスタンスを返す
    pub fn frozen(self, reason: String, now: DateTime<Utc>) -> Result<Self, DomainError> {
        match self.state {
            WorkflowInstanceState::Running(running) => Ok(Self {
                state: WorkflowInstanceState::Frozen(FrozenState {
                    current_step_id: running.current_step_id,
                    frozen_at: now,
                    reason,
                }),
                history: close_active(self.history, HistoryOutcome::Frozen, now),
                updated_at: now,
                ..self
            }),
            _ => Err(DomainError::Validation(format!(
                "凍結は実行中のインスタンスでのみ可能です（現在: {}）",
                self.status()
            ))),
        }
    }

    /// 1 操作分の更新を確定した新しいインスタンスを返す（version をインクリメント）
    pub fn touched(self, now: DateTime<Utc>) -> Self {
        Self {
            version: self.version.next(),
            updated_at: now,
            ..self
        }
    }
}

/// 滞在中の履歴エントリを閉じる
fn close_active(
    mut history: Vec<HistoryEntry>,
    outcome: HistoryOutcome,
    now: DateTime<Utc>,
) -> Vec<HistoryEntry> {
    if let Some(entry) = history
        .iter_mut()
        .rev()
        .find(|e| e.outcome == HistoryOutcome::Active)
    {
        entry.exited_at = Some(now);
        entry.outcome = outcome;
    }
    history
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};
    use serde_json::json;

    use super::*;

    /// テスト用の固定タイムスタンプ
    #[fixture]
    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[fixture]
    fn graph() -> WorkflowGraph {
        WorkflowGraph::parse(&json!({
            "steps": [
                {"id": "start", "name": "開始", "type": "start_event",
                 "transitions": [{"to": "registration"}]},
                {"id": "registration", "name": "受付", "type": "manual",
                 "transitions": [{"to": "end", "condition": "status == 'completed'"}]},
                {"id": "end", "name": "完了", "type": "end_event"}
            ]
        }))
        .unwrap()
    }

    #[fixture]
    fn test_instance(graph: WorkflowGraph, now: DateTime<Utc>) -> WorkflowInstance {
        WorkflowInstance::new(NewWorkflowInstance {
            id: WorkflowInstanceId::new(),
            case_id: CaseId::new(),
            definition_id: WorkflowDefinitionId::new(),
            definition_name: WorkflowName::new("smartphone_repair").unwrap(),
            definition_version: Version::initial(),
            definition: graph,
            context: json!({"device": "smartphone"}),
            now,
        })
        .unwrap()
    }

    mod workflow_instance {
        use pretty_assertions::assert_eq;

        use super::*;

        #[rstest]
        fn test_新規作成は開始ステップに滞在する(test_instance: WorkflowInstance, now: DateTime<Utc>) {
            assert_eq!(test_instance.status(), WorkflowInstanceStatus::Running);
            assert_eq!(test_instance.current_step_id(), &StepId::new("start"));
            assert_eq!(test_instance.step_entered_at(), Some(now));
            assert_eq!(
                test_instance.history(),
                &[HistoryEntry {
                    step_id:    StepId::new("start"),
                    entered_at: now,
                    exited_at:  None,
                    outcome:    HistoryOutcome::Active,
                }]
            );
        }

        #[rstest]
        fn test_ステップ移動で履歴が閉じられる(test_instance: WorkflowInstance, now: DateTime<Utc>) {
            let later = now + chrono::Duration::minutes(1);

            let sut = test_instance
                .moved_to(StepId::new("registration"), HistoryOutcome::AutoTransitioned, later)
                .unwrap();

            assert_eq!(sut.current_step_id(), &StepId::new("registration"));
            assert_eq!(sut.step_entered_at(), Some(later));
            assert_eq!(sut.history()[0].outcome, HistoryOutcome::AutoTransitioned);
            assert_eq!(sut.history()[0].exited_at, Some(later));
            assert_eq!(sut.history()[1].outcome, HistoryOutcome::Active);
        }

        #[rstest]
        fn test_存在しないステップへは移動できない(test_instance: WorkflowInstance, now: DateTime<Utc>) {
            let result =
                test_instance.moved_to(StepId::new("unknown"), HistoryOutcome::Transitioned, now);

            assert!(matches!(result, Err(DomainError::Validation(_))));
        }

        #[rstest]
        fn test_移動でエスカレーション発火記録がリセットされる(
            test_instance: WorkflowInstance,
            now: DateTime<Utc>,
        ) {
            let fired = test_instance.with_escalation_fired(0, now).unwrap();
            assert_eq!(fired.escalations_fired(), &[0]);

            let sut = fired
                .moved_to(StepId::new("registration"), HistoryOutcome::Transitioned, now)
                .unwrap();

            assert!(sut.escalations_fired().is_empty());
        }

        #[rstest]
        fn test_完了後は取り消しできない(test_instance: WorkflowInstance, now: DateTime<Utc>) {
            let completed = test_instance
                .moved_to(StepId::new("end"), HistoryOutcome::Transitioned, now)
                .unwrap()
                .completed(now)
                .unwrap();

            assert_eq!(completed.status(), WorkflowInstanceStatus::Completed);
            assert_eq!(completed.finished_at(), Some(now));
            assert!(completed.cancelled(None, now).is_err());
        }

        #[rstest]
        fn test_凍結したインスタンスは取り消しできる(
            test_instance: WorkflowInstance,
            now: DateTime<Utc>,
        ) {
            let frozen = test_instance.frozen("循環を検出".to_string(), now).unwrap();

            let sut = frozen.cancelled(Some("手動で終了".to_string()), now).unwrap();

            assert_eq!(sut.status(), WorkflowInstanceStatus::Cancelled);
            assert_eq!(sut.history()[0].outcome, HistoryOutcome::Frozen);
        }

        #[rstest]
        fn test_touchedでバージョンが上がる(test_instance: WorkflowInstance, now: DateTime<Utc>) {
            let later = now + chrono::Duration::seconds(5);

            let sut = test_instance.touched(later);

            assert_eq!(sut.version(), Version::initial().next());
            assert_eq!(sut.updated_at(), later);
        }
    }

    mod record {
        use pretty_assertions::assert_eq;

        use super::*;

        #[rstest]
        #[case::running(None)]
        #[case::cancelled(Some("顧客都合".to_string()))]
        fn test_レコードとの往復で同じインスタンスになる(
            test_instance: WorkflowInstance,
            now: DateTime<Utc>,
            #[case] cancel_reason: Option<String>,
        ) {
            let sut = match cancel_reason {
                Some(reason) => test_instance.cancelled(Some(reason), now).unwrap(),
                None => test_instance.with_escalation_fired(1, now).unwrap(),
            };

            let restored = WorkflowInstance::from_db(sut.to_record()).unwrap();

            assert_eq!(restored, sut);
        }

        #[rstest]
        fn test_jsonとの往復で同じインスタンスになる(test_instance: WorkflowInstance) {
            let body = serde_json::to_value(test_instance.to_record()).unwrap();

            let record: WorkflowInstanceRecord = serde_json::from_value(body).unwrap();

            assert_eq!(WorkflowInstance::from_db(record).unwrap(), test_instance);
        }

        #[rstest]
        fn test_runningでstep_entered_atがない場合はエラー(test_instance: WorkflowInstance) {
            let record = WorkflowInstanceRecord {
                step_entered_at: None,
                ..test_instance.to_record()
            };

            assert!(WorkflowInstance::from_db(record).is_err());
        }

        #[rstest]
        fn test_定義にない現在ステップはエラー(test_instance: WorkflowInstance) {
            let record = WorkflowInstanceRecord {
                current_step_id: StepId::new("deleted_step"),
                ..test_instance.to_record()
            };

            assert!(WorkflowInstance::from_db(record).is_err());
        }

        #[rstest]
        fn test_凍結で理由がない場合はエラー(test_instance: WorkflowInstance, now: DateTime<Utc>) {
            let record = WorkflowInstanceRecord {
                status: WorkflowInstanceStatus::Frozen,
                finished_at: Some(now),
                reason: None,
                ..test_instance.to_record()
            };

            assert!(WorkflowInstance::from_db(record).is_err());
        }
    }
}
