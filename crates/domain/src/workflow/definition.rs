//! # ワークフロー定義
//!
//! 修理案件を流すワークフローグラフ（ステップ・遷移・ビジネスルール・エスカレーションルール）と、
//! 名前 + バージョンで管理される定義エンティティを定義する。
//!
//! ## 設計方針
//!
//! - **公開済み定義は不変**: 管理者の編集は同名の新バージョンとして登録する
//! - **スナップショット**: インスタンスは開始時点の [`WorkflowGraph`] を値としてコピーして保持し、
//!   定義の変更が実行中の案件に影響しないようにする
//! - **登録時に検証**: [`WorkflowGraph::parse`] は [`validate_definition`] を通過した JSON のみを
//!   型付きグラフに変換する

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use strum::IntoStaticStr;

use super::{definition_validator::validate_definition, step::StepDefinition};
use crate::{
    DomainError,
    condition::Condition,
    context::set_path,
    notification::NotificationChannel,
    value_objects::{StepId, Version, WorkflowName},
};

define_uuid_id! {
    /// ワークフロー定義 ID
    pub struct WorkflowDefinitionId;
}

/// ワークフロー定義ステータス
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, IntoStaticStr, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum WorkflowDefinitionStatus {
    /// 下書き（編集中）
    Draft,
    /// 公開済み（利用可能・不変）
    Published,
    /// アーカイブ済み（新規案件では選択されない）
    Archived,
}

impl std::str::FromStr for WorkflowDefinitionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "published" => Ok(Self::Published),
            "archived" => Ok(Self::Archived),
            _ => Err(DomainError::Validation(format!(
                "不正なワークフロー定義ステータス: {s}"
            ))),
        }
    }
}

// =========================================================================
// グラフ構成要素
// =========================================================================

/// ビジネスルール
///
/// 遷移評価の前にコンテキストに対して評価し、`when` が成立した場合は
/// `set` の各フィールド（ドット区切りパス）をコンテキストに書き込む。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessRule {
    pub id:   String,
    #[serde(default)]
    pub name: String,
    pub when: Condition,
    #[serde(default)]
    pub set:  Map<String, JsonValue>,
}

/// ステップタイムアウト後のエスカレーション段階
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationLevel {
    /// タイムアウト期限からの経過時間
    pub after_hours:  u32,
    pub notify_roles: Vec<String>,
    #[serde(default)]
    pub channel:      NotificationChannel,
}

/// タイムアウト後の強制遷移
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoTransition {
    pub to:          StepId,
    /// タイムアウト期限からの経過時間
    pub after_hours: u32,
}

/// ステップ単位のエスカレーションルール
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepEscalationRule {
    pub step_id:           StepId,
    #[serde(default)]
    pub escalation_levels: Vec<EscalationLevel>,
    #[serde(default)]
    pub auto_transition:   Option<AutoTransition>,
}

/// ワークフローグラフ
///
/// バリデーション済みの定義本体。インスタンスのスナップショットとしても使用する。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowGraph {
    #[serde(default)]
    start_event:      Option<StepId>,
    #[serde(default)]
    end_events:       Vec<StepId>,
    steps:            Vec<StepDefinition>,
    #[serde(default)]
    business_rules:   Vec<BusinessRule>,
    #[serde(default)]
    escalation_rules: Vec<StepEscalationRule>,
}

impl WorkflowGraph {
    /// 定義 JSON を検証して型付きグラフに変換する
    ///
    /// # Errors
    ///
    /// バリデーションエラーがある場合は、すべてのエラーをまとめた
    /// `DomainError::Validation` を返す。
    pub fn parse(definition: &JsonValue) -> Result<Self, DomainError> {
        let result = validate_definition(definition);
        if !result.valid {
            return Err(DomainError::Validation(result.summary()));
        }
        serde_json::from_value(definition.clone())
            .map_err(|e| DomainError::Validation(format!("定義の構造が不正です: {e}")))
    }

    /// 永続化・API 出力用の JSON 表現
    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn step(&self, id: &StepId) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| &s.id == id)
    }

    pub fn contains_step(&self, id: &StepId) -> bool {
        self.step(id).is_some()
    }

    /// 開始ステップ
    ///
    /// `start_event` が指定されていればそれを、なければ開始フラグを持つステップを返す。
    pub fn start_step(&self) -> Option<&StepDefinition> {
        match &self.start_event {
            Some(id) => self.step(id),
            None => self.steps.iter().find(|s| s.is_start()),
        }
    }

    pub fn end_events(&self) -> &[StepId] {
        &self.end_events
    }

    pub fn business_rules(&self) -> &[BusinessRule] {
        &self.business_rules
    }

    pub fn escalation_rules(&self) -> &[StepEscalationRule] {
        &self.escalation_rules
    }

    pub fn escalation_rule_for(&self, step_id: &StepId) -> Option<&StepEscalationRule> {
        self.escalation_rules.iter().find(|r| &r.step_id == step_id)
    }

    /// 最終ステータスが cancelled の終了ステップ（取り消し時のアクションの取得元）
    pub fn cancellation_step(&self) -> Option<&StepDefinition> {
        self.steps
            .iter()
            .find(|s| s.is_end() && s.final_status() == super::step::FinalStatus::Cancelled)
    }

    /// ビジネスルールを定義順に適用する
    ///
    /// 後続のルールは先行ルールが書き込んだ値を参照できる。
    /// 適用されたルールの ID を返す。
    pub fn apply_business_rules(&self, context: &mut JsonValue) -> Vec<String> {
        let mut fired = Vec::new();
        for rule in &self.business_rules {
            if !rule.when.evaluate(context) {
                continue;
            }
            for (path, value) in &rule.set {
                set_path(context, path, value.clone());
            }
            fired.push(rule.id.clone());
        }
        fired
    }
}

// =========================================================================
// WorkflowDefinition（エンティティ）
// =========================================================================

/// ワークフロー定義エンティティ
///
/// 名前 + バージョンで一意。公開後はグラフを変更できない。
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    id:         WorkflowDefinitionId,
    name:       WorkflowName,
    version:    Version,
    status:     WorkflowDefinitionStatus,
    metadata:   JsonValue,
    graph:      WorkflowGraph,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// ワークフロー定義の新規作成パラメータ
pub struct NewWorkflowDefinition {
    pub id:       WorkflowDefinitionId,
    pub name:     WorkflowName,
    /// 同名の既存定義の最新バージョン + 1
    pub version:  Version,
    pub metadata: JsonValue,
    pub graph:    WorkflowGraph,
    pub now:      DateTime<Utc>,
}

/// ワークフロー定義の DB 復元パラメータ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinitionRecord {
    pub id:         WorkflowDefinitionId,
    pub name:       WorkflowName,
    pub version:    Version,
    pub status:     WorkflowDefinitionStatus,
    pub metadata:   JsonValue,
    pub graph:      WorkflowGraph,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// 下書き状態の定義を作成する
    pub fn new(params: NewWorkflowDefinition) -> Self {
        Self {
            id:         params.id,
            name:       params.name,
            version:    params.version,
            status:     WorkflowDefinitionStatus::Draft,
            metadata:   params.metadata,
            graph:      params.graph,
            created_at: params.now,
            updated_at: params.now,
        }
    }

    /// 既存のデータから復元する
    pub fn from_db(record: WorkflowDefinitionRecord) -> Self {
        Self {
            id:         record.id,
            name:       record.name,
            version:    record.version,
            status:     record.status,
            metadata:   record.metadata,
            graph:      record.graph,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }

    /// DB 保存用のレコードに変換する
    pub fn to_record(&self) -> WorkflowDefinitionRecord {
        WorkflowDefinitionRecord {
            id:         self.id.clone(),
            name:       self.name.clone(),
            version:    self.version,
            status:     self.status,
            metadata:   self.metadata.clone(),
            graph:      self.graph.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    // Getter メソッド

    pub fn id(&self) -> &WorkflowDefinitionId {
        &self.id
    }

    pub fn name(&self) -> &WorkflowName {
        &self.name
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn status(&self) -> WorkflowDefinitionStatus {
        self.status
    }

    pub fn metadata(&self) -> &JsonValue {
        &self.metadata
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    // ビジネスロジックメソッド

    /// 定義を公開した新しいインスタンスを返す
    ///
    /// # Errors
    ///
    /// 下書き以外の状態からは公開できない。
    pub fn published(self, now: DateTime<Utc>) -> Result<Self, DomainError> {
        match self.status {
            WorkflowDefinitionStatus::Draft => Ok(Self {
                status: WorkflowDefinitionStatus::Published,
                updated_at: now,
                ..self
            }),
            WorkflowDefinitionStatus::Published => {
                Err(DomainError::Validation("既に公開済みです".to_string()))
            }
            WorkflowDefinitionStatus::Archived => Err(DomainError::Validation(
                "アーカイブ済みの定義は公開できません".to_string(),
            )),
        }
    }

    /// 定義をアーカイブした新しいインスタンスを返す
    pub fn archived(self, now: DateTime<Utc>) -> Result<Self, DomainError> {
        if self.status == WorkflowDefinitionStatus::Archived {
            return Err(DomainError::Validation(
                "既にアーカイブ済みです".to_string(),
            ));
        }
        Ok(Self {
            status: WorkflowDefinitionStatus::Archived,
            updated_at: now,
            ..self
        })
    }
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
    fn graph_json() -> JsonValue {
        json!({
            "start_event": "start",
            "end_events": ["end"],
            "steps": [
                {"id": "start", "name": "開始", "type": "start_event",
                 "transitions": [{"to": "registration", "condition": "always"}]},
                {"id": "registration", "name": "受付", "type": "manual",
                 "transitions": [{"to": "end", "condition": "status == 'completed'"}]},
                {"id": "end", "name": "完了", "type": "end_event", "final_status": "completed"}
            ],
            "business_rules": [
                {"id": "high_value", "when": "repair_cost >= 50000",
                 "set": {"flags.requires_manager_review": true}}
            ],
            "escalation_rules": [
                {"step_id": "registration",
                 "escalation_levels": [{"after_hours": 0, "notify_roles": ["supervisor"]}]}
            ]
        })
    }

    #[fixture]
    fn test_definition(graph_json: JsonValue, now: DateTime<Utc>) -> WorkflowDefinition {
        WorkflowDefinition::new(NewWorkflowDefinition {
            id: WorkflowDefinitionId::new(),
            name: WorkflowName::new("smartphone_repair").unwrap(),
            version: Version::initial(),
            metadata: json!({"category": "repair"}),
            graph: WorkflowGraph::parse(&graph_json).unwrap(),
            now,
        })
    }

    mod graph {
        use pretty_assertions::assert_eq;

        use super::*;

        #[rstest]
        fn test_開始ステップを解決できる(graph_json: JsonValue) {
            let sut = WorkflowGraph::parse(&graph_json).unwrap();

            assert_eq!(sut.start_step().unwrap().id, "start");
            assert!(sut.contains_step(&StepId::new("registration")));
            assert!(!sut.contains_step(&StepId::new("unknown")));
        }

        #[rstest]
        fn test_不正な定義はバリデーションエラー() {
            let result = WorkflowGraph::parse(&json!({"steps": []}));

            assert!(matches!(result, Err(DomainError::Validation(_))));
        }

        #[rstest]
        fn test_ビジネスルールは条件成立時のみ適用される(graph_json: JsonValue) {
            let sut = WorkflowGraph::parse(&graph_json).unwrap();
            let mut high = json!({"repair_cost": 80000});
            let mut low = json!({"repair_cost": 1000});

            let fired_high = sut.apply_business_rules(&mut high);
            let fired_low = sut.apply_business_rules(&mut low);

            assert_eq!(fired_high, vec!["high_value".to_string()]);
            assert_eq!(high["flags"]["requires_manager_review"], json!(true));
            assert!(fired_low.is_empty());
            assert_eq!(low, json!({"repair_cost": 1000}));
        }

        #[rstest]
        fn test_エスカレーションルールをステップidで引ける(graph_json: JsonValue) {
            let sut = WorkflowGraph::parse(&graph_json).unwrap();

            let rule = sut.escalation_rule_for(&StepId::new("registration")).unwrap();

            assert_eq!(rule.escalation_levels[0].notify_roles, vec!["supervisor".to_string()]);
            assert_eq!(rule.escalation_levels[0].channel, NotificationChannel::InApp);
        }

        #[rstest]
        fn test_jsonとの往復で同じグラフになる(graph_json: JsonValue) {
            let sut = WorkflowGraph::parse(&graph_json).unwrap();

            let restored = WorkflowGraph::parse(&sut.to_json()).unwrap();

            assert_eq!(restored, sut);
        }
    }

    mod workflow_definition {
        use pretty_assertions::assert_eq;

        use super::*;

        #[rstest]
        fn test_新規定義は下書き(test_definition: WorkflowDefinition) {
            assert_eq!(test_definition.status(), WorkflowDefinitionStatus::Draft);
        }

        #[rstest]
        fn test_公開後の状態(test_definition: WorkflowDefinition, now: DateTime<Utc>) {
            let before = test_definition.clone();
            let later = now + chrono::Duration::hours(1);

            let sut = test_definition.published(later).unwrap();

            let expected = WorkflowDefinition::from_db(WorkflowDefinitionRecord {
                status: WorkflowDefinitionStatus::Published,
                updated_at: later,
                ..before.to_record()
            });
            assert_eq!(sut, expected);
        }

        #[rstest]
        fn test_公開済みの再公開はエラー(
            test_definition: WorkflowDefinition,
            now: DateTime<Utc>,
        ) {
            let published = test_definition.published(now).unwrap();

            let result = published.published(now);

            assert!(result.is_err());
        }

        #[rstest]
        fn test_アーカイブ済みは公開できない(
            test_definition: WorkflowDefinition,
            now: DateTime<Utc>,
        ) {
            let archived = test_definition.archived(now).unwrap();

            assert!(archived.clone().published(now).is_err());
            assert!(archived.archived(now).is_err());
        }
    }
}
