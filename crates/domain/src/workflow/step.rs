//! # ステップ定義
//!
//! ワークフローグラフのノード（ステップ）と、ステップから出る遷移・アクションを定義する。
//!
//! 定義 JSON はバリデーション後にこれらの型へデシリアライズされ、
//! インスタンスにスナップショットとして埋め込まれる。

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use strum::IntoStaticStr;

use crate::{
    DomainError,
    condition::Condition,
    document::DocumentStatus,
    notification::{NotificationChannel, Recipient},
    value_objects::StepId,
};

/// ステップ種別
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, IntoStaticStr, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StepType {
    /// 開始イベント（外部入力を待たずに遷移する）
    StartEvent,
    /// 終了イベント
    EndEvent,
    /// 担当者の作業を待つステップ
    Manual,
    /// 外部入力を待たずに遷移するステップ
    Automatic,
    /// 社内承認を待つステップ
    Approval,
    /// 顧客承認など社外の承認を待つステップ
    ExternalApproval,
}

impl std::str::FromStr for StepType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start_event" => Ok(Self::StartEvent),
            "end_event" => Ok(Self::EndEvent),
            "manual" => Ok(Self::Manual),
            "automatic" => Ok(Self::Automatic),
            "approval" => Ok(Self::Approval),
            "external_approval" => Ok(Self::ExternalApproval),
            _ => Err(DomainError::Validation(format!("不正なステップ種別: {s}"))),
        }
    }
}

/// 終了ステップ到達時のインスタンスの最終ステータス
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    IntoStaticStr,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FinalStatus {
    #[default]
    Completed,
    Cancelled,
}

/// 担当者割り当てルール
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    #[serde(default)]
    pub roles:    Vec<String>,
    #[serde(default)]
    pub user_ids: Vec<String>,
}

impl Assignment {
    /// 通知先としての宛先一覧
    pub fn recipients(&self) -> Vec<Recipient> {
        self.roles
            .iter()
            .map(Recipient::role)
            .chain(self.user_ids.iter().map(Recipient::user))
            .collect()
    }
}

/// 遷移（条件付きの有向辺）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub to:        StepId,
    #[serde(default = "Condition::always")]
    pub condition: Condition,
}

/// ステップのアクション
///
/// 終了ステップ到達時・取り消し時に外部コラボレーターへ発行される。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    /// 通知を送信する
    Notify {
        recipients: Vec<Recipient>,
        #[serde(default)]
        channel:    NotificationChannel,
        template:   String,
    },
    /// 案件の文書ステータスを更新する
    UpdateDocumentStatus {
        document_type: String,
        status:        DocumentStatus,
    },
    /// 監査ログを記録する
    Audit { event: String },
}

/// ステップ定義
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id:                 StepId,
    pub name:               String,
    #[serde(rename = "type")]
    pub step_type:          StepType,
    #[serde(default)]
    pub assignment:         Assignment,
    #[serde(default)]
    pub required_documents: Vec<String>,
    #[serde(default)]
    pub timeout_hours:      Option<u32>,
    /// 定義順で評価される。最初に成立した遷移が採用される
    #[serde(default)]
    pub transitions:        Vec<Transition>,
    #[serde(default)]
    pub chargeable:         bool,
    #[serde(default)]
    pub is_start_step:      bool,
    #[serde(default)]
    pub is_end_step:        bool,
    #[serde(default)]
    pub final_status:       Option<FinalStatus>,
    #[serde(default)]
    pub actions:            Vec<StepAction>,
    /// すべて成立した場合にステップを素通りする
    #[serde(default)]
    pub skip_conditions:    Vec<Condition>,
    #[serde(default)]
    pub metadata:           JsonValue,
}

impl StepDefinition {
    pub fn is_start(&self) -> bool {
        self.step_type == StepType::StartEvent || self.is_start_step
    }

    pub fn is_end(&self) -> bool {
        self.step_type == StepType::EndEvent || self.is_end_step
    }

    /// 外部入力を待たずに遷移を試みるステップか
    pub fn is_auto_advancing(&self) -> bool {
        matches!(self.step_type, StepType::StartEvent | StepType::Automatic)
    }

    /// 終了ステップの最終ステータス（未指定は completed）
    pub fn final_status(&self) -> FinalStatus {
        self.final_status.unwrap_or_default()
    }

    /// スキップ条件がすべて成立するか
    ///
    /// スキップ条件が 1 つもないステップはスキップしない。
    pub fn should_skip(&self, context: &JsonValue) -> bool {
        !self.skip_conditions.is_empty() && self.skip_conditions.iter().all(|c| c.evaluate(context))
    }

    /// 定義順で最初に成立する遷移を返す
    pub fn first_matching_transition(&self, context: &JsonValue) -> Option<&Transition> {
        self.transitions
            .iter()
            .find(|t| t.condition.evaluate(context))
    }
}
