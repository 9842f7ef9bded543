//! # 承認ワークフロー設定
//!
//! 文書種別ごとの多段承認の設定（承認レベル・エスカレーション・常設の委任・通知）を定義する。
//!
//! 設定は JSON から [`ApprovalWorkflow::parse`] で読み込み、登録時に整合性を検証する。
//! 承認インスタンスは申請時点の設定をスナップショットとして保持する。

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use strum::IntoStaticStr;

use crate::{
    DomainError,
    condition::Condition,
    notification::{NotificationChannel, Recipient},
};

define_uuid_id! {
    /// 承認ワークフロー ID
    pub struct ApprovalWorkflowId;
}

/// 承認者の指定方法
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, IntoStaticStr, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ApproverType {
    /// `approver_ids` はユーザー ID
    User,
    /// `approver_ids` はロール名
    Role,
}

/// 決裁を行う利用者
///
/// ロールの解決は認証・CRUD 層の責務で、呼び出し側が保有ロールを渡す。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Approver {
    pub user_id: String,
    pub roles:   Vec<String>,
}

impl Approver {
    pub fn new(user_id: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            user_id: user_id.into(),
            roles,
        }
    }

    /// ロールを持たない利用者
    pub fn user(user_id: impl Into<String>) -> Self {
        Self::new(user_id, Vec::new())
    }
}

fn default_required_approvals() -> u32 {
    1
}

/// 承認レベル
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalLevel {
    pub level:              u32,
    pub name:               String,
    pub approver_type:      ApproverType,
    pub approver_ids:       Vec<String>,
    #[serde(default = "default_required_approvals")]
    pub required_approvals: u32,
    /// true なら順不同で複数の承認者が独立に決裁する。
    /// false は単独承認者のレベルを想定するが、順序は強制しない
    #[serde(default)]
    pub is_parallel:        bool,
    #[serde(default)]
    pub timeout_hours:      Option<u32>,
    /// すべて成立した場合にレベルをスキップする
    #[serde(default)]
    pub skip_conditions:    Vec<Condition>,
}

impl ApprovalLevel {
    /// スキップ条件がすべて成立するか（条件なしはスキップしない）
    pub fn should_skip(&self, context: &JsonValue) -> bool {
        !self.skip_conditions.is_empty() && self.skip_conditions.iter().all(|c| c.evaluate(context))
    }

    /// 利用者がこのレベルの承認者か
    pub fn is_eligible(&self, approver: &Approver) -> bool {
        match self.approver_type {
            ApproverType::User => self.approver_ids.contains(&approver.user_id),
            ApproverType::Role => approver
                .roles
                .iter()
                .any(|role| self.approver_ids.contains(role)),
        }
    }

    /// ユーザー ID だけで承認者と判定できるか（ユーザー指定のレベルのみ）
    pub fn lists_user(&self, user_id: &str) -> bool {
        self.approver_type == ApproverType::User && self.approver_ids.iter().any(|id| id == user_id)
    }

    /// 承認依頼の宛先
    pub fn recipients(&self) -> Vec<Recipient> {
        self.approver_ids
            .iter()
            .map(|id| match self.approver_type {
                ApproverType::User => Recipient::user(id),
                ApproverType::Role => Recipient::role(id),
            })
            .collect()
    }

    /// スキップ記録用の条件表記
    pub fn skip_condition_text(&self) -> String {
        self.skip_conditions
            .iter()
            .map(Condition::source)
            .collect::<Vec<_>>()
            .join(" && ")
    }
}

/// 承認レベルのエスカレーションルール
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalEscalationRule {
    pub from_level:   u32,
    /// 指定した上位レベルへ移す
    #[serde(default)]
    pub to_level:     Option<u32>,
    /// システムによる承認を合成してレベルを通過させる
    #[serde(default)]
    pub auto_approve: bool,
    #[serde(default)]
    pub notify_users: Vec<String>,
    /// 待ち時間の延長
    #[serde(default)]
    pub extend_hours: Option<u32>,
}

/// 常設の委任ルール
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationRule {
    pub from_user:   String,
    pub to_user:     String,
    /// 未指定なら from_user が承認者のすべてのレベル
    #[serde(default)]
    pub level:       Option<u32>,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
}

impl DelegationRule {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_until.is_none_or(|until| now < until)
    }
}

/// 承認イベント（通知の契機）
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, IntoStaticStr, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ApprovalEvent {
    /// 承認依頼
    ApprovalRequest,
    /// レベル承認
    Approved,
    /// 却下
    Rejected,
    /// エスカレーション
    Escalated,
    /// 委任
    Delegated,
    /// 承認完了
    Completed,
}

impl ApprovalEvent {
    /// 通知設定がない場合のテンプレート名
    pub fn default_template(&self) -> &'static str {
        match self {
            Self::ApprovalRequest => "approval_request",
            Self::Approved => "approval_approved",
            Self::Rejected => "approval_rejected",
            Self::Escalated => "approval_escalated",
            Self::Delegated => "approval_delegated",
            Self::Completed => "approval_completed",
        }
    }
}

/// イベントごとの通知設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRule {
    pub event:    ApprovalEvent,
    #[serde(default)]
    pub channel:  NotificationChannel,
    pub template: String,
}

/// 承認ワークフロー
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalWorkflow {
    pub id:                ApprovalWorkflowId,
    pub name:              String,
    /// 空なら全文書種別に適用できる
    #[serde(default)]
    pub document_type_ids: Vec<String>,
    /// レベル番号の昇順
    pub levels:            Vec<ApprovalLevel>,
    #[serde(default)]
    pub escalation_rules:  Vec<ApprovalEscalationRule>,
    #[serde(default)]
    pub delegation_rules:  Vec<DelegationRule>,
    #[serde(default)]
    pub notifications:     Vec<NotificationRule>,
    #[serde(default = "default_active")]
    pub is_active:         bool,
}

fn default_active() -> bool {
    true
}

impl ApprovalWorkflow {
    /// JSON から読み込み、整合性を検証する
    ///
    /// # Errors
    ///
    /// 構造の不正、または [`ApprovalWorkflow::validated`] の検証に失敗した場合は
    /// `DomainError::Validation` を返す。
    pub fn parse(value: &JsonValue) -> Result<Self, DomainError> {
        let workflow: Self = serde_json::from_value(value.clone()).map_err(|e| {
            DomainError::Validation(format!("承認ワークフローの構造が不正です: {e}"))
        })?;
        workflow.validated()
    }

    /// 整合性を検証し、レベルを番号順に並べた設定を返す
    pub fn validated(mut self) -> Result<Self, DomainError> {
        if self.levels.is_empty() {
            return Err(DomainError::Validation(
                "承認レベルが 1 つ以上必要です".to_string(),
            ));
        }
        self.levels.sort_by_key(|l| l.level);

        let mut seen = HashSet::new();
        for level in &self.levels {
            if !seen.insert(level.level) {
                return Err(DomainError::Validation(format!(
                    "承認レベル {} が重複しています",
                    level.level
                )));
            }
            if level.approver_ids.is_empty() {
                return Err(DomainError::Validation(format!(
                    "承認レベル {} に承認者が必要です",
                    level.level
                )));
            }
            if level.required_approvals == 0 {
                return Err(DomainError::Validation(format!(
                    "承認レベル {} の必要承認数は 1 以上である必要があります",
                    level.level
                )));
            }
            let listed = u32::try_from(level.approver_ids.len()).unwrap_or(u32::MAX);
            if level.approver_type == ApproverType::User && level.required_approvals > listed {
                return Err(DomainError::Validation(format!(
                    "承認レベル {} の必要承認数 {} が承認者数 {listed} を超えています",
                    level.level, level.required_approvals
                )));
            }
        }

        for rule in &self.escalation_rules {
            if !seen.contains(&rule.from_level) {
                return Err(DomainError::Validation(format!(
                    "エスカレーションルールの from_level {} は存在しないレベルです",
                    rule.from_level
                )));
            }
            if let Some(to) = rule.to_level
                && !seen.contains(&to)
            {
                return Err(DomainError::Validation(format!(
                    "エスカレーションルールの to_level {to} は存在しないレベルです"
                )));
            }
        }

        for rule in &self.delegation_rules {
            if rule.from_user == rule.to_user {
                return Err(DomainError::Validation(format!(
                    "自分自身への委任はできません: {}",
                    rule.from_user
                )));
            }
            if let Some(level) = rule.level
                && !seen.contains(&level)
            {
                return Err(DomainError::Validation(format!(
                    "委任ルールのレベル {level} は存在しないレベルです"
                )));
            }
        }

        Ok(self)
    }

    /// 文書種別に適用できるか
    pub fn applies_to(&self, document_type_id: &str) -> bool {
        self.document_type_ids.is_empty()
            || self.document_type_ids.iter().any(|t| t == document_type_id)
    }

    pub fn level(&self, level: u32) -> Option<&ApprovalLevel> {
        self.levels.iter().find(|l| l.level == level)
    }

    /// 指定レベルより後のレベル（番号順）
    pub fn levels_after(&self, level: u32) -> impl Iterator<Item = &ApprovalLevel> {
        self.levels.iter().filter(move |l| l.level > level)
    }

    pub fn escalation_rule_for(&self, level: u32) -> Option<&ApprovalEscalationRule> {
        self.escalation_rules.iter().find(|r| r.from_level == level)
    }

    /// イベントの通知チャネルとテンプレート
    pub fn notification_for(&self, event: ApprovalEvent) -> (NotificationChannel, String) {
        self.notifications
            .iter()
            .find(|n| n.event == event)
            .map_or_else(
                || (NotificationChannel::InApp, event.default_template().to_string()),
                |n| (n.channel, n.template.clone()),
            )
    }
}
