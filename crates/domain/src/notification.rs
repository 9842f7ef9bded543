//! # 通知
//!
//! ワークフロー・承認エンジンが発行する通知リクエストと、送信履歴（通知ログ）を定義する。
//!
//! ## ドメイン用語
//!
//! | 型 | ドメイン用語 | 説明 |
//! |---|------------|------|
//! | [`NotificationRequest`] | 通知リクエスト | エンジンが副作用として返す「誰に・どのチャネルで・どのテンプレートで」 |
//! | [`NotificationDelivery`] | 配信メッセージ | テンプレート適用済みで送信器に渡すメッセージ |
//! | [`NotificationLog`] | 通知ログ | 配信の状態と再送スケジュール |
//! | [`RetryPolicy`] | 再送ポリシー | 上限付き指数バックオフ |
//!
//! ## 設計方針
//!
//! - **fire-and-forget**: 通知送信の失敗はインスタンスの状態遷移に影響しない。
//!   失敗はログに `failed` として記録し、スケジュールジョブが再送する
//! - **配信 ID = 冪等キー**: 再送時も同じ [`NotificationLogId`] を使い、
//!   受信側で重複を排除できるようにする（at-least-once 配信）

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use strum::IntoStaticStr;
use thiserror::Error;

use crate::DomainError;

define_uuid_id! {
    /// 通知ログ ID（配信 ID）
    ///
    /// 再送時も変わらず、Webhook の `Idempotency-Key` としても使用する。
    pub struct NotificationLogId;
}

/// 通知送信エラー
#[derive(Debug, Error)]
pub enum NotificationError {
    /// 送信に失敗
    #[error("通知の送信に失敗: {0}")]
    SendFailed(String),

    /// テンプレートレンダリングに失敗
    #[error("テンプレートレンダリングに失敗: {0}")]
    TemplateFailed(String),

    /// 通知ログの記録に失敗
    #[error("通知ログの記録に失敗: {0}")]
    LogFailed(String),

    /// 送信器が設定されていないチャネル
    #[error("未対応の通知チャネル: {0}")]
    UnsupportedChannel(NotificationChannel),
}

/// 通知チャネル
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    IntoStaticStr,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotificationChannel {
    Email,
    #[default]
    InApp,
    Sms,
    Webhook,
}

/// 通知の宛先
///
/// ユーザー ID またはロール名。ロールからユーザーへの展開は CRUD 層の責務で、
/// 文字列表現は `role:<name>` / `<user_id>`。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Recipient {
    User(String),
    Role(String),
}

impl Recipient {
    const ROLE_PREFIX: &'static str = "role:";

    pub fn user(id: impl Into<String>) -> Self {
        Self::User(id.into())
    }

    pub fn role(name: impl Into<String>) -> Self {
        Self::Role(name.into())
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => f.write_str(id),
            Self::Role(name) => write!(f, "{}{name}", Self::ROLE_PREFIX),
        }
    }
}

impl TryFrom<String> for Recipient {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let value = value.trim();
        if value.is_empty() {
            return Err(DomainError::Validation("通知の宛先は必須です".to_string()));
        }
        match value.strip_prefix(Self::ROLE_PREFIX) {
            Some("") => Err(DomainError::Validation(
                "ロール名が空の宛先は指定できません".to_string(),
            )),
            Some(role) => Ok(Self::Role(role.to_string())),
            None => Ok(Self::User(value.to_string())),
        }
    }
}

impl From<Recipient> for String {
    fn from(value: Recipient) -> Self {
        value.to_string()
    }
}

/// 通知リクエスト
///
/// エンジンが副作用として返す。テンプレート適用と送信はユースケース層が行う。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub recipients: Vec<Recipient>,
    pub channel:    NotificationChannel,
    /// テンプレート名（例: `"approval_request"`）
    pub template:   String,
    /// テンプレート変数
    pub payload:    JsonValue,
}

/// 配信メッセージ
///
/// テンプレートレンダリングの出力。`NotificationSender` に渡される。
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationDelivery {
    /// 配信 ID（冪等キー）
    pub id:         NotificationLogId,
    pub recipients: Vec<Recipient>,
    pub channel:    NotificationChannel,
    pub subject:    String,
    pub body:       String,
    pub payload:    JsonValue,
}

/// 通知ログのステータス
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    IntoStaticStr,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotificationStatus {
    /// 送信前
    Pending,
    /// 送信済み
    Sent,
    /// 送信失敗（再送待ち）
    Failed,
    /// 最大試行回数に到達し再送を断念
    Abandoned,
}

/// 上限付き指数バックオフの再送ポリシー
///
/// n 回目の失敗後の待ち時間は `min(base * 2^(n-1), max)`。
/// `max_attempts` 回失敗した時点で `abandoned` になる。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base:         Duration,
    pub max:          Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
        }
    }

    /// `attempts` 回目の失敗後に待つ時間
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(30);
        let factor = 1_i32 << exponent;
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::seconds(60), Duration::seconds(3600), 5)
    }
}

/// 通知ログエンティティ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationLog {
    id:            NotificationLogId,
    recipients:    Vec<Recipient>,
    channel:       NotificationChannel,
    template:      String,
    subject:       String,
    body:          String,
    payload:       JsonValue,
    status:        NotificationStatus,
    attempts:      u32,
    last_error:    Option<String>,
    next_retry_at: Option<DateTime<Utc>>,
    created_at:    DateTime<Utc>,
    updated_at:    DateTime<Utc>,
}

/// 通知ログの新規作成パラメータ
pub struct NewNotificationLog {
    pub id:      NotificationLogId,
    pub request: NotificationRequest,
    pub subject: String,
    pub body:    String,
    pub now:     DateTime<Utc>,
}

impl NotificationLog {
    /// 送信前の通知ログを作成する
    pub fn new(params: NewNotificationLog) -> Self {
        Self {
            id:            params.id,
            recipients:    params.request.recipients,
            channel:       params.request.channel,
            template:      params.request.template,
            subject:       params.subject,
            body:          params.body,
            payload:       params.request.payload,
            status:        NotificationStatus::Pending,
            attempts:      0,
            last_error:    None,
            next_retry_at: None,
            created_at:    params.now,
            updated_at:    params.now,
        }
    }

    pub fn id(&self) -> &NotificationLogId {
        &self.id
    }

    pub fn recipients(&self) -> &[Recipient] {
        &self.recipients
    }

    pub fn channel(&self) -> NotificationChannel {
        self.channel
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn status(&self) -> NotificationStatus {
        self.status
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.next_retry_at
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// 送信器に渡す配信メッセージを組み立てる
    pub fn to_delivery(&self) -> NotificationDelivery {
        NotificationDelivery {
            id:         self.id.clone(),
            recipients: self.recipients.clone(),
            channel:    self.channel,
            subject:    self.subject.clone(),
            body:       self.body.clone(),
            payload:    self.payload.clone(),
        }
    }

    /// 再送対象か判定する
    pub fn is_retry_due(&self, now: DateTime<Utc>) -> bool {
        self.status == NotificationStatus::Failed
            && self.next_retry_at.is_some_and(|at| at <= now)
    }

    /// 送信成功を記録した新しいログを返す
    pub fn sent(self, now: DateTime<Utc>) -> Self {
        Self {
            status: NotificationStatus::Sent,
            attempts: self.attempts + 1,
            last_error: None,
            next_retry_at: None,
            updated_at: now,
            ..self
        }
    }

    /// 送信失敗を記録した新しいログを返す
    ///
    /// 試行回数が上限に達した場合は `abandoned` になり、再送予定は消える。
    pub fn failed(self, error: impl Into<String>, policy: &RetryPolicy, now: DateTime<Utc>) -> Self {
        let attempts = self.attempts + 1;
        let (status, next_retry_at) = if attempts >= policy.max_attempts {
            (NotificationStatus::Abandoned, None)
        } else {
            (
                NotificationStatus::Failed,
                Some(now + policy.backoff(attempts)),
            )
        };
        Self {
            status,
            attempts,
            last_error: Some(error.into()),
            next_retry_at,
            updated_at: now,
            ..self
        }
    }
}
