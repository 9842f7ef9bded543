//! # Core Service 設定
//!
//! 環境変数からスケジューラと通知基盤の設定を読み込む。

use std::{env, str::FromStr, time::Duration};

use repairflow_domain::notification::RetryPolicy;
use thiserror::Error;

/// 設定の読み込みエラー
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 必須の環境変数が未設定
    #[error("{0} が設定されていません")]
    Missing(&'static str),

    /// 値を解釈できない
    #[error("{name} の値が不正です: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Core Service の設定
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// データベース接続 URL
    pub database_url: String,
    /// スケジューラ設定
    pub scheduler:    SchedulerConfig,
    /// 通知設定
    pub notification: NotificationConfig,
}

/// スケジューラの設定
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// 定期実行の間隔
    pub interval:         Duration,
    /// 1 インスタンスあたりの処理のタイムアウト
    pub instance_timeout: Duration,
}

/// メールチャネルの送信バックエンド
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailBackend {
    /// Mailpit（開発）/ SMTP サーバー経由で送信
    Smtp,
    /// Amazon SES v2 経由で送信（本番）
    Ses,
    /// 送信しない（ログ出力のみ）
    Noop,
}

impl FromStr for EmailBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "smtp" => Ok(Self::Smtp),
            "ses" => Ok(Self::Ses),
            "noop" => Ok(Self::Noop),
            other => Err(ConfigError::Invalid {
                name:  "NOTIFICATION_BACKEND",
                value: other.to_string(),
            }),
        }
    }
}

/// 通知機能の設定
///
/// `NOTIFICATION_BACKEND` 環境変数でメールの送信バックエンドを切り替える。
/// Webhook と SMS は URL が設定されている場合のみ有効になる。
#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub backend:         EmailBackend,
    /// SMTP ホスト（backend=smtp の場合に使用）
    pub smtp_host:       String,
    /// SMTP ポート（backend=smtp の場合に使用）
    pub smtp_port:       u16,
    /// 送信元メールアドレス
    pub from_address:    String,
    /// Webhook の送信先
    pub webhook_url:     Option<String>,
    /// SMS ゲートウェイの URL
    pub sms_gateway_url: Option<String>,
    /// 通知本文のリンクに使うベース URL
    pub base_url:        String,
    pub retry_policy:    RetryPolicy,
    /// 通知ログの保持期間
    pub retention:       chrono::Duration,
    /// 1 回の送信（HTTP リクエストを含む）にかける時間の上限
    pub send_timeout:    Duration,
}

impl CoreConfig {
    /// 環境変数から設定を読み込む
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            scheduler:    SchedulerConfig {
                interval:         Duration::from_secs(parse_or("SCHEDULER_INTERVAL_SECS", 900)?),
                instance_timeout: Duration::from_secs(parse_or(
                    "SCHEDULER_INSTANCE_TIMEOUT_SECS",
                    30,
                )?),
            },
            notification: NotificationConfig::from_env()?,
        })
    }
}

impl NotificationConfig {
    /// 環境変数から通知設定を読み込む
    fn from_env() -> Result<Self, ConfigError> {
        let base = chrono::Duration::seconds(parse_or("NOTIFICATION_RETRY_BASE_SECS", 60)?);
        let max = chrono::Duration::seconds(parse_or("NOTIFICATION_RETRY_MAX_SECS", 3600)?);

        Ok(Self {
            backend:         env::var("NOTIFICATION_BACKEND")
                .unwrap_or_else(|_| "noop".to_string())
                .parse()?,
            smtp_host:       env::var("SMTP_HOST").unwrap_or_else(|_| "localhost".to_string()),
            smtp_port:       parse_or("SMTP_PORT", 1025)?,
            from_address:    env::var("NOTIFICATION_FROM_ADDRESS")
                .unwrap_or_else(|_| "noreply@repairflow.example.com".to_string()),
            webhook_url:     env::var("NOTIFICATION_WEBHOOK_URL").ok(),
            sms_gateway_url: env::var("NOTIFICATION_SMS_GATEWAY_URL").ok(),
            base_url:        env::var("NOTIFICATION_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:5173".to_string()),
            retry_policy:    RetryPolicy::new(base, max, parse_or("NOTIFICATION_MAX_ATTEMPTS", 5)?),
            retention:       chrono::Duration::days(parse_or("NOTIFICATION_RETENTION_DAYS", 30)?),
            send_timeout:    Duration::from_secs(parse_or("NOTIFICATION_SEND_TIMEOUT_SECS", 10)?),
        })
    }
}

/// 環境変数を数値として読み込む（未設定ならデフォルト値）
fn parse_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_バックエンド名を解釈できる() {
        assert_eq!("smtp".parse::<EmailBackend>().unwrap(), EmailBackend::Smtp);
        assert_eq!("ses".parse::<EmailBackend>().unwrap(), EmailBackend::Ses);
        assert_eq!("noop".parse::<EmailBackend>().unwrap(), EmailBackend::Noop);
    }

    #[test]
    fn test_未知のバックエンド名はエラー() {
        let result = "sendgrid".parse::<EmailBackend>();

        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                name: "NOTIFICATION_BACKEND",
                ..
            })
        ));
    }

    #[test]
    fn test_未設定の環境変数はデフォルト値になる() {
        let value: u64 = parse_or("REPAIRFLOW_TEST_UNSET_VARIABLE", 900).unwrap();

        assert_eq!(value, 900);
    }
}
