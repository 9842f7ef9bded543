//! # 通知送信
//!
//! テンプレート適用済みの配信メッセージを外部に送るインフラストラクチャモジュール。
//!
//! ## 設計方針
//!
//! - **trait による抽象化**: `NotificationSender` trait で送信方法を抽象化
//! - **チャネル別の実装**: メール（SMTP / SES / Noop）、SMS（HTTP ゲートウェイ）、
//!   Webhook、アプリ内通知
//! - **チャネルルーティング**: [`ChannelRouter`] が配信メッセージのチャネルで送信器を選ぶ
//! - **冪等キー**: 配信 ID を HTTP 系チャネルの `Idempotency-Key` として送る。
//!   再送時も同じ ID を使うため、受信側で重複を排除できる

mod in_app;
mod noop;
mod router;
mod ses;
mod sms;
mod smtp;
mod webhook;

use async_trait::async_trait;
pub use in_app::InAppNotificationSender;
pub use noop::NoopNotificationSender;
use repairflow_domain::notification::{NotificationDelivery, NotificationError, Recipient};
pub use router::ChannelRouter;
pub use ses::SesNotificationSender;
pub use sms::SmsGatewaySender;
pub use smtp::SmtpNotificationSender;
pub use webhook::WebhookNotificationSender;

/// HTTP 系チャネルで配信 ID を渡すヘッダ
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// 通知送信トレイト
///
/// 通知基盤の中核。チャネルごとの送信方法を抽象化する。
#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// 配信メッセージを送信する
    async fn send(&self, delivery: &NotificationDelivery) -> Result<(), NotificationError>;
}

/// メールチャネルの宛先アドレスを取り出す
///
/// ロール宛先のユーザー展開は呼び出し側の責務のため、ここではユーザー宛先のうち
/// メールアドレス形式のものだけを使う。
pub(crate) fn email_addresses(recipients: &[Recipient]) -> Result<Vec<&str>, NotificationError> {
    let addresses: Vec<&str> = recipients
        .iter()
        .filter_map(|r| match r {
            Recipient::User(id) if id.contains('@') => Some(id.as_str()),
            _ => None,
        })
        .collect();

    if addresses.is_empty() {
        return Err(NotificationError::SendFailed(
            "メールアドレス形式の宛先がありません".to_string(),
        ));
    }
    Ok(addresses)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_メール宛先はアドレス形式のユーザーのみ() {
        let recipients = vec![
            Recipient::user("tech@example.com"),
            Recipient::role("store_manager"),
            Recipient::user("user-1"),
        ];

        let result = email_addresses(&recipients).unwrap();

        assert_eq!(result, vec!["tech@example.com"]);
    }

    #[test]
    fn test_アドレス形式の宛先がなければエラー() {
        let recipients = [Recipient::role("accounting")];
        let result = email_addresses(&recipients);

        assert!(matches!(result, Err(NotificationError::SendFailed(_))));
    }
}
