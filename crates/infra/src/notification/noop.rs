//! Noop 通知送信実装
//!
//! 実際には送信せず、ログ出力のみ行う。
//! テスト環境や通知無効化時に使用する。

use async_trait::async_trait;
use repairflow_domain::notification::{NotificationDelivery, NotificationError};

use super::NotificationSender;

/// Noop 通知送信（ログ出力のみ）
#[derive(Debug, Clone)]
pub struct NoopNotificationSender;

#[async_trait]
impl NotificationSender for NoopNotificationSender {
    async fn send(&self, delivery: &NotificationDelivery) -> Result<(), NotificationError> {
        tracing::info!(
            delivery_id = %delivery.id,
            channel = %delivery.channel,
            recipients = delivery.recipients.len(),
            subject = %delivery.subject,
            "Noop: 通知送信をスキップ"
        );
        Ok(())
    }
}
