//! アプリ内通知の送信実装
//!
//! アプリ内通知は通知ログそのものが受信箱になるため、送信処理は受理を記録するだけ。

use async_trait::async_trait;
use repairflow_domain::notification::{NotificationDelivery, NotificationError};

use super::NotificationSender;

/// アプリ内通知送信
#[derive(Debug, Clone, Default)]
pub struct InAppNotificationSender;

#[async_trait]
impl NotificationSender for InAppNotificationSender {
    async fn send(&self, delivery: &NotificationDelivery) -> Result<(), NotificationError> {
        tracing::debug!(
            delivery_id = %delivery.id,
            recipients = ?delivery.recipients,
            "アプリ内通知を受理"
        );
        Ok(())
    }
}
