//! Webhook 通知送信実装
//!
//! 設定された URL に配信メッセージを JSON で POST する。
//! 配信 ID を `Idempotency-Key` ヘッダで送るため、再送は受信側で重複排除できる。

use async_trait::async_trait;
use repairflow_domain::notification::{NotificationDelivery, NotificationError};
use serde::Serialize;
use serde_json::Value as JsonValue;

use super::{IDEMPOTENCY_KEY_HEADER, NotificationSender};

/// Webhook の送信ボディ
#[derive(Debug, Serialize)]
struct WebhookBody<'a> {
    delivery_id: String,
    recipients:  Vec<String>,
    subject:     &'a str,
    body:        &'a str,
    payload:     &'a JsonValue,
}

impl<'a> From<&'a NotificationDelivery> for WebhookBody<'a> {
    fn from(delivery: &'a NotificationDelivery) -> Self {
        Self {
            delivery_id: delivery.id.to_string(),
            recipients:  delivery.recipients.iter().map(ToString::to_string).collect(),
            subject:     &delivery.subject,
            body:        &delivery.body,
            payload:     &delivery.payload,
        }
    }
}

/// Webhook 通知送信
pub struct WebhookNotificationSender {
    client: reqwest::Client,
    url:    String,
}

impl WebhookNotificationSender {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl NotificationSender for WebhookNotificationSender {
    #[tracing::instrument(skip_all, level = "debug", fields(delivery_id = %delivery.id))]
    async fn send(&self, delivery: &NotificationDelivery) -> Result<(), NotificationError> {
        self.client
            .post(&self.url)
            .header(IDEMPOTENCY_KEY_HEADER, delivery.id.to_string())
            .json(&WebhookBody::from(delivery))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| NotificationError::SendFailed(format!("Webhook 送信失敗: {e}")))?;

        Ok(())
    }
}
