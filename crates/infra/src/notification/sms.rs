//! SMS 通知送信実装
//!
//! HTTP ゲートウェイ経由で SMS を送る。宛先の電話番号解決はゲートウェイ側で行うため、
//! ユーザー ID とロール名をそのまま渡す。

use async_trait::async_trait;
use repairflow_domain::notification::{NotificationDelivery, NotificationError};
use serde::Serialize;

use super::{IDEMPOTENCY_KEY_HEADER, NotificationSender};

#[derive(Debug, Serialize)]
struct SmsRequest<'a> {
    to:      Vec<String>,
    message: &'a str,
}

/// SMS ゲートウェイ送信
pub struct SmsGatewaySender {
    client:      reqwest::Client,
    gateway_url: String,
}

impl SmsGatewaySender {
    pub fn new(client: reqwest::Client, gateway_url: String) -> Self {
        Self {
            client,
            gateway_url,
        }
    }
}

#[async_trait]
impl NotificationSender for SmsGatewaySender {
    #[tracing::instrument(skip_all, level = "debug", fields(delivery_id = %delivery.id))]
    async fn send(&self, delivery: &NotificationDelivery) -> Result<(), NotificationError> {
        let request = SmsRequest {
            to:      delivery.recipients.iter().map(ToString::to_string).collect(),
            message: &delivery.body,
        };

        self.client
            .post(&self.gateway_url)
            .header(IDEMPOTENCY_KEY_HEADER, delivery.id.to_string())
            .json(&request)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| NotificationError::SendFailed(format!("SMS ゲートウェイ送信失敗: {e}")))?;

        Ok(())
    }
}
