//! SES 通知送信実装
//!
//! AWS SES v2 API を使用してメールを送信する。
//! 本番環境で使用する。

use async_trait::async_trait;
use aws_sdk_sesv2::{
    Client,
    types::{Body, Content, Destination, EmailContent, Message},
};
use repairflow_domain::notification::{NotificationDelivery, NotificationError};

use super::{NotificationSender, email_addresses};

/// SES 通知送信
///
/// `aws_sdk_sesv2::Client` をラップする。
pub struct SesNotificationSender {
    client:       Client,
    from_address: String,
}

impl SesNotificationSender {
    /// 新しい SES 送信インスタンスを作成
    ///
    /// # 引数
    ///
    /// - `client`: AWS SES v2 クライアント
    /// - `from_address`: 送信元メールアドレス（SES で検証済みであること）
    pub fn new(client: Client, from_address: String) -> Self {
        Self {
            client,
            from_address,
        }
    }

    /// 環境変数・共有設定から AWS 設定を読み込んで作成する
    pub async fn from_env(from_address: String) -> Self {
        let config = aws_config::load_from_env().await;
        Self::new(Client::new(&config), from_address)
    }
}

fn content(data: &str, label: &str) -> Result<Content, NotificationError> {
    Content::builder()
        .data(data)
        .charset("UTF-8")
        .build()
        .map_err(|e| NotificationError::SendFailed(format!("{label}構築失敗: {e}")))
}

#[async_trait]
impl NotificationSender for SesNotificationSender {
    async fn send(&self, delivery: &NotificationDelivery) -> Result<(), NotificationError> {
        let destination = Destination::builder()
            .set_to_addresses(Some(
                email_addresses(&delivery.recipients)?
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
            ))
            .build();

        let email_content = EmailContent::builder()
            .simple(
                Message::builder()
                    .subject(content(&delivery.subject, "件名")?)
                    .body(Body::builder().text(content(&delivery.body, "本文")?).build())
                    .build(),
            )
            .build();

        self.client
            .send_email()
            .from_email_address(&self.from_address)
            .destination(destination)
            .content(email_content)
            .send()
            .await
            .map_err(|e| NotificationError::SendFailed(format!("SES 送信失敗: {e}")))?;

        Ok(())
    }
}
