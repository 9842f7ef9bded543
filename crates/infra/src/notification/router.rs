//! チャネル別の送信器ルーティング

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use repairflow_domain::notification::{
    NotificationChannel,
    NotificationDelivery,
    NotificationError,
};

use super::NotificationSender;

/// 配信メッセージのチャネルに応じて送信器を選ぶ
///
/// 送信器が登録されていないチャネルは `UnsupportedChannel` を返す。
#[derive(Clone, Default)]
pub struct ChannelRouter {
    senders: HashMap<NotificationChannel, Arc<dyn NotificationSender>>,
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// チャネルの送信器を登録する（既存の登録は置き換える）
    #[must_use]
    pub fn with(mut self, channel: NotificationChannel, sender: Arc<dyn NotificationSender>) -> Self {
        self.senders.insert(channel, sender);
        self
    }

    pub fn supports(&self, channel: NotificationChannel) -> bool {
        self.senders.contains_key(&channel)
    }
}

#[async_trait]
impl NotificationSender for ChannelRouter {
    async fn send(&self, delivery: &NotificationDelivery) -> Result<(), NotificationError> {
        let sender = self
            .senders
            .get(&delivery.channel)
            .ok_or(NotificationError::UnsupportedChannel(delivery.channel))?;
        sender.send(delivery).await
    }
}
