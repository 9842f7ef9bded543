//! # 通知サービス
//!
//! テンプレートレンダリング → ログ記録 → 送信 → 結果の記録を統合するサービス。
//!
//! ## 設計方針
//!
//! - **ログ先行**: 送信前に `pending` の通知ログを保存し、その ID を配信 ID（冪等キー）とする
//! - **送信失敗はエラーにしない**: 送信失敗は `failed` として記録し、[`retry_failed`] が再送する。
//!   `dispatch()` がエラーを返すのはテンプレートとログ記録の失敗のみ
//! - **送信時間の上限**: 1 回の送信が上限時間内に終わらなければ送信失敗として扱う
//! - **fire-and-forget**: エンジンの副作用からは `notify()` を使い、失敗してもログ出力のみ
//! - **依存性注入**: `NotificationSender` と `NotificationLogRepository` は trait で抽象化
//!
//! [`retry_failed`]: NotificationService::retry_failed

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use itertools::Itertools;
use repairflow_domain::{
    clock::Clock,
    notification::{
        NewNotificationLog,
        NotificationError,
        NotificationLog,
        NotificationLogId,
        NotificationRequest,
        NotificationStatus,
        RetryPolicy,
    },
};
use repairflow_infra::{notification::NotificationSender, repository::NotificationLogRepository};
use repairflow_shared::{
    event_log::{error as log_error, event},
    log_business_event,
};

use super::TemplateRenderer;

/// 1 回の送信にかける時間の上限（デフォルト）
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// 再送処理の集計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryReport {
    /// 再送を試みた件数
    pub attempted: usize,
    /// 再送に成功した件数
    pub sent:      usize,
    /// 再び失敗し、次の再送を待つ件数
    pub failed:    usize,
    /// 最大試行回数に達して断念した件数
    pub abandoned: usize,
}

/// 通知サービス
pub struct NotificationService {
    sender:            Arc<dyn NotificationSender>,
    template_renderer: TemplateRenderer,
    log_repo:          Arc<dyn NotificationLogRepository>,
    clock:             Arc<dyn Clock>,
    retry_policy:      RetryPolicy,
    base_url:          String,
    send_timeout:      Duration,
}

impl NotificationService {
    pub fn new(
        sender: Arc<dyn NotificationSender>,
        template_renderer: TemplateRenderer,
        log_repo: Arc<dyn NotificationLogRepository>,
        clock: Arc<dyn Clock>,
        retry_policy: RetryPolicy,
        base_url: String,
    ) -> Self {
        Self {
            sender,
            template_renderer,
            log_repo,
            clock,
            retry_policy,
            base_url,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    /// 1 回の送信にかける時間の上限を変更する
    #[must_use]
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// 通知を描画・記録・送信し、配信 ID を返す
    ///
    /// 送信の成否は通知ログに記録され、戻り値には影響しない。
    ///
    /// # Errors
    ///
    /// - `NotificationError::TemplateFailed`: テンプレートの描画に失敗
    /// - `NotificationError::LogFailed`: 通知ログの保存に失敗
    pub async fn dispatch(
        &self,
        mut request: NotificationRequest,
    ) -> Result<NotificationLogId, NotificationError> {
        // 同じ宛先への重複送信を避ける（順序は保持）
        request.recipients = request.recipients.into_iter().unique().collect();
        let rendered = self.template_renderer.render(&request, &self.base_url)?;
        let now = self.clock.now();

        let log = NotificationLog::new(NewNotificationLog {
            id: NotificationLogId::new(),
            request,
            subject: rendered.subject,
            body: rendered.body,
            now,
        });
        self.log_repo
            .insert(&log)
            .await
            .map_err(|e| NotificationError::LogFailed(e.to_string()))?;

        let id = log.id().clone();
        let updated = self.send_and_record(log).await?;
        if updated.status() == NotificationStatus::Sent {
            tracing::debug!(delivery_id = %id, "通知を送信しました");
        }

        Ok(id)
    }

    /// 通知を送信する（fire-and-forget）
    ///
    /// いずれのステップで失敗してもエラーを返さない（ログ出力のみ）。
    pub async fn notify(&self, request: NotificationRequest) {
        let template = request.template.clone();
        if let Err(e) = self.dispatch(request).await {
            tracing::error!(
                error = %e,
                notification.template = %template,
                "通知の処理に失敗"
            );
        }
    }

    /// 再送予定を過ぎた失敗ログを再送する
    ///
    /// 再送時も同じ配信 ID を使う。1 件の失敗は他のログの再送を止めない。
    ///
    /// # Errors
    ///
    /// - `NotificationError::LogFailed`: 再送対象の取得に失敗
    pub async fn retry_failed(&self) -> Result<RetryReport, NotificationError> {
        let now = self.clock.now();
        let due = self
            .log_repo
            .find_retry_due(now)
            .await
            .map_err(|e| NotificationError::LogFailed(e.to_string()))?;

        let mut report = RetryReport::default();
        for log in due {
            report.attempted += 1;
            let id = log.id().clone();
            match self.send_and_record(log).await {
                Ok(updated) => match updated.status() {
                    NotificationStatus::Sent => {
                        report.sent += 1;
                        log_business_event!(
                            event.category = event::category::NOTIFICATION,
                            event.action = event::action::NOTIFICATION_RETRIED,
                            event.entity_type = event::entity_type::NOTIFICATION_LOG,
                            event.entity_id = %id,
                            event.result = event::result::SUCCESS,
                            notification.attempts = updated.attempts(),
                            "通知の再送に成功"
                        );
                    }
                    NotificationStatus::Abandoned => report.abandoned += 1,
                    _ => report.failed += 1,
                },
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(error = %e, delivery_id = %id, "再送結果の記録に失敗");
                }
            }
        }

        Ok(report)
    }

    /// 作成日時が `cutoff` より古い通知ログを削除する
    ///
    /// # Errors
    ///
    /// - `NotificationError::LogFailed`: 削除に失敗
    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, NotificationError> {
        let deleted = self
            .log_repo
            .delete_older_than(cutoff)
            .await
            .map_err(|e| NotificationError::LogFailed(e.to_string()))?;

        if deleted > 0 {
            log_business_event!(
                event.category = event::category::NOTIFICATION,
                event.action = event::action::NOTIFICATION_PURGED,
                event.entity_type = event::entity_type::NOTIFICATION_LOG,
                event.result = event::result::SUCCESS,
                notification.deleted = deleted,
                notification.cutoff = %cutoff,
                "古い通知ログを削除"
            );
        }

        Ok(deleted)
    }

    /// 送信して結果を通知ログに記録する
    async fn send_and_record(&self, log: NotificationLog) -> Result<NotificationLog, NotificationError> {
        let delivery = log.to_delivery();
        let channel: &str = delivery.channel.into();
        let template = log.template().to_string();

        let send = self.sender.send(&delivery);
        let sent = match tokio::time::timeout(self.send_timeout, send).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    error.kind = log_error::kind::TIMEOUT,
                    delivery_id = %delivery.id,
                    timeout_ms = self.send_timeout.as_millis(),
                    "通知の送信が上限時間内に終わりませんでした"
                );
                Err(NotificationError::SendFailed(format!(
                    "{} ミリ秒以内に送信が完了しませんでした",
                    self.send_timeout.as_millis()
                )))
            }
        };

        let updated = match sent {
            Ok(()) => {
                log_business_event!(
                    event.category = event::category::NOTIFICATION,
                    event.action = event::action::NOTIFICATION_SENT,
                    event.entity_type = event::entity_type::NOTIFICATION_LOG,
                    event.entity_id = %delivery.id,
                    event.result = event::result::SUCCESS,
                    notification.channel = channel,
                    notification.template = %template,
                    "通知送信成功"
                );
                log.sent(self.clock.now())
            }
            Err(e) => {
                let failed = log.failed(e.to_string(), &self.retry_policy, self.clock.now());
                let action = if failed.status() == NotificationStatus::Abandoned {
                    event::action::NOTIFICATION_ABANDONED
                } else {
                    event::action::NOTIFICATION_FAILED
                };
                log_business_event!(
                    event.category = event::category::NOTIFICATION,
                    event.action = action,
                    event.entity_type = event::entity_type::NOTIFICATION_LOG,
                    event.entity_id = %delivery.id,
                    event.result = event::result::FAILURE,
                    notification.channel = channel,
                    notification.template = %template,
                    notification.attempts = failed.attempts(),
                    error = %e,
                    "通知送信失敗"
                );
                failed
            }
        };

        self.log_repo
            .update(&updated)
            .await
            .map_err(|e| NotificationError::LogFailed(e.to_string()))?;

        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use repairflow_domain::{
        clock::ManualClock,
        notification::{NotificationChannel, NotificationDelivery, Recipient},
    };
    use repairflow_infra::mock::{MockNotificationLogRepository, RecordingNotificationSender};
    use rstest::{fixture, rstest};
    use serde_json::json;

    use super::*;

    #[fixture]
    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    struct Sut {
        service:  NotificationService,
        sender:   RecordingNotificationSender,
        log_repo: MockNotificationLogRepository,
        clock:    Arc<ManualClock>,
    }

    fn make_service(now: DateTime<Utc>, policy: RetryPolicy) -> Sut {
        let sender = RecordingNotificationSender::new();
        let log_repo = MockNotificationLogRepository::new();
        let clock = Arc::new(ManualClock::new(now));
        let service = NotificationService::new(
            Arc::new(sender.clone()),
            TemplateRenderer::new().unwrap(),
            Arc::new(log_repo.clone()),
            clock.clone(),
            policy,
            "http://localhost:5173".to_string(),
        );
        Sut {
            service,
            sender,
            log_repo,
            clock,
        }
    }

    fn timeout_request() -> NotificationRequest {
        NotificationRequest {
            recipients: vec![Recipient::role("technician_lead")],
            channel:    NotificationChannel::InApp,
            template:   "step_timeout".to_string(),
            payload:    json!({
                "case_id": "case-1",
                "instance_id": "instance-1",
                "step_id": "repair",
                "step_name": "修理",
                "timeout_hours": 48,
                "overdue_hours": 1,
                "escalation_level": null,
            }),
        }
    }

    #[rstest]
    #[tokio::test]
    async fn test_送信成功時にsentで記録し配信idを返す(now: DateTime<Utc>) {
        let sut = make_service(now, RetryPolicy::default());

        let id = sut.service.dispatch(timeout_request()).await.unwrap();

        let logs = sut.log_repo.all();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].id(), &id);
        assert_eq!(logs[0].status(), NotificationStatus::Sent);
        assert_eq!(logs[0].attempts(), 1);

        let sent = sut.sender.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, id);
        assert_eq!(sent[0].subject, "[RepairFlow] 期限超過: 修理");
    }

    #[rstest]
    #[tokio::test]
    async fn test_重複した宛先は1つにまとめる(now: DateTime<Utc>) {
        let sut = make_service(now, RetryPolicy::default());
        let mut request = timeout_request();
        request.recipients = vec![
            Recipient::role("technician_lead"),
            Recipient::user("tech-1"),
            Recipient::role("technician_lead"),
        ];

        sut.service.dispatch(request).await.unwrap();

        assert_eq!(
            sut.sender.sent()[0].recipients,
            vec![Recipient::role("technician_lead"), Recipient::user("tech-1")]
        );
    }

    #[rstest]
    #[tokio::test]
    async fn test_送信失敗してもエラーを返さずfailedで記録する(now: DateTime<Utc>) {
        let sut = make_service(now, RetryPolicy::default());
        sut.sender.fail_next(1);

        let id = sut.service.dispatch(timeout_request()).await.unwrap();

        let logs = sut.log_repo.all();
        assert_eq!(logs[0].id(), &id);
        assert_eq!(logs[0].status(), NotificationStatus::Failed);
        assert_eq!(logs[0].next_retry_at(), Some(now + Duration::seconds(60)));
        assert!(sut.sender.sent().is_empty());
    }

    /// 応答を返さない送信先
    struct HangingSender;

    #[async_trait::async_trait]
    impl NotificationSender for HangingSender {
        async fn send(&self, _delivery: &NotificationDelivery) -> Result<(), NotificationError> {
            std::future::pending().await
        }
    }

    #[rstest]
    #[tokio::test]
    async fn test_上限時間内に終わらない送信はfailedで記録する(now: DateTime<Utc>) {
        let clock = Arc::new(ManualClock::new(now));
        let log_repo = MockNotificationLogRepository::new();
        let service = NotificationService::new(
            Arc::new(HangingSender),
            TemplateRenderer::new().unwrap(),
            Arc::new(log_repo.clone()),
            clock.clone(),
            RetryPolicy::default(),
            "http://localhost:5173".to_string(),
        )
        .with_send_timeout(std::time::Duration::from_millis(20));

        service.dispatch(timeout_request()).await.unwrap();
        clock.advance(Duration::minutes(5));
        let report = service.retry_failed().await.unwrap();

        assert_eq!(report.attempted, 1);
        assert_eq!(report.failed, 1);
        let logs = log_repo.all();
        assert_eq!(logs[0].status(), NotificationStatus::Failed);
        assert_eq!(logs[0].attempts(), 2);
        assert!(logs[0].last_error().unwrap().contains("20 ミリ秒"));
    }

    #[rstest]
    #[tokio::test]
    async fn test_テンプレートの描画失敗はエラーを返しログを残さない(now: DateTime<Utc>) {
        let sut = make_service(now, RetryPolicy::default());
        let mut request = timeout_request();
        request.payload = json!({});

        let result = sut.service.dispatch(request).await;

        assert!(matches!(result, Err(NotificationError::TemplateFailed(_))));
        assert!(sut.log_repo.all().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn test_再送は同じ配信idで送信する(now: DateTime<Utc>) {
        let sut = make_service(now, RetryPolicy::default());
        sut.sender.fail_next(1);
        let id = sut.service.dispatch(timeout_request()).await.unwrap();

        sut.clock.advance(Duration::seconds(61));
        let report = sut.service.retry_failed().await.unwrap();

        assert_eq!(
            report,
            RetryReport {
                attempted: 1,
                sent:      1,
                failed:    0,
                abandoned: 0,
            }
        );
        assert_eq!(sut.sender.sent()[0].id, id);
        assert_eq!(sut.log_repo.all()[0].status(), NotificationStatus::Sent);
        assert_eq!(sut.log_repo.all()[0].attempts(), 2);
    }

    #[rstest]
    #[tokio::test]
    async fn test_再送予定前のログは再送しない(now: DateTime<Utc>) {
        let sut = make_service(now, RetryPolicy::default());
        sut.sender.fail_next(1);
        sut.service.dispatch(timeout_request()).await.unwrap();

        sut.clock.advance(Duration::seconds(30));
        let report = sut.service.retry_failed().await.unwrap();

        assert_eq!(report, RetryReport::default());
    }

    #[rstest]
    #[tokio::test]
    async fn test_最大試行回数に達するとabandonedになる(now: DateTime<Utc>) {
        let policy = RetryPolicy::new(Duration::seconds(10), Duration::seconds(20), 3);
        let sut = make_service(now, policy);
        sut.sender.fail_next(3);
        sut.service.dispatch(timeout_request()).await.unwrap();

        // 2 回目: 10 秒後、3 回目: さらに 20 秒後
        sut.clock.advance(Duration::seconds(10));
        let second = sut.service.retry_failed().await.unwrap();
        sut.clock.advance(Duration::seconds(20));
        let third = sut.service.retry_failed().await.unwrap();
        sut.clock.advance(Duration::hours(1));
        let after = sut.service.retry_failed().await.unwrap();

        assert_eq!(second.failed, 1);
        assert_eq!(third.abandoned, 1);
        assert_eq!(after.attempted, 0);
        let log = &sut.log_repo.all()[0];
        assert_eq!(log.status(), NotificationStatus::Abandoned);
        assert_eq!(log.attempts(), 3);
        assert_eq!(log.next_retry_at(), None);
    }

    #[rstest]
    #[tokio::test]
    async fn test_保持期間より古いログだけを削除する(now: DateTime<Utc>) {
        let sut = make_service(now, RetryPolicy::default());
        sut.service.dispatch(timeout_request()).await.unwrap();
        sut.clock.advance(Duration::days(31));
        sut.service.dispatch(timeout_request()).await.unwrap();

        let deleted = sut
            .service
            .purge_older_than(sut.clock.now() - Duration::days(30))
            .await
            .unwrap();

        assert_eq!(deleted, 1);
        assert_eq!(sut.log_repo.all().len(), 1);
    }
}
