//! # Core Service
//!
//! 修理案件ワークフローと文書承認のエンジンを動かす常駐プロセス。
//!
//! ## 役割
//!
//! - **定期ジョブ**: ステップ・承認レベルのタイムアウト判定、承認結果の再配信、通知の再送、通知ログの削除
//! - **結線**: PostgreSQL リポジトリ・通知チャネル・ユースケースを組み立てる
//!
//! 案件の作成や決裁の受付は上位の API 層がライブラリ（[`repairflow_core_service::usecase`]）を
//! 直接呼び出す。
//!
//! ## 環境変数
//!
//! | 変数名 | 必須 | 説明 |
//! |--------|------|------|
//! | `DATABASE_URL` | **Yes** | PostgreSQL 接続 URL |
//! | `SCHEDULER_INTERVAL_SECS` | No | 定期ジョブの間隔（デフォルト: 900） |
//! | `SCHEDULER_INSTANCE_TIMEOUT_SECS` | No | 1 インスタンスあたりの処理時間の上限（デフォルト: 30） |
//! | `NOTIFICATION_BACKEND` | No | メール送信バックエンド `smtp` / `ses` / `noop`（デフォルト: `noop`） |
//! | `NOTIFICATION_WEBHOOK_URL` | No | 設定すると Webhook チャネルを有効にする |
//! | `NOTIFICATION_SMS_GATEWAY_URL` | No | 設定すると SMS チャネルを有効にする |
//! | `NOTIFICATION_SEND_TIMEOUT_SECS` | No | 1 回の通知送信の上限時間（デフォルト: 10） |
//! | `LOG_FORMAT` | No | `json` / `pretty` |
//!
//! ## 起動方法
//!
//! ```bash
//! DATABASE_URL=postgres://... cargo run -p repairflow-core-service
//! ```

use std::sync::Arc;

use anyhow::Context as _;
use repairflow_core_service::{
    config::{CoreConfig, EmailBackend, NotificationConfig},
    usecase::{
        ApprovalUseCaseImpl,
        ConfigurationUseCaseImpl,
        NotificationService,
        ScheduledJobsRunner,
        TemplateRenderer,
        WorkflowExecutionUseCaseImpl,
    },
};
use repairflow_domain::{clock::SystemClock, notification::NotificationChannel};
use repairflow_infra::{
    db,
    notification::{
        ChannelRouter,
        InAppNotificationSender,
        NoopNotificationSender,
        NotificationSender,
        SesNotificationSender,
        SmsGatewaySender,
        SmtpNotificationSender,
        WebhookNotificationSender,
    },
    repository::{
        PostgresApprovalInstanceRepository,
        PostgresApprovalWorkflowRepository,
        PostgresDocumentRepository,
        PostgresNotificationLogRepository,
        PostgresWorkflowConfigurationRepository,
        PostgresWorkflowDefinitionRepository,
        PostgresWorkflowInstanceRepository,
    },
};
use repairflow_shared::observability::{TracingConfig, init_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env ファイルを読み込む（存在する場合）
    dotenvy::dotenv().ok();

    init_tracing(TracingConfig::from_env("core-service"));

    let config = CoreConfig::from_env().context("設定の読み込みに失敗しました")?;

    let pool = db::create_pool(&config.database_url)
        .await
        .context("データベース接続に失敗しました")?;
    db::run_migrations(&pool)
        .await
        .context("マイグレーションの実行に失敗しました")?;
    tracing::info!("データベースに接続しました");

    let clock = Arc::new(SystemClock);
    let definition_repo = Arc::new(PostgresWorkflowDefinitionRepository::new(pool.clone()));
    let document_repo = Arc::new(PostgresDocumentRepository::new(pool.clone()));

    let notification = Arc::new(
        NotificationService::new(
            Arc::new(build_channel_router(&config.notification).await?),
            TemplateRenderer::new().context("通知テンプレートの読み込みに失敗しました")?,
            Arc::new(PostgresNotificationLogRepository::new(pool.clone())),
            clock.clone(),
            config.notification.retry_policy,
            config.notification.base_url.clone(),
        )
        .with_send_timeout(config.notification.send_timeout),
    );

    let configuration = Arc::new(ConfigurationUseCaseImpl::new(
        Arc::new(PostgresWorkflowConfigurationRepository::new(pool.clone())),
        definition_repo.clone(),
    ));
    let execution = Arc::new(
        WorkflowExecutionUseCaseImpl::new(
            Arc::new(PostgresWorkflowInstanceRepository::new(pool.clone())),
            definition_repo,
            document_repo.clone(),
            configuration,
            notification.clone(),
            clock.clone(),
        )
        .with_sweep_timeout(config.scheduler.instance_timeout),
    );
    let approval = Arc::new(
        ApprovalUseCaseImpl::new(
            Arc::new(PostgresApprovalWorkflowRepository::new(pool.clone())),
            Arc::new(PostgresApprovalInstanceRepository::new(pool.clone())),
            document_repo,
            notification.clone(),
            execution.clone(),
            clock.clone(),
        )
        .with_sweep_timeout(config.scheduler.instance_timeout),
    );

    let runner = ScheduledJobsRunner::new(
        execution,
        approval,
        notification,
        clock,
        config.notification.retention,
        config.scheduler.interval,
    );

    tracing::info!("Core Service を起動しました");
    runner
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "シグナルの待機に失敗");
            }
        })
        .await;
    tracing::info!("Core Service を停止しました");

    Ok(())
}

/// 設定に応じてチャネル別の送信器を登録する
async fn build_channel_router(config: &NotificationConfig) -> anyhow::Result<ChannelRouter> {
    let email: Arc<dyn NotificationSender> = match config.backend {
        EmailBackend::Smtp => {
            tracing::info!(host = %config.smtp_host, port = config.smtp_port, "メール送信: SMTP");
            Arc::new(SmtpNotificationSender::new(
                &config.smtp_host,
                config.smtp_port,
                config.from_address.clone(),
            ))
        }
        EmailBackend::Ses => {
            tracing::info!("メール送信: Amazon SES");
            Arc::new(SesNotificationSender::from_env(config.from_address.clone()).await)
        }
        EmailBackend::Noop => {
            tracing::info!("メール送信: 無効（ログ出力のみ）");
            Arc::new(NoopNotificationSender)
        }
    };

    let client = reqwest::Client::builder()
        .timeout(config.send_timeout)
        .build()
        .context("HTTP クライアントの初期化に失敗しました")?;
    let mut router = ChannelRouter::new()
        .with(NotificationChannel::Email, email)
        .with(NotificationChannel::InApp, Arc::new(InAppNotificationSender));

    if let Some(url) = &config.webhook_url {
        router = router.with(
            NotificationChannel::Webhook,
            Arc::new(WebhookNotificationSender::new(client.clone(), url.clone())),
        );
    }
    if let Some(url) = &config.sms_gateway_url {
        router = router.with(
            NotificationChannel::Sms,
            Arc::new(SmsGatewaySender::new(client, url.clone())),
        );
    }

    Ok(router)
}
