//! # 定期ジョブ
//!
//! 一定間隔で以下を順に実行する。
//!
//! 1. 案件ワークフローのステップタイムアウト判定
//! 2. 承認レベルのタイムアウト判定
//! 3. 配信できなかった承認結果の再配信
//! 4. 失敗した通知の再送
//! 5. 保持期間を過ぎた通知ログの削除
//!
//! ## 設計方針
//!
//! - 各ジョブは独立して実行し、1 つの失敗で後続のジョブを止めない
//! - ジョブ単位の失敗は [`JobReport::errors`] に数え、インスタンス単位の失敗は各集計に数える

use std::{future::Future, sync::Arc, time::Duration};

use chrono::Duration as ChronoDuration;
use repairflow_domain::clock::Clock;
use repairflow_shared::{event_log::event, log_business_event};
use tokio::time::MissedTickBehavior;

use super::{
    ApprovalUseCaseImpl,
    NotificationService,
    PatchRedeliveryReport,
    SweepReport,
    WorkflowExecutionUseCaseImpl,
    notification::RetryReport,
};

/// 1 回の実行結果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobReport {
    pub workflow_timeouts:    SweepReport,
    pub approval_timeouts:    SweepReport,
    pub patch_redeliveries:   PatchRedeliveryReport,
    pub notification_retries: RetryReport,
    /// 削除した通知ログの件数
    pub purged:               u64,
    /// 失敗したジョブの数
    pub errors:               usize,
}

/// 定期ジョブの実行器
pub struct ScheduledJobsRunner {
    execution:    Arc<WorkflowExecutionUseCaseImpl>,
    approval:     Arc<ApprovalUseCaseImpl>,
    notification: Arc<NotificationService>,
    clock:        Arc<dyn Clock>,
    retention:    ChronoDuration,
    interval:     Duration,
}

impl ScheduledJobsRunner {
    pub fn new(
        execution: Arc<WorkflowExecutionUseCaseImpl>,
        approval: Arc<ApprovalUseCaseImpl>,
        notification: Arc<NotificationService>,
        clock: Arc<dyn Clock>,
        retention: ChronoDuration,
        interval: Duration,
    ) -> Self {
        Self {
            execution,
            approval,
            notification,
            clock,
            retention,
            interval,
        }
    }

    /// 全ジョブを 1 回ずつ実行する
    #[tracing::instrument(skip_all)]
    pub async fn run_once(&self) -> JobReport {
        let mut report = JobReport::default();

        match self.execution.check_timeouts().await {
            Ok(sweep) => report.workflow_timeouts = sweep,
            Err(e) => {
                report.errors += 1;
                tracing::error!(error = %e, "ワークフローのタイムアウト判定に失敗");
            }
        }

        match self.approval.sweep_timeouts().await {
            Ok(sweep) => report.approval_timeouts = sweep,
            Err(e) => {
                report.errors += 1;
                tracing::error!(error = %e, "承認のタイムアウト判定に失敗");
            }
        }

        match self.approval.redeliver_pending_patches().await {
            Ok(redelivery) => report.patch_redeliveries = redelivery,
            Err(e) => {
                report.errors += 1;
                tracing::error!(error = %e, "承認結果の再配信に失敗");
            }
        }

        match self.notification.retry_failed().await {
            Ok(retries) => report.notification_retries = retries,
            Err(e) => {
                report.errors += 1;
                tracing::error!(error = %e, "通知の再送に失敗");
            }
        }

        let cutoff = self.clock.now() - self.retention;
        match self.notification.purge_older_than(cutoff).await {
            Ok(purged) => report.purged = purged,
            Err(e) => {
                report.errors += 1;
                tracing::error!(error = %e, "通知ログの削除に失敗");
            }
        }

        log_business_event!(
            event.category = event::category::SCHEDULER,
            event.action = event::action::SWEEP_COMPLETED,
            event.result = if report.errors == 0 {
                event::result::SUCCESS
            } else {
                event::result::FAILURE
            },
            scheduler.workflow_escalated = report.workflow_timeouts.escalated,
            scheduler.approval_escalated = report.approval_timeouts.escalated,
            scheduler.patches_redelivered = report.patch_redeliveries.delivered,
            scheduler.notifications_retried = report.notification_retries.attempted,
            scheduler.notifications_purged = report.purged,
            scheduler.errors = report.errors,
            "定期ジョブを実行"
        );

        report
    }

    /// `shutdown` が完了するまで一定間隔で [`run_once`](Self::run_once) を繰り返す
    ///
    /// 初回は起動直後に実行する。実行が間隔より長引いた場合、次の実行は終了時点から数える。
    pub async fn run(&self, shutdown: impl Future) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        tracing::info!(interval_secs = self.interval.as_secs(), "定期ジョブを開始");

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!("シャットダウン要求を受けたため定期ジョブを停止");
                    break;
                }
                _ = ticker.tick() => {
                    self.run_once().await;
                }
            }
        }
    }
}
