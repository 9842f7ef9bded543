//! # 承認ユースケース
//!
//! 文書の多段階承認（申請・決裁・委任・エスカレーション・タイムアウト判定）を実装する。
//!
//! ## 設計方針
//!
//! - 状態遷移の判定はドメイン層の [`ApprovalInstance`] のメソッドに任せ、ここでは
//!   読み込み・compare-and-swap 保存・副作用の実行だけを行う
//! - 承認完了・却下は [`ContextPatchPublisher`] 経由で案件ワークフローに伝える。
//!   パッチは終了状態と同時にインスタンスへ保存し、配信できたときだけ消す。
//!   配信できなかったパッチは [`ApprovalUseCaseImpl::redeliver_pending_patches`] が再配信する
//! - 通知・文書ステータス更新の失敗はログ出力のみで、承認インスタンスの状態は巻き戻さない

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use repairflow_domain::{
    approval::{
        ApprovalAction,
        ApprovalEffect,
        ApprovalInstance,
        ApprovalInstanceId,
        ApprovalStatus,
        ApprovalTransition,
        ApprovalWorkflowId,
        Approver,
        EscalateResult,
        NewApprovalInstance,
        ProcessResult,
        SubmitResult,
        TriggeredBy,
    },
    clock::Clock,
    context::{ContextPatch, deep_merge},
    document::DocumentId,
    value_objects::Version,
};
use repairflow_infra::repository::{
    ApprovalInstanceRepository,
    ApprovalWorkflowRepository,
    DocumentRepository,
};
use repairflow_shared::{
    event_log::{error as log_error, event},
    log_business_event,
};
use serde_json::Value as JsonValue;

use super::{
    DEFAULT_SWEEP_INSTANCE_TIMEOUT,
    NotificationService,
    SweepReport,
    WorkflowExecutionUseCaseImpl,
    helpers::{FindResultExt, map_version_conflict},
};
use crate::error::CoreError;

const ENTITY_NAME: &str = "承認インスタンス";

/// タイムアウトによるエスカレーションの理由
const TIMEOUT_REASON: &str = "承認期限を超過しました";

/// 配信済みの記録を保存する最大試行回数
const MAX_SAVE_ATTEMPTS: u32 = 3;

/// 承認結果を案件ワークフローに伝えるポート
#[async_trait]
pub trait ContextPatchPublisher: Send + Sync {
    async fn publish(&self, patch: &ContextPatch) -> Result<(), CoreError>;
}

#[async_trait]
impl ContextPatchPublisher for WorkflowExecutionUseCaseImpl {
    async fn publish(&self, patch: &ContextPatch) -> Result<(), CoreError> {
        let results = self.apply_context_patch(patch).await?;
        tracing::debug!(instances = results.len(), "コンテキストパッチを適用");
        Ok(())
    }
}

/// コンテキストパッチ再配信の集計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchRedeliveryReport {
    /// 再配信を試みた件数
    pub attempted: usize,
    /// 配信できた件数
    pub delivered: usize,
    /// 配信できず次回に持ち越した件数
    pub failed:    usize,
}

/// 承認申請の入力
#[derive(Debug, Clone)]
pub struct SubmitApprovalInput {
    pub document_id:  DocumentId,
    pub workflow_id:  ApprovalWorkflowId,
    pub submitted_by: String,
    /// スキップ条件の評価に追加するコンテキスト（文書内容に重ねる）
    pub context:      JsonValue,
}

/// 承認ユースケース
pub struct ApprovalUseCaseImpl {
    workflow_repo: Arc<dyn ApprovalWorkflowRepository>,
    instance_repo: Arc<dyn ApprovalInstanceRepository>,
    document_repo: Arc<dyn DocumentRepository>,
    notification:  Arc<NotificationService>,
    publisher:     Arc<dyn ContextPatchPublisher>,
    clock:         Arc<dyn Clock>,
    sweep_timeout: Duration,
}

impl ApprovalUseCaseImpl {
    pub fn new(
        workflow_repo: Arc<dyn ApprovalWorkflowRepository>,
        instance_repo: Arc<dyn ApprovalInstanceRepository>,
        document_repo: Arc<dyn DocumentRepository>,
        notification: Arc<NotificationService>,
        publisher: Arc<dyn ContextPatchPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            workflow_repo,
            instance_repo,
            document_repo,
            notification,
            publisher,
            clock,
            sweep_timeout: DEFAULT_SWEEP_INSTANCE_TIMEOUT,
        }
    }

    /// タイムアウト一括判定で 1 インスタンスに許す処理時間を設定する
    #[must_use]
    pub fn with_sweep_timeout(mut self, timeout: Duration) -> Self {
        self.sweep_timeout = timeout;
        self
    }

    /// 文書を承認に回す
    ///
    /// 文書ごとに決裁待ちのインスタンスは 1 件まで。既にある場合は `Conflict`。
    #[tracing::instrument(skip_all, fields(document_id = %input.document_id, workflow_id = %input.workflow_id))]
    pub async fn submit_for_approval(
        &self,
        input: SubmitApprovalInput,
    ) -> Result<ApprovalTransition<SubmitResult>, CoreError> {
        let document = self
            .document_repo
            .find_by_id(&input.document_id)
            .await
            .or_not_found("文書")?;
        let workflow = self
            .workflow_repo
            .find_by_id(&input.workflow_id)
            .await
            .or_not_found("承認ワークフロー")?;

        let open = self
            .instance_repo
            .find_open_by_document(document.id())
            .await
            .map_err(|e| CoreError::Internal(format!("{}の取得に失敗: {}", ENTITY_NAME, e)))?;
        if let Some(open) = open {
            return Err(CoreError::Conflict(format!(
                "文書 {} は既に承認中です（承認インスタンス {}）",
                document.id(),
                open.id()
            )));
        }

        let mut context = document.content().clone();
        deep_merge(&mut context, &input.context);

        let transition = ApprovalInstance::submit(NewApprovalInstance {
            id: ApprovalInstanceId::new(),
            document_id: document.id().clone(),
            document_type_id: document.document_type_id().to_string(),
            case_id: document.case_id().clone(),
            workflow,
            submitted_by: input.submitted_by,
            context,
            now: self.clock.now(),
        })?;

        self.instance_repo
            .insert(&transition.instance)
            .await
            .map_err(|e| match e.as_conflict() {
                Some(_) => CoreError::Conflict(format!("文書 {} は既に承認中です", document.id())),
                None => CoreError::Internal(format!("{}の保存に失敗: {}", ENTITY_NAME, e)),
            })?;

        log_business_event!(
            event.category = event::category::APPROVAL,
            event.action = event::action::APPROVAL_SUBMITTED,
            event.entity_type = event::entity_type::APPROVAL_INSTANCE,
            event.entity_id = %transition.instance.id(),
            event.result = event::result::SUCCESS,
            approval.document_id = %document.id(),
            approval.workflow = %transition.instance.workflow().name,
            approval.level = transition.instance.current_level(),
            approval.skipped_levels = transition.instance.skips().len(),
            "承認を申請"
        );
        self.log_if_finished(&transition.instance);

        self.dispatch_effects(transition.instance.id(), transition.effects.clone())
            .await;
        Ok(transition)
    }

    /// 現在レベルで承認または却下する
    ///
    /// 同じ決裁者の同一レベルでの再決裁は何も保存せず `ProcessResult::AlreadyDecided` を返す。
    #[tracing::instrument(skip_all, fields(%instance_id, approver_id = %approver.user_id))]
    pub async fn process(
        &self,
        instance_id: &ApprovalInstanceId,
        approver: &Approver,
        action: ApprovalAction,
        comments: Option<String>,
    ) -> Result<ApprovalTransition<ProcessResult>, CoreError> {
        let instance = self.find(instance_id).await?;
        let expected = instance.version();
        let level = instance.current_level();

        let transition = instance.process(approver, action, comments, self.clock.now())?;
        if transition.result == ProcessResult::AlreadyDecided {
            tracing::info!(level, "同じ決裁者による再決裁のため何もしません");
            return Ok(transition);
        }

        self.save(&transition.instance, expected).await?;

        let action = match action {
            ApprovalAction::Approve => event::action::APPROVAL_APPROVED,
            ApprovalAction::Reject => event::action::APPROVAL_REJECTED,
        };
        log_business_event!(
            event.category = event::category::APPROVAL,
            event.action = action,
            event.entity_type = event::entity_type::APPROVAL_INSTANCE,
            event.entity_id = %transition.instance.id(),
            event.result = event::result::SUCCESS,
            approval.approver_id = %approver.user_id,
            approval.level = level,
            approval.outcome = ?transition.result,
            "承認を決裁"
        );
        self.log_if_finished(&transition.instance);

        self.dispatch_effects(transition.instance.id(), transition.effects.clone())
            .await;
        Ok(transition)
    }

    /// 現在レベルの決裁権限を委任する
    #[tracing::instrument(skip_all, fields(%instance_id, from = %from.user_id, to = to_user))]
    pub async fn delegate(
        &self,
        instance_id: &ApprovalInstanceId,
        from: &Approver,
        to_user: &str,
        reason: String,
        valid_until: Option<DateTime<Utc>>,
    ) -> Result<ApprovalInstance, CoreError> {
        let instance = self.find(instance_id).await?;
        let expected = instance.version();

        let transition = instance.delegate(from, to_user, reason, valid_until, self.clock.now())?;
        self.save(&transition.instance, expected).await?;

        log_business_event!(
            event.category = event::category::APPROVAL,
            event.action = event::action::APPROVAL_DELEGATED,
            event.entity_type = event::entity_type::APPROVAL_INSTANCE,
            event.entity_id = %transition.instance.id(),
            event.result = event::result::SUCCESS,
            approval.from_user = %from.user_id,
            approval.to_user = to_user,
            approval.level = transition.instance.current_level(),
            "承認権限を委任"
        );

        let instance = transition.instance.clone();
        self.dispatch_effects(instance.id(), transition.effects).await;
        Ok(instance)
    }

    /// 現在レベルをエスカレーションする
    ///
    /// `manual` が false の場合はタイムアウトによるエスカレーションとして記録する。
    #[tracing::instrument(skip_all, fields(%instance_id, manual))]
    pub async fn escalate(
        &self,
        instance_id: &ApprovalInstanceId,
        reason: String,
        manual: bool,
    ) -> Result<ApprovalTransition<EscalateResult>, CoreError> {
        let instance = self.find(instance_id).await?;
        let triggered_by = if manual {
            TriggeredBy::Manual
        } else {
            TriggeredBy::Timeout
        };
        self.escalate_loaded(instance, reason, triggered_by).await
    }

    /// 決裁待ちの全インスタンスのタイムアウトを判定し、期限切れをエスカレーションする
    ///
    /// # Errors
    ///
    /// 決裁待ちインスタンスの一覧取得に失敗した場合のみエラーを返す。
    #[tracing::instrument(skip_all)]
    pub async fn sweep_timeouts(&self) -> Result<SweepReport, CoreError> {
        let instances = self
            .instance_repo
            .find_open()
            .await
            .map_err(|e| CoreError::Internal(format!("{}の取得に失敗: {}", ENTITY_NAME, e)))?;

        let now = self.clock.now();
        let mut report = SweepReport::default();
        for instance in instances {
            report.checked += 1;
            if !instance.is_timed_out(now) {
                continue;
            }

            let instance_id = instance.id().clone();
            let escalation =
                self.escalate_loaded(instance, TIMEOUT_REASON.to_string(), TriggeredBy::Timeout);
            match tokio::time::timeout(self.sweep_timeout, escalation).await {
                Ok(Ok(_)) => report.escalated += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    tracing::error!(error = %e, %instance_id, "承認のエスカレーションに失敗");
                }
                Err(_) => {
                    report.timed_out += 1;
                    tracing::error!(
                        error.kind = log_error::kind::TIMEOUT,
                        %instance_id,
                        "承認のエスカレーションが時間内に終わりませんでした"
                    );
                }
            }
        }

        Ok(report)
    }

    /// 配信待ちのコンテキストパッチを案件ワークフローへ再配信する
    ///
    /// 1 件あたりの処理時間に上限を設け、失敗したパッチは次回に持ち越す。
    ///
    /// # Errors
    ///
    /// 配信待ちインスタンスの一覧取得に失敗した場合のみエラーを返す。
    #[tracing::instrument(skip_all)]
    pub async fn redeliver_pending_patches(&self) -> Result<PatchRedeliveryReport, CoreError> {
        let instances = self
            .instance_repo
            .find_with_pending_patch()
            .await
            .map_err(|e| CoreError::Internal(format!("{}の取得に失敗: {}", ENTITY_NAME, e)))?;

        let mut report = PatchRedeliveryReport::default();
        for instance in instances {
            let Some(patch) = instance.pending_patch().cloned() else {
                continue;
            };
            report.attempted += 1;
            let instance_id = instance.id().clone();
            let delivery = self.deliver_patch(&instance_id, &patch);
            match tokio::time::timeout(self.sweep_timeout, delivery).await {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    tracing::error!(error = %e, %instance_id, "コンテキストパッチの再配信に失敗");
                }
                Err(_) => {
                    report.failed += 1;
                    tracing::error!(
                        error.kind = log_error::kind::TIMEOUT,
                        %instance_id,
                        "コンテキストパッチの再配信が時間内に終わりませんでした"
                    );
                }
            }
        }

        Ok(report)
    }

    /// ID で承認インスタンスを取得
    pub async fn find(&self, instance_id: &ApprovalInstanceId) -> Result<ApprovalInstance, CoreError> {
        self.instance_repo
            .find_by_id(instance_id)
            .await
            .or_not_found(ENTITY_NAME)
    }

    async fn escalate_loaded(
        &self,
        instance: ApprovalInstance,
        reason: String,
        triggered_by: TriggeredBy,
    ) -> Result<ApprovalTransition<EscalateResult>, CoreError> {
        let expected = instance.version();
        let from_level = instance.current_level();

        let transition = instance.escalate(reason, triggered_by, self.clock.now())?;
        self.save(&transition.instance, expected).await?;

        log_business_event!(
            event.category = event::category::APPROVAL,
            event.action = event::action::APPROVAL_ESCALATED,
            event.entity_type = event::entity_type::APPROVAL_INSTANCE,
            event.entity_id = %transition.instance.id(),
            event.result = event::result::SUCCESS,
            approval.from_level = from_level,
            approval.triggered_by = ?triggered_by,
            approval.outcome = ?transition.result,
            "承認をエスカレーション"
        );
        self.log_if_finished(&transition.instance);

        self.dispatch_effects(transition.instance.id(), transition.effects.clone())
            .await;
        Ok(transition)
    }

    async fn save(&self, instance: &ApprovalInstance, expected: Version) -> Result<(), CoreError> {
        self.instance_repo
            .update_with_version_check(instance, expected)
            .await
            .map_err(map_version_conflict(ENTITY_NAME))
    }

    fn log_if_finished(&self, instance: &ApprovalInstance) {
        if matches!(
            instance.status(),
            ApprovalStatus::Approved | ApprovalStatus::Completed
        ) {
            log_business_event!(
                event.category = event::category::APPROVAL,
                event.action = event::action::APPROVAL_COMPLETED,
                event.entity_type = event::entity_type::APPROVAL_INSTANCE,
                event.entity_id = %instance.id(),
                event.result = event::result::SUCCESS,
                approval.document_id = %instance.document_id(),
                approval.status = %instance.status(),
                "承認が完了"
            );
        }
    }

    /// パッチを案件ワークフローに配信し、配信済みを記録する
    async fn deliver_patch(
        &self,
        instance_id: &ApprovalInstanceId,
        patch: &ContextPatch,
    ) -> Result<(), CoreError> {
        self.publisher.publish(patch).await?;

        let mut attempt = 1;
        loop {
            let instance = self.find(instance_id).await?;
            let expected = instance.version();
            let Some(delivered) = instance.patch_delivered(self.clock.now()) else {
                return Ok(());
            };
            match self.save(&delivered, expected).await {
                Ok(()) => break,
                Err(CoreError::Conflict(_)) if attempt < MAX_SAVE_ATTEMPTS => attempt += 1,
                Err(e) => return Err(e),
            }
        }

        log_business_event!(
            event.category = event::category::APPROVAL,
            event.action = event::action::APPROVAL_PATCH_DELIVERED,
            event.entity_type = event::entity_type::APPROVAL_INSTANCE,
            event.entity_id = %instance_id,
            event.result = event::result::SUCCESS,
            approval.case_id = %patch.case_id,
            approval.document_id = %patch.document_id,
            "承認結果を案件ワークフローに反映"
        );
        Ok(())
    }

    /// 承認の副作用を実行する
    ///
    /// 通知・文書ステータス更新は fire-and-forget。コンテキストパッチは配信できなければ
    /// インスタンスに残り、定期ジョブが再配信する。
    async fn dispatch_effects(
        &self,
        instance_id: &ApprovalInstanceId,
        effects: Vec<ApprovalEffect>,
    ) {
        for effect in effects {
            match effect {
                ApprovalEffect::Notify(request) => self.notification.notify(request).await,
                ApprovalEffect::UpdateDocumentStatus {
                    document_id,
                    status,
                } => {
                    if let Err(e) = self
                        .document_repo
                        .update_status(&document_id, status, self.clock.now())
                        .await
                    {
                        tracing::error!(
                            error = %e,
                            %document_id,
                            "文書ステータスの更新に失敗"
                        );
                    }
                }
                ApprovalEffect::PublishContextPatch(patch) => {
                    if let Err(e) = self.deliver_patch(instance_id, &patch).await {
                        tracing::warn!(
                            error = %e,
                            %instance_id,
                            case_id = %patch.case_id,
                            document_id = %patch.document_id,
                            "承認結果を案件ワークフローに反映できませんでした（定期ジョブで再配信）"
                        );
                    }
                }
            }
        }
    }
}
