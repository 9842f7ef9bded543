//! # ワークフロー実行ユースケース
//!
//! 案件ワークフローインスタンスの開始・進行・取り消し・タイムアウト判定を実装する。
//!
//! ## 処理の流れ
//!
//! 1. インスタンスを 1 件読み込む
//! 2. ドメイン層のエンジン（[`engine`]）を実行する
//! 3. 読み込み時のバージョンで compare-and-swap 保存する（不一致は `CoreError::Conflict`）
//! 4. エンジンが返した副作用（通知・文書ステータス更新・監査）を fire-and-forget で実行する
//!
//! 自動遷移の循環を検出した場合は、操作前のインスタンスを凍結して保存し、エラーを返す。

use std::{sync::Arc, time::Duration};

use repairflow_domain::{
    DomainError,
    clock::Clock,
    context::{ContextPatch, deep_merge},
    document::DocumentStatus,
    value_objects::{CaseId, Version},
    workflow::{
        AdvanceResult,
        EngineEffect,
        EngineOutcome,
        SelectionCriteria,
        TimeoutResult,
        WorkflowDefinition,
        WorkflowDefinitionId,
        WorkflowInstance,
        WorkflowInstanceId,
        WorkflowInstanceStatus,
        engine,
    },
};
use repairflow_infra::repository::{
    DocumentRepository,
    WorkflowDefinitionRepository,
    WorkflowInstanceRepository,
};
use repairflow_shared::{
    event_log::{error as log_error, event},
    log_business_event,
};
use serde_json::Value as JsonValue;

use super::{
    ConfigurationUseCaseImpl,
    DEFAULT_SWEEP_INSTANCE_TIMEOUT,
    NotificationService,
    SweepReport,
    helpers::{FindResultExt, map_version_conflict},
};
use crate::error::CoreError;

const ENTITY_NAME: &str = "ワークフローインスタンス";

/// コンテキストパッチ適用の最大試行回数（競合時は再読み込みして再試行する）
const MAX_PATCH_ATTEMPTS: u32 = 3;

/// ワークフロー実行ユースケース
pub struct WorkflowExecutionUseCaseImpl {
    instance_repo:   Arc<dyn WorkflowInstanceRepository>,
    definition_repo: Arc<dyn WorkflowDefinitionRepository>,
    document_repo:   Arc<dyn DocumentRepository>,
    configuration:   Arc<ConfigurationUseCaseImpl>,
    notification:    Arc<NotificationService>,
    clock:           Arc<dyn Clock>,
    sweep_timeout:   Duration,
}

impl WorkflowExecutionUseCaseImpl {
    pub fn new(
        instance_repo: Arc<dyn WorkflowInstanceRepository>,
        definition_repo: Arc<dyn WorkflowDefinitionRepository>,
        document_repo: Arc<dyn DocumentRepository>,
        configuration: Arc<ConfigurationUseCaseImpl>,
        notification: Arc<NotificationService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            instance_repo,
            definition_repo,
            document_repo,
            configuration,
            notification,
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

    // =========================================================================
    // 開始
    // =========================================================================

    /// 公開済み定義を指定してインスタンスを開始する
    #[tracing::instrument(skip_all, fields(%definition_id, %case_id))]
    pub async fn start_instance(
        &self,
        definition_id: &WorkflowDefinitionId,
        case_id: CaseId,
        initial_context: &JsonValue,
    ) -> Result<WorkflowInstance, CoreError> {
        let definition = self
            .definition_repo
            .find_by_id(definition_id)
            .await
            .or_not_found("ワークフロー定義")?;

        self.start_with(&definition, case_id, initial_context).await
    }

    /// 案件の属性からワークフロー構成を選び、インスタンスを開始する
    ///
    /// 初期コンテキストは案件の属性（`device_type` など）に `context` を重ねたもの。
    #[tracing::instrument(skip_all, fields(%case_id, device_type = %criteria.device_type))]
    pub async fn start_for_case(
        &self,
        case_id: CaseId,
        criteria: &SelectionCriteria,
        context: &JsonValue,
    ) -> Result<WorkflowInstance, CoreError> {
        let Some((configuration, definition)) =
            self.configuration.select_definition(criteria).await?
        else {
            return Err(CoreError::NotFound(format!(
                "案件に適用できるワークフロー構成がありません: {} / {}",
                criteria.device_type, criteria.service_type
            )));
        };
        tracing::debug!(configuration.name = %configuration.name, "ワークフロー構成を選択");

        let mut initial_context = criteria.evaluation_context();
        deep_merge(&mut initial_context, context);

        self.start_with(&definition, case_id, &initial_context).await
    }

    async fn start_with(
        &self,
        definition: &WorkflowDefinition,
        case_id: CaseId,
        initial_context: &JsonValue,
    ) -> Result<WorkflowInstance, CoreError> {
        let outcome = engine::start(definition, case_id, initial_context, self.clock.now())
            .inspect_err(|e| {
                if matches!(e, DomainError::CycleDetected { .. }) {
                    tracing::error!(
                        error.category = log_error::category::DEFINITION,
                        error.kind = log_error::kind::CYCLE_DETECTED,
                        definition.name = %definition.name(),
                        definition.version = definition.version().as_u32(),
                        "開始時の自動遷移で循環を検出"
                    );
                }
            })?;

        self.instance_repo
            .insert(&outcome.instance)
            .await
            .map_err(|e| CoreError::Internal(format!("{}の保存に失敗: {}", ENTITY_NAME, e)))?;

        log_business_event!(
            event.category = event::category::WORKFLOW,
            event.action = event::action::WORKFLOW_STARTED,
            event.entity_type = event::entity_type::WORKFLOW_INSTANCE,
            event.entity_id = %outcome.instance.id(),
            event.result = event::result::SUCCESS,
            workflow.case_id = %outcome.instance.case_id(),
            workflow.definition = %definition.name(),
            workflow.step_id = %outcome.instance.current_step_id(),
            "ワークフローを開始"
        );
        self.log_if_finished(&outcome.instance);

        let instance = outcome.instance.clone();
        self.dispatch_effects(&outcome.instance, outcome.effects).await;
        Ok(instance)
    }

    // =========================================================================
    // 進行
    // =========================================================================

    /// イベントペイロードを適用してインスタンスを進める
    ///
    /// 成立する遷移がなければ何も保存せず `AdvanceResult::NoTransitionMatched` を返す。
    #[tracing::instrument(skip_all, fields(%instance_id))]
    pub async fn advance(
        &self,
        instance_id: &WorkflowInstanceId,
        payload: &JsonValue,
    ) -> Result<EngineOutcome<AdvanceResult>, CoreError> {
        let instance = self.find(instance_id).await?;
        self.advance_loaded(instance, payload).await
    }

    /// 承認結果などのコンテキストパッチを、案件の実行中インスタンスに適用する
    ///
    /// パッチをイベントペイロードとして進行を試みる。遷移が成立しない場合も、
    /// 後続の遷移条件で参照できるようパッチをコンテキストにマージして保存する。
    /// 保存が競合した場合は再読み込みして [`MAX_PATCH_ATTEMPTS`] 回まで試す。
    /// 再読み込みしたインスタンスが既に実行中でなければ、そのインスタンスには適用しない。
    #[tracing::instrument(skip_all, fields(case_id = %patch.case_id, document_id = %patch.document_id))]
    pub async fn apply_context_patch(
        &self,
        patch: &ContextPatch,
    ) -> Result<Vec<AdvanceResult>, CoreError> {
        let instances = self
            .instance_repo
            .find_running_by_case(&patch.case_id)
            .await
            .map_err(|e| CoreError::Internal(format!("{}の取得に失敗: {}", ENTITY_NAME, e)))?;

        if instances.is_empty() {
            tracing::warn!("コンテキストパッチを適用する実行中のインスタンスがありません");
        }

        let mut results = Vec::with_capacity(instances.len());
        for instance in instances {
            if let Some(result) = self.apply_patch_with_retry(instance, &patch.patch).await? {
                results.push(result);
            }
        }
        Ok(results)
    }

    async fn apply_patch_with_retry(
        &self,
        mut instance: WorkflowInstance,
        patch: &JsonValue,
    ) -> Result<Option<AdvanceResult>, CoreError> {
        let mut attempt = 1;
        loop {
            let instance_id = instance.id().clone();
            match self.apply_patch_once(instance, patch).await {
                Err(CoreError::Conflict(reason)) if attempt < MAX_PATCH_ATTEMPTS => {
                    tracing::warn!(
                        %instance_id,
                        attempt,
                        %reason,
                        "コンテキストパッチの保存が競合したため再読み込みして再試行"
                    );
                    attempt += 1;
                    instance = self.find(&instance_id).await?;
                    if instance.status() != WorkflowInstanceStatus::Running {
                        tracing::info!(
                            %instance_id,
                            status = %instance.status(),
                            "実行中でなくなったためコンテキストパッチを適用しません"
                        );
                        return Ok(None);
                    }
                }
                other => return other.map(Some),
            }
        }
    }

    async fn apply_patch_once(
        &self,
        instance: WorkflowInstance,
        patch: &JsonValue,
    ) -> Result<AdvanceResult, CoreError> {
        let outcome = self.advance_loaded(instance, patch).await?;
        if outcome.result == AdvanceResult::NoTransitionMatched {
            self.merge_context(outcome.instance, patch).await?;
        }
        Ok(outcome.result)
    }

    async fn advance_loaded(
        &self,
        instance: WorkflowInstance,
        payload: &JsonValue,
    ) -> Result<EngineOutcome<AdvanceResult>, CoreError> {
        let expected = instance.version();
        let snapshot = instance.clone();

        let outcome = match engine::advance(instance, payload, self.clock.now()) {
            Ok(outcome) => outcome,
            Err(e @ DomainError::CycleDetected { .. }) => {
                return Err(self.freeze_on_cycle(snapshot, e).await);
            }
            Err(e) => return Err(e.into()),
        };

        let AdvanceResult::Transitioned { from, to } = &outcome.result else {
            tracing::debug!("成立する遷移がありません");
            return Ok(outcome);
        };

        self.save(&outcome.instance, expected).await?;

        log_business_event!(
            event.category = event::category::WORKFLOW,
            event.action = event::action::WORKFLOW_ADVANCED,
            event.entity_type = event::entity_type::WORKFLOW_INSTANCE,
            event.entity_id = %outcome.instance.id(),
            event.result = event::result::SUCCESS,
            workflow.from_step = %from,
            workflow.to_step = %to,
            "ワークフローを進行"
        );
        self.log_if_finished(&outcome.instance);

        self.dispatch_effects(&outcome.instance, outcome.effects.clone())
            .await;
        Ok(outcome)
    }

    async fn merge_context(
        &self,
        instance: WorkflowInstance,
        patch: &JsonValue,
    ) -> Result<(), CoreError> {
        let expected = instance.version();
        let now = self.clock.now();
        let mut context = instance.context().clone();
        deep_merge(&mut context, patch);

        let merged = instance.with_context(context).touched(now);
        self.save(&merged, expected).await
    }

    // =========================================================================
    // 取り消し
    // =========================================================================

    /// インスタンスを取り消す
    ///
    /// 実行中・凍結中のインスタンスが対象。取り消し用の終了ステップのアクションを実行する。
    #[tracing::instrument(skip_all, fields(%instance_id))]
    pub async fn cancel(
        &self,
        instance_id: &WorkflowInstanceId,
        reason: Option<String>,
    ) -> Result<WorkflowInstance, CoreError> {
        let instance = self.find(instance_id).await?;
        let expected = instance.version();

        let outcome = engine::cancel(instance, reason, self.clock.now())?;
        self.save(&outcome.instance, expected).await?;

        log_business_event!(
            event.category = event::category::WORKFLOW,
            event.action = event::action::WORKFLOW_CANCELLED,
            event.entity_type = event::entity_type::WORKFLOW_INSTANCE,
            event.entity_id = %outcome.instance.id(),
            event.result = event::result::SUCCESS,
            workflow.step_id = %outcome.instance.current_step_id(),
            "ワークフローを取り消し"
        );

        let instance = outcome.instance.clone();
        self.dispatch_effects(&outcome.instance, outcome.effects).await;
        Ok(instance)
    }

    // =========================================================================
    // タイムアウト判定
    // =========================================================================

    /// 実行中の全インスタンスのタイムアウトを判定する
    ///
    /// インスタンスは順に処理し、1 件あたりの処理時間に上限を設ける。
    /// 個々のエラーは集計に数えて処理を続ける。
    ///
    /// # Errors
    ///
    /// 実行中インスタンスの一覧取得に失敗した場合のみエラーを返す。
    #[tracing::instrument(skip_all)]
    pub async fn check_timeouts(&self) -> Result<SweepReport, CoreError> {
        let instances = self
            .instance_repo
            .find_running()
            .await
            .map_err(|e| CoreError::Internal(format!("{}の取得に失敗: {}", ENTITY_NAME, e)))?;

        let mut report = SweepReport::default();
        for instance in instances {
            report.checked += 1;
            let instance_id = instance.id().clone();
            match tokio::time::timeout(self.sweep_timeout, self.check_instance_timeout(instance))
                .await
            {
                Ok(Ok(TimeoutResult::NoAction)) => {}
                Ok(Ok(TimeoutResult::Handled { .. })) => report.escalated += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    tracing::error!(
                        error = %e,
                        %instance_id,
                        "インスタンスのタイムアウト判定に失敗"
                    );
                }
                Err(_) => {
                    report.timed_out += 1;
                    tracing::error!(
                        error.kind = log_error::kind::TIMEOUT,
                        %instance_id,
                        "インスタンスのタイムアウト判定が時間内に終わりませんでした"
                    );
                }
            }
        }

        Ok(report)
    }

    async fn check_instance_timeout(
        &self,
        instance: WorkflowInstance,
    ) -> Result<TimeoutResult, CoreError> {
        let expected = instance.version();
        let snapshot = instance.clone();

        let outcome = match engine::check_timeouts(instance, self.clock.now()) {
            Ok(outcome) => outcome,
            Err(e @ DomainError::CycleDetected { .. }) => {
                return Err(self.freeze_on_cycle(snapshot, e).await);
            }
            Err(e) => return Err(e.into()),
        };

        let TimeoutResult::Handled {
            escalated_levels,
            auto_transitioned_to,
        } = &outcome.result
        else {
            return Ok(TimeoutResult::NoAction);
        };

        self.save(&outcome.instance, expected).await?;

        log_business_event!(
            event.category = event::category::WORKFLOW,
            event.action = event::action::WORKFLOW_ESCALATED,
            event.entity_type = event::entity_type::WORKFLOW_INSTANCE,
            event.entity_id = %outcome.instance.id(),
            event.result = event::result::SUCCESS,
            workflow.step_id = %snapshot.current_step_id(),
            workflow.escalated_levels = ?escalated_levels,
            workflow.auto_transitioned_to = ?auto_transitioned_to,
            "ステップのタイムアウトをエスカレーション"
        );
        self.log_if_finished(&outcome.instance);

        self.dispatch_effects(&outcome.instance, outcome.effects)
            .await;
        Ok(outcome.result)
    }

    // =========================================================================
    // 参照
    // =========================================================================

    /// ID でインスタンスを取得
    pub async fn find(&self, instance_id: &WorkflowInstanceId) -> Result<WorkflowInstance, CoreError> {
        self.instance_repo
            .find_by_id(instance_id)
            .await
            .or_not_found(ENTITY_NAME)
    }

    // =========================================================================
    // 内部処理
    // =========================================================================

    async fn save(&self, instance: &WorkflowInstance, expected: Version) -> Result<(), CoreError> {
        self.instance_repo
            .update_with_version_check(instance, expected)
            .await
            .map_err(map_version_conflict(ENTITY_NAME))
    }

    /// 操作前のインスタンスを凍結して保存し、循環検出のエラーを返す
    async fn freeze_on_cycle(&self, snapshot: WorkflowInstance, error: DomainError) -> CoreError {
        let expected = snapshot.version();
        let instance_id = snapshot.id().clone();
        let step_id = snapshot.current_step_id().clone();

        tracing::error!(
            error.category = log_error::category::DEFINITION,
            error.kind = log_error::kind::CYCLE_DETECTED,
            %instance_id,
            %step_id,
            "自動遷移の循環を検出したためインスタンスを凍結します"
        );

        let frozen = engine::freeze(snapshot, error.to_string(), self.clock.now());
        match frozen {
            Ok(outcome) => match self.save(&outcome.instance, expected).await {
                Ok(()) => {
                    log_business_event!(
                        event.category = event::category::WORKFLOW,
                        event.action = event::action::WORKFLOW_FROZEN,
                        event.entity_type = event::entity_type::WORKFLOW_INSTANCE,
                        event.entity_id = %instance_id,
                        event.result = event::result::FAILURE,
                        workflow.step_id = %step_id,
                        "ワークフローを凍結"
                    );
                    self.dispatch_effects(&outcome.instance, outcome.effects).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, %instance_id, "凍結したインスタンスの保存に失敗");
                }
            },
            Err(e) => {
                tracing::error!(error = %e, %instance_id, "インスタンスの凍結に失敗");
            }
        }

        error.into()
    }

    fn log_if_finished(&self, instance: &WorkflowInstance) {
        let action = match instance.status() {
            WorkflowInstanceStatus::Completed => event::action::WORKFLOW_COMPLETED,
            WorkflowInstanceStatus::Cancelled => event::action::WORKFLOW_CANCELLED,
            WorkflowInstanceStatus::Running | WorkflowInstanceStatus::Frozen => return,
        };
        log_business_event!(
            event.category = event::category::WORKFLOW,
            event.action = action,
            event.entity_type = event::entity_type::WORKFLOW_INSTANCE,
            event.entity_id = %instance.id(),
            event.result = event::result::SUCCESS,
            workflow.step_id = %instance.current_step_id(),
            "ワークフローが終了ステップに到達"
        );
    }

    /// エンジンの副作用を実行する（fire-and-forget）
    async fn dispatch_effects(&self, instance: &WorkflowInstance, effects: Vec<EngineEffect>) {
        for effect in effects {
            match effect {
                EngineEffect::Notify(request) => self.notification.notify(request).await,
                EngineEffect::UpdateDocumentStatus {
                    document_type,
                    status,
                } => {
                    self.update_document_status(instance.case_id(), &document_type, status)
                        .await;
                }
                EngineEffect::Audit {
                    event: audit_event,
                    step_id,
                } => {
                    log_business_event!(
                        event.category = event::category::WORKFLOW,
                        event.action = %audit_event,
                        event.entity_type = event::entity_type::WORKFLOW_INSTANCE,
                        event.entity_id = %instance.id(),
                        event.result = event::result::SUCCESS,
                        workflow.case_id = %instance.case_id(),
                        workflow.step_id = %step_id,
                        "ステップの監査イベント"
                    );
                }
            }
        }
    }

    async fn update_document_status(
        &self,
        case_id: &CaseId,
        document_type: &str,
        status: DocumentStatus,
    ) {
        let document = match self
            .document_repo
            .find_by_case_and_type(case_id, document_type)
            .await
        {
            Ok(Some(document)) => document,
            Ok(None) => {
                tracing::warn!(
                    %case_id,
                    document_type,
                    "ステータスを更新する文書がありません"
                );
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, %case_id, document_type, "文書の取得に失敗");
                return;
            }
        };

        if let Err(e) = self
            .document_repo
            .update_status(document.id(), status, self.clock.now())
            .await
        {
            tracing::error!(
                error = %e,
                document_id = %document.id(),
                "文書ステータスの更新に失敗"
            );
        }
    }
}
