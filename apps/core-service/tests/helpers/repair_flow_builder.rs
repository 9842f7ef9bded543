//! 修理案件テストビルダー
//!
//! モックリポジトリと手動時計で全ユースケースを本番と同じ形に結線する。

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use repairflow_core_service::usecase::{
    ApprovalUseCaseImpl,
    ConfigurationUseCaseImpl,
    DocumentUseCaseImpl,
    NotificationService,
    ScheduledJobsRunner,
    TemplateRenderer,
    WorkflowDefinitionUseCaseImpl,
    WorkflowExecutionUseCaseImpl,
};
use repairflow_domain::{clock::ManualClock, notification::RetryPolicy};
use repairflow_infra::mock::{
    MockApprovalInstanceRepository,
    MockApprovalWorkflowRepository,
    MockDocumentRepository,
    MockNotificationLogRepository,
    MockWorkflowConfigurationRepository,
    MockWorkflowDefinitionRepository,
    MockWorkflowInstanceRepository,
    RecordingNotificationSender,
};

/// 結線済みのユースケース一式
pub struct RepairFlowSystem {
    pub definitions:            WorkflowDefinitionUseCaseImpl,
    pub configuration:          Arc<ConfigurationUseCaseImpl>,
    pub execution:              Arc<WorkflowExecutionUseCaseImpl>,
    pub approval:               Arc<ApprovalUseCaseImpl>,
    pub documents:              DocumentUseCaseImpl,
    pub runner:                 ScheduledJobsRunner,
    pub approval_workflow_repo: MockApprovalWorkflowRepository,
    pub instance_repo:          MockWorkflowInstanceRepository,
    pub sender:                 RecordingNotificationSender,
    pub clock:                  Arc<ManualClock>,
}

/// 修理案件テストビルダー
pub struct RepairFlowTestBuilder {
    now: DateTime<Utc>,
}

impl Default for RepairFlowTestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RepairFlowTestBuilder {
    pub fn new() -> Self {
        Self {
            now: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    pub fn build(&self) -> RepairFlowSystem {
        let definition_repo = MockWorkflowDefinitionRepository::new();
        let instance_repo = MockWorkflowInstanceRepository::new();
        let document_repo = MockDocumentRepository::new();
        let approval_workflow_repo = MockApprovalWorkflowRepository::new();
        let sender = RecordingNotificationSender::new();
        let clock = Arc::new(ManualClock::new(self.now));

        let notification = Arc::new(NotificationService::new(
            Arc::new(sender.clone()),
            TemplateRenderer::new().unwrap(),
            Arc::new(MockNotificationLogRepository::new()),
            clock.clone(),
            RetryPolicy::default(),
            "http://localhost:5173".to_string(),
        ));
        let configuration = Arc::new(ConfigurationUseCaseImpl::new(
            Arc::new(MockWorkflowConfigurationRepository::new()),
            Arc::new(definition_repo.clone()),
        ));
        let execution = Arc::new(WorkflowExecutionUseCaseImpl::new(
            Arc::new(instance_repo.clone()),
            Arc::new(definition_repo.clone()),
            Arc::new(document_repo.clone()),
            configuration.clone(),
            notification.clone(),
            clock.clone(),
        ));
        let approval = Arc::new(ApprovalUseCaseImpl::new(
            Arc::new(approval_workflow_repo.clone()),
            Arc::new(MockApprovalInstanceRepository::new()),
            Arc::new(document_repo.clone()),
            notification.clone(),
            execution.clone(),
            clock.clone(),
        ));
        let runner = ScheduledJobsRunner::new(
            execution.clone(),
            approval.clone(),
            notification,
            clock.clone(),
            ChronoDuration::days(30),
            Duration::from_secs(900),
        );

        RepairFlowSystem {
            definitions: WorkflowDefinitionUseCaseImpl::new(
                Arc::new(definition_repo),
                clock.clone(),
            ),
            configuration,
            execution,
            approval,
            documents: DocumentUseCaseImpl::new(Arc::new(document_repo), clock.clone()),
            runner,
            approval_workflow_repo,
            instance_repo,
            sender,
            clock,
        }
    }
}
