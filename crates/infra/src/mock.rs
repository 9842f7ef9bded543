//! # テスト用モックリポジトリ
//!
//! ユースケーステストで使用するインメモリモックリポジトリと記録用の通知送信。
//! `test-utils` feature を有効にすることで、他クレートからも利用可能。
//!
//! ```toml
//! [dev-dependencies]
//! repairflow-infra = { workspace = true, features = ["test-utils"] }
//! ```
//!
//! 楽観的ロックは PostgreSQL 実装と同じく、バージョン不一致で `Conflict` を返す。

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use repairflow_domain::{
    approval::{ApprovalInstance, ApprovalInstanceId, ApprovalWorkflow, ApprovalWorkflowId},
    document::{Document, DocumentId, DocumentStatus},
    notification::{NotificationDelivery, NotificationError, NotificationLog, NotificationLogId},
    value_objects::{CaseId, Version, WorkflowName},
    workflow::{
        WorkflowConfiguration,
        WorkflowConfigurationId,
        WorkflowDefinition,
        WorkflowDefinitionId,
        WorkflowDefinitionStatus,
        WorkflowInstance,
        WorkflowInstanceId,
    },
};

use crate::{
    error::InfraError,
    notification::NotificationSender,
    repository::{
        ApprovalInstanceRepository,
        ApprovalWorkflowRepository,
        DocumentRepository,
        NotificationLogRepository,
        WorkflowConfigurationRepository,
        WorkflowDefinitionRepository,
        WorkflowInstanceRepository,
    },
};

// ===== MockWorkflowDefinitionRepository =====

#[derive(Clone, Default)]
pub struct MockWorkflowDefinitionRepository {
    definitions: Arc<Mutex<Vec<WorkflowDefinition>>>,
}

impl MockWorkflowDefinitionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_definition(&self, def: WorkflowDefinition) {
        self.definitions.lock().unwrap().push(def);
    }
}

#[async_trait]
impl WorkflowDefinitionRepository for MockWorkflowDefinitionRepository {
    async fn insert(&self, definition: &WorkflowDefinition) -> Result<(), InfraError> {
        let mut definitions = self.definitions.lock().unwrap();
        if definitions
            .iter()
            .any(|d| d.name() == definition.name() && d.version() == definition.version())
        {
            return Err(InfraError::conflict(
                "WorkflowDefinition",
                format!("{} {}", definition.name(), definition.version()),
            ));
        }
        definitions.push(definition.clone());
        Ok(())
    }

    async fn update(&self, definition: &WorkflowDefinition) -> Result<(), InfraError> {
        let mut definitions = self.definitions.lock().unwrap();
        if let Some(pos) = definitions.iter().position(|d| d.id() == definition.id()) {
            definitions[pos] = definition.clone();
        }
        Ok(())
    }

    async fn find_by_id(
        &self,
        id: &WorkflowDefinitionId,
    ) -> Result<Option<WorkflowDefinition>, InfraError> {
        Ok(self
            .definitions
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.id() == id)
            .cloned())
    }

    async fn find_by_name_and_version(
        &self,
        name: &WorkflowName,
        version: Version,
    ) -> Result<Option<WorkflowDefinition>, InfraError> {
        Ok(self
            .definitions
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.name() == name && d.version() == version)
            .cloned())
    }

    async fn find_latest_published(
        &self,
        name: &WorkflowName,
    ) -> Result<Option<WorkflowDefinition>, InfraError> {
        Ok(self
            .definitions
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.name() == name && d.status() == WorkflowDefinitionStatus::Published)
            .max_by_key(|d| d.version())
            .cloned())
    }

    async fn latest_version(&self, name: &WorkflowName) -> Result<Option<Version>, InfraError> {
        Ok(self
            .definitions
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.name() == name)
            .map(WorkflowDefinition::version)
            .max())
    }
}

// ===== MockWorkflowConfigurationRepository =====

#[derive(Clone, Default)]
pub struct MockWorkflowConfigurationRepository {
    configurations: Arc<Mutex<Vec<WorkflowConfiguration>>>,
}

impl MockWorkflowConfigurationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowConfigurationRepository for MockWorkflowConfigurationRepository {
    async fn save(&self, configuration: &WorkflowConfiguration) -> Result<(), InfraError> {
        let mut configurations = self.configurations.lock().unwrap();
        match configurations.iter().position(|c| c.id == configuration.id) {
            Some(pos) => configurations[pos] = configuration.clone(),
            None => configurations.push(configuration.clone()),
        }
        Ok(())
    }

    async fn find_by_id(
        &self,
        id: &WorkflowConfigurationId,
    ) -> Result<Option<WorkflowConfiguration>, InfraError> {
        Ok(self
            .configurations
            .lock()
            .unwrap()
            .iter()
            .find(|c| &c.id == id)
            .cloned())
    }

    async fn find_active(&self) -> Result<Vec<WorkflowConfiguration>, InfraError> {
        Ok(self
            .configurations
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.is_active)
            .cloned()
            .collect())
    }
}

// ===== MockWorkflowInstanceRepository =====

/// `conflict_next_updates` で指定した回数だけ更新を競合させられる。
#[derive(Clone, Default)]
pub struct MockWorkflowInstanceRepository {
    instances:      Arc<Mutex<Vec<WorkflowInstance>>>,
    conflicts_left: Arc<Mutex<u32>>,
}

impl MockWorkflowInstanceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 次の `count` 回の楽観ロック付き更新を競合させる
    pub fn conflict_next_updates(&self, count: u32) {
        *self.conflicts_left.lock().unwrap() = count;
    }

    /// 保存済みの全インスタンス（テストの検証用）
    pub fn all(&self) -> Vec<WorkflowInstance> {
        self.instances.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkflowInstanceRepository for MockWorkflowInstanceRepository {
    async fn insert(&self, instance: &WorkflowInstance) -> Result<(), InfraError> {
        self.instances.lock().unwrap().push(instance.clone());
        Ok(())
    }

    async fn update_with_version_check(
        &self,
        instance: &WorkflowInstance,
        expected_version: Version,
    ) -> Result<(), InfraError> {
        {
            let mut conflicts_left = self.conflicts_left.lock().unwrap();
            if *conflicts_left > 0 {
                *conflicts_left -= 1;
                return Err(InfraError::conflict("WorkflowInstance", instance.id().to_string()));
            }
        }
        let mut instances = self.instances.lock().unwrap();
        let pos = instances
            .iter()
            .position(|i| i.id() == instance.id() && i.version() == expected_version)
            .ok_or_else(|| InfraError::conflict("WorkflowInstance", instance.id().to_string()))?;
        instances[pos] = instance.clone();
        Ok(())
    }

    async fn find_by_id(
        &self,
        id: &WorkflowInstanceId,
    ) -> Result<Option<WorkflowInstance>, InfraError> {
        Ok(self
            .instances
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.id() == id)
            .cloned())
    }

    async fn find_running(&self) -> Result<Vec<WorkflowInstance>, InfraError> {
        Ok(self
            .instances
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.is_running())
            .cloned()
            .collect())
    }

    async fn find_running_by_case(
        &self,
        case_id: &CaseId,
    ) -> Result<Vec<WorkflowInstance>, InfraError> {
        Ok(self
            .instances
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.case_id() == case_id && i.is_running())
            .cloned()
            .collect())
    }
}

// ===== MockApprovalWorkflowRepository =====

#[derive(Clone, Default)]
pub struct MockApprovalWorkflowRepository {
    workflows: Arc<Mutex<Vec<ApprovalWorkflow>>>,
}

impl MockApprovalWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApprovalWorkflowRepository for MockApprovalWorkflowRepository {
    async fn save(&self, workflow: &ApprovalWorkflow) -> Result<(), InfraError> {
        let mut workflows = self.workflows.lock().unwrap();
        match workflows.iter().position(|w| w.id == workflow.id) {
            Some(pos) => workflows[pos] = workflow.clone(),
            None => workflows.push(workflow.clone()),
        }
        Ok(())
    }

    async fn find_by_id(
        &self,
        id: &ApprovalWorkflowId,
    ) -> Result<Option<ApprovalWorkflow>, InfraError> {
        Ok(self
            .workflows
            .lock()
            .unwrap()
            .iter()
            .find(|w| &w.id == id)
            .cloned())
    }
}

// ===== MockApprovalInstanceRepository =====

#[derive(Clone, Default)]
pub struct MockApprovalInstanceRepository {
    instances: Arc<Mutex<Vec<ApprovalInstance>>>,
}

impl MockApprovalInstanceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 保存済みの全インスタンス（テストの検証用）
    pub fn all(&self) -> Vec<ApprovalInstance> {
        self.instances.lock().unwrap().clone()
    }
}

#[async_trait]
impl ApprovalInstanceRepository for MockApprovalInstanceRepository {
    async fn insert(&self, instance: &ApprovalInstance) -> Result<(), InfraError> {
        let mut instances = self.instances.lock().unwrap();
        // 決裁待ちは文書ごとに 1 件（部分ユニークインデックス相当）
        if !instance.is_terminal()
            && instances
                .iter()
                .any(|i| i.document_id() == instance.document_id() && !i.is_terminal())
        {
            return Err(InfraError::conflict(
                "ApprovalInstance",
                instance.document_id().to_string(),
            ));
        }
        instances.push(instance.clone());
        Ok(())
    }

    async fn update_with_version_check(
        &self,
        instance: &ApprovalInstance,
        expected_version: Version,
    ) -> Result<(), InfraError> {
        let mut instances = self.instances.lock().unwrap();
        let pos = instances
            .iter()
            .position(|i| i.id() == instance.id() && i.version() == expected_version)
            .ok_or_else(|| InfraError::conflict("ApprovalInstance", instance.id().to_string()))?;
        instances[pos] = instance.clone();
        Ok(())
    }

    async fn find_by_id(
        &self,
        id: &ApprovalInstanceId,
    ) -> Result<Option<ApprovalInstance>, InfraError> {
        Ok(self
            .instances
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.id() == id)
            .cloned())
    }

    async fn find_open(&self) -> Result<Vec<ApprovalInstance>, InfraError> {
        Ok(self
            .instances
            .lock()
            .unwrap()
            .iter()
            .filter(|i| !i.is_terminal())
            .cloned()
            .collect())
    }

    async fn find_open_by_document(
        &self,
        document_id: &DocumentId,
    ) -> Result<Option<ApprovalInstance>, InfraError> {
        Ok(self
            .instances
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.document_id() == document_id && !i.is_terminal())
            .cloned())
    }
    async fn find_with_pending_patch(&self) -> Result<Vec<ApprovalInstance>, InfraError> {
        Ok(self
            .instances
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.pending_patch().is_some())
            .cloned()
            .collect())
    }
}

// ===== MockDocumentRepository =====

#[derive(Clone, Default)]
pub struct MockDocumentRepository {
    documents: Arc<Mutex<Vec<Document>>>,
}

impl MockDocumentRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentRepository for MockDocumentRepository {
    async fn find_by_id(&self, id: &DocumentId) -> Result<Option<Document>, InfraError> {
        Ok(self
            .documents
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.id() == id)
            .cloned())
    }

    async fn find_by_case_and_type(
        &self,
        case_id: &CaseId,
        document_type_id: &str,
    ) -> Result<Option<Document>, InfraError> {
        Ok(self
            .documents
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.case_id() == case_id && d.document_type_id() == document_type_id)
            .max_by_key(|d| d.created_at())
            .cloned())
    }

    async fn insert(&self, document: &Document) -> Result<(), InfraError> {
        self.documents.lock().unwrap().push(document.clone());
        Ok(())
    }

    async fn update_status(
        &self,
        id: &DocumentId,
        status: DocumentStatus,
        now: DateTime<Utc>,
    ) -> Result<(), InfraError> {
        let mut documents = self.documents.lock().unwrap();
        if let Some(pos) = documents.iter().position(|d| d.id() == id) {
            let updated = documents[pos].clone().with_status(status, now);
            documents[pos] = updated;
        }
        Ok(())
    }
}

// ===== MockNotificationLogRepository =====

#[derive(Clone, Default)]
pub struct MockNotificationLogRepository {
    logs: Arc<Mutex<Vec<NotificationLog>>>,
}

impl MockNotificationLogRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 保存済みの全ログ（テストの検証用）
    pub fn all(&self) -> Vec<NotificationLog> {
        self.logs.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationLogRepository for MockNotificationLogRepository {
    async fn insert(&self, log: &NotificationLog) -> Result<(), InfraError> {
        self.logs.lock().unwrap().push(log.clone());
        Ok(())
    }

    async fn update(&self, log: &NotificationLog) -> Result<(), InfraError> {
        let mut logs = self.logs.lock().unwrap();
        if let Some(pos) = logs.iter().position(|l| l.id() == log.id()) {
            logs[pos] = log.clone();
        }
        Ok(())
    }

    async fn find_by_id(
        &self,
        id: &NotificationLogId,
    ) -> Result<Option<NotificationLog>, InfraError> {
        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .find(|l| l.id() == id)
            .cloned())
    }

    async fn find_retry_due(&self, now: DateTime<Utc>) -> Result<Vec<NotificationLog>, InfraError> {
        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.is_retry_due(now))
            .cloned()
            .collect())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, InfraError> {
        let mut logs = self.logs.lock().unwrap();
        let before = logs.len();
        logs.retain(|l| l.created_at() >= cutoff);
        Ok((before - logs.len()) as u64)
    }
}

// ===== RecordingNotificationSender =====

/// 送信内容を記録する通知送信
///
/// `fail_next` で指定した回数だけ送信を失敗させられる。
#[derive(Clone, Default)]
pub struct RecordingNotificationSender {
    sent:          Arc<Mutex<Vec<NotificationDelivery>>>,
    failures_left: Arc<Mutex<u32>>,
}

impl RecordingNotificationSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// 次の `count` 回の送信を失敗させる
    pub fn fail_next(&self, count: u32) {
        *self.failures_left.lock().unwrap() = count;
    }

    /// 送信に成功した配信メッセージ
    pub fn sent(&self) -> Vec<NotificationDelivery> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSender for RecordingNotificationSender {
    async fn send(&self, delivery: &NotificationDelivery) -> Result<(), NotificationError> {
        {
            let mut failures_left = self.failures_left.lock().unwrap();
            if *failures_left > 0 {
                *failures_left -= 1;
                return Err(NotificationError::SendFailed(
                    "テスト用の送信失敗".to_string(),
                ));
            }
        }
        self.sent.lock().unwrap().push(delivery.clone());
        Ok(())
    }
}
