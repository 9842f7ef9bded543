//! # ワークフロー構成ユースケース
//!
//! 案件の属性から適用するワークフロー構成を選び、参照先の定義を解決する。
//! 選択規則そのものはドメイン層の [`select`] にある。

use std::sync::Arc;

use repairflow_domain::workflow::{
    SelectionCriteria,
    WorkflowConfiguration,
    WorkflowDefinition,
    WorkflowDefinitionStatus,
    select,
};
use repairflow_infra::repository::{WorkflowConfigurationRepository, WorkflowDefinitionRepository};

use crate::error::CoreError;

/// ワークフロー構成ユースケース
pub struct ConfigurationUseCaseImpl {
    configuration_repo: Arc<dyn WorkflowConfigurationRepository>,
    definition_repo:    Arc<dyn WorkflowDefinitionRepository>,
}

impl ConfigurationUseCaseImpl {
    pub fn new(
        configuration_repo: Arc<dyn WorkflowConfigurationRepository>,
        definition_repo: Arc<dyn WorkflowDefinitionRepository>,
    ) -> Self {
        Self {
            configuration_repo,
            definition_repo,
        }
    }

    /// 構成を保存する（新規・更新）
    pub async fn save(&self, configuration: &WorkflowConfiguration) -> Result<(), CoreError> {
        self.configuration_repo
            .save(configuration)
            .await
            .map_err(|e| CoreError::Internal(format!("ワークフロー構成の保存に失敗: {}", e)))
    }

    /// 条件に一致する構成と、その構成が参照する公開済み定義を返す
    ///
    /// 一致する構成がない場合、または参照先の定義が公開されていない場合は `None`。
    /// バージョン指定がなければ最新の公開済み定義を使う。
    pub async fn select_definition(
        &self,
        criteria: &SelectionCriteria,
    ) -> Result<Option<(WorkflowConfiguration, WorkflowDefinition)>, CoreError> {
        let configurations = self
            .configuration_repo
            .find_active()
            .await
            .map_err(|e| CoreError::Internal(format!("ワークフロー構成の取得に失敗: {}", e)))?;

        let Some(configuration) = select(&configurations, criteria) else {
            tracing::debug!(
                device_type = %criteria.device_type,
                service_type = %criteria.service_type,
                "一致するワークフロー構成がありません"
            );
            return Ok(None);
        };

        let definition = match configuration.definition_version {
            Some(version) => self
                .definition_repo
                .find_by_name_and_version(&configuration.definition_name, version)
                .await
                .map(|found| found.filter(|d| d.status() == WorkflowDefinitionStatus::Published)),
            None => {
                self.definition_repo
                    .find_latest_published(&configuration.definition_name)
                    .await
            }
        }
        .map_err(|e| CoreError::Internal(format!("ワークフロー定義の取得に失敗: {}", e)))?;

        let Some(definition) = definition else {
            tracing::warn!(
                configuration.name = %configuration.name,
                definition.name = %configuration.definition_name,
                "構成が参照する公開済みのワークフロー定義がありません"
            );
            return Ok(None);
        };

        Ok(Some((configuration.clone(), definition)))
    }
}
