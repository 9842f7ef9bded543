//! # ワークフロー定義ユースケース
//!
//! 定義 JSON のバリデーション、バージョン付きの登録、公開・アーカイブと検索を実装する。
//!
//! 定義は名前 + バージョンで一意。公開済みの定義は変更できず、管理者による修正は
//! 同じ名前で新しいバージョンとして登録する。

use std::sync::Arc;

use repairflow_domain::{
    clock::Clock,
    value_objects::{Version, WorkflowName},
    workflow::{
        NewWorkflowDefinition,
        ValidationResult,
        WorkflowDefinition,
        WorkflowDefinitionId,
        WorkflowGraph,
        validate_definition,
    },
};
use repairflow_infra::repository::WorkflowDefinitionRepository;
use repairflow_shared::{event_log::event, log_business_event};
use serde_json::Value as JsonValue;

use super::helpers::FindResultExt;
use crate::error::CoreError;

/// ワークフロー定義ユースケース
pub struct WorkflowDefinitionUseCaseImpl {
    definition_repo: Arc<dyn WorkflowDefinitionRepository>,
    clock:           Arc<dyn Clock>,
}

impl WorkflowDefinitionUseCaseImpl {
    pub fn new(
        definition_repo: Arc<dyn WorkflowDefinitionRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            definition_repo,
            clock,
        }
    }

    /// 定義を新しいバージョンとして登録する（Draft 状態）
    ///
    /// バージョンは同じ名前の最新バージョン + 1（初回は 1）。
    pub async fn register(
        &self,
        name: WorkflowName,
        definition: &JsonValue,
        metadata: JsonValue,
    ) -> Result<WorkflowDefinition, CoreError> {
        let graph = WorkflowGraph::parse(definition)?;

        let latest = self
            .definition_repo
            .latest_version(&name)
            .await
            .map_err(|e| CoreError::Internal(format!("定義バージョンの取得に失敗: {}", e)))?;
        let version = latest.map_or_else(Version::initial, |v| v.next());

        let def = WorkflowDefinition::new(NewWorkflowDefinition {
            id: WorkflowDefinitionId::new(),
            name,
            version,
            metadata,
            graph,
            now: self.clock.now(),
        });

        self.definition_repo.insert(&def).await.map_err(|e| match e.as_conflict() {
            Some(_) => CoreError::Conflict(format!(
                "{} のバージョン {} は既に登録されています",
                def.name(),
                def.version()
            )),
            None => CoreError::Internal(format!("定義の保存に失敗: {}", e)),
        })?;

        log_business_event!(
            event.category = event::category::WORKFLOW,
            event.action = event::action::DEFINITION_REGISTERED,
            event.entity_type = event::entity_type::WORKFLOW_DEFINITION,
            event.entity_id = %def.id(),
            event.result = event::result::SUCCESS,
            definition.name = %def.name(),
            definition.version = def.version().as_u32(),
            "ワークフロー定義を登録"
        );

        Ok(def)
    }

    /// 定義を公開（Draft → Published）
    pub async fn publish(&self, id: &WorkflowDefinitionId) -> Result<WorkflowDefinition, CoreError> {
        let existing = self.find_by_id(id).await?;
        let published = existing.published(self.clock.now())?;

        self.definition_repo
            .update(&published)
            .await
            .map_err(|e| CoreError::Internal(format!("定義の保存に失敗: {}", e)))?;

        log_business_event!(
            event.category = event::category::WORKFLOW,
            event.action = event::action::DEFINITION_PUBLISHED,
            event.entity_type = event::entity_type::WORKFLOW_DEFINITION,
            event.entity_id = %published.id(),
            event.result = event::result::SUCCESS,
            definition.name = %published.name(),
            definition.version = published.version().as_u32(),
            "ワークフロー定義を公開"
        );

        Ok(published)
    }

    /// 定義をアーカイブ（Draft / Published → Archived）
    ///
    /// アーカイブ済みの定義からは新しいインスタンスを開始できない。
    /// 実行中のインスタンスは定義のスナップショットを保持しているため影響を受けない。
    pub async fn archive(&self, id: &WorkflowDefinitionId) -> Result<WorkflowDefinition, CoreError> {
        let existing = self.find_by_id(id).await?;
        let archived = existing.archived(self.clock.now())?;

        self.definition_repo
            .update(&archived)
            .await
            .map_err(|e| CoreError::Internal(format!("定義の保存に失敗: {}", e)))?;

        log_business_event!(
            event.category = event::category::WORKFLOW,
            event.action = event::action::DEFINITION_ARCHIVED,
            event.entity_type = event::entity_type::WORKFLOW_DEFINITION,
            event.entity_id = %archived.id(),
            event.result = event::result::SUCCESS,
            "ワークフロー定義をアーカイブ"
        );

        Ok(archived)
    }

    /// 名前とバージョンで定義を取得
    pub async fn find(
        &self,
        name: &WorkflowName,
        version: Version,
    ) -> Result<WorkflowDefinition, CoreError> {
        self.definition_repo
            .find_by_name_and_version(name, version)
            .await
            .or_not_found("ワークフロー定義")
    }

    /// 名前に対する最新の公開済み定義を取得
    pub async fn find_latest_published(
        &self,
        name: &WorkflowName,
    ) -> Result<WorkflowDefinition, CoreError> {
        self.definition_repo
            .find_latest_published(name)
            .await
            .or_not_found("公開済みのワークフロー定義")
    }

    /// ID で定義を取得
    pub async fn find_by_id(
        &self,
        id: &WorkflowDefinitionId,
    ) -> Result<WorkflowDefinition, CoreError> {
        self.definition_repo
            .find_by_id(id)
            .await
            .or_not_found("ワークフロー定義")
    }

    /// 定義 JSON のバリデーションのみ実行
    pub fn validate_definition_json(&self, definition: &JsonValue) -> ValidationResult {
        validate_definition(definition)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};
    use pretty_assertions::assert_eq;
    use repairflow_domain::{clock::FixedClock, workflow::WorkflowDefinitionStatus};
    use repairflow_infra::mock::MockWorkflowDefinitionRepository;
    use rstest::{fixture, rstest};
    use serde_json::json;

    use super::*;

    fn fixed_now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[fixture]
    fn usecase() -> WorkflowDefinitionUseCaseImpl {
        let repo = Arc::new(MockWorkflowDefinitionRepository::new());
        let clock = Arc::new(FixedClock::new(fixed_now()));
        WorkflowDefinitionUseCaseImpl::new(repo, clock)
    }

    fn valid_definition_json() -> JsonValue {
        json!({
            "start_event": "start",
            "end_events": ["end"],
            "steps": [
                {"id": "start", "name": "開始", "type": "start_event",
                 "transitions": [{"to": "diagnosis"}]},
                {"id": "diagnosis", "name": "診断", "type": "manual",
                 "transitions": [{"to": "end", "condition": "diagnosis.status == 'done'"}]},
                {"id": "end", "name": "完了", "type": "end_event"}
            ]
        })
    }

    fn name() -> WorkflowName {
        WorkflowName::new("smartphone_repair").unwrap()
    }

    #[rstest]
    #[tokio::test]
    async fn test_登録するとdraft状態のバージョン1になる(usecase: WorkflowDefinitionUseCaseImpl) {
        let def = usecase
            .register(name(), &valid_definition_json(), json!({"category": "repair"}))
            .await
            .unwrap();

        assert_eq!(def.status(), WorkflowDefinitionStatus::Draft);
        assert_eq!(def.version(), Version::initial());
        assert_eq!(def.metadata(), &json!({"category": "repair"}));
    }

    #[rstest]
    #[tokio::test]
    async fn test_同じ名前の再登録はバージョンが上がる(usecase: WorkflowDefinitionUseCaseImpl) {
        usecase
            .register(name(), &valid_definition_json(), json!({}))
            .await
            .unwrap();

        let second = usecase
            .register(name(), &valid_definition_json(), json!({}))
            .await
            .unwrap();

        assert_eq!(second.version(), Version::new(2).unwrap());
        let found = usecase.find(&name(), Version::new(2).unwrap()).await.unwrap();
        assert_eq!(found.id(), second.id());
    }

    #[rstest]
    #[tokio::test]
    async fn test_不正な定義はbadrequestになる(usecase: WorkflowDefinitionUseCaseImpl) {
        let invalid = json!({
            "start_event": "start",
            "end_events": ["end"],
            "steps": [
                {"id": "start", "name": "開始", "type": "start_event",
                 "transitions": [{"to": "missing"}]},
                {"id": "end", "name": "完了", "type": "end_event"}
            ]
        });

        let result = usecase.register(name(), &invalid, json!({})).await;

        assert!(matches!(result, Err(CoreError::BadRequest(_))));
    }

    #[rstest]
    #[tokio::test]
    async fn test_公開すると最新の公開済み定義として取得できる(
        usecase: WorkflowDefinitionUseCaseImpl,
    ) {
        let v1 = usecase
            .register(name(), &valid_definition_json(), json!({}))
            .await
            .unwrap();
        usecase.publish(v1.id()).await.unwrap();
        usecase
            .register(name(), &valid_definition_json(), json!({}))
            .await
            .unwrap();

        let latest = usecase.find_latest_published(&name()).await.unwrap();

        assert_eq!(latest.id(), v1.id());
        assert_eq!(latest.status(), WorkflowDefinitionStatus::Published);
    }

    #[rstest]
    #[tokio::test]
    async fn test_二重公開はbadrequestになる(usecase: WorkflowDefinitionUseCaseImpl) {
        let def = usecase
            .register(name(), &valid_definition_json(), json!({}))
            .await
            .unwrap();
        usecase.publish(def.id()).await.unwrap();

        let result = usecase.publish(def.id()).await;

        assert!(matches!(result, Err(CoreError::BadRequest(_))));
    }

    #[rstest]
    #[tokio::test]
    async fn test_アーカイブすると公開済み定義として取得できない(
        usecase: WorkflowDefinitionUseCaseImpl,
    ) {
        let def = usecase
            .register(name(), &valid_definition_json(), json!({}))
            .await
            .unwrap();
        usecase.publish(def.id()).await.unwrap();

        let archived = usecase.archive(def.id()).await.unwrap();
        let result = usecase.find_latest_published(&name()).await;

        assert_eq!(archived.status(), WorkflowDefinitionStatus::Archived);
        assert!(matches!(result, Err(CoreError::NotFound(_))));
    }

    #[rstest]
    #[tokio::test]
    async fn test_存在しないidはnotfoundになる(usecase: WorkflowDefinitionUseCaseImpl) {
        let result = usecase.find_by_id(&WorkflowDefinitionId::new()).await;

        assert!(matches!(result, Err(CoreError::NotFound(_))));
    }

    #[rstest]
    fn test_バリデーションのみ実行できる(usecase: WorkflowDefinitionUseCaseImpl) {
        let result = usecase.validate_definition_json(&json!({"steps": []}));

        assert!(!result.valid);
        assert!(!result.errors.is_empty());
    }
}
