//! WorkflowDefinitionRepository 統合テスト
//!
//! 実行方法:
//! ```bash
//! DATABASE_URL=postgres://... cargo test -p repairflow-infra --test workflow_definition_repository_test -- --ignored
//! ```

mod common;

use common::{create_test_definition, test_now};
use pretty_assertions::assert_eq;
use repairflow_domain::value_objects::{Version, WorkflowName};
use repairflow_infra::repository::{
    PostgresWorkflowDefinitionRepository,
    WorkflowDefinitionRepository,
};
use sqlx::PgPool;

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "PostgreSQL が必要"]
async fn test_同じ名前とバージョンの登録はconflict(pool: PgPool) {
    let sut = PostgresWorkflowDefinitionRepository::new(pool);
    sut.insert(&create_test_definition("smartphone_repair", 1))
        .await
        .unwrap();

    let result = sut
        .insert(&create_test_definition("smartphone_repair", 1))
        .await;

    assert!(result.unwrap_err().as_conflict().is_some());
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "PostgreSQL が必要"]
async fn test_最新の公開済み定義と最新バージョンを取得できる(pool: PgPool) {
    let sut = PostgresWorkflowDefinitionRepository::new(pool);
    let name = WorkflowName::new("smartphone_repair").unwrap();
    let v1 = create_test_definition("smartphone_repair", 1)
        .published(test_now())
        .unwrap();
    let v2 = create_test_definition("smartphone_repair", 2);
    sut.insert(&v1).await.unwrap();
    sut.insert(&v2).await.unwrap();

    let latest_published = sut.find_latest_published(&name).await.unwrap().unwrap();
    let latest_version = sut.latest_version(&name).await.unwrap();

    assert_eq!(latest_published.id(), v1.id());
    assert_eq!(latest_version, Some(Version::new(2).unwrap()));
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "PostgreSQL が必要"]
async fn test_未登録の名前はバージョンなし(pool: PgPool) {
    let sut = PostgresWorkflowDefinitionRepository::new(pool);

    let result = sut
        .latest_version(&WorkflowName::new("unknown").unwrap())
        .await
        .unwrap();

    assert_eq!(result, None);
}
