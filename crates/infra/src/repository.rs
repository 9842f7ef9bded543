//! # リポジトリ実装
//!
//! 集約ごとの永続化トレイトと PostgreSQL 実装を提供する。
//!
//! ## 設計方針
//!
//! - **トレイト + 実装**: ユースケース層はトレイトにのみ依存し、テストでは
//!   [`mock`](crate::mock) のインメモリ実装に差し替える
//! - **JSONB 本体**: 各集約は `XxxRecord` を `body` 列に保存し、検索に使う列だけを別に持つ
//! - **楽観的ロック**: インスタンス系の更新は `update_with_version_check` による compare-and-swap
//! - **一覧の復元は行単位**: 定期ジョブが使う一覧取得では、復元できない行をログに残して読み飛ばし、
//!   1 件の不正データで他の行の処理を止めない

pub mod approval_instance_repository;
pub mod approval_workflow_repository;
pub mod document_repository;
pub mod notification_log_repository;
pub mod workflow_configuration_repository;
pub mod workflow_definition_repository;
pub mod workflow_instance_repository;

pub use approval_instance_repository::{
    ApprovalInstanceRepository,
    PostgresApprovalInstanceRepository,
};
pub use approval_workflow_repository::{
    ApprovalWorkflowRepository,
    PostgresApprovalWorkflowRepository,
};
pub use document_repository::{DocumentRepository, PostgresDocumentRepository};
pub use notification_log_repository::{
    NotificationLogRepository,
    PostgresNotificationLogRepository,
};
pub use workflow_configuration_repository::{
    PostgresWorkflowConfigurationRepository,
    WorkflowConfigurationRepository,
};
pub use workflow_definition_repository::{
    PostgresWorkflowDefinitionRepository,
    WorkflowDefinitionRepository,
};
pub use workflow_instance_repository::{
    PostgresWorkflowInstanceRepository,
    WorkflowInstanceRepository,
};

use repairflow_domain::DomainError;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// `(id, body)` の行をエンティティに復元する
///
/// JSON の形式不正や `from_db` の検証エラーになった行は、ID をログに残して読み飛ばす。
pub(crate) fn restore_rows<R, T>(
    entity: &'static str,
    rows: Vec<(Uuid, JsonValue)>,
    from_db: impl Fn(R) -> Result<T, DomainError>,
) -> Vec<T>
where
    R: DeserializeOwned,
{
    rows.into_iter()
        .filter_map(|(id, body)| {
            let restored = serde_json::from_value::<R>(body)
                .map_err(|e| e.to_string())
                .and_then(|record| from_db(record).map_err(|e| e.to_string()));
            match restored {
                Ok(value) => Some(value),
                Err(error) => {
                    tracing::error!(
                        entity,
                        %id,
                        %error,
                        "復元できない行を読み飛ばしました"
                    );
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[derive(Debug, Deserialize)]
    struct CounterRecord {
        count: u32,
    }

    fn positive(record: CounterRecord) -> Result<u32, DomainError> {
        if record.count == 0 {
            return Err(DomainError::Validation("count は 1 以上".to_string()));
        }
        Ok(record.count)
    }

    #[test]
    fn test_復元できない行を読み飛ばして残りを返す() {
        let rows = vec![
            (Uuid::now_v7(), json!({"count": 1})),
            (Uuid::now_v7(), json!({"unexpected": true})),
            (Uuid::now_v7(), json!({"count": 0})),
            (Uuid::now_v7(), json!({"count": 3})),
        ];

        let restored = restore_rows("Counter", rows, positive);

        assert_eq!(restored, vec![1, 3]);
    }

    #[test]
    fn test_行がなければ空を返す() {
        let restored = restore_rows("Counter", Vec::new(), positive);

        assert!(restored.is_empty());
    }
}
