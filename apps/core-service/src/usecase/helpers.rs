//! ユースケース層の共通ヘルパー
//!
//! リポジトリ呼び出し結果の変換など、複数のユースケースで繰り返されるパターンを共通化する。

use repairflow_infra::InfraError;

use crate::error::CoreError;

/// リポジトリの `Result<Option<T>, InfraError>` を `Result<T, CoreError>` に変換する
///
/// `find_by_id` 等の `Option` を返すリポジトリメソッドの結果を、
/// `CoreError::NotFound` または `CoreError::Internal` に変換する。
///
/// ```ignore
/// let instance = self.instance_repo.find_by_id(&id).await
///     .or_not_found("ワークフローインスタンス")?;
/// ```
pub(crate) trait FindResultExt<T> {
    /// `None` の場合は `CoreError::NotFound`、`InfraError` の場合は `CoreError::Internal` を返す
    fn or_not_found(self, entity_name: &str) -> Result<T, CoreError>;
}

impl<T> FindResultExt<T> for Result<Option<T>, InfraError> {
    fn or_not_found(self, entity_name: &str) -> Result<T, CoreError> {
        self.map_err(|e| CoreError::Internal(format!("{}の取得に失敗: {}", entity_name, e)))?
            .ok_or_else(|| CoreError::NotFound(format!("{}が見つかりません", entity_name)))
    }
}

/// 楽観的ロック付き更新の結果を `CoreError` に変換する
///
/// バージョン不一致は `CoreError::Conflict`、それ以外は `CoreError::Internal` にする。
pub(crate) fn map_version_conflict(entity_name: &str) -> impl Fn(InfraError) -> CoreError + '_ {
    move |e| match e.as_conflict() {
        Some(_) => CoreError::Conflict(format!(
            "この{}は既に更新されています。最新の状態を取得してください。",
            entity_name
        )),
        None => CoreError::Internal(format!("{}の保存に失敗: {}", entity_name, e)),
    }
}
