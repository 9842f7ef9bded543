//! # インスタンスコンテキスト
//!
//! ワークフローインスタンスが保持する JSON コンテキストの操作と、
//! 承認エンジンからワークフロー実行エンジンへ渡すコンテキストパッチを定義する。
//!
//! 2 つのステートマシンは互いの内部状態を直接読まない。承認の終了は
//! [`ContextPatch`] として発行され、案件ワークフロー側はそれをイベントペイロードとして
//! コンテキストにマージしたうえで遷移条件を評価する。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::{document::DocumentId, value_objects::CaseId};

/// 承認結果などを案件ワークフローのコンテキストに反映するためのパッチ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPatch {
    pub case_id:     CaseId,
    pub document_id: DocumentId,
    /// マージするオブジェクト（例: `{"quotation": {"status": "approved"}}`）
    pub patch:       JsonValue,
}

/// `patch` を `target` に再帰的にマージする
///
/// 両方がオブジェクトのキーは再帰的にマージし、それ以外は上書きする。
/// `target` がオブジェクトでない場合は空オブジェクトとして扱う。
pub fn deep_merge(target: &mut JsonValue, patch: &JsonValue) {
    let JsonValue::Object(patch_map) = patch else {
        return;
    };
    if !target.is_object() {
        *target = JsonValue::Object(Map::new());
    }
    let Some(target_map) = target.as_object_mut() else {
        return;
    };
    for (key, value) in patch_map {
        let nested = value.is_object() && target_map.get(key).is_some_and(JsonValue::is_object);
        if nested {
            if let Some(existing) = target_map.get_mut(key) {
                deep_merge(existing, value);
            }
        } else {
            target_map.insert(key.clone(), value.clone());
        }
    }
}

/// ドット区切りのパスに値を設定する
///
/// 途中のオブジェクトが存在しなければ作成する。
pub fn set_path(target: &mut JsonValue, path: &str, value: JsonValue) {
    let mut current = target;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if !current.is_object() {
            *current = JsonValue::Object(Map::new());
        }
        let Some(map) = current.as_object_mut() else {
            return;
        };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| JsonValue::Object(Map::new()));
    }
}
