//! # ワークフロー構成の選択
//!
//! 案件の属性（端末種別・サービス種別・顧客ランク・追加コンテキスト）から、
//! 適用するワークフロー定義を決める構成レコードと選択ロジックを定義する。
//!
//! ## 選択規則
//!
//! 1. 無効な構成は対象外
//! 2. 端末種別・サービス種別・顧客ランクのリストは、空ならワイルドカード、
//!    そうでなければ案件の値を含む必要がある
//! 3. `conditions` はすべて成立する必要がある
//! 4. 優先度の高いものが勝ち、同値なら作成日時の新しいもの、さらに同値なら ID の大きいもの

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::{
    condition::Condition,
    value_objects::{Version, WorkflowName},
};

define_uuid_id! {
    /// ワークフロー構成 ID
    pub struct WorkflowConfigurationId;
}

/// ワークフロー構成
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfiguration {
    pub id:                 WorkflowConfigurationId,
    pub name:               String,
    pub definition_name:    WorkflowName,
    /// 未指定の場合は最新の公開済みバージョンを使う
    #[serde(default)]
    pub definition_version: Option<Version>,
    #[serde(default)]
    pub device_types:       Vec<String>,
    #[serde(default)]
    pub service_types:      Vec<String>,
    #[serde(default)]
    pub customer_tiers:     Vec<String>,
    /// 追加コンテキストに対して評価する条件
    #[serde(default)]
    pub conditions:         Vec<Condition>,
    #[serde(default)]
    pub priority:           i32,
    #[serde(default = "default_active")]
    pub is_active:          bool,
    pub created_at:         DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

/// 選択条件（案件の属性）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionCriteria {
    pub device_type:        String,
    pub service_type:       String,
    #[serde(default)]
    pub customer_tier:      Option<String>,
    #[serde(default)]
    pub additional_context: JsonValue,
}

impl SelectionCriteria {
    /// 条件評価用のコンテキスト
    ///
    /// 追加コンテキストに、案件の属性を `device_type` などのキーで重ねたもの。
    pub fn evaluation_context(&self) -> JsonValue {
        let mut map = match &self.additional_context {
            JsonValue::Object(map) => map.clone(),
            _ => Map::new(),
        };
        map.insert(
            "device_type".to_string(),
            JsonValue::String(self.device_type.clone()),
        );
        map.insert(
            "service_type".to_string(),
            JsonValue::String(self.service_type.clone()),
        );
        if let Some(tier) = &self.customer_tier {
            map.insert("customer_tier".to_string(), JsonValue::String(tier.clone()));
        }
        JsonValue::Object(map)
    }
}

/// 空リストはワイルドカード
fn list_matches(list: &[String], value: Option<&str>) -> bool {
    list.is_empty() || value.is_some_and(|v| list.iter().any(|item| item == v))
}

impl WorkflowConfiguration {
    /// 選択条件に一致するか
    pub fn matches(&self, criteria: &SelectionCriteria) -> bool {
        if !self.is_active {
            return false;
        }
        if !list_matches(&self.device_types, Some(&criteria.device_type))
            || !list_matches(&self.service_types, Some(&criteria.service_type))
            || !list_matches(&self.customer_tiers, criteria.customer_tier.as_deref())
        {
            return false;
        }
        if self.conditions.is_empty() {
            return true;
        }
        let context = criteria.evaluation_context();
        self.conditions.iter().all(|c| c.evaluate(&context))
    }

    /// 選択順位の比較（大きいほうが優先）
    fn precedence(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.id.as_uuid().cmp(other.id.as_uuid()))
    }
}

/// 条件に一致する構成のうち最優先のものを返す
///
/// 一致するものがなければ `None`。
pub fn select<'a>(
    configurations: &'a [WorkflowConfiguration],
    criteria: &SelectionCriteria,
) -> Option<&'a WorkflowConfiguration> {
    configurations
        .iter()
        .filter(|c| c.matches(criteria))
        .max_by(|a, b| a.precedence(b))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::{fixture, rstest};
    use serde_json::json;

    use super::*;

    #[fixture]
    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn config(name: &str, priority: i32, created_at: DateTime<Utc>) -> WorkflowConfiguration {
        WorkflowConfiguration {
            id: WorkflowConfigurationId::new(),
            name: name.to_string(),
            definition_name: WorkflowName::new(format!("{name}_flow")).unwrap(),
            definition_version: None,
            device_types: Vec::new(),
            service_types: Vec::new(),
            customer_tiers: Vec::new(),
            conditions: Vec::new(),
            priority,
            is_active: true,
            created_at,
        }
    }

    fn criteria(device: &str, service: &str, tier: Option<&str>) -> SelectionCriteria {
        SelectionCriteria {
            device_type:        device.to_string(),
            service_type:       service.to_string(),
            customer_tier:      tier.map(str::to_string),
            additional_context: json!({}),
        }
    }

    #[rstest]
    fn test_優先度の高い構成が選ばれる(now: DateTime<Utc>) {
        let mut general = config("general", 0, now);
        general.device_types = vec!["smartphone".to_string()];
        let mut premium = config("premium", 10, now);
        premium.customer_tiers = vec!["premium".to_string()];
        let configs = vec![general, premium];

        let premium_case = select(&configs, &criteria("smartphone", "repair", Some("premium")));
        let normal_case = select(&configs, &criteria("smartphone", "repair", Some("standard")));

        assert_eq!(premium_case.unwrap().name, "premium");
        assert_eq!(normal_case.unwrap().name, "general");
    }

    #[rstest]
    fn test_空リストはワイルドカードとして一致する(now: DateTime<Utc>) {
        let configs = vec![config("fallback", 0, now)];

        let result = select(&configs, &criteria("tablet", "battery", None));

        assert_eq!(result.unwrap().name, "fallback");
    }

    #[rstest]
    fn test_顧客ランク未指定の案件はランク指定の構成に一致しない(now: DateTime<Utc>) {
        let mut premium = config("premium", 10, now);
        premium.customer_tiers = vec!["premium".to_string()];
        let configs = vec![premium];

        let result = select(&configs, &criteria("smartphone", "repair", None));

        assert_eq!(result, None);
    }

    #[rstest]
    fn test_無効な構成は選ばれない(now: DateTime<Utc>) {
        let mut inactive = config("inactive", 100, now);
        inactive.is_active = false;
        let configs = vec![inactive, config("active", 0, now)];

        let result = select(&configs, &criteria("smartphone", "repair", None));

        assert_eq!(result.unwrap().name, "active");
    }

    #[rstest]
    fn test_同じ優先度なら新しい構成が選ばれる(now: DateTime<Utc>) {
        let older = config("older", 5, now);
        let newer = config("newer", 5, now + chrono::Duration::days(1));
        let configs = vec![newer, older];

        let result = select(&configs, &criteria("smartphone", "repair", None));

        assert_eq!(result.unwrap().name, "newer");
    }

    #[rstest]
    fn test_追加条件は追加コンテキストに対して評価される(now: DateTime<Utc>) {
        let mut water = config("water_damage", 20, now);
        water.conditions = vec![Condition::parse("damage.water == true").unwrap()];
        let configs = vec![water, config("general", 0, now)];
        let mut wet = criteria("smartphone", "repair", None);
        wet.additional_context = json!({"damage": {"water": true}});

        let wet_result = select(&configs, &wet);
        let dry_result = select(&configs, &criteria("smartphone", "repair", None));

        assert_eq!(wet_result.unwrap().name, "water_damage");
        assert_eq!(dry_result.unwrap().name, "general");
    }

    #[rstest]
    fn test_条件から案件の属性も参照できる(now: DateTime<Utc>) {
        let mut laptops = config("laptop_only", 1, now);
        laptops.conditions = vec![Condition::parse("device_type in [laptop, tablet]").unwrap()];
        let configs = vec![laptops];

        assert!(select(&configs, &criteria("laptop", "repair", None)).is_some());
        assert!(select(&configs, &criteria("smartphone", "repair", None)).is_none());
    }

    #[rstest]
    fn test_一致する構成がなければnone(now: DateTime<Utc>) {
        let mut laptop = config("laptop", 0, now);
        laptop.device_types = vec!["laptop".to_string()];

        let configurations = [laptop];
        let result = select(&configurations, &criteria("smartphone", "repair", None));

        assert_eq!(result, None);
    }

    #[test]
    fn test_jsonから読み込める() {
        let value = json!({
            "id": "0190a0b0-0000-7000-8000-000000000001",
            "name": "premium",
            "definition_name": "premium_repair",
            "definition_version": 2,
            "customer_tiers": ["premium"],
            "conditions": ["warranty == true"],
            "priority": 10,
            "created_at": "2026-01-01T00:00:00Z"
        });

        let sut: WorkflowConfiguration = serde_json::from_value(value).unwrap();

        assert!(sut.is_active);
        assert_eq!(sut.definition_version, Some(Version::new(2).unwrap()));
        assert_eq!(sut.conditions[0].source(), "warranty == true");
    }
}
