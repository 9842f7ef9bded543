//! # ワークフロー定義バリデーション
//!
//! 定義 JSON の構造的整合性を検証する。
//! 定義の登録時に自動実行され、型付きグラフへの変換前に不正な定義を弾く。
//!
//! 手動ステップを含む循環（見積の再作成ループなど）は正当な定義として許可する。
//! automatic ステップだけで閉じた循環は実行時にホップ上限で検出する。

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;
use serde_json::Value as JsonValue;

use super::{definition::WorkflowGraph, step::StepType};
use crate::condition::Condition;

/// バリデーション結果
#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub valid:  bool,
    pub errors: Vec<ValidationError>,
}

impl ValidationResult {
    /// エラーメッセージを 1 行にまとめる
    pub fn summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// 指定したコードのエラーを含むか
    pub fn has_error(&self, code: &str) -> bool {
        self.errors.iter().any(|e| e.code == code)
    }
}

/// バリデーションエラー
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub code:    String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

impl ValidationError {
    fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code:    code.into(),
            message: message.into(),
            step_id: None,
        }
    }

    fn with_step_id(
        code: impl Into<String>,
        message: impl Into<String>,
        step_id: impl Into<String>,
    ) -> Self {
        Self {
            code:    code.into(),
            message: message.into(),
            step_id: Some(step_id.into()),
        }
    }
}

/// ワークフロー定義 JSON をバリデーションする
///
/// すべてのルールを順に検証し、エラーをすべて収集して返す。
pub fn validate_definition(definition: &JsonValue) -> ValidationResult {
    let mut errors = Vec::new();

    if get_steps(definition).is_none_or(Vec::is_empty) {
        errors.push(ValidationError::new(
            "missing_steps",
            "steps に 1 つ以上のステップが必要です",
        ));
        return ValidationResult {
            valid: false,
            errors,
        };
    }

    validate_step_ids(definition, &mut errors);
    validate_step_types(definition, &mut errors);
    validate_start_step(definition, &mut errors);
    validate_end_steps(definition, &mut errors);
    validate_transition_references(definition, &mut errors);
    validate_auto_steps_have_transitions(definition, &mut errors);
    validate_conditions(definition, &mut errors);
    validate_escalation_rules(definition, &mut errors);
    validate_no_orphans(definition, &mut errors);

    // 個別ルールを通過した場合のみ、型付きグラフへの変換可否を確認する
    if errors.is_empty()
        && let Err(e) = serde_json::from_value::<WorkflowGraph>(definition.clone())
    {
        errors.push(ValidationError::new(
            "invalid_structure",
            format!("定義の構造が不正です: {e}"),
        ));
    }

    ValidationResult {
        valid: errors.is_empty(),
        errors,
    }
}

/// steps 配列を安全に取得するヘルパー
fn get_steps(definition: &JsonValue) -> Option<&Vec<JsonValue>> {
    definition.get("steps").and_then(|v| v.as_array())
}

/// ステップの type を取得するヘルパー
fn step_type(step: &JsonValue) -> Option<&str> {
    step.get("type").and_then(|v| v.as_str())
}

/// ステップの id を取得するヘルパー
fn step_id(step: &JsonValue) -> Option<&str> {
    step.get("id").and_then(|v| v.as_str())
}

fn flag(step: &JsonValue, key: &str) -> bool {
    step.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

fn is_start(step: &JsonValue) -> bool {
    step_type(step) == Some("start_event") || flag(step, "is_start_step")
}

fn is_end(step: &JsonValue) -> bool {
    step_type(step) == Some("end_event") || flag(step, "is_end_step")
}

fn transitions(step: &JsonValue) -> impl Iterator<Item = &JsonValue> {
    step.get("transitions")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
}

fn transition_target(transition: &JsonValue) -> Option<&str> {
    transition.get("to").and_then(|v| v.as_str())
}

fn string_array<'a>(value: &'a JsonValue, key: &str) -> impl Iterator<Item = &'a JsonValue> {
    value.get(key).and_then(|v| v.as_array()).into_iter().flatten()
}

fn all_step_ids(definition: &JsonValue) -> HashSet<&str> {
    get_steps(definition)
        .into_iter()
        .flatten()
        .filter_map(step_id)
        .collect()
}

// --- バリデーションルール ---

/// ステップ ID の存在と重複チェック
fn validate_step_ids(definition: &JsonValue, errors: &mut Vec<ValidationError>) {
    let Some(steps) = get_steps(definition) else {
        return;
    };
    let mut seen = HashSet::new();
    for (index, step) in steps.iter().enumerate() {
        let Some(id) = step_id(step) else {
            errors.push(ValidationError::new(
                "missing_step_id",
                format!("{} 番目のステップに id が必要です", index + 1),
            ));
            continue;
        };
        if !seen.insert(id) {
            errors.push(ValidationError::with_step_id(
                "duplicate_step_id",
                format!("ステップ ID '{id}' が重複しています"),
                id,
            ));
        }
    }
}

/// ステップ種別の有効性チェック
fn validate_step_types(definition: &JsonValue, errors: &mut Vec<ValidationError>) {
    let Some(steps) = get_steps(definition) else {
        return;
    };
    for step in steps {
        let id = step_id(step).unwrap_or("?");
        match step_type(step) {
            None => errors.push(ValidationError::with_step_id(
                "invalid_step_type",
                format!("ステップ '{id}' に type が必要です"),
                id,
            )),
            Some(t) if t.parse::<StepType>().is_err() => {
                errors.push(ValidationError::with_step_id(
                    "invalid_step_type",
                    format!("ステップ '{id}' の type '{t}' は無効です"),
                    id,
                ));
            }
            Some(_) => {}
        }
    }
}

/// 開始ステップが正確に 1 つで、start_event と一致すること
fn validate_start_step(definition: &JsonValue, errors: &mut Vec<ValidationError>) {
    let Some(steps) = get_steps(definition) else {
        return;
    };
    let starts: Vec<&JsonValue> = steps.iter().filter(|s| is_start(s)).collect();
    match starts.len() {
        0 => errors.push(ValidationError::new(
            "missing_start_step",
            "開始ステップが必要です",
        )),
        1 => {}
        _ => errors.push(ValidationError::new(
            "multiple_start_steps",
            "開始ステップは 1 つのみ許可されます",
        )),
    }

    let Some(start_event) = definition.get("start_event").and_then(|v| v.as_str()) else {
        return;
    };
    let is_valid = starts.iter().any(|s| step_id(s) == Some(start_event));
    if !is_valid {
        errors.push(ValidationError::with_step_id(
            "invalid_start_event",
            format!("start_event '{start_event}' は開始ステップではありません"),
            start_event,
        ));
    }
}

/// 終了ステップが 1 つ以上存在し、遷移を持たないこと
fn validate_end_steps(definition: &JsonValue, errors: &mut Vec<ValidationError>) {
    let Some(steps) = get_steps(definition) else {
        return;
    };
    let ends: Vec<&JsonValue> = steps.iter().filter(|s| is_end(s)).collect();
    if ends.is_empty() {
        errors.push(ValidationError::new(
            "missing_end_step",
            "終了ステップが必要です",
        ));
    }

    for step in &ends {
        if transitions(step).next().is_some() {
            let id = step_id(step).unwrap_or("?");
            errors.push(ValidationError::with_step_id(
                "end_step_has_transitions",
                format!("終了ステップ '{id}' は遷移を持てません"),
                id,
            ));
        }
    }

    let end_ids: HashSet<&str> = ends.iter().filter_map(|s| step_id(s)).collect();
    for end_event in string_array(definition, "end_events") {
        let Some(id) = end_event.as_str() else {
            continue;
        };
        if !end_ids.contains(id) {
            errors.push(ValidationError::with_step_id(
                "invalid_end_event",
                format!("end_events の '{id}' は終了ステップではありません"),
                id,
            ));
        }
    }
}

/// 遷移が有効なステップ ID を参照しているか
fn validate_transition_references(definition: &JsonValue, errors: &mut Vec<ValidationError>) {
    let Some(steps) = get_steps(definition) else {
        return;
    };
    let step_ids = all_step_ids(definition);

    for step in steps {
        let from = step_id(step).unwrap_or("?");
        for transition in transitions(step) {
            match transition_target(transition) {
                None => errors.push(ValidationError::with_step_id(
                    "invalid_transition_ref",
                    format!("ステップ '{from}' の遷移に to が必要です"),
                    from,
                )),
                Some(to) if !step_ids.contains(to) => {
                    errors.push(ValidationError::with_step_id(
                        "invalid_transition_ref",
                        format!("ステップ '{from}' の遷移先 '{to}' は存在しないステップです"),
                        from,
                    ));
                }
                Some(_) => {}
            }
        }
    }
}

/// 外部入力を待たないステップは遷移を持つこと
fn validate_auto_steps_have_transitions(
    definition: &JsonValue,
    errors: &mut Vec<ValidationError>,
) {
    let Some(steps) = get_steps(definition) else {
        return;
    };
    for step in steps {
        let auto = matches!(step_type(step), Some("start_event" | "automatic"));
        if auto && !is_end(step) && transitions(step).next().is_none() {
            let id = step_id(step).unwrap_or("?");
            errors.push(ValidationError::with_step_id(
                "missing_transitions",
                format!("ステップ '{id}' には 1 つ以上の遷移が必要です"),
                id,
            ));
        }
    }
}

/// 遷移条件・スキップ条件・ビジネスルール条件がパースできること
fn validate_conditions(definition: &JsonValue, errors: &mut Vec<ValidationError>) {
    let mut check = |value: Option<&JsonValue>, owner: &str, step: Option<&str>| {
        let message = match value {
            None => return,
            Some(JsonValue::String(expr)) => match Condition::parse(expr) {
                Ok(_) => return,
                Err(e) => format!("{owner} の条件が不正です: {e}"),
            },
            Some(other) => format!("{owner} の条件は文字列である必要があります: {other}"),
        };
        errors.push(match step {
            Some(id) => ValidationError::with_step_id("invalid_condition", message, id),
            None => ValidationError::new("invalid_condition", message),
        });
    };

    for step in get_steps(definition).into_iter().flatten() {
        let id = step_id(step).unwrap_or("?");
        for transition in transitions(step) {
            check(
                transition.get("condition"),
                &format!("ステップ '{id}' の遷移"),
                Some(id),
            );
        }
        for condition in string_array(step, "skip_conditions") {
            check(
                Some(condition),
                &format!("ステップ '{id}' のスキップ条件"),
                Some(id),
            );
        }
    }

    for rule in string_array(definition, "business_rules") {
        let rule_id = rule.get("id").and_then(|v| v.as_str()).unwrap_or("?");
        // when は必須。欠落は null として型エラーに落とす
        let when = rule.get("when").unwrap_or(&JsonValue::Null);
        check(Some(when), &format!("ビジネスルール '{rule_id}'"), None);
    }
}

/// エスカレーションルールが存在するステップを参照していること
fn validate_escalation_rules(definition: &JsonValue, errors: &mut Vec<ValidationError>) {
    let step_ids = all_step_ids(definition);

    for rule in string_array(definition, "escalation_rules") {
        let Some(target) = rule.get("step_id").and_then(|v| v.as_str()) else {
            errors.push(ValidationError::new(
                "invalid_escalation_rule",
                "エスカレーションルールに step_id が必要です",
            ));
            continue;
        };
        if !step_ids.contains(target) {
            errors.push(ValidationError::with_step_id(
                "invalid_escalation_rule",
                format!("エスカレーションルールの step_id '{target}' は存在しないステップです"),
                target,
            ));
        }
        let auto_to = rule
            .get("auto_transition")
            .and_then(|a| a.get("to"))
            .and_then(|v| v.as_str());
        if let Some(to) = auto_to
            && !step_ids.contains(to)
        {
            errors.push(ValidationError::with_step_id(
                "invalid_escalation_rule",
                format!("ステップ '{target}' の自動遷移先 '{to}' は存在しないステップです"),
                target,
            ));
        }
    }
}

/// 孤立ステップなし（すべてのステップが開始ステップから到達可能）
///
/// 通常の遷移に加え、エスカレーションルールの自動遷移も辺として扱う。
fn validate_no_orphans(definition: &JsonValue, errors: &mut Vec<ValidationError>) {
    let Some(steps) = get_steps(definition) else {
        return;
    };
    let Some(start) = steps.iter().find(|s| is_start(s)).and_then(step_id) else {
        return;
    };

    // 隣接リストを構築
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in steps {
        let Some(from) = step_id(step) else {
            continue;
        };
        let targets = adjacency.entry(from).or_default();
        targets.extend(transitions(step).filter_map(transition_target));
    }
    for rule in string_array(definition, "escalation_rules") {
        let from = rule.get("step_id").and_then(|v| v.as_str());
        let to = rule
            .get("auto_transition")
            .and_then(|a| a.get("to"))
            .and_then(|v| v.as_str());
        if let (Some(from), Some(to)) = (from, to) {
            adjacency.entry(from).or_default().push(to);
        }
    }

    // 幅優先探索
    let mut reachable: HashSet<&str> = HashSet::from([start]);
    let mut queue = VecDeque::from([start]);
    while let Some(node) = queue.pop_front() {
        for &next in adjacency.get(node).into_iter().flatten() {
            if reachable.insert(next) {
                queue.push_back(next);
            }
        }
    }

    for step in steps {
        let Some(id) = step_id(step) else {
            continue;
        };
        if !reachable.contains(id) {
            errors.push(ValidationError::with_step_id(
                "orphaned_step",
                format!("ステップ '{id}' は開始ステップから到達できません"),
                id,
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::{fixture, rstest};
    use serde_json::json;

    use super::*;

    /// start → registration → inspection → end の有効な定義
    #[fixture]
    fn valid_definition() -> JsonValue {
        json!({
            "start_event": "start",
            "end_events": ["end"],
            "steps": [
                {"id": "start", "name": "開始", "type": "start_event",
                 "transitions": [{"to": "registration", "condition": "always"}]},
                {"id": "registration", "name": "受付", "type": "manual",
                 "transitions": [{"to": "inspection", "condition": "status == 'completed'"}]},
                {"id": "inspection", "name": "点検", "type": "manual", "timeout_hours": 24,
                 "transitions": [
                     {"to": "end", "condition": "inspection_report.status == 'approved'"},
                     {"to": "registration", "condition": "inspection_report.status == 'rework'"}
                 ]},
                {"id": "end", "name": "完了", "type": "end_event"}
            ]
        })
    }

    fn codes(result: &ValidationResult) -> Vec<&str> {
        result.errors.iter().map(|e| e.code.as_str()).collect()
    }

    #[rstest]
    fn test_有効な定義はエラーなし(valid_definition: JsonValue) {
        let result = validate_definition(&valid_definition);

        assert!(result.valid, "{:?}", result.errors);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_stepsがない定義はエラー() {
        let result = validate_definition(&json!({}));

        assert_eq!(codes(&result), vec!["missing_steps"]);
    }

    #[rstest]
    fn test_開始ステップがない場合はエラー(mut valid_definition: JsonValue) {
        valid_definition["steps"][0]["type"] = json!("manual");
        valid_definition.as_object_mut().unwrap().remove("start_event");

        let result = validate_definition(&valid_definition);

        assert!(result.has_error("missing_start_step"));
    }

    #[rstest]
    fn test_開始ステップが複数ある場合はエラー(mut valid_definition: JsonValue) {
        valid_definition["steps"][1]["is_start_step"] = json!(true);

        let result = validate_definition(&valid_definition);

        assert!(result.has_error("multiple_start_steps"));
    }

    #[rstest]
    fn test_start_eventが開始ステップでない場合はエラー(mut valid_definition: JsonValue) {
        valid_definition["start_event"] = json!("registration");

        let result = validate_definition(&valid_definition);

        assert!(result.has_error("invalid_start_event"));
    }

    #[rstest]
    fn test_終了ステップがない場合はエラー(mut valid_definition: JsonValue) {
        valid_definition["steps"][3]["type"] = json!("manual");

        let result = validate_definition(&valid_definition);

        assert!(result.has_error("missing_end_step"));
        assert!(result.has_error("invalid_end_event"));
    }

    #[rstest]
    fn test_終了ステップの遷移はエラー(mut valid_definition: JsonValue) {
        valid_definition["steps"][3]["transitions"] = json!([{"to": "registration"}]);

        let result = validate_definition(&valid_definition);

        assert!(result.has_error("end_step_has_transitions"));
    }

    #[rstest]
    fn test_ステップidの重複はエラー(mut valid_definition: JsonValue) {
        valid_definition["steps"][2]["id"] = json!("registration");

        let result = validate_definition(&valid_definition);

        assert!(result.has_error("duplicate_step_id"));
    }

    #[rstest]
    fn test_不正なステップ種別はエラー(mut valid_definition: JsonValue) {
        valid_definition["steps"][1]["type"] = json!("human_task");

        let result = validate_definition(&valid_definition);

        assert!(result.has_error("invalid_step_type"));
    }

    #[rstest]
    fn test_存在しない遷移先はエラー(mut valid_definition: JsonValue) {
        valid_definition["steps"][1]["transitions"][0]["to"] = json!("nowhere");

        let result = validate_definition(&valid_definition);

        let error = result
            .errors
            .iter()
            .find(|e| e.code == "invalid_transition_ref")
            .unwrap();
        assert_eq!(error.step_id.as_deref(), Some("registration"));
    }

    #[rstest]
    fn test_不正な条件式はエラー(mut valid_definition: JsonValue) {
        valid_definition["steps"][1]["transitions"][0]["condition"] = json!("status ==");
        valid_definition["steps"][2]["skip_conditions"] = json!(["(a == 1"]);

        let result = validate_definition(&valid_definition);

        let invalid: Vec<_> = result
            .errors
            .iter()
            .filter(|e| e.code == "invalid_condition")
            .filter_map(|e| e.step_id.as_deref())
            .collect();
        assert_eq!(invalid, vec!["registration", "inspection"]);
    }

    #[rstest]
    fn test_ビジネスルールのwhenは必須(mut valid_definition: JsonValue) {
        valid_definition["business_rules"] = json!([{"id": "r1", "set": {"x": 1}}]);

        let result = validate_definition(&valid_definition);

        assert!(result.has_error("invalid_condition"));
    }

    #[rstest]
    fn test_automaticステップに遷移がない場合はエラー(mut valid_definition: JsonValue) {
        valid_definition["steps"][1]["type"] = json!("automatic");
        valid_definition["steps"][1]["transitions"] = json!([]);

        let result = validate_definition(&valid_definition);

        assert!(result.has_error("missing_transitions"));
    }

    #[rstest]
    fn test_到達不能なステップは孤立エラー(mut valid_definition: JsonValue) {
        valid_definition["steps"]
            .as_array_mut()
            .unwrap()
            .push(json!({"id": "island", "name": "孤立", "type": "manual",
                         "transitions": [{"to": "end"}]}));

        let result = validate_definition(&valid_definition);

        let error = result
            .errors
            .iter()
            .find(|e| e.code == "orphaned_step")
            .unwrap();
        assert_eq!(error.step_id.as_deref(), Some("island"));
    }

    #[rstest]
    fn test_自動遷移でのみ到達できるステップは孤立ではない(mut valid_definition: JsonValue) {
        valid_definition["steps"]
            .as_array_mut()
            .unwrap()
            .push(json!({"id": "supervisor_review", "name": "上長確認", "type": "manual",
                         "transitions": [{"to": "end"}]}));
        valid_definition["escalation_rules"] = json!([
            {"step_id": "inspection",
             "auto_transition": {"to": "supervisor_review", "after_hours": 4}}
        ]);

        let result = validate_definition(&valid_definition);

        assert!(result.valid, "{:?}", result.errors);
    }

    #[rstest]
    fn test_エスカレーションルールの参照先が存在しない場合はエラー(
        mut valid_definition: JsonValue,
    ) {
        valid_definition["escalation_rules"] = json!([
            {"step_id": "unknown", "escalation_levels": []},
            {"step_id": "inspection", "auto_transition": {"to": "nowhere", "after_hours": 1}}
        ]);

        let result = validate_definition(&valid_definition);

        let count = result
            .errors
            .iter()
            .filter(|e| e.code == "invalid_escalation_rule")
            .count();
        assert_eq!(count, 2);
    }

    #[rstest]
    fn test_型が合わないフィールドは構造エラー(mut valid_definition: JsonValue) {
        valid_definition["steps"][2]["timeout_hours"] = json!("24h");

        let result = validate_definition(&valid_definition);

        assert_eq!(codes(&result), vec!["invalid_structure"]);
    }

    #[rstest]
    fn test_エラーはすべて収集される(mut valid_definition: JsonValue) {
        valid_definition["steps"][1]["type"] = json!("bogus");
        valid_definition["steps"][2]["transitions"][0]["to"] = json!("nowhere");

        let result = validate_definition(&valid_definition);

        assert!(!result.valid);
        assert!(result.errors.len() >= 2);
        assert!(result.summary().contains("nowhere"));
    }
}
