//! # 条件式（Condition）
//!
//! ステップ遷移・スキップ条件・ビジネスルールで使用する真偽式を表現する。
//!
//! ## 設計方針
//!
//! - **パースは定義登録時に 1 回だけ**: 文字列のまま保持せず、`Condition` に変換してから
//!   定義スナップショットに格納する。構文エラーは [`ExpressionError`] として登録時に返す
//! - **評価は決して失敗しない**: 実行時の評価は `bool` を返す純粋関数。コンテキストに
//!   存在しないフィールドとの比較はすべて `false` になる
//! - **シリアライズは元の文字列**: 永続化・API 入出力では元の式文字列をそのまま使い、
//!   デシリアライズ時に再パースして検証する
//!
//! ## 文法
//!
//! ```text
//! or      := and ("||" and)*
//! and     := primary ("&&" primary)*
//! primary := "(" or ")"
//!          | "always"
//!          | path op literal
//!          | path "in" "[" literal ("," literal)* "]"
//!          | path                       -- 真偽値判定
//! op      := "==" | "!=" | ">=" | "<=" | ">" | "<"
//! literal := number | "'" text "'" | '"' text '"' | true | false | null | word
//! ```
//!
//! ## 使用例
//!
//! ```rust
//! use repairflow_domain::condition::Condition;
//! use serde_json::json;
//!
//! let condition = Condition::parse("quotation.total_amount < 5000000").unwrap();
//! assert!(condition.evaluate(&json!({"quotation": {"total_amount": 3000000}})));
//! assert!(!condition.evaluate(&json!({})));
//! ```

mod parser;

use std::{cmp::Ordering, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// 条件式の構文エラー
///
/// 括弧の不一致、演算子の右辺欠落など、式として解釈できない場合に発生する。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("条件式の構文エラー `{expression}`: {message}")]
pub struct ExpressionError {
    /// 解析対象の式
    pub expression: String,
    /// パーサーのエラーメッセージ
    pub message:    String,
}

/// 比較演算子
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

impl CompareOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Ge => ">=",
            Self::Le => "<=",
        }
    }
}

/// 比較の右辺に書けるリテラル
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Number(f64),
    String(String),
    Bool(bool),
    Null,
}

/// ドット区切りのフィールドパス（例: `inspection_report.status`）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn parse(path: &str) -> Self {
        Self(path.split('.').map(str::to_string).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// コンテキストからパスの値を取り出す
    ///
    /// 途中のセグメントが存在しない場合は `None`。
    /// 配列に対しては数値セグメントをインデックスとして扱う。
    pub fn resolve<'a>(&self, context: &'a JsonValue) -> Option<&'a JsonValue> {
        self.0.iter().try_fold(context, |current, segment| match current {
            JsonValue::Object(map) => map.get(segment),
            JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// 条件式の構文木
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// 常に真（`always`）
    Always,
    /// 論理和
    Or(Vec<Expr>),
    /// 論理積
    And(Vec<Expr>),
    /// 比較（`path op literal`）
    Compare {
        path:  FieldPath,
        op:    CompareOp,
        value: Literal,
    },
    /// 集合所属（`path in [a, b]`）
    In { path: FieldPath, values: Vec<Literal> },
    /// フィールド単体の真偽値判定
    Truthy(FieldPath),
}

impl Expr {
    fn evaluate(&self, context: &JsonValue) -> bool {
        match self {
            Self::Always => true,
            Self::Or(items) => items.iter().any(|e| e.evaluate(context)),
            Self::And(items) => items.iter().all(|e| e.evaluate(context)),
            Self::Compare { path, op, value } => match present(path.resolve(context)) {
                Some(actual) => compare(actual, *op, value),
                None => false,
            },
            Self::In { path, values } => match present(path.resolve(context)) {
                Some(actual) => values.iter().any(|v| loosely_equal(actual, v)),
                None => false,
            },
            Self::Truthy(path) => present(path.resolve(context)).is_some_and(is_truthy),
        }
    }
}

/// 条件式
///
/// 元の式文字列とパース済みの構文木を保持する。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Condition {
    source: String,
    expr:   Expr,
}

impl Condition {
    /// 式文字列をパースする
    ///
    /// # Errors
    ///
    /// 空文字列や構文的に不正な式の場合は [`ExpressionError`] を返す。
    pub fn parse(expression: &str) -> Result<Self, ExpressionError> {
        let source = expression.trim();
        if source.is_empty() {
            return Err(ExpressionError {
                expression: expression.to_string(),
                message:    "条件式が空です".to_string(),
            });
        }
        let expr = parser::parse_expression(source).map_err(|message| ExpressionError {
            expression: expression.to_string(),
            message,
        })?;
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// 常に真となる条件
    pub fn always() -> Self {
        Self {
            source: "always".to_string(),
            expr:   Expr::Always,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn is_always(&self) -> bool {
        matches!(self.expr, Expr::Always)
    }

    /// コンテキストに対して条件を評価する
    pub fn evaluate(&self, context: &JsonValue) -> bool {
        self.expr.evaluate(context)
    }
}

impl FromStr for Condition {
    type Err = ExpressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Condition {
    type Error = ExpressionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Condition> for String {
    fn from(value: Condition) -> Self {
        value.source
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// 式文字列をパースして即座に評価する
///
/// 定義バリデーションやテストで使用する。実行時は事前にパースした
/// [`Condition`] を使うこと。
pub fn evaluate(expression: &str, context: &JsonValue) -> Result<bool, ExpressionError> {
    Condition::parse(expression).map(|c| c.evaluate(context))
}

// ===== 評価ヘルパー =====

/// null は未定義と同じ扱い
fn present(value: Option<&JsonValue>) -> Option<&JsonValue> {
    value.filter(|v| !v.is_null())
}

fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(items) => !items.is_empty(),
        JsonValue::Object(_) => true,
    }
}

fn value_as_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn literal_as_number(literal: &Literal) -> Option<f64> {
    match literal {
        Literal::Number(n) => Some(*n),
        Literal::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn value_as_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn literal_as_text(literal: &Literal) -> String {
    match literal {
        Literal::Number(n) => format_number(*n),
        Literal::String(s) => s.clone(),
        Literal::Bool(b) => b.to_string(),
        Literal::Null => "null".to_string(),
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn loosely_equal(actual: &JsonValue, expected: &Literal) -> bool {
    match (actual, expected) {
        (_, Literal::Null) => false,
        (JsonValue::Bool(a), Literal::Bool(b)) => a == b,
        (JsonValue::Bool(a), Literal::String(s)) => a.to_string() == *s,
        _ => match (value_as_number(actual), literal_as_number(expected)) {
            (Some(a), Some(b)) => a == b,
            _ => value_as_text(actual) == literal_as_text(expected),
        },
    }
}

fn compare(actual: &JsonValue, op: CompareOp, expected: &Literal) -> bool {
    match op {
        CompareOp::Eq => loosely_equal(actual, expected),
        CompareOp::Ne => !loosely_equal(actual, expected),
        CompareOp::Gt | CompareOp::Lt | CompareOp::Ge | CompareOp::Le => {
            let ordering = match (value_as_number(actual), literal_as_number(expected)) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => match (actual, expected) {
                    (JsonValue::String(a), Literal::String(b)) => Some(a.as_str().cmp(b.as_str())),
                    _ => None,
                },
            };
            match ordering {
                Some(Ordering::Greater) => matches!(op, CompareOp::Gt | CompareOp::Ge),
                Some(Ordering::Less) => matches!(op, CompareOp::Lt | CompareOp::Le),
                Some(Ordering::Equal) => matches!(op, CompareOp::Ge | CompareOp::Le),
                None => false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    mod parse {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn test_alwaysはexpr_alwaysになる() {
            let condition = Condition::parse("always").unwrap();
            assert!(condition.is_always());
        }

        #[test]
        fn test_比較式をパースできる() {
            let condition = Condition::parse("quotation.total_amount >= 5000000").unwrap();
            assert_eq!(
                condition.expr(),
                &Expr::Compare {
                    path:  FieldPath::parse("quotation.total_amount"),
                    op:    CompareOp::Ge,
                    value: Literal::Number(5_000_000.0),
                }
            );
        }

        #[test]
        fn test_in式をパースできる() {
            let condition = Condition::parse("customer_tier in ['gold', \"platinum\", vip]").unwrap();
            assert_eq!(
                condition.expr(),
                &Expr::In {
                    path:   FieldPath::parse("customer_tier"),
                    values: vec![
                        Literal::String("gold".to_string()),
                        Literal::String("platinum".to_string()),
                        Literal::String("vip".to_string()),
                    ],
                }
            );
        }

        #[test]
        fn test_andはorより強く結合する() {
            let condition = Condition::parse("a == 1 || b == 2 && c == 3").unwrap();
            let Expr::Or(items) = condition.expr() else {
                panic!("Or になるべき: {:?}", condition.expr());
            };
            assert_eq!(items.len(), 2);
            assert!(matches!(items[1], Expr::And(_)));
        }

        #[test]
        fn test_前後の空白は除去される() {
            let condition = Condition::parse("  status == completed  ").unwrap();
            assert_eq!(condition.source(), "status == completed");
        }

        #[test]
        fn test_alwaysで始まるフィールド名はパスとして扱う() {
            let condition = Condition::parse("always_notify").unwrap();
            assert_eq!(
                condition.expr(),
                &Expr::Truthy(FieldPath::parse("always_notify"))
            );
        }

        #[rstest]
        #[case("")]
        #[case("   ")]
        #[case("status ==")]
        #[case("(status == completed")]
        #[case("status == completed)")]
        #[case("a == 1 &&")]
        #[case("|| a == 1")]
        #[case("status in []")]
        #[case("status in ['a',")]
        #[case("status === completed")]
        #[case("name == 'unterminated")]
        fn test_不正な式はエラーになる(#[case] input: &str) {
            let result = Condition::parse(input);
            assert!(result.is_err(), "エラーになるべき: {input:?}");
        }

        #[test]
        fn test_エラーに元の式が含まれる() {
            let err = Condition::parse("(a == 1").unwrap_err();
            assert_eq!(err.expression, "(a == 1");
            assert!(!err.message.is_empty());
        }
    }

    mod evaluate {
        use super::*;
        use pretty_assertions::assert_eq;

        #[rstest]
        #[case("status == 'completed'")]
        #[case("status != 'completed'")]
        #[case("amount > 10")]
        #[case("amount < 10")]
        #[case("amount >= 10")]
        #[case("amount <= 10")]
        #[case("status in [a, b]")]
        #[case("status == null")]
        #[case("status")]
        fn test_存在しないフィールドとの比較はすべてfalse(#[case] expression: &str) {
            assert!(!evaluate(expression, &json!({})).unwrap());
        }

        #[test]
        fn test_nullのフィールドは未定義と同じ扱い() {
            let context = json!({"status": null});
            assert!(!evaluate("status != 'x'", &context).unwrap());
        }

        #[test]
        fn test_ネストしたパスを辿れる() {
            let context = json!({"inspection_report": {"status": "approved"}});
            assert!(evaluate("inspection_report.status == 'approved'", &context).unwrap());
            assert!(!evaluate("inspection_report.status == 'rejected'", &context).unwrap());
        }

        #[test]
        fn test_途中がオブジェクトでないパスはfalse() {
            let context = json!({"inspection_report": "done"});
            assert!(!evaluate("inspection_report.status == 'done'", &context).unwrap());
        }

        #[rstest]
        #[case(json!({"amount": 3000000}), true)]
        #[case(json!({"amount": "3000000"}), true)]
        #[case(json!({"amount": 5000000}), false)]
        #[case(json!({"amount": "abc"}), false)]
        fn test_数値文字列は数値として比較される(#[case] context: JsonValue, #[case] expected: bool) {
            assert_eq!(evaluate("amount < 5000000", &context).unwrap(), expected);
        }

        #[test]
        fn test_数値の等価比較は表現に依存しない() {
            let context = json!({"count": 2.0});
            assert!(evaluate("count == 2", &context).unwrap());
            assert!(evaluate("count == '2'", &context).unwrap());
        }

        #[test]
        fn test_真偽値の比較() {
            let context = json!({"warranty": true});
            assert!(evaluate("warranty == true", &context).unwrap());
            assert!(!evaluate("warranty == false", &context).unwrap());
            assert!(evaluate("warranty", &context).unwrap());
        }

        #[test]
        fn test_文字列の大小比較は辞書順() {
            let context = json!({"grade": "b"});
            assert!(evaluate("grade > 'a'", &context).unwrap());
            assert!(!evaluate("grade > 'c'", &context).unwrap());
        }

        #[test]
        fn test_数値と非数値文字列の大小比較はfalse() {
            let context = json!({"grade": "b"});
            assert!(!evaluate("grade > 1", &context).unwrap());
            assert!(!evaluate("grade < 1", &context).unwrap());
        }

        #[test]
        fn test_in式は集合のいずれかに一致すれば真() {
            let context = json!({"device_type": "smartphone"});
            assert!(evaluate("device_type in [tablet, smartphone]", &context).unwrap());
            assert!(!evaluate("device_type in [laptop]", &context).unwrap());
        }

        #[test]
        fn test_論理演算と括弧() {
            let context = json!({"a": 1, "b": 2, "c": 0});
            assert!(evaluate("a == 1 && (b == 3 || c == 0)", &context).unwrap());
            assert!(!evaluate("(a == 1 && b == 3) || c == 1", &context).unwrap());
        }

        #[test]
        fn test_配列はインデックスで参照できる() {
            let context = json!({"parts": [{"sku": "LCD-01"}]});
            assert!(evaluate("parts.0.sku == 'LCD-01'", &context).unwrap());
            assert!(!evaluate("parts.1.sku == 'LCD-01'", &context).unwrap());
        }

        #[rstest]
        #[case(json!({"flag": 0}), false)]
        #[case(json!({"flag": ""}), false)]
        #[case(json!({"flag": []}), false)]
        #[case(json!({"flag": "yes"}), true)]
        #[case(json!({"flag": {"a": 1}}), true)]
        fn test_真偽値判定(#[case] context: JsonValue, #[case] expected: bool) {
            assert_eq!(evaluate("flag", &context).unwrap(), expected);
        }
    }

    mod serialization {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn test_元の文字列としてシリアライズされる() {
            let condition = Condition::parse("status == 'completed'").unwrap();
            let json = serde_json::to_value(&condition).unwrap();
            assert_eq!(json, json!("status == 'completed'"));
        }

        #[test]
        fn test_デシリアライズ時にパースされる() {
            let condition: Condition = serde_json::from_value(json!("amount > 1")).unwrap();
            assert!(condition.evaluate(&json!({"amount": 2})));
        }

        #[test]
        fn test_不正な式のデシリアライズはエラー() {
            let result: Result<Condition, _> = serde_json::from_value(json!("amount >"));
            assert!(result.is_err());
        }
    }
}
