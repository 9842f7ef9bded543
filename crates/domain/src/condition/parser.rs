//! 条件式の nom パーサー

use nom::{
    IResult,
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, digit1, multispace0, satisfy},
    combinator::{all_consuming, cut, map, map_res, not, opt, peek, recognize, value, verify},
    error::{VerboseError, context, convert_error},
    multi::{many0, separated_list1},
    sequence::{delimited, pair, preceded, terminated, tuple},
};

use super::{CompareOp, Expr, FieldPath, Literal};

type Res<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

/// 式全体をパースする
///
/// 失敗時は位置情報付きのエラーメッセージを返す。
pub(super) fn parse_expression(input: &str) -> Result<Expr, String> {
    match all_consuming(ws(or_expr))(input) {
        Ok((_, expr)) => Ok(expr),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(convert_error(input, e)),
        Err(nom::Err::Incomplete(_)) => Err("式が途中で終わっています".to_string()),
    }
}

fn ws<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> Res<'a, O>
where
    F: FnMut(&'a str) -> Res<'a, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// 識別子の一部として続かないことを確認するキーワード
fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> Res<'a, &'a str> {
    terminated(tag(word), not(peek(satisfy(is_ident_char))))
}

fn or_expr(input: &str) -> Res<'_, Expr> {
    map(
        pair(and_expr, many0(preceded(ws(tag("||")), cut(and_expr)))),
        |(first, rest)| flatten(first, rest, Expr::Or),
    )(input)
}

fn and_expr(input: &str) -> Res<'_, Expr> {
    map(
        pair(primary, many0(preceded(ws(tag("&&")), cut(primary)))),
        |(first, rest)| flatten(first, rest, Expr::And),
    )(input)
}

fn flatten(first: Expr, rest: Vec<Expr>, wrap: fn(Vec<Expr>) -> Expr) -> Expr {
    if rest.is_empty() {
        return first;
    }
    let mut items = Vec::with_capacity(rest.len() + 1);
    items.push(first);
    items.extend(rest);
    wrap(items)
}

fn primary(input: &str) -> Res<'_, Expr> {
    ws(alt((
        context(
            "括弧",
            delimited(char('('), ws(or_expr), cut(char(')'))),
        ),
        value(Expr::Always, keyword("always")),
        context("比較式", path_expr),
    )))(input)
}

fn path_expr(input: &str) -> Res<'_, Expr> {
    let (input, path) = field_path(input)?;
    let (input, tail) = opt(alt((
        map(
            pair(ws(compare_op), cut(literal)),
            |(op, value)| Tail::Compare(op, value),
        ),
        map(
            preceded(
                ws(keyword("in")),
                cut(delimited(
                    ws(char('[')),
                    separated_list1(ws(char(',')), literal),
                    ws(char(']')),
                )),
            ),
            Tail::In,
        ),
    )))(input)?;

    let expr = match tail {
        Some(Tail::Compare(op, value)) => Expr::Compare { path, op, value },
        Some(Tail::In(values)) => Expr::In { path, values },
        None => Expr::Truthy(path),
    };
    Ok((input, expr))
}

enum Tail {
    Compare(CompareOp, Literal),
    In(Vec<Literal>),
}

fn field_path(input: &str) -> Res<'_, FieldPath> {
    map(
        recognize(pair(
            verify(take_while1(is_ident_char), |s: &str| {
                s.chars().next().is_some_and(|c| !c.is_ascii_digit())
            }),
            many0(pair(char('.'), take_while1(is_ident_char))),
        )),
        FieldPath::parse,
    )(input)
}

fn compare_op(input: &str) -> Res<'_, CompareOp> {
    terminated(
        alt((
            value(CompareOp::Eq, tag("==")),
            value(CompareOp::Ne, tag("!=")),
            value(CompareOp::Ge, tag(">=")),
            value(CompareOp::Le, tag("<=")),
            value(CompareOp::Gt, tag(">")),
            value(CompareOp::Lt, tag("<")),
        )),
        not(peek(char('='))),
    )(input)
}

fn literal(input: &str) -> Res<'_, Literal> {
    context(
        "リテラル",
        ws(alt((
            number,
            map(quoted('\''), |s| Literal::String(s.to_string())),
            map(quoted('"'), |s| Literal::String(s.to_string())),
            value(Literal::Bool(true), keyword("true")),
            value(Literal::Bool(false), keyword("false")),
            value(Literal::Null, keyword("null")),
            map(bare_word, |s| Literal::String(s.to_string())),
        ))),
    )(input)
}

fn number(input: &str) -> Res<'_, Literal> {
    map_res(
        terminated(
            recognize(tuple((
                opt(char('-')),
                digit1,
                opt(pair(char('.'), digit1)),
            ))),
            not(peek(satisfy(is_ident_char))),
        ),
        |s: &str| s.parse::<f64>().map(Literal::Number),
    )(input)
}

fn quoted<'a>(quote: char) -> impl FnMut(&'a str) -> Res<'a, &'a str> {
    delimited(
        char(quote),
        take_while(move |c| c != quote),
        cut(char(quote)),
    )
}

fn bare_word(input: &str) -> Res<'_, &str> {
    take_while1(|c: char| is_ident_char(c) || c == '-' || c == '.')(input)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_負数と小数をパースできる() {
        let expr = parse_expression("delta >= -1.5").unwrap();
        assert_eq!(
            expr,
            Expr::Compare {
                path:  FieldPath::parse("delta"),
                op:    CompareOp::Ge,
                value: Literal::Number(-1.5),
            }
        );
    }

    #[test]
    fn test_数字で始まる語は文字列リテラル() {
        let expr = parse_expression("model == 5g-router").unwrap();
        assert_eq!(
            expr,
            Expr::Compare {
                path:  FieldPath::parse("model"),
                op:    CompareOp::Eq,
                value: Literal::String("5g-router".to_string()),
            }
        );
    }

    #[test]
    fn test_andの連鎖は平坦化される() {
        let expr = parse_expression("a && b && c").unwrap();
        let Expr::And(items) = expr else {
            panic!("And になるべき");
        };
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn test_in演算子は識別子の一部と区別される() {
        let expr = parse_expression("index == 1").unwrap();
        assert!(matches!(expr, Expr::Compare { .. }));
    }

    #[test]
    fn test_エラーメッセージは位置情報を含む() {
        let message = parse_expression("a == 1 && (b").unwrap_err();
        assert!(message.contains("line 1"), "{message}");
    }
}
