//! Condition trees used by conditional steps and filter transforms.
//!
//! Conditions arrive either structured (tagged by `conditionType`) or as
//! strings such as `{{step1.count}} > 3 && subject contains invoice`; the
//! string form is parsed once while steps are canonicalized.

use crate::reference::strip_braces;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Comparison operator of a simple condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// Loose equality
    #[serde(alias = "==", alias = "eq", alias = "=")]
    Equals,
    /// Loose inequality
    #[serde(alias = "!=", alias = "ne")]
    NotEquals,
    /// Case-insensitive substring, array membership or object key
    Contains,
    /// Negation of `contains`
    NotContains,
    /// Numeric `>`
    #[serde(alias = ">", alias = "gt")]
    GreaterThan,
    /// Numeric `<`
    #[serde(alias = "<", alias = "lt")]
    LessThan,
    /// Numeric `>=`
    #[serde(alias = ">=", alias = "gte")]
    GreaterOrEqual,
    /// Numeric `<=`
    #[serde(alias = "<=", alias = "lte")]
    LessOrEqual,
    /// Field present and not null
    Exists,
    /// Field absent or null
    NotExists,
    /// Field equals one of the listed values
    In,
}

/// A boolean condition over named fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "conditionType", rename_all = "snake_case")]
pub enum Condition {
    /// `field operator value`
    Simple {
        /// Field path, optionally wrapped in `{{ }}`
        field: String,
        /// Comparison
        operator: Operator,
        /// Expected value
        #[serde(default)]
        value: Value,
    },
    /// All children hold (empty = true)
    And {
        /// Children
        conditions: Vec<Condition>,
    },
    /// Any child holds (empty = false)
    Or {
        /// Children
        conditions: Vec<Condition>,
    },
    /// Negation
    Not {
        /// Negated child
        condition: Box<Condition>,
    },
    /// Any field contains any keyword
    KeywordSet {
        /// Fields to search
        fields: Vec<String>,
        /// Keywords (case-insensitive)
        keywords: Vec<String>,
    },
}

/// Source of field values during evaluation
pub trait FieldSource {
    /// Look up a field by path; `None` when absent
    fn lookup(&self, field: &str) -> Option<Value>;
}

impl FieldSource for Value {
    fn lookup(&self, field: &str) -> Option<Value> {
        lookup_path(self, strip_braces(field)).cloned()
    }
}

/// Walk a dotted path through objects and arrays
#[must_use]
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, seg| match current {
        Value::Object(map) => map.get(seg),
        Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

impl Condition {
    /// Shorthand for a simple condition
    pub fn simple(field: impl Into<String>, operator: Operator, value: Value) -> Self {
        Self::Simple {
            field: field.into(),
            operator,
            value,
        }
    }

    /// Constant true
    #[must_use]
    pub fn always() -> Self {
        Self::And {
            conditions: Vec::new(),
        }
    }

    /// Whether this condition holds for every input
    #[must_use]
    pub fn is_always_true(&self) -> bool {
        match self {
            Self::And { conditions } => conditions.iter().all(Self::is_always_true),
            Self::Or { conditions } => conditions.iter().any(Self::is_always_true),
            _ => false,
        }
    }

    /// Evaluate against a field source
    pub fn evaluate<S: FieldSource + ?Sized>(&self, source: &S) -> bool {
        match self {
            Self::Simple {
                field,
                operator,
                value,
            } => compare(source.lookup(field).as_ref(), *operator, value),
            Self::And { conditions } => conditions.iter().all(|c| c.evaluate(source)),
            Self::Or { conditions } => conditions.iter().any(|c| c.evaluate(source)),
            Self::Not { condition } => !condition.evaluate(source),
            Self::KeywordSet { fields, keywords } => fields.iter().any(|field| {
                source
                    .lookup(field)
                    .is_some_and(|actual| keywords.iter().any(|k| contains_value(&actual, &Value::String(k.clone()))))
            }),
        }
    }

    /// Every field expression this condition reads
    #[must_use]
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Simple { field, .. } => out.push(field),
            Self::And { conditions } | Self::Or { conditions } => {
                conditions.iter().for_each(|c| c.collect_fields(out));
            }
            Self::Not { condition } => condition.collect_fields(out),
            Self::KeywordSet { fields, .. } => out.extend(fields.iter().map(String::as_str)),
        }
    }

    /// Visit every string (fields and string values)
    pub fn visit_strings(&self, f: &mut dyn FnMut(&str)) {
        match self {
            Self::Simple { field, value, .. } => {
                f(field);
                visit_value_strings(value, f);
            }
            Self::And { conditions } | Self::Or { conditions } => {
                conditions.iter().for_each(|c| c.visit_strings(f));
            }
            Self::Not { condition } => condition.visit_strings(f),
            Self::KeywordSet { fields, .. } => fields.iter().for_each(|s| f(s)),
        }
    }

    /// Visit every string (fields and string values) mutably
    pub fn visit_strings_mut(&mut self, f: &mut dyn FnMut(&mut String)) {
        match self {
            Self::Simple { field, value, .. } => {
                f(field);
                visit_value_strings_mut(value, f);
            }
            Self::And { conditions } | Self::Or { conditions } => {
                conditions.iter_mut().for_each(|c| c.visit_strings_mut(f));
            }
            Self::Not { condition } => condition.visit_strings_mut(f),
            Self::KeywordSet { fields, .. } => fields.iter_mut().for_each(|s| f(s)),
        }
    }

    /// Collapse large keyword disjunctions into [`Condition::KeywordSet`].
    ///
    /// An `or` of at least `min_terms` `contains` checks with string values
    /// whose (field, keyword) pairs form a full cross product is replaced by
    /// a single keyword-set check. Children are simplified first.
    #[must_use]
    pub fn simplify(self, min_terms: usize) -> Self {
        match self {
            Self::And { conditions } => Self::And {
                conditions: conditions.into_iter().map(|c| c.simplify(min_terms)).collect(),
            },
            Self::Not { condition } => Self::Not {
                condition: Box::new(condition.simplify(min_terms)),
            },
            Self::Or { conditions } => match keyword_set(&conditions, min_terms) {
                Some(set) => set,
                None => Self::Or {
                    conditions: conditions.into_iter().map(|c| c.simplify(min_terms)).collect(),
                },
            },
            other => other,
        }
    }
}

fn keyword_set(conditions: &[Condition], min_terms: usize) -> Option<Condition> {
    let mut terms = Vec::new();
    if !conditions.iter().all(|c| flatten_or(c, &mut terms)) || terms.len() < min_terms {
        return None;
    }

    let mut fields: Vec<String> = Vec::new();
    let mut keywords: Vec<String> = Vec::new();
    let mut pairs = HashSet::new();
    for (field, keyword) in terms {
        if !fields.contains(&field) {
            fields.push(field.clone());
        }
        if !keywords.contains(&keyword) {
            keywords.push(keyword.clone());
        }
        pairs.insert((field, keyword));
    }

    if pairs.len() != fields.len() * keywords.len() {
        return None;
    }
    Some(Condition::KeywordSet { fields, keywords })
}

/// Collect `(field, keyword)` from a pure disjunction of string `contains` checks
fn flatten_or(condition: &Condition, out: &mut Vec<(String, String)>) -> bool {
    match condition {
        Condition::Or { conditions } => conditions.iter().all(|c| flatten_or(c, out)),
        Condition::Simple {
            field,
            operator: Operator::Contains,
            value: Value::String(keyword),
        } => {
            out.push((field.clone(), keyword.clone()));
            true
        }
        _ => false,
    }
}

fn visit_value_strings(value: &Value, f: &mut dyn FnMut(&str)) {
    match value {
        Value::String(s) => f(s),
        Value::Array(items) => items.iter().for_each(|v| visit_value_strings(v, f)),
        Value::Object(map) => map.values().for_each(|v| visit_value_strings(v, f)),
        _ => {}
    }
}

fn visit_value_strings_mut(value: &mut Value, f: &mut dyn FnMut(&mut String)) {
    match value {
        Value::String(s) => f(s),
        Value::Array(items) => items.iter_mut().for_each(|v| visit_value_strings_mut(v, f)),
        Value::Object(map) => map.values_mut().for_each(|v| visit_value_strings_mut(v, f)),
        _ => {}
    }
}

fn compare(actual: Option<&Value>, operator: Operator, expected: &Value) -> bool {
    match operator {
        Operator::Exists => actual.is_some_and(|v| !v.is_null()),
        Operator::NotExists => actual.is_none_or(Value::is_null),
        Operator::Equals => actual.is_some_and(|v| loose_eq(v, expected)),
        Operator::NotEquals => !actual.is_some_and(|v| loose_eq(v, expected)),
        Operator::Contains => actual.is_some_and(|v| contains_value(v, expected)),
        Operator::NotContains => !actual.is_some_and(|v| contains_value(v, expected)),
        Operator::In => match (actual, expected) {
            (Some(v), Value::Array(options)) => options.iter().any(|o| loose_eq(v, o)),
            (Some(v), other) => contains_value(other, v),
            (None, _) => false,
        },
        Operator::GreaterThan => numeric(actual, expected).is_some_and(|(a, b)| a > b),
        Operator::LessThan => numeric(actual, expected).is_some_and(|(a, b)| a < b),
        Operator::GreaterOrEqual => numeric(actual, expected).is_some_and(|(a, b)| a >= b),
        Operator::LessOrEqual => numeric(actual, expected).is_some_and(|(a, b)| a <= b),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Array(items) => Some(items.len() as f64),
        _ => None,
    }
}

fn numeric(actual: Option<&Value>, expected: &Value) -> Option<(f64, f64)> {
    Some((as_number(actual?)?, as_number(expected)?))
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn loose_eq(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (actual, expected) {
        (Value::Number(_), _) | (_, Value::Number(_)) => {
            matches!((as_number(actual), as_number(expected)), (Some(a), Some(b)) if a == b)
        }
        (Value::Bool(_), Value::String(_)) | (Value::String(_), Value::Bool(_)) => {
            as_text(actual).eq_ignore_ascii_case(&as_text(expected))
        }
        _ => false,
    }
}

/// Case-insensitive containment shared by `contains` and keyword sets
#[must_use]
pub fn contains_value(actual: &Value, needle: &Value) -> bool {
    let needle_text = as_text(needle).to_lowercase();
    match actual {
        Value::Null => false,
        Value::Array(items) => items.iter().any(|item| match item {
            Value::String(s) => s.to_lowercase() == needle_text,
            other => loose_eq(other, needle),
        }),
        Value::Object(map) => map.contains_key(&as_text(needle)),
        other => as_text(other).to_lowercase().contains(&needle_text),
    }
}

/// Error parsing a string condition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConditionParseError {
    /// Nothing to parse
    #[error("empty condition expression")]
    Empty,
    /// Parentheses or quotes do not balance
    #[error("unbalanced expression: {0}")]
    Unbalanced(String),
    /// Operator without a left-hand field
    #[error("missing field in '{0}'")]
    MissingField(String),
}

const WORD_OPERATORS: &[(&str, Operator)] = &[
    (" not_contains ", Operator::NotContains),
    (" not contains ", Operator::NotContains),
    (" contains ", Operator::Contains),
    (" in ", Operator::In),
];

const SYMBOL_OPERATORS: &[(&str, Operator)] = &[
    (">=", Operator::GreaterOrEqual),
    ("<=", Operator::LessOrEqual),
    ("!=", Operator::NotEquals),
    ("==", Operator::Equals),
    (">", Operator::GreaterThan),
    ("<", Operator::LessThan),
    ("=", Operator::Equals),
];

/// Parse a string expression into a condition tree.
///
/// `||` binds looser than `&&`; `!` or `not ` negates; parentheses group.
/// A bare field is an existence check.
///
/// # Errors
///
/// Returns error on empty input, unbalanced quotes or parentheses, or an
/// operator with no field.
pub fn parse_expression(text: &str) -> Result<Condition, ConditionParseError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ConditionParseError::Empty);
    }

    let alternatives = split_top_level(text, "||")?;
    if alternatives.len() > 1 {
        return Ok(Condition::Or {
            conditions: alternatives
                .into_iter()
                .map(parse_expression)
                .collect::<Result<_, _>>()?,
        });
    }

    let conjuncts = split_top_level(text, "&&")?;
    if conjuncts.len() > 1 {
        return Ok(Condition::And {
            conditions: conjuncts
                .into_iter()
                .map(parse_expression)
                .collect::<Result<_, _>>()?,
        });
    }

    if let Some(inner) = strip_group(text) {
        return parse_expression(inner);
    }
    if let Some(rest) = text.strip_prefix('!').filter(|r| !r.starts_with('=')) {
        return Ok(Condition::Not {
            condition: Box::new(parse_expression(rest)?),
        });
    }
    if let Some(rest) = text.strip_prefix("not ") {
        return Ok(Condition::Not {
            condition: Box::new(parse_expression(rest)?),
        });
    }
    match text {
        "true" => return Ok(Condition::always()),
        "false" => {
            return Ok(Condition::Or {
                conditions: Vec::new(),
            });
        }
        _ => {}
    }

    parse_comparison(text)
}

fn parse_comparison(text: &str) -> Result<Condition, ConditionParseError> {
    for (suffix, operator) in [
        (" not_exists", Operator::NotExists),
        (" not exists", Operator::NotExists),
        (" exists", Operator::Exists),
    ] {
        if let Some(field) = text.strip_suffix(suffix) {
            return Ok(Condition::simple(field.trim(), operator, Value::Null));
        }
    }

    let found = WORD_OPERATORS
        .iter()
        .chain(SYMBOL_OPERATORS)
        .find_map(|(token, op)| find_outside_quotes(text, token).map(|at| (at, *token, *op)));

    match found {
        Some((at, token, operator)) => {
            let field = text[..at].trim();
            if field.is_empty() {
                return Err(ConditionParseError::MissingField(text.to_string()));
            }
            let value = parse_literal(text[at + token.len()..].trim(), operator);
            Ok(Condition::simple(field, operator, value))
        }
        None => Ok(Condition::simple(text, Operator::Exists, Value::Null)),
    }
}

fn parse_literal(raw: &str, operator: Operator) -> Value {
    if let Some(unquoted) = unquote(raw) {
        return Value::String(unquoted.to_string());
    }
    if operator == Operator::In {
        if let Some(inner) = raw.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
            return Value::Array(
                inner
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| parse_literal(s, Operator::Equals))
                    .collect(),
            );
        }
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        _ => serde_json::from_str::<serde_json::Number>(raw)
            .map(Value::Number)
            .unwrap_or_else(|_| Value::String(raw.to_string())),
    }
}

fn unquote(raw: &str) -> Option<&str> {
    ['"', '\'']
        .into_iter()
        .find_map(|q| raw.strip_prefix(q).and_then(|r| r.strip_suffix(q)))
}

/// Split on `sep` at depth zero, outside quotes
fn split_top_level<'a>(text: &'a str, sep: &str) -> Result<Vec<&'a str>, ConditionParseError> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => {
                depth -= 1;
                if depth < 0 {
                    return Err(ConditionParseError::Unbalanced(text.to_string()));
                }
            }
            (None, _) if depth == 0 && text[i..].starts_with(sep) => {
                parts.push(text[start..i].trim());
                start = i + sep.len();
                for _ in 1..sep.len() {
                    chars.next();
                }
            }
            _ => {}
        }
    }

    if depth != 0 || quote.is_some() {
        return Err(ConditionParseError::Unbalanced(text.to_string()));
    }
    parts.push(text[start..].trim());
    Ok(parts)
}

/// Inner text when the whole expression is one parenthesized group
fn strip_group(text: &str) -> Option<&str> {
    let inner = text.strip_prefix('(')?.strip_suffix(')')?;
    let mut depth = 0i32;
    for c in inner.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return None;
                }
            }
            _ => {}
        }
    }
    (depth == 0).then_some(inner)
}

fn find_outside_quotes(text: &str, token: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    let mut braces = 0i32;
    for (i, c) in text.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '{') => braces += 1,
            (None, '}') => braces -= 1,
            (None, _) if braces == 0 && text[i..].starts_with(token) => return Some(i),
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn keyword_disjunction(fields: &[&str], keywords: &[&str]) -> Condition {
        Condition::Or {
            conditions: fields
                .iter()
                .flat_map(|f| {
                    keywords
                        .iter()
                        .map(move |k| Condition::simple(*f, Operator::Contains, json!(k)))
                })
                .collect(),
        }
    }

    #[test]
    fn test_condition_serde_tagged() {
        let cond: Condition = serde_json::from_value(json!({
            "conditionType": "simple",
            "field": "{{step1.count}}",
            "operator": ">",
            "value": 3
        }))
        .unwrap();
        assert_eq!(cond, Condition::simple("{{step1.count}}", Operator::GreaterThan, json!(3)));
        assert!(cond.evaluate(&json!({"step1": {"count": 4}})));
        assert!(!cond.evaluate(&json!({"step1": {"count": 3}})));
    }

    #[test]
    fn test_parse_expression_precedence() {
        let cond = parse_expression("{{step1.count}} > 3 && subject contains invoice || urgent == true").unwrap();
        match &cond {
            Condition::Or { conditions } => {
                assert_eq!(conditions.len(), 2);
                assert!(matches!(&conditions[0], Condition::And { conditions } if conditions.len() == 2));
            }
            other => panic!("expected or, got {:?}", other),
        }
        assert!(cond.evaluate(&json!({"urgent": true})));
        assert!(cond.evaluate(&json!({"step1": {"count": 5}, "subject": "Your INVOICE"})));
        assert!(!cond.evaluate(&json!({"step1": {"count": 5}, "subject": "hello"})));
    }

    #[test]
    fn test_parse_expression_forms() {
        assert_eq!(
            parse_expression("status == 'open'").unwrap(),
            Condition::simple("status", Operator::Equals, json!("open"))
        );
        assert_eq!(
            parse_expression("priority in [high, 2]").unwrap(),
            Condition::simple("priority", Operator::In, json!(["high", 2]))
        );
        assert_eq!(
            parse_expression("attachments exists").unwrap(),
            Condition::simple("attachments", Operator::Exists, Value::Null)
        );
        assert!(matches!(parse_expression("!(a == 1)").unwrap(), Condition::Not { .. }));
        assert!(parse_expression("true").unwrap().is_always_true());
        assert!(!parse_expression("false").unwrap().evaluate(&json!({})));
        assert_eq!(parse_expression("  "), Err(ConditionParseError::Empty));
        assert!(matches!(parse_expression("(a == 1"), Err(ConditionParseError::Unbalanced(_))));
        assert!(matches!(parse_expression("== 1"), Err(ConditionParseError::MissingField(_))));
    }

    #[test]
    fn test_quoted_operator_is_literal() {
        let cond = parse_expression("subject == 'a && b'").unwrap();
        assert_eq!(cond, Condition::simple("subject", Operator::Equals, json!("a && b")));
    }

    #[test]
    fn test_operators() {
        let row = json!({"n": "7", "tags": ["Urgent", "ops"], "meta": {"k": 1}, "none": null});
        assert!(Condition::simple("n", Operator::GreaterOrEqual, json!(7)).evaluate(&row));
        assert!(Condition::simple("n", Operator::Equals, json!(7)).evaluate(&row));
        assert!(Condition::simple("tags", Operator::Contains, json!("urgent")).evaluate(&row));
        assert!(Condition::simple("meta", Operator::Contains, json!("k")).evaluate(&row));
        assert!(Condition::simple("none", Operator::NotExists, Value::Null).evaluate(&row));
        assert!(Condition::simple("missing", Operator::NotContains, json!("x")).evaluate(&row));
        assert!(!Condition::simple("missing", Operator::LessThan, json!(1)).evaluate(&row));
        assert!(Condition::simple("tags.1", Operator::In, json!(["ops", "dev"])).evaluate(&row));
    }

    #[test]
    fn test_simplify_cross_product() {
        let fields = ["subject", "body"];
        let keywords = ["invoice", "receipt", "bill", "payment", "due"];
        let simplified = keyword_disjunction(&fields, &keywords).simplify(10);
        assert_eq!(
            simplified,
            Condition::KeywordSet {
                fields: fields.iter().map(|s| s.to_string()).collect(),
                keywords: keywords.iter().map(|s| s.to_string()).collect(),
            }
        );
    }

    #[test]
    fn test_simplify_leaves_small_or_partial() {
        let small = keyword_disjunction(&["subject"], &["a", "b", "c"]);
        assert_eq!(small.clone().simplify(10), small);

        let mut partial = keyword_disjunction(&["subject", "body"], &["a", "b", "c", "d", "e", "f"]);
        if let Condition::Or { conditions } = &mut partial {
            conditions.pop();
        }
        assert!(matches!(partial.simplify(10), Condition::Or { .. }));
    }

    #[test]
    fn test_simplify_nested() {
        let inner = keyword_disjunction(&["subject"], &["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"]);
        let cond = Condition::And {
            conditions: vec![inner, Condition::simple("x", Operator::Exists, Value::Null)],
        };
        match cond.simplify(10) {
            Condition::And { conditions } => {
                assert!(matches!(conditions[0], Condition::KeywordSet { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    proptest! {
        #[test]
        fn prop_simplified_condition_is_equivalent(
            subject in "[a-zA-Z ]{0,24}",
            body in proptest::option::of("[a-zA-Z ]{0,24}"),
            keyword_count in 5usize..8,
        ) {
            let keywords = ["inv", "Pay", "due", "bill", "a", "zz", "Rec", "x"];
            let original = keyword_disjunction(&["subject", "body"], &keywords[..keyword_count]);
            let simplified = original.clone().simplify(10);
            prop_assert!(matches!(simplified, Condition::KeywordSet { .. }), "disjunction was not collapsed");

            let mut row = serde_json::Map::new();
            row.insert("subject".into(), json!(subject));
            if let Some(body) = body {
                row.insert("body".into(), json!(body));
            }
            let row = Value::Object(row);
            prop_assert_eq!(original.evaluate(&row), simplified.evaluate(&row));
        }
    }
}
