//! Variable pool and `{{ref}}` resolution.
//!
//! The pool maps reference roots to values: `input` to the workflow inputs,
//! each completed step id to its raw output, named output variables to the
//! same output and, inside scatter and loop bodies, item variables and
//! nested step outputs. Scopes chain to their parent, so a nested body sees
//! everything the enclosing step sees.

use indexmap::IndexMap;
use pilot_plan::condition::{lookup_path, FieldSource};
use pilot_plan::reference::{replace_references, strip_braces, whole_token, Reference};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Resolution result
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    /// Resolved value
    pub value: Value,
    /// Tokens that resolved to nothing
    pub unresolved: Vec<String>,
}

impl Resolved {
    fn new(value: Value) -> Self {
        Self {
            value,
            unresolved: Vec::new(),
        }
    }
}

/// Scoped variable pool
#[derive(Debug, Clone, Default)]
pub struct VariablePool {
    values: IndexMap<String, Value>,
    parent: Option<Arc<VariablePool>>,
}

impl VariablePool {
    /// Root pool holding the workflow inputs under `input`
    #[must_use]
    pub fn new(inputs: Map<String, Value>) -> Self {
        let mut values = IndexMap::new();
        values.insert("input".to_string(), Value::Object(inputs));
        Self { values, parent: None }
    }

    /// Child scope of `parent`
    #[must_use]
    pub fn scope(parent: Arc<VariablePool>) -> Self {
        Self {
            values: IndexMap::new(),
            parent: Some(parent),
        }
    }

    /// Bind a root in this scope
    pub fn set(&mut self, root: impl Into<String>, value: Value) {
        self.values.insert(root.into(), value);
    }

    /// Bind a step output under its id and, if any, its variable name
    pub fn set_output(&mut self, step_id: &str, variable: Option<&str>, value: Value) {
        if let Some(var) = variable {
            self.values.insert(var.to_string(), value.clone());
        }
        self.values.insert(step_id.to_string(), value);
    }

    /// Value bound to `root`, searching enclosing scopes
    #[must_use]
    pub fn get(&self, root: &str) -> Option<&Value> {
        match self.values.get(root) {
            Some(value) => Some(value),
            None => self.parent.as_deref().and_then(|p| p.get(root)),
        }
    }

    /// Whether `root` is bound anywhere in scope
    #[must_use]
    pub fn contains(&self, root: &str) -> bool {
        self.get(root).is_some()
    }

    /// Typed value of a reference
    #[must_use]
    pub fn lookup(&self, reference: &Reference) -> Option<Value> {
        let root = self.get(&reference.root)?;
        lookup_path(root, &reference.path.join(".")).cloned()
    }

    /// Resolve one string.
    ///
    /// A string that is exactly one token yields the referenced value with
    /// its JSON type (null when unresolved). Otherwise every embedded token
    /// is rendered as text (empty when unresolved).
    #[must_use]
    pub fn resolve_str(&self, text: &str) -> Resolved {
        if let Some(reference) = whole_token(text) {
            return match self.lookup(&reference) {
                Some(value) => Resolved::new(value),
                None => Resolved {
                    value: Value::Null,
                    unresolved: vec![reference.to_string()],
                },
            };
        }
        self.render(text)
    }

    /// Render a template to text regardless of token placement
    #[must_use]
    pub fn render(&self, text: &str) -> Resolved {
        let mut unresolved = Vec::new();
        let out = replace_references(text, |reference| match self.lookup(reference) {
            Some(value) => to_text(&value),
            None => {
                unresolved.push(reference.to_string());
                String::new()
            }
        });
        Resolved {
            value: Value::String(out),
            unresolved,
        }
    }

    /// Resolve every string inside a JSON value
    #[must_use]
    pub fn resolve_value(&self, value: &Value) -> Resolved {
        let mut unresolved = Vec::new();
        let value = self.resolve_into(value, &mut unresolved);
        Resolved { value, unresolved }
    }

    /// Resolve every value of a parameter map
    #[must_use]
    pub fn resolve_map(&self, params: &Map<String, Value>) -> (Map<String, Value>, Vec<String>) {
        let mut unresolved = Vec::new();
        let resolved = params
            .iter()
            .map(|(k, v)| (k.clone(), self.resolve_into(v, &mut unresolved)))
            .collect();
        (resolved, unresolved)
    }

    fn resolve_into(&self, value: &Value, unresolved: &mut Vec<String>) -> Value {
        match value {
            Value::String(s) => {
                let resolved = self.resolve_str(s);
                unresolved.extend(resolved.unresolved);
                resolved.value
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve_into(v, unresolved)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_into(v, unresolved)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

/// Text form of a value inside a template
#[must_use]
pub fn to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl FieldSource for VariablePool {
    fn lookup(&self, field: &str) -> Option<Value> {
        let field = strip_braces(field);
        let (root, path) = field.split_once('.').unwrap_or((field, ""));
        lookup_path(self.get(root)?, path).cloned()
    }
}

/// Field source for per-item conditions.
///
/// Bare fields and `item.*` paths read the item; other roots fall back to
/// the pool.
pub struct ItemFields<'a> {
    /// Current item
    pub item: &'a Value,
    /// Enclosing pool
    pub pool: &'a VariablePool,
}

impl FieldSource for ItemFields<'_> {
    fn lookup(&self, field: &str) -> Option<Value> {
        let field = strip_braces(field);
        if field == "item" {
            return Some(self.item.clone());
        }
        if let Some(path) = field.strip_prefix("item.") {
            return lookup_path(self.item, path).cloned();
        }
        lookup_path(self.item, field)
            .cloned()
            .or_else(|| FieldSource::lookup(self.pool, field))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_plan::condition::{Condition, Operator};
    use proptest::prelude::*;
    use serde_json::json;

    fn pool() -> VariablePool {
        let mut inputs = Map::new();
        inputs.insert("recipient".into(), json!("ops@example.com"));
        let mut pool = VariablePool::new(inputs);
        pool.set_output("step1", None, json!([{"subject": "Invoice 7", "amount": 40}]));
        pool.set_output("step2", Some("summary"), json!({"text": "all good", "count": 1}));
        pool
    }

    #[test]
    fn test_whole_token_keeps_type() {
        let pool = pool();
        assert_eq!(pool.resolve_str("{{step1}}").value, json!([{"subject": "Invoice 7", "amount": 40}]));
        assert_eq!(pool.resolve_str("{{ step1.0.amount }}").value, json!(40));
        assert_eq!(pool.resolve_str("{{summary.count}}").value, json!(1));
        assert_eq!(pool.resolve_str("{{step2}}").value, pool.resolve_str("{{summary}}").value);
    }

    #[test]
    fn test_embedded_tokens_render_text() {
        let pool = pool();
        let out = pool.resolve_str("To {{input.recipient}}: {{summary.text}} ({{summary.count}})");
        assert_eq!(out.value, json!("To ops@example.com: all good (1)"));
        assert!(out.unresolved.is_empty());
    }

    #[test]
    fn test_unresolved_reported_not_fatal() {
        let pool = pool();
        let whole = pool.resolve_str("{{step9.x}}");
        assert_eq!(whole.value, Value::Null);
        assert_eq!(whole.unresolved, vec!["{{step9.x}}"]);

        let embedded = pool.resolve_value(&json!({"body": "a {{ghost}} b", "n": 3}));
        assert_eq!(embedded.value, json!({"body": "a  b", "n": 3}));
        assert_eq!(embedded.unresolved.len(), 1);
    }

    #[test]
    fn test_scopes_shadow_and_inherit() {
        let parent = Arc::new(pool());
        let mut child = VariablePool::scope(Arc::clone(&parent));
        child.set("item", json!({"subject": "Hi"}));
        child.set("step1", json!("shadowed"));
        assert_eq!(child.resolve_str("{{item.subject}} {{input.recipient}}").value, json!("Hi ops@example.com"));
        assert_eq!(child.resolve_str("{{step1}}").value, json!("shadowed"));
        assert!(!parent.contains("item"));
    }

    #[test]
    fn test_conditions_over_pool_and_items() {
        let pool = pool();
        assert!(Condition::simple("{{summary.count}}", Operator::GreaterOrEqual, json!(1)).evaluate(&pool));

        let item = json!({"subject": "Invoice 7"});
        let fields = ItemFields { item: &item, pool: &pool };
        assert!(Condition::simple("subject", Operator::Contains, json!("invoice")).evaluate(&fields));
        assert!(Condition::simple("item.subject", Operator::Contains, json!("7")).evaluate(&fields));
        assert!(Condition::simple("input.recipient", Operator::Exists, Value::Null).evaluate(&fields));
    }

    proptest! {
        #[test]
        fn prop_plain_text_unchanged(text in "[a-zA-Z0-9 .,:!?-]{0,40}") {
            let out = pool().resolve_str(&text);
            prop_assert_eq!(out.value, Value::String(text));
            prop_assert!(out.unresolved.is_empty());
        }

        #[test]
        fn prop_whole_token_keeps_number(n in any::<i64>()) {
            let mut pool = pool();
            pool.set_output("count_step", None, json!(n));
            prop_assert_eq!(pool.resolve_str("{{count_step}}").value, json!(n));
            prop_assert_eq!(pool.resolve_str("n={{count_step}}").value, json!(format!("n={}", n)));
        }
    }
}
