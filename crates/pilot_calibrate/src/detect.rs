//! Hardcoded value detection.
//!
//! Walks a step's configuration and reports literals that look like they
//! should be user-settable inputs. Each literal lands in exactly one
//! category, checked in order:
//!
//! 1. `resource_ids`: opaque identifiers, URLs and id-like parameter names
//! 2. `business_logic`: condition operands, keyword lists and thresholds
//! 3. `configuration`: recipients, addresses and similar settings
//!
//! Free text (message bodies, prompts) and references (`{{...}}`) are
//! never reported. Identical literals found in several steps merge into one
//! finding listing every step.

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use pilot_core::StepId;
use pilot_plan::condition::parse_expression;
use pilot_plan::{CompiledStep, Condition, StepKind};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::debug;

static INPUT_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*input\.([A-Za-z0-9_]+)\s*\}\}").expect("input token pattern is valid"));
static OPAQUE_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_\-]{20,}$").expect("opaque id pattern is valid"));
static URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^https?://\S+$").expect("url pattern is valid"));
static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[A-Za-z]{2,}$").expect("email pattern is valid"));

/// Parameter names (or suffixes) that hold resource identifiers
const RESOURCE_KEYS: &[&str] = &[
    "id", "ids", "spreadsheet", "sheet", "folder", "file", "document", "database", "table", "calendar", "channel",
    "board", "range", "url", "link",
];

/// Parameter names that hold business rules
const LOGIC_KEYS: &[&str] = &[
    "query", "filter", "keywords", "keyword", "threshold", "condition", "min", "max", "limit", "amount", "status",
    "label", "labels", "priority",
];

/// Parameter names that hold deployment settings
const CONFIG_KEYS: &[&str] = &[
    "to", "cc", "bcc", "recipient", "recipients", "email", "from", "sender", "subject", "timezone", "language",
    "locale", "format", "tab", "sheet_name", "currency",
];

/// Finding category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardcodeCategory {
    /// Identifiers of external resources
    ResourceIds,
    /// Values that encode business rules
    BusinessLogic,
    /// Environment-specific settings
    Configuration,
}

impl HardcodeCategory {
    fn fallback_param(self) -> &'static str {
        match self {
            Self::ResourceIds => "resource_id",
            Self::BusinessLogic => "rule_value",
            Self::Configuration => "setting",
        }
    }
}

/// A literal that is a candidate for a user input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardcodedValue {
    /// Category
    pub category: HardcodeCategory,
    /// The literal
    pub value: Value,
    /// Steps containing the literal, in first-seen order
    pub step_ids: Vec<StepId>,
    /// Where the literal sits, e.g. `step1.params.spreadsheet_id`
    pub paths: Vec<String>,
    /// Input name to promote the literal to
    pub suggested_param: String,
    /// Existing input already holding this value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_input: Option<String>,
}

/// Findings grouped by category
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionReport {
    /// Resource identifiers
    pub resource_ids: Vec<HardcodedValue>,
    /// Business rules
    pub business_logic: Vec<HardcodedValue>,
    /// Settings
    pub configuration: Vec<HardcodedValue>,
}

impl DetectionReport {
    /// Number of findings
    #[must_use]
    pub fn len(&self) -> usize {
        self.resource_ids.len() + self.business_logic.len() + self.configuration.len()
    }

    /// Whether nothing was found
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every finding, by category order
    pub fn iter(&self) -> impl Iterator<Item = &HardcodedValue> {
        self.resource_ids
            .iter()
            .chain(&self.business_logic)
            .chain(&self.configuration)
    }
}

/// One literal occurrence before merging
struct Occurrence {
    category: HardcodeCategory,
    value: Value,
    step: StepId,
    path: String,
    key: Option<String>,
}

/// Rule-based hardcoded value detector
#[derive(Debug, Clone, Default)]
pub struct HardcodeDetector;

impl HardcodeDetector {
    /// Create a detector
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Scan `steps` (nested steps included).
    ///
    /// `inputs` are the workflow's current input values; a finding whose
    /// literal equals one of them names it in `existing_input`.
    #[must_use]
    pub fn detect(&self, steps: &[CompiledStep], inputs: Option<&Map<String, Value>>) -> DetectionReport {
        let mut found = Vec::new();
        for step in steps {
            scan_step(step, &mut found);
        }

        let mut merged: IndexMap<(HardcodeCategory, String), HardcodedValue> = IndexMap::new();
        for occurrence in found {
            let identity = (occurrence.category, occurrence.value.to_string());
            let entry = merged.entry(identity).or_insert_with(|| HardcodedValue {
                category: occurrence.category,
                value: occurrence.value.clone(),
                step_ids: Vec::new(),
                paths: Vec::new(),
                suggested_param: suggest_param(occurrence.key.as_deref(), occurrence.category),
                existing_input: inputs.and_then(|inputs| {
                    inputs
                        .iter()
                        .find(|(_, v)| **v == occurrence.value)
                        .map(|(name, _)| name.clone())
                }),
            });
            if !entry.step_ids.contains(&occurrence.step) {
                entry.step_ids.push(occurrence.step);
            }
            if !entry.paths.contains(&occurrence.path) {
                entry.paths.push(occurrence.path);
            }
        }

        let mut report = DetectionReport::default();
        let mut taken = HashSet::new();
        for (_, mut finding) in merged {
            finding.suggested_param = unique_name(&finding.suggested_param, &mut taken);
            match finding.category {
                HardcodeCategory::ResourceIds => report.resource_ids.push(finding),
                HardcodeCategory::BusinessLogic => report.business_logic.push(finding),
                HardcodeCategory::Configuration => report.configuration.push(finding),
            }
        }
        debug!(findings = report.len(), "hardcode scan finished");
        report
    }
}

/// Input names a step already references through `{{input.name}}`
#[must_use]
pub fn referenced_inputs(step: &CompiledStep) -> Vec<String> {
    let serialized = serde_json::to_string(step).unwrap_or_default();
    let mut names: Vec<String> = Vec::new();
    for capture in INPUT_TOKEN.captures_iter(&serialized) {
        let name = &capture[1];
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

fn scan_step(step: &CompiledStep, out: &mut Vec<Occurrence>) {
    let prefix = step.id.as_str();
    match &step.kind {
        StepKind::Action { params, .. } => scan_map(&step.id, &format!("{}.params", prefix), params, out),
        StepKind::AiProcessing { params, .. } => scan_map(&step.id, &format!("{}.params", prefix), params, out),
        StepKind::Transform { config, .. } => {
            for (key, value) in config {
                let path = format!("{}.config.{}", prefix, key);
                match (key.as_str(), value) {
                    ("condition", Value::String(expr)) => {
                        if let Ok(condition) = parse_expression(expr) {
                            scan_condition(&step.id, &path, &condition, out);
                        }
                    }
                    ("condition", Value::Object(_)) => {
                        if let Ok(condition) = serde_json::from_value::<Condition>(value.clone()) {
                            scan_condition(&step.id, &path, &condition, out);
                        }
                    }
                    ("input" | "template" | "fields" | "expression", _) => {}
                    _ => scan_value(&step.id, &path, Some(key), value, out),
                }
            }
        }
        StepKind::Conditional { condition, .. } => {
            scan_condition(&step.id, &format!("{}.condition", prefix), condition, out);
        }
        StepKind::Loop { .. } | StepKind::ScatterGather { .. } => {}
    }
    for nested in step.kind.nested_steps() {
        scan_step(nested, out);
    }
}

fn scan_map(step: &StepId, path: &str, map: &Map<String, Value>, out: &mut Vec<Occurrence>) {
    for (key, value) in map {
        scan_value(step, &format!("{}.{}", path, key), Some(key), value, out);
    }
}

fn scan_value(step: &StepId, path: &str, key: Option<&str>, value: &Value, out: &mut Vec<Occurrence>) {
    match value {
        Value::Object(map) => scan_map(step, path, map, out),
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                scan_value(step, &format!("{}[{}]", path, index), key, item, out);
            }
        }
        Value::String(text) if text.contains("{{") => {}
        Value::String(_) | Value::Number(_) => {
            if let Some(category) = categorize(key, value) {
                out.push(Occurrence {
                    category,
                    value: value.clone(),
                    step: step.clone(),
                    path: path.to_string(),
                    key: key.map(str::to_string),
                });
            }
        }
        Value::Bool(_) | Value::Null => {}
    }
}

fn scan_condition(step: &StepId, path: &str, condition: &Condition, out: &mut Vec<Occurrence>) {
    match condition {
        Condition::Simple { field, value, .. } => {
            let key = field_key(field);
            match value {
                Value::String(text) if text.contains("{{") || text.is_empty() => {}
                Value::String(_) | Value::Number(_) => out.push(Occurrence {
                    category: HardcodeCategory::BusinessLogic,
                    value: value.clone(),
                    step: step.clone(),
                    path: format!("{}.value", path),
                    key: Some(key),
                }),
                Value::Array(items) => {
                    for (index, item) in items.iter().enumerate() {
                        if item.is_string() || item.is_number() {
                            out.push(Occurrence {
                                category: HardcodeCategory::BusinessLogic,
                                value: item.clone(),
                                step: step.clone(),
                                path: format!("{}.value[{}]", path, index),
                                key: Some(key.clone()),
                            });
                        }
                    }
                }
                _ => {}
            }
        }
        Condition::And { conditions } | Condition::Or { conditions } => {
            for (index, child) in conditions.iter().enumerate() {
                scan_condition(step, &format!("{}.conditions[{}]", path, index), child, out);
            }
        }
        Condition::Not { condition } => scan_condition(step, &format!("{}.condition", path), condition, out),
        Condition::KeywordSet { keywords, .. } => {
            if !keywords.is_empty() {
                out.push(Occurrence {
                    category: HardcodeCategory::BusinessLogic,
                    value: Value::from(keywords.clone()),
                    step: step.clone(),
                    path: format!("{}.keywords", path),
                    key: Some("keywords".to_string()),
                });
            }
        }
    }
}

fn categorize(key: Option<&str>, value: &Value) -> Option<HardcodeCategory> {
    let key = key.map(str::to_ascii_lowercase);
    let key = key.as_deref().unwrap_or_default();
    let text = value.as_str().map(str::trim);

    if key_matches(key, RESOURCE_KEYS) && !key_matches(key, CONFIG_KEYS) {
        return Some(HardcodeCategory::ResourceIds);
    }
    if let Some(text) = text {
        if URL.is_match(text) || (OPAQUE_ID.is_match(text) && text.chars().any(|c| c.is_ascii_digit())) {
            return Some(HardcodeCategory::ResourceIds);
        }
    }
    if key_matches(key, LOGIC_KEYS) {
        return Some(HardcodeCategory::BusinessLogic);
    }
    if key_matches(key, CONFIG_KEYS) || text.is_some_and(|t| EMAIL.is_match(t)) {
        return Some(HardcodeCategory::Configuration);
    }
    None
}

/// Whether `key` is one of `names` or ends with `_{name}`
fn key_matches(key: &str, names: &[&str]) -> bool {
    names
        .iter()
        .any(|name| key == *name || key.ends_with(&format!("_{}", name)) || key.starts_with(&format!("{}_", name)))
}

/// Last path segment of a condition field, without braces
fn field_key(field: &str) -> String {
    let bare = field.trim().trim_start_matches("{{").trim_end_matches("}}").trim();
    bare.rsplit('.').next().unwrap_or(bare).to_string()
}

fn suggest_param(key: Option<&str>, category: HardcodeCategory) -> String {
    let name: String = key
        .unwrap_or_default()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    let name = name.trim_matches('_');
    if name.is_empty() || name.chars().all(|c| c.is_ascii_digit()) {
        category.fallback_param().to_string()
    } else {
        name.to_string()
    }
}

fn unique_name(base: &str, taken: &mut HashSet<String>) -> String {
    let mut candidate = base.to_string();
    let mut n = 2;
    while !taken.insert(candidate.clone()) {
        candidate = format!("{}_{}", base, n);
        n += 1;
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_plan::{Operator, TransformOp};
    use serde_json::json;

    fn action(id: &str, params: Value) -> CompiledStep {
        CompiledStep::action(id, "google-sheets", "read_range", params.as_object().cloned().unwrap())
    }

    #[test]
    fn test_literal_spreadsheet_id() {
        let step = action(
            "step1",
            json!({"spreadsheet_id": "1BxiMVs0XRA5nFMdKvBdBZjgmUUqptlbs74OgvE2upms"}),
        );
        let report = HardcodeDetector::new().detect(std::slice::from_ref(&step), None);

        assert_eq!(report.resource_ids.len(), 1);
        assert!(report.business_logic.is_empty());
        assert!(report.configuration.is_empty());
        assert_eq!(report.resource_ids[0].suggested_param, "spreadsheet_id");
        assert_eq!(report.resource_ids[0].paths, vec!["step1.params.spreadsheet_id"]);
        assert!(referenced_inputs(&step).is_empty());
    }

    #[test]
    fn test_identical_literals_merge_across_steps() {
        let steps = vec![
            action("step1", json!({"spreadsheet_id": "sheet-2024-finance-q1-xyz"})),
            action("step2", json!({"spreadsheet_id": "sheet-2024-finance-q1-xyz", "range": "A1:D20"})),
        ];
        let report = HardcodeDetector::new().detect(&steps, None);

        assert_eq!(report.resource_ids.len(), 2);
        let sheet = &report.resource_ids[0];
        assert_eq!(sheet.step_ids, vec![StepId::from("step1"), StepId::from("step2")]);
        assert_eq!(report.resource_ids[1].suggested_param, "range");
    }

    #[test]
    fn test_categories_and_references() {
        let send = CompiledStep::action(
            "step3",
            "google-mail",
            "send_email",
            json!({
                "to": "finance@example.com",
                "subject": "{{input.subject}}",
                "body": "Here is the weekly report"
            })
            .as_object()
            .cloned()
            .unwrap(),
        );
        let filter = CompiledStep::new(
            "step2",
            "Large invoices",
            StepKind::Transform {
                operation: TransformOp::Filter,
                config: json!({"input": "{{step1}}", "condition": "amount > 500"})
                    .as_object()
                    .cloned()
                    .unwrap(),
            },
        );
        let check = CompiledStep::new(
            "step4",
            "Urgent?",
            StepKind::Conditional {
                condition: Condition::simple("{{step1.priority}}", Operator::Equals, json!("urgent")),
                true_branch: Vec::new(),
                false_branch: Vec::new(),
            },
        );

        let mut inputs = Map::new();
        inputs.insert("finance_inbox".into(), json!("finance@example.com"));
        let report = HardcodeDetector::new().detect(&[filter, send.clone(), check], Some(&inputs));

        assert!(report.resource_ids.is_empty());
        let logic: Vec<&Value> = report.business_logic.iter().map(|f| &f.value).collect();
        assert_eq!(logic, vec![&json!(500), &json!("urgent")]);
        assert_eq!(report.business_logic[0].suggested_param, "amount");

        assert_eq!(report.configuration.len(), 1);
        assert_eq!(report.configuration[0].value, json!("finance@example.com"));
        assert_eq!(report.configuration[0].existing_input.as_deref(), Some("finance_inbox"));

        assert_eq!(referenced_inputs(&send), vec!["subject"]);
    }

    #[test]
    fn test_colliding_suggestions_are_numbered() {
        let steps = vec![
            action("step1", json!({"folder_id": "folder-aaaaaaaaaaaaaaaaaaaa1"})),
            action("step2", json!({"folder_id": "folder-bbbbbbbbbbbbbbbbbbbb2"})),
        ];
        let report = HardcodeDetector::new().detect(&steps, None);
        let names: Vec<&str> = report.resource_ids.iter().map(|f| f.suggested_param.as_str()).collect();
        assert_eq!(names, vec!["folder_id", "folder_id_2"]);
    }
}
