//! Compiled step model.
//!
//! Every step, whichever strategy produced it, is brought into one tagged
//! shape ([`StepKind`]) before any other component sees it. [`StepParser`]
//! performs that canonicalization on loosely-shaped JSON.

use crate::condition::{parse_expression, Condition, ConditionParseError};
use crate::reference::{references_in_str, whole_token, Reference};
use indexmap::IndexSet;
use pilot_core::StepId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default maximum nesting depth for loops and scatter branches
pub const DEFAULT_MAX_DEPTH: usize = 8;

/// A node of the compiled step graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledStep {
    /// Unique id within the graph
    pub id: StepId,
    /// Human-readable name
    #[serde(default)]
    pub name: String,
    /// Steps that must complete first
    #[serde(default, skip_serializing_if = "IndexSet::is_empty")]
    pub dependencies: IndexSet<StepId>,
    /// Name under which the output is published (transform and scatter only)
    #[serde(
        rename = "outputVariable",
        alias = "output_variable",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub output_variable: Option<String>,
    /// Type-specific fields
    #[serde(flatten)]
    pub kind: StepKind,
}

/// Type-specific step payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Invoke a plugin action
    Action {
        /// Plugin name
        plugin: String,
        /// Action name
        action: String,
        /// Templated parameters
        #[serde(default)]
        params: Map<String, Value>,
    },
    /// Reshape data without external calls
    Transform {
        /// Operation
        operation: TransformOp,
        /// Operation config; `input` names the data to transform
        #[serde(default)]
        config: Map<String, Value>,
    },
    /// Choose between two sets of steps
    Conditional {
        /// Condition to evaluate
        condition: Condition,
        /// Steps run when the condition holds
        #[serde(rename = "trueBranch", default)]
        true_branch: Vec<StepId>,
        /// Steps run otherwise
        #[serde(rename = "falseBranch", default)]
        false_branch: Vec<StepId>,
    },
    /// Run nested steps sequentially for each item
    Loop {
        /// Reference to the collection
        #[serde(rename = "iterateOver")]
        iterate_over: String,
        /// Item cap
        #[serde(rename = "maxIterations", default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<usize>,
        /// Nested steps
        #[serde(rename = "loopSteps", default)]
        loop_steps: Vec<CompiledStep>,
    },
    /// Fan nested steps out per item and gather the results
    ScatterGather {
        /// Fan-out
        scatter: Scatter,
        /// Fan-in
        #[serde(default)]
        gather: Gather,
    },
    /// Generative processing step
    AiProcessing {
        /// Templated prompt
        prompt: String,
        /// Templated parameters
        #[serde(default)]
        params: Map<String, Value>,
    },
}

/// Scatter half of a scatter/gather step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scatter {
    /// Reference to the collection
    pub input: String,
    /// Nested steps run per item
    #[serde(default)]
    pub steps: Vec<CompiledStep>,
    /// Name of the per-item variable
    #[serde(rename = "itemVariable", default, skip_serializing_if = "Option::is_none")]
    pub item_variable: Option<String>,
    /// Item cap
    #[serde(rename = "maxIterations", default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<usize>,
}

/// Gather half of a scatter/gather step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gather {
    /// Aggregation
    #[serde(default)]
    pub operation: GatherOp,
}

/// How scattered results are combined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatherOp {
    /// Ordered list of per-item results
    #[default]
    Collect,
    /// Per-item arrays concatenated
    Flatten,
    /// Per-item objects merged left to right
    Merge,
    /// Number of items
    Count,
}

/// Transform operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformOp {
    /// Project each item
    Map,
    /// Keep items matching `config.condition`
    Filter,
    /// Order by `config.by`
    Sort,
    /// Drop duplicates (optionally by `config.by`)
    Deduplicate,
    /// Number of items
    Count,
    /// Concatenate nested arrays
    Flatten,
    /// Produce `config.value`
    Set,
    /// Render `config.template` to text
    Format,
}

impl StepKind {
    /// Wire name of the step type
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Action { .. } => "action",
            Self::Transform { .. } => "transform",
            Self::Conditional { .. } => "conditional",
            Self::Loop { .. } => "loop",
            Self::ScatterGather { .. } => "scatter_gather",
            Self::AiProcessing { .. } => "ai_processing",
        }
    }

    /// Whether steps of this type may publish a named output variable
    #[must_use]
    pub const fn may_expose_variable(&self) -> bool {
        matches!(self, Self::Transform { .. } | Self::ScatterGather { .. })
    }

    /// Nested steps of loops and scatter branches
    #[must_use]
    pub fn nested_steps(&self) -> &[CompiledStep] {
        match self {
            Self::Loop { loop_steps, .. } => loop_steps,
            Self::ScatterGather { scatter, .. } => &scatter.steps,
            _ => &[],
        }
    }

    /// Mutable nested steps
    pub fn nested_steps_mut(&mut self) -> Option<&mut Vec<CompiledStep>> {
        match self {
            Self::Loop { loop_steps, .. } => Some(loop_steps),
            Self::ScatterGather { scatter, .. } => Some(&mut scatter.steps),
            _ => None,
        }
    }

    /// Name of the per-item variable in nested scope
    #[must_use]
    pub fn item_variable(&self) -> Option<&str> {
        match self {
            Self::Loop { .. } => Some("item"),
            Self::ScatterGather { scatter, .. } => Some(scatter.item_variable.as_deref().unwrap_or("item")),
            _ => None,
        }
    }
}

impl CompiledStep {
    /// Create a step with no dependencies
    pub fn new(id: impl Into<StepId>, name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            dependencies: IndexSet::new(),
            output_variable: None,
            kind,
        }
    }

    /// Action step shorthand
    pub fn action(id: impl Into<StepId>, plugin: &str, action: &str, params: Map<String, Value>) -> Self {
        Self::new(
            id,
            format!("{}.{}", plugin, action),
            StepKind::Action {
                plugin: plugin.to_string(),
                action: action.to_string(),
                params,
            },
        )
    }

    /// Add a dependency
    #[must_use]
    pub fn depends_on(mut self, id: impl Into<StepId>) -> Self {
        self.dependencies.insert(id.into());
        self
    }

    /// Set the output variable
    #[must_use]
    pub fn with_output_variable(mut self, name: impl Into<String>) -> Self {
        self.output_variable = Some(name.into());
        self
    }

    /// Wire name of the step type
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    /// The variable name this step publishes, if any
    #[must_use]
    pub fn exposed_variable(&self) -> Option<&str> {
        if self.kind.may_expose_variable() {
            self.output_variable.as_deref()
        } else {
            None
        }
    }

    /// Visit every templated string of this step.
    ///
    /// With `deep`, strings of nested steps are visited too.
    pub fn visit_strings(&self, deep: bool, f: &mut dyn FnMut(&str)) {
        match &self.kind {
            StepKind::Action { params, .. } => params.values().for_each(|v| visit_value(v, f)),
            StepKind::AiProcessing { prompt, params } => {
                f(prompt);
                params.values().for_each(|v| visit_value(v, f));
            }
            StepKind::Transform { config, .. } => config.values().for_each(|v| visit_value(v, f)),
            StepKind::Conditional { condition, .. } => condition.visit_strings(f),
            StepKind::Loop { iterate_over, .. } => f(iterate_over),
            StepKind::ScatterGather { scatter, .. } => f(&scatter.input),
        }
        if deep {
            for nested in self.kind.nested_steps() {
                nested.visit_strings(true, f);
            }
        }
    }

    /// Mutable variant of [`CompiledStep::visit_strings`]
    pub fn visit_strings_mut(&mut self, deep: bool, f: &mut dyn FnMut(&mut String)) {
        match &mut self.kind {
            StepKind::Action { params, .. } => params.values_mut().for_each(|v| visit_value_mut(v, f)),
            StepKind::AiProcessing { prompt, params } => {
                f(prompt);
                params.values_mut().for_each(|v| visit_value_mut(v, f));
            }
            StepKind::Transform { config, .. } => config.values_mut().for_each(|v| visit_value_mut(v, f)),
            StepKind::Conditional { condition, .. } => condition.visit_strings_mut(f),
            StepKind::Loop { iterate_over, .. } => f(iterate_over),
            StepKind::ScatterGather { scatter, .. } => f(&mut scatter.input),
        }
        if deep {
            if let Some(nested) = self.kind.nested_steps_mut() {
                for step in nested {
                    step.visit_strings_mut(true, f);
                }
            }
        }
    }

    /// Every `{{...}}` reference in this step
    #[must_use]
    pub fn references(&self, deep: bool) -> Vec<Reference> {
        let mut out = Vec::new();
        self.visit_strings(deep, &mut |s| out.extend(references_in_str(s)));
        out
    }

    /// Whether this is a `map` transform that returns its input unchanged
    #[must_use]
    pub fn is_identity_map(&self) -> bool {
        let StepKind::Transform {
            operation: TransformOp::Map,
            config,
        } = &self.kind
        else {
            return false;
        };
        let projects = config
            .get("fields")
            .is_some_and(|f| f.as_object().is_some_and(|m| !m.is_empty()));
        let expression = config.get("expression").and_then(Value::as_str);
        !projects && expression.is_none_or(|e| whole_token(e).is_some_and(|r| r.root == "item" && r.path.is_empty()))
    }

    /// Whether this is a `filter` transform that keeps every item
    #[must_use]
    pub fn is_always_true_filter(&self) -> bool {
        let StepKind::Transform {
            operation: TransformOp::Filter,
            config,
        } = &self.kind
        else {
            return false;
        };
        match config.get("condition") {
            None | Some(Value::Null) | Some(Value::Bool(true)) => true,
            Some(value) => serde_json::from_value::<Condition>(value.clone()).is_ok_and(|c| c.is_always_true()),
        }
    }

    /// Dotted reference to the data this transform consumes.
    ///
    /// Taken from `config.input` when it is a single token, otherwise the
    /// first dependency.
    #[must_use]
    pub fn upstream_input(&self) -> Option<String> {
        if let StepKind::Transform { config, .. } = &self.kind {
            if let Some(r) = config.get("input").and_then(Value::as_str).and_then(whole_token) {
                return Some(r.dotted());
            }
        }
        self.dependencies.first().map(|id| id.to_string())
    }
}

fn visit_value(value: &Value, f: &mut dyn FnMut(&str)) {
    match value {
        Value::String(s) => f(s),
        Value::Array(items) => items.iter().for_each(|v| visit_value(v, f)),
        Value::Object(map) => map.values().for_each(|v| visit_value(v, f)),
        _ => {}
    }
}

fn visit_value_mut(value: &mut Value, f: &mut dyn FnMut(&mut String)) {
    match value {
        Value::String(s) => f(s),
        Value::Array(items) => items.iter_mut().for_each(|v| visit_value_mut(v, f)),
        Value::Object(map) => map.values_mut().for_each(|v| visit_value_mut(v, f)),
        _ => {}
    }
}

/// Error canonicalizing loosely-shaped steps
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepParseError {
    /// Expected a list of steps
    #[error("expected a list of steps at {path}")]
    NotAList {
        /// Location
        path: String,
    },
    /// A step is not a JSON object
    #[error("step at {path} is not an object")]
    NotAnObject {
        /// Location
        path: String,
    },
    /// Nesting deeper than allowed
    #[error("nesting depth {depth} exceeds maximum {max}")]
    TooDeep {
        /// Depth reached
        depth: usize,
        /// Configured maximum
        max: usize,
    },
    /// Step type missing and not inferable
    #[error("step {id} has no recognizable type")]
    MissingType {
        /// Step id
        id: String,
    },
    /// A string condition could not be parsed
    #[error("step {id} condition: {source}")]
    InvalidCondition {
        /// Step id
        id: String,
        /// Parse failure
        source: ConditionParseError,
    },
    /// Step fields do not match the step schema
    #[error("step {id} is malformed: {reason}")]
    Malformed {
        /// Step id
        id: String,
        /// Deserialization error
        reason: String,
    },
}

/// Canonicalizes loosely-shaped step JSON into [`CompiledStep`]s.
///
/// Handles the legacy scatter shape (`data` + `actions`), string conditions,
/// snake_case/camelCase aliases, combined `plugin.action` names and missing
/// ids. Recursion into nested steps is bounded by `max_depth`.
#[derive(Debug, Clone)]
pub struct StepParser {
    /// Maximum nesting depth
    pub max_depth: usize,
}

impl StepParser {
    /// Create a parser with the default depth limit
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    /// Set the depth limit
    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Parse a step list, or an object wrapping one under `workflow` or `steps`
    ///
    /// # Errors
    ///
    /// Returns error if any step cannot be canonicalized
    pub fn parse(&self, value: &Value) -> Result<Vec<CompiledStep>, StepParseError> {
        let list = match value {
            Value::Array(items) => items,
            Value::Object(map) => match map.get("workflow").or_else(|| map.get("steps")) {
                Some(Value::Array(items)) => items,
                _ => {
                    return Err(StepParseError::NotAList {
                        path: "$".to_string(),
                    });
                }
            },
            _ => {
                return Err(StepParseError::NotAList {
                    path: "$".to_string(),
                });
            }
        };
        self.parse_list(list, 0, None, "$")
    }

    fn parse_list(
        &self,
        items: &[Value],
        depth: usize,
        parent: Option<&str>,
        path: &str,
    ) -> Result<Vec<CompiledStep>, StepParseError> {
        if depth > self.max_depth {
            return Err(StepParseError::TooDeep {
                depth,
                max: self.max_depth,
            });
        }
        items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let canonical = self.canonicalize(item, depth, parent, i + 1, &format!("{}[{}]", path, i))?;
                let id = canonical.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
                serde_json::from_value(Value::Object(canonical)).map_err(|e| StepParseError::Malformed {
                    id,
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    fn canonicalize(
        &self,
        value: &Value,
        depth: usize,
        parent: Option<&str>,
        position: usize,
        path: &str,
    ) -> Result<Map<String, Value>, StepParseError> {
        let Value::Object(raw) = value else {
            return Err(StepParseError::NotAnObject {
                path: path.to_string(),
            });
        };
        let mut step = raw.clone();

        rename(&mut step, &["step_id", "stepId"], "id");
        let id = match step.get("id") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => format!("step{}", n),
            _ => match parent {
                Some(parent) => format!("{}_{}", parent, position),
                None => StepId::numbered(position).to_string(),
            },
        };
        step.insert("id".into(), Value::String(id.clone()));

        rename(&mut step, &["depends_on", "dependsOn"], "dependencies");
        if let Some(Value::String(dep)) = step.get("dependencies") {
            let dep = dep.clone();
            step.insert("dependencies".into(), Value::Array(vec![Value::String(dep)]));
        }
        rename(&mut step, &["output_variable", "output"], "outputVariable");
        rename(&mut step, &["parameters"], "params");

        let ty = step
            .get("type")
            .and_then(Value::as_str)
            .map(canonical_type)
            .or_else(|| infer_type(&step))
            .ok_or_else(|| StepParseError::MissingType { id: id.clone() })?;
        step.insert("type".into(), Value::String(ty.to_string()));

        match ty {
            "action" => split_plugin_action(&mut step),
            "transform" => {
                rename(&mut step, &["op"], "operation");
                let mut config = match step.remove("config") {
                    Some(Value::Object(map)) => map,
                    _ => Map::new(),
                };
                if let Some(input) = step.remove("input") {
                    config.entry("input").or_insert(input);
                }
                if let Some(Value::String(expr)) = config.get("condition") {
                    let cond = parse_condition(expr, &id)?;
                    config.insert("condition".into(), cond);
                }
                step.insert("config".into(), Value::Object(config));
            }
            "conditional" => {
                rename(&mut step, &["true_branch"], "trueBranch");
                rename(&mut step, &["false_branch"], "falseBranch");
                for key in ["trueBranch", "falseBranch"] {
                    if let Some(Value::String(s)) = step.get(key) {
                        let s = s.clone();
                        step.insert(key.into(), Value::Array(vec![Value::String(s)]));
                    }
                }
                if let Some(Value::String(expr)) = step.get("condition") {
                    let cond = parse_condition(expr, &id)?;
                    step.insert("condition".into(), cond);
                }
            }
            "loop" => {
                rename(&mut step, &["iterate_over", "items"], "iterateOver");
                rename(&mut step, &["max_iterations"], "maxIterations");
                rename(&mut step, &["loop_steps", "steps"], "loopSteps");
                if let Some(Value::Array(nested)) = step.remove("loopSteps") {
                    let nested = self.canonicalize_list(&nested, depth + 1, &id, &format!("{}.loopSteps", path))?;
                    step.insert("loopSteps".into(), Value::Array(nested));
                }
            }
            "scatter_gather" => self.canonicalize_scatter(&mut step, depth, &id, path)?,
            _ => {}
        }

        Ok(step)
    }

    fn canonicalize_list(
        &self,
        items: &[Value],
        depth: usize,
        parent: &str,
        path: &str,
    ) -> Result<Vec<Value>, StepParseError> {
        if depth > self.max_depth {
            return Err(StepParseError::TooDeep {
                depth,
                max: self.max_depth,
            });
        }
        items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                self.canonicalize(item, depth, Some(parent), i + 1, &format!("{}[{}]", path, i))
                    .map(Value::Object)
            })
            .collect()
    }

    fn canonicalize_scatter(
        &self,
        step: &mut Map<String, Value>,
        depth: usize,
        id: &str,
        path: &str,
    ) -> Result<(), StepParseError> {
        let mut scatter = match step.remove("scatter") {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        // Legacy shape: data + actions at the top level
        if let Some(data) = step.remove("data") {
            scatter.entry("input").or_insert(data);
        }
        if let Some(actions) = step.remove("actions") {
            scatter.entry("steps").or_insert(actions);
        }
        for (from, to) in [
            ("item_variable", "itemVariable"),
            ("itemVariable", "itemVariable"),
            ("max_iterations", "maxIterations"),
            ("maxIterations", "maxIterations"),
        ] {
            if let Some(v) = step.remove(from) {
                scatter.entry(to).or_insert(v);
            }
        }
        rename(&mut scatter, &["item_variable"], "itemVariable");
        rename(&mut scatter, &["max_iterations"], "maxIterations");

        if let Some(Value::Array(nested)) = scatter.remove("steps") {
            let nested = self.canonicalize_list(&nested, depth + 1, id, &format!("{}.scatter.steps", path))?;
            scatter.insert("steps".into(), Value::Array(nested));
        }
        step.insert("scatter".into(), Value::Object(scatter));

        let gather = match step.remove("gather") {
            Some(Value::String(op)) => serde_json::json!({ "operation": op }),
            Some(Value::Object(map)) => Value::Object(map),
            _ => match step.remove("gather_operation").or_else(|| step.remove("gatherOperation")) {
                Some(op) => serde_json::json!({ "operation": op }),
                None => serde_json::json!({}),
            },
        };
        step.insert("gather".into(), gather);
        Ok(())
    }
}

impl Default for StepParser {
    fn default() -> Self {
        Self::new()
    }
}

fn rename(map: &mut Map<String, Value>, aliases: &[&str], canonical: &str) {
    for alias in aliases {
        if let Some(v) = map.remove(*alias) {
            map.entry(canonical).or_insert(v);
        }
    }
}

fn canonical_type(raw: &str) -> &'static str {
    match raw.to_ascii_lowercase().replace('-', "_").as_str() {
        "transform" => "transform",
        "conditional" | "condition" | "if" => "conditional",
        "loop" | "foreach" | "for_each" => "loop",
        "scatter_gather" | "scattergather" | "scatter" | "parallel" => "scatter_gather",
        "ai_processing" | "ai" | "llm" | "ai_process" | "llm_decision" => "ai_processing",
        _ => "action",
    }
}

fn infer_type(step: &Map<String, Value>) -> Option<&'static str> {
    if step.contains_key("plugin") || step.contains_key("action") {
        Some("action")
    } else if step.contains_key("operation") || step.contains_key("op") {
        Some("transform")
    } else if step.contains_key("scatter") || step.contains_key("actions") {
        Some("scatter_gather")
    } else if step.contains_key("condition") {
        Some("conditional")
    } else if step.contains_key("loopSteps") || step.contains_key("loop_steps") {
        Some("loop")
    } else if step.contains_key("prompt") {
        Some("ai_processing")
    } else {
        None
    }
}

/// `{"action": "google-mail.send_email"}` without a plugin splits on the dot
fn split_plugin_action(step: &mut Map<String, Value>) {
    if step.contains_key("plugin") {
        return;
    }
    let Some(Value::String(combined)) = step.get("action") else {
        return;
    };
    if let Some((plugin, action)) = combined.split_once('.') {
        let (plugin, action) = (plugin.to_string(), action.to_string());
        step.insert("plugin".into(), Value::String(plugin));
        step.insert("action".into(), Value::String(action));
    }
}

fn parse_condition(expr: &str, id: &str) -> Result<Value, StepParseError> {
    let cond = parse_expression(expr).map_err(|source| StepParseError::InvalidCondition {
        id: id.to_string(),
        source,
    })?;
    serde_json::to_value(cond).map_err(|e| StepParseError::Malformed {
        id: id.to_string(),
        reason: e.to_string(),
    })
}
