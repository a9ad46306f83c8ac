//! Step execution.
//!
//! [`StepExecutor`] runs one top-level step against a variable pool and
//! reports its output plus side effects: tokens used, whether the input had
//! to be repaired, the untaken conditional branch and the nested runs of
//! loop and scatter bodies.
//!
//! Recursion into nested bodies carries an explicit depth counter and fails
//! past `max_nesting_depth`. Scatter bodies run as tokio tasks, at most
//! `parallelism` at a time, and are gathered in item order.

use crate::classify::StepError;
use crate::engine::EngineConfig;
use crate::plugin::{PluginExecutor, AI_ACTION, AI_PLUGIN};
use crate::resolver::{ItemFields, VariablePool};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use pilot_core::StepId;
use pilot_plan::condition::{lookup_path, parse_expression, Condition, FieldSource};
use pilot_plan::reference::whole_token;
use pilot_plan::{CompiledStep, GatherOp, StepKind, TransformOp};
use serde_json::{json, Map, Value};
use std::any::Any;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

/// One nested step run inside a loop or scatter body
#[derive(Debug, Clone, PartialEq)]
pub struct NestedRun {
    /// `{nested_id}[{index}]`, prefixed by the enclosing run for deeper bodies
    pub step_id: StepId,
    /// Nested step name
    pub step_name: String,
    /// Nested step type
    pub step_type: &'static str,
    /// Item position
    pub index: usize,
    /// Output or failure
    pub result: Result<Value, StepError>,
    /// Tokens consumed by this run
    pub tokens_used: u64,
    /// Dispatch time
    pub started_at: DateTime<Utc>,
    /// Finish time
    pub completed_at: DateTime<Utc>,
    /// Wall time
    pub execution_time_ms: u64,
}

/// Outcome of a top-level step
#[derive(Debug, Clone)]
pub struct StepRun {
    /// Output or failure
    pub result: Result<Value, StepError>,
    /// Tokens consumed, nested runs included
    pub tokens_used: u64,
    /// Input was coerced into the expected shape
    pub auto_repaired: bool,
    /// Members of the branch a conditional did not take
    pub untaken_branch: Vec<StepId>,
    /// Nested runs in item order
    pub nested: Vec<NestedRun>,
    /// Wall time
    pub execution_time_ms: u64,
}

#[derive(Debug, Default)]
struct Effects {
    tokens_used: u64,
    auto_repaired: bool,
    untaken: Vec<StepId>,
    nested: Vec<NestedRun>,
}

impl Effects {
    fn absorb(&mut self, other: Effects) {
        self.tokens_used = self.tokens_used.saturating_add(other.tokens_used);
        self.auto_repaired |= other.auto_repaired;
        self.nested.extend(other.nested);
    }
}

/// Runs steps against a variable pool
#[derive(Clone)]
pub struct StepExecutor {
    plugins: Arc<dyn PluginExecutor>,
    config: EngineConfig,
}

impl std::fmt::Debug for StepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepExecutor").field("config", &self.config).finish_non_exhaustive()
    }
}

impl StepExecutor {
    /// Create an executor
    #[must_use]
    pub fn new(plugins: Arc<dyn PluginExecutor>, config: EngineConfig) -> Self {
        Self { plugins, config }
    }

    /// Run a top-level step. Panics inside the step become failures.
    #[instrument(skip_all, fields(step = %step.id, kind = step.type_name()))]
    pub async fn run(&self, step: &CompiledStep, pool: Arc<VariablePool>) -> StepRun {
        let clock = Instant::now();
        let mut fx = Effects::default();
        let result = AssertUnwindSafe(self.eval(step, pool, 0, "", &mut fx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(StepError::Panicked(panic_message(panic.as_ref()))));
        StepRun {
            result,
            tokens_used: fx.tokens_used,
            auto_repaired: fx.auto_repaired,
            untaken_branch: fx.untaken,
            nested: fx.nested,
            execution_time_ms: elapsed_ms(clock),
        }
    }

    fn eval<'a>(
        &'a self,
        step: &'a CompiledStep,
        pool: Arc<VariablePool>,
        depth: usize,
        prefix: &'a str,
        fx: &'a mut Effects,
    ) -> BoxFuture<'a, Result<Value, StepError>> {
        async move {
            if depth > self.config.max_nesting_depth {
                return Err(StepError::DepthExceeded {
                    depth,
                    max: self.config.max_nesting_depth,
                });
            }
            match &step.kind {
                StepKind::Action { plugin, action, params } => {
                    let (params, unresolved) = pool.resolve_map(params);
                    if !unresolved.is_empty() {
                        debug!(step = %step.id, ?unresolved, "unresolved references in params");
                    }
                    self.call(plugin, action, &params, fx).await
                }
                StepKind::AiProcessing { prompt, params } => {
                    let (mut params, _) = pool.resolve_map(params);
                    params.insert("prompt".into(), pool.render(prompt).value);
                    self.call(AI_PLUGIN, AI_ACTION, &params, fx).await
                }
                StepKind::Transform { operation, config } => transform(*operation, config, step, &pool, fx),
                StepKind::Conditional {
                    condition,
                    true_branch,
                    false_branch,
                } => {
                    let taken = condition.evaluate(pool.as_ref());
                    let untaken = if taken { false_branch } else { true_branch };
                    fx.untaken.extend(untaken.iter().cloned());
                    Ok(json!({
                        "result": taken,
                        "branch": if taken { "true" } else { "false" },
                    }))
                }
                StepKind::Loop {
                    iterate_over,
                    max_iterations,
                    loop_steps,
                } => {
                    let cap = max_iterations.unwrap_or(self.config.default_max_iterations);
                    let items = collection(iterate_over, &pool, cap, fx);
                    let mut results = Vec::with_capacity(items.len());
                    for (index, item) in items.into_iter().enumerate() {
                        let scope = item_scope(&pool, "item", item, index);
                        let out = self
                            .run_body(loop_steps, scope, "item", depth + 1, prefix, index, fx)
                            .await
                            .map_err(|e| StepError::Item {
                                index,
                                source: Box::new(e),
                            })?;
                        results.push(out);
                    }
                    Ok(Value::Array(results))
                }
                StepKind::ScatterGather { scatter, gather } => {
                    let cap = scatter.max_iterations.unwrap_or(self.config.default_max_iterations);
                    let items = collection(&scatter.input, &pool, cap, fx);
                    let item_var = step.kind.item_variable().unwrap_or("item");
                    let results = self
                        .scatter(&scatter.steps, item_var, items, &pool, depth + 1, prefix, fx)
                        .await?;
                    Ok(gather_results(gather.operation, results))
                }
            }
        }
        .boxed()
    }

    async fn call(
        &self,
        plugin: &str,
        action: &str,
        params: &Map<String, Value>,
        fx: &mut Effects,
    ) -> Result<Value, StepError> {
        let output = self
            .plugins
            .execute(plugin, action, params)
            .await
            .map_err(|source| StepError::Plugin {
                plugin: plugin.to_string(),
                action: action.to_string(),
                source,
            })?;
        fx.tokens_used = fx.tokens_used.saturating_add(output.tokens_used);
        Ok(output.data)
    }

    /// Run every item's body, bounded by `parallelism`, results in item order
    #[allow(clippy::too_many_arguments)]
    async fn scatter(
        &self,
        steps: &[CompiledStep],
        item_var: &str,
        items: Vec<Value>,
        pool: &Arc<VariablePool>,
        depth: usize,
        prefix: &str,
        fx: &mut Effects,
    ) -> Result<Vec<Value>, StepError> {
        let steps: Arc<[CompiledStep]> = Arc::from(steps.to_vec());
        let limit = self.config.parallelism.max(1);
        let mut slots: Vec<Option<(Result<Value, StepError>, Effects)>> = (0..items.len()).map(|_| None).collect();
        let mut queue = items.into_iter().enumerate();
        let mut tasks = JoinSet::new();

        loop {
            while tasks.len() < limit {
                let Some((index, item)) = queue.next() else {
                    break;
                };
                let exec = self.clone();
                let steps = Arc::clone(&steps);
                let scope = item_scope(pool, item_var, item, index);
                let item_var = item_var.to_string();
                let prefix = prefix.to_string();
                tasks.spawn(async move {
                    let mut item_fx = Effects::default();
                    let result = AssertUnwindSafe(exec.run_body(&steps, scope, &item_var, depth, &prefix, index, &mut item_fx))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| Err(StepError::Panicked(panic_message(panic.as_ref()))));
                    (index, result, item_fx)
                });
            }
            match tasks.join_next().await {
                Some(Ok((index, result, item_fx))) => {
                    if let Some(slot) = slots.get_mut(index) {
                        *slot = Some((result, item_fx));
                    }
                }
                Some(Err(err)) => return Err(StepError::Execution(format!("scatter task did not finish: {}", err))),
                None => break,
            }
        }

        let mut results = Vec::with_capacity(slots.len());
        let mut first_failure = None;
        for (index, slot) in slots.into_iter().enumerate() {
            let Some((result, item_fx)) = slot else {
                continue;
            };
            fx.absorb(item_fx);
            match result {
                Ok(value) => results.push(value),
                Err(err) => {
                    first_failure.get_or_insert(StepError::Item {
                        index,
                        source: Box::new(err),
                    });
                }
            }
        }
        match first_failure {
            Some(err) => Err(err),
            None => Ok(results),
        }
    }

    /// Run nested steps in order within one item scope; yields the last output
    #[allow(clippy::too_many_arguments)]
    fn run_body<'a>(
        &'a self,
        steps: &'a [CompiledStep],
        scope: VariablePool,
        item_var: &'a str,
        depth: usize,
        prefix: &'a str,
        index: usize,
        fx: &'a mut Effects,
    ) -> BoxFuture<'a, Result<Value, StepError>> {
        async move {
            let mut last = scope.get(item_var).cloned().unwrap_or(Value::Null);
            let mut scope = Arc::new(scope);
            let mut skipped: HashSet<StepId> = HashSet::new();

            for nested in steps {
                if skipped.contains(&nested.id) {
                    continue;
                }
                let run_id = StepId::new(format!("{}{}[{}]", prefix, nested.id, index));
                let child_prefix = format!("{}.", run_id);
                let started_at = Utc::now();
                let clock = Instant::now();
                let mut inner = Effects::default();
                let result = self
                    .eval(nested, Arc::clone(&scope), depth, &child_prefix, &mut inner)
                    .await;

                skipped.extend(inner.untaken.drain(..));
                let children = std::mem::take(&mut inner.nested);
                fx.tokens_used = fx.tokens_used.saturating_add(inner.tokens_used);
                fx.auto_repaired |= inner.auto_repaired;
                fx.nested.push(NestedRun {
                    step_id: run_id,
                    step_name: nested.name.clone(),
                    step_type: nested.type_name(),
                    index,
                    result: result.clone(),
                    tokens_used: inner.tokens_used,
                    started_at,
                    completed_at: Utc::now(),
                    execution_time_ms: elapsed_ms(clock),
                });
                fx.nested.extend(children);

                let value = result?;
                Arc::make_mut(&mut scope).set_output(nested.id.as_str(), nested.exposed_variable(), value.clone());
                last = value;
            }
            Ok(last)
        }
        .boxed()
    }
}

fn item_scope(pool: &Arc<VariablePool>, item_var: &str, item: Value, index: usize) -> VariablePool {
    let mut scope = VariablePool::scope(Arc::clone(pool));
    if item_var != "item" {
        scope.set(item_var, item.clone());
    }
    scope.set("item", item);
    scope.set("index", json!(index));
    scope
}

/// Value named by a collection or input reference.
///
/// Accepts a single token, a bare dotted path or a template.
fn referenced(reference: &str, pool: &VariablePool) -> Option<Value> {
    match whole_token(reference) {
        Some(token) => pool.lookup(&token),
        None if !reference.contains("{{") => FieldSource::lookup(pool, reference),
        None => Some(pool.render(reference).value),
    }
}

/// Items of a collection, coerced to a list and capped
fn collection(reference: &str, pool: &VariablePool, cap: usize, fx: &mut Effects) -> Vec<Value> {
    let value = referenced(reference, pool).unwrap_or_else(|| {
        warn!(reference, "collection did not resolve; iterating nothing");
        Value::Null
    });
    let mut items = coerce_items(value, fx);
    if items.len() > cap {
        warn!(reference, len = items.len(), cap, "collection truncated to max iterations");
        items.truncate(cap);
    }
    items
}

/// Coerce a value into a list of items, flagging any repair
fn coerce_items(value: Value, fx: &mut Effects) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Null => {
            fx.auto_repaired = true;
            Vec::new()
        }
        Value::Object(map) => {
            fx.auto_repaired = true;
            let mut arrays = map.values().filter(|v| v.is_array());
            match (arrays.next(), arrays.next()) {
                (Some(Value::Array(items)), None) => items.clone(),
                _ => vec![Value::Object(map)],
            }
        }
        scalar => {
            fx.auto_repaired = true;
            vec![scalar]
        }
    }
}

fn transform(
    op: TransformOp,
    config: &Map<String, Value>,
    step: &CompiledStep,
    pool: &Arc<VariablePool>,
    fx: &mut Effects,
) -> Result<Value, StepError> {
    match op {
        TransformOp::Set => Ok(config.get("value").map(|v| pool.resolve_value(v).value).unwrap_or(Value::Null)),
        TransformOp::Format => {
            let template = config
                .get("template")
                .and_then(Value::as_str)
                .ok_or_else(|| missing("template"))?;
            Ok(pool.render(template).value)
        }
        TransformOp::Count => Ok(json!(match transform_input(config, step, pool) {
            Value::Null => 0,
            Value::Array(items) => items.len(),
            _ => 1,
        })),
        TransformOp::Map => {
            let items = coerce_items(transform_input(config, step, pool), fx);
            let projected = items
                .into_iter()
                .enumerate()
                .map(|(index, item)| project(&item, index, config, pool))
                .collect();
            Ok(Value::Array(projected))
        }
        TransformOp::Filter => {
            let condition = filter_condition(config.get("condition"))?;
            let items = coerce_items(transform_input(config, step, pool), fx);
            let kept = match condition {
                None => items,
                Some(condition) => items
                    .into_iter()
                    .filter(|item| condition.evaluate(&ItemFields { item, pool: pool.as_ref() }))
                    .collect(),
            };
            Ok(Value::Array(kept))
        }
        TransformOp::Sort => {
            let mut items = coerce_items(transform_input(config, step, pool), fx);
            let by = config.get("by").and_then(Value::as_str).unwrap_or_default();
            let descending = config
                .get("order")
                .and_then(Value::as_str)
                .is_some_and(|o| o.eq_ignore_ascii_case("desc") || o.eq_ignore_ascii_case("descending"));
            items.sort_by(|a, b| {
                let ord = compare_values(lookup_path(a, by), lookup_path(b, by));
                if descending { ord.reverse() } else { ord }
            });
            Ok(Value::Array(items))
        }
        TransformOp::Deduplicate => {
            let items = coerce_items(transform_input(config, step, pool), fx);
            let by = config.get("by").and_then(Value::as_str).unwrap_or_default();
            let mut seen = HashSet::new();
            let unique = items
                .into_iter()
                .filter(|item| {
                    let key = lookup_path(item, by).map(Value::to_string).unwrap_or_default();
                    seen.insert(key)
                })
                .collect();
            Ok(Value::Array(unique))
        }
        TransformOp::Flatten => {
            let items = coerce_items(transform_input(config, step, pool), fx);
            Ok(Value::Array(flatten_one(items)))
        }
    }
}

/// `config.input` if present, otherwise the first dependency's output
fn transform_input(config: &Map<String, Value>, step: &CompiledStep, pool: &VariablePool) -> Value {
    match config.get("input") {
        Some(Value::String(reference)) => referenced(reference, pool).unwrap_or(Value::Null),
        Some(other) => pool.resolve_value(other).value,
        None => step
            .dependencies
            .first()
            .and_then(|dep| pool.get(dep.as_str()))
            .cloned()
            .unwrap_or(Value::Null),
    }
}

fn project(item: &Value, index: usize, config: &Map<String, Value>, pool: &Arc<VariablePool>) -> Value {
    let needs_scope = config.contains_key("fields") || config.contains_key("expression");
    if !needs_scope {
        return item.clone();
    }
    let scope = item_scope(pool, "item", item.clone(), index);

    if let Some(Value::Object(fields)) = config.get("fields") {
        let projected: Map<String, Value> = fields
            .iter()
            .map(|(name, spec)| {
                let value = match spec {
                    Value::String(s) if s.contains("{{") => scope.resolve_str(s).value,
                    Value::String(path) => lookup_path(item, path).cloned().unwrap_or(Value::Null),
                    literal => literal.clone(),
                };
                (name.clone(), value)
            })
            .collect();
        return Value::Object(projected);
    }
    match config.get("expression") {
        Some(Value::String(expr)) => scope.resolve_str(expr).value,
        Some(other) => scope.resolve_value(other).value,
        None => item.clone(),
    }
}

fn filter_condition(raw: Option<&Value>) -> Result<Option<Condition>, StepError> {
    match raw {
        None | Some(Value::Null) | Some(Value::Bool(true)) => Ok(None),
        Some(Value::Bool(false)) => Ok(Some(Condition::Not {
            condition: Box::new(Condition::always()),
        })),
        Some(Value::String(text)) => parse_expression(text).map(Some).map_err(|e| StepError::Parameter {
            name: "condition".into(),
            reason: e.to_string(),
        }),
        Some(other) => serde_json::from_value(other.clone())
            .map(Some)
            .map_err(|e| StepError::Parameter {
                name: "condition".into(),
                reason: e.to_string(),
            }),
    }
}

fn missing(name: &str) -> StepError {
    StepError::Parameter {
        name: name.to_string(),
        reason: "missing required config".into(),
    }
}

/// Ordering for sort keys: numbers numerically, strings lexically, absent last
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Greater,
        (_, None | Some(Value::Null)) => Ordering::Less,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

fn flatten_one(items: Vec<Value>) -> Vec<Value> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::Array(inner) => out.extend(inner),
            other => out.push(other),
        }
    }
    out
}

fn gather_results(op: GatherOp, results: Vec<Value>) -> Value {
    match op {
        GatherOp::Collect => Value::Array(results),
        GatherOp::Flatten => Value::Array(flatten_one(results)),
        GatherOp::Merge => {
            let mut merged = Map::new();
            for result in results {
                if let Value::Object(map) = result {
                    merged.extend(map);
                }
            }
            Value::Object(merged)
        }
        GatherOp::Count => json!(results.len()),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn elapsed_ms(clock: Instant) -> u64 {
    u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{PluginError, PluginRegistry};
    use pilot_plan::step::{Gather, Scatter};
    use pilot_plan::Operator;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn executor(registry: PluginRegistry) -> StepExecutor {
        StepExecutor::new(Arc::new(registry), EngineConfig::default())
    }

    fn pool_with(step: &str, value: Value) -> Arc<VariablePool> {
        let mut pool = VariablePool::new(Map::new());
        pool.set_output(step, None, value);
        Arc::new(pool)
    }

    fn transform_step(op: TransformOp, config: Value) -> CompiledStep {
        CompiledStep::new(
            "t",
            "t",
            StepKind::Transform {
                operation: op,
                config: config.as_object().cloned().unwrap_or_default(),
            },
        )
    }

    fn scatter_step(input: &str, body: Vec<CompiledStep>, gather: GatherOp) -> CompiledStep {
        CompiledStep::new(
            "fan",
            "fan",
            StepKind::ScatterGather {
                scatter: Scatter {
                    input: input.into(),
                    steps: body,
                    item_variable: None,
                    max_iterations: None,
                },
                gather: Gather { operation: gather },
            },
        )
    }

    #[tokio::test]
    async fn test_action_resolves_params() {
        let exec = executor(PluginRegistry::with_builtins(Vec::new()));
        let mut inputs = Map::new();
        inputs.insert("manager".into(), json!("boss@example.com"));
        let mut pool = VariablePool::new(inputs);
        pool.set_output("step1", None, json!("weekly digest"));

        let params = json!({"to": "{{input.manager}}", "subject": "Digest", "body": "{{step1}}"});
        let step = CompiledStep::action("step2", "email", "send", params.as_object().cloned().unwrap());
        let run = exec.run(&step, Arc::new(pool)).await;
        assert_eq!(
            run.result.unwrap(),
            json!({"sent": true, "to": "boss@example.com", "subject": "Digest", "body_len": 13})
        );
    }

    #[tokio::test]
    async fn test_unresolved_param_is_parameter_failure() {
        let exec = executor(PluginRegistry::with_builtins(Vec::new()));
        let params = json!({"to": "{{input.manager}}"});
        let step = CompiledStep::action("step2", "email", "send", params.as_object().cloned().unwrap());
        let run = exec.run(&step, Arc::new(VariablePool::default())).await;
        assert!(matches!(
            run.result,
            Err(StepError::Plugin {
                source: PluginError::MissingParameter { .. },
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_transforms() {
        let exec = executor(PluginRegistry::new());
        let rows = json!([
            {"subject": "Invoice 2", "amount": 20},
            {"subject": "hello", "amount": 5},
            {"subject": "Invoice 1", "amount": 40},
            {"subject": "Invoice 1", "amount": 40},
        ]);
        let pool = pool_with("step1", rows);

        let filter = transform_step(TransformOp::Filter, json!({"input": "{{step1}}", "condition": "subject contains invoice"}));
        let out = exec.run(&filter, Arc::clone(&pool)).await.result.unwrap();
        assert_eq!(out.as_array().unwrap().len(), 3);

        let sort = transform_step(TransformOp::Sort, json!({"input": "{{step1}}", "by": "amount", "order": "desc"}));
        let out = exec.run(&sort, Arc::clone(&pool)).await.result.unwrap();
        assert_eq!(out[0]["amount"], 40);
        assert_eq!(out[3]["amount"], 5);

        let dedup = transform_step(TransformOp::Deduplicate, json!({"input": "{{step1}}", "by": "subject"}));
        let out = exec.run(&dedup, Arc::clone(&pool)).await.result.unwrap();
        assert_eq!(out.as_array().unwrap().len(), 3);

        let map = transform_step(TransformOp::Map, json!({"input": "step1", "fields": {"title": "subject", "label": "#{{index}} {{item.subject}}"}}));
        let out = exec.run(&map, Arc::clone(&pool)).await.result.unwrap();
        assert_eq!(out[1], json!({"title": "hello", "label": "#1 hello"}));

        let count = transform_step(TransformOp::Count, json!({}));
        let count = count.depends_on("step1");
        assert_eq!(exec.run(&count, Arc::clone(&pool)).await.result.unwrap(), json!(4));

        let format = transform_step(TransformOp::Format, json!({"template": "{{step1.0.subject}}!"}));
        assert_eq!(exec.run(&format, Arc::clone(&pool)).await.result.unwrap(), json!("Invoice 2!"));
    }

    #[tokio::test]
    async fn test_scalar_input_is_repaired() {
        let exec = executor(PluginRegistry::new());
        let pool = pool_with("step1", json!({"emails": [[1, 2], [3]]}));
        let step = transform_step(TransformOp::Flatten, json!({"input": "{{step1}}"}));
        let run = exec.run(&step, pool).await;
        assert!(run.auto_repaired);
        assert_eq!(run.result.unwrap(), json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn test_conditional_reports_untaken_branch() {
        let exec = executor(PluginRegistry::new());
        let pool = pool_with("step1", json!({"count": 2}));
        let step = CompiledStep::new(
            "check",
            "check",
            StepKind::Conditional {
                condition: Condition::simple("{{step1.count}}", Operator::GreaterThan, json!(5)),
                true_branch: vec!["alert".into()],
                false_branch: vec!["quiet".into()],
            },
        );
        let run = exec.run(&step, pool).await;
        assert_eq!(run.result.unwrap(), json!({"result": false, "branch": "false"}));
        assert_eq!(run.untaken_branch, vec![StepId::from("alert")]);
    }

    #[tokio::test]
    async fn test_scatter_collects_in_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = PluginRegistry::new();
        let counter = Arc::clone(&calls);
        registry.register_fn("text", "upper", move |params| {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(json!(params["value"].as_str().unwrap_or_default().to_uppercase()))
        });
        let exec = executor(registry);
        let pool = pool_with("step1", json!(["a", "b", "c", "d", "e"]));

        let body = CompiledStep::action("up", "text", "upper", json!({"value": "{{item}}"}).as_object().cloned().unwrap());
        let step = scatter_step("{{step1}}", vec![body], GatherOp::Collect);
        let run = exec.run(&step, pool).await;

        assert_eq!(run.result.unwrap(), json!(["A", "B", "C", "D", "E"]));
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 5);
        assert_eq!(run.nested.len(), 5);
        assert_eq!(run.nested[4].step_id, StepId::from("up[4]"));
    }

    #[tokio::test]
    async fn test_scatter_failure_names_item() {
        let mut registry = PluginRegistry::new();
        registry.register_fn("check", "positive", |params| match params["value"].as_i64() {
            Some(n) if n > 0 => Ok(json!(n)),
            _ => Err(PluginError::InvalidParameter {
                name: "value".into(),
                reason: "must be positive".into(),
            }),
        });
        let exec = executor(registry);
        let pool = pool_with("nums", json!([1, -2, 3]));
        let body = CompiledStep::action("c", "check", "positive", json!({"value": "{{item}}"}).as_object().cloned().unwrap());
        let run = exec.run(&scatter_step("nums", vec![body], GatherOp::Count), pool).await;

        assert!(matches!(run.result, Err(StepError::Item { index: 1, .. })));
        assert_eq!(run.nested.len(), 3);
        assert_eq!(run.nested.iter().filter(|n| n.result.is_err()).count(), 1);
    }

    #[tokio::test]
    async fn test_loop_and_depth_limit() {
        let exec = StepExecutor::new(
            Arc::new(PluginRegistry::new()),
            EngineConfig::default().with_max_nesting_depth(1),
        );
        let pool = pool_with("rows", json!([1, 2]));
        let inner = CompiledStep::new(
            "inner",
            "inner",
            StepKind::Loop {
                iterate_over: "{{item}}".into(),
                max_iterations: None,
                loop_steps: vec![transform_step(TransformOp::Set, json!({"value": "{{item}}"}))],
            },
        );
        let shallow = CompiledStep::new(
            "outer",
            "outer",
            StepKind::Loop {
                iterate_over: "{{rows}}".into(),
                max_iterations: Some(1),
                loop_steps: vec![transform_step(TransformOp::Set, json!({"value": "{{index}}"}))],
            },
        );
        assert_eq!(exec.run(&shallow, Arc::clone(&pool)).await.result.unwrap(), json!([0]));

        let mut deep = shallow.clone();
        if let StepKind::Loop { loop_steps, .. } = &mut deep.kind {
            *loop_steps = vec![inner];
        }
        let run = exec.run(&deep, pool).await;
        assert!(matches!(
            run.result.unwrap_err().root_cause(),
            StepError::DepthExceeded { depth: 2, max: 1 }
        ));
    }

    #[tokio::test]
    async fn test_panicking_plugin_is_contained() {
        let mut registry = PluginRegistry::new();
        registry.register_fn("bad", "boom", |_| panic!("plugin exploded"));
        let exec = executor(registry);
        let step = CompiledStep::action("s", "bad", "boom", Map::new());
        let run = exec.run(&step, Arc::new(VariablePool::default())).await;
        assert_eq!(run.result.unwrap_err(), StepError::Panicked("plugin exploded".into()));
    }
}
