//! Rule-based compilation.
//!
//! Maps each data source to a read action, the goal's verb to an optional
//! processing step and each delivery rule to a send action. No external
//! calls; anything outside the rule table is an error.

use super::{plugins_in, CompileContext, CompilerKind, CompilerStrategy, StrategyError, StrategyOutput};
use crate::ir::{DataSource, DeclarativeIr, DeliveryRule};
use crate::step::{CompiledStep, Gather, Scatter, StepKind};
use async_trait::async_trait;
use pilot_core::StepId;
use serde_json::{Map, Value};

/// Source-name fragments and the read action they map to, checked in order
const SOURCE_RULES: &[(&str, &str, &str)] = &[
    ("sheet", "google-sheets", "read_range"),
    ("drive", "google-drive", "list_files"),
    ("slack", "slack", "read_messages"),
    ("calendar", "google-calendar", "list_events"),
    ("gmail", "google-mail", "search_emails"),
    ("inbox", "google-mail", "search_emails"),
    ("email", "google-mail", "search_emails"),
    ("mail", "google-mail", "search_emails"),
];

/// Goal verbs that call for a processing step
const PROCESSING_VERBS: &[(&str, &str)] = &[
    ("summar", "summarize"),
    ("digest", "summarize"),
    ("analy", "analyze"),
    ("classif", "classify"),
    ("categori", "classify"),
    ("extract", "extract"),
];

/// The rule-based strategy
#[derive(Debug, Clone, Default)]
pub struct DeterministicStrategy;

impl DeterministicStrategy {
    /// Create the strategy
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Build the step list for an IR
    ///
    /// # Errors
    ///
    /// Returns error on an IR shape outside the rule table
    pub fn build(&self, ir: &DeclarativeIr) -> Result<Vec<CompiledStep>, StrategyError> {
        if ir.data_sources.is_empty() {
            return Err(StrategyError::NoSources);
        }
        if ir.delivery_rules.is_empty() {
            return Err(StrategyError::NoDeliveries);
        }

        let mut steps = Vec::new();
        let mut next = 1;
        let mut fresh_id = || {
            let id = StepId::numbered(next);
            next += 1;
            id
        };

        let mut reads = Vec::new();
        for source in &ir.data_sources {
            let (plugin, action) = read_action(source)?;
            let mut step = CompiledStep::action(fresh_id(), &plugin, &action, read_params(source));
            step.name = format!("Read {}", source.source);
            reads.push(step.id.clone());
            steps.push(step);
        }

        let producers = match processing_operation(&ir.goal) {
            Some(operation) => {
                let id = fresh_id();
                let data = reads.iter().map(|r| format!("{{{{{}}}}}", r)).collect::<Vec<_>>().join("\n");
                let mut params = Map::new();
                params.insert("operation".into(), Value::String(operation.to_string()));
                let mut step = CompiledStep::new(
                    id.clone(),
                    capitalize(operation),
                    StepKind::AiProcessing {
                        prompt: format!("{}\n\nInput:\n{}", ir.goal, data),
                        params,
                    },
                );
                step.dependencies.extend(reads.iter().cloned());
                steps.push(step);
                vec![id]
            }
            None => reads,
        };

        for (index, rule) in ir.delivery_rules.iter().enumerate() {
            let (plugin, action) = delivery_action(rule, index)?;
            let id = fresh_id();
            let mut step = if rule.per_item {
                let collection = producers.last().map(|p| format!("{{{{{}}}}}", p)).unwrap_or_default();
                let send = CompiledStep::action(
                    "send",
                    &plugin,
                    &action,
                    delivery_params(&plugin, rule, &ir.goal, "{{item}}".to_string()),
                );
                CompiledStep::new(
                    id,
                    format!("Deliver each item to {}", rule.to),
                    StepKind::ScatterGather {
                        scatter: Scatter {
                            input: collection,
                            steps: vec![send],
                            item_variable: None,
                            max_iterations: None,
                        },
                        gather: Gather::default(),
                    },
                )
            } else {
                let body = producers.iter().map(|p| format!("{{{{{}}}}}", p)).collect::<Vec<_>>().join("\n");
                let mut step = CompiledStep::action(id, &plugin, &action, delivery_params(&plugin, rule, &ir.goal, body));
                step.name = format!("Deliver to {}", rule.to);
                step
            };
            step.dependencies.extend(producers.iter().cloned());
            steps.push(step);
        }

        Ok(steps)
    }
}

#[async_trait]
impl CompilerStrategy for DeterministicStrategy {
    fn kind(&self) -> CompilerKind {
        CompilerKind::Deterministic
    }

    async fn compile(&self, ir: &DeclarativeIr, _ctx: &CompileContext) -> Result<StrategyOutput, StrategyError> {
        let workflow = self.build(ir)?;
        Ok(StrategyOutput {
            plugins_used: plugins_in(&workflow),
            workflow,
            token_usage: None,
        })
    }
}

fn read_action(source: &DataSource) -> Result<(String, String), StrategyError> {
    if let Some(plugin) = &source.plugin {
        if let Some((plugin, action)) = plugin.split_once('.') {
            return Ok((plugin.to_string(), action.to_string()));
        }
        let action = SOURCE_RULES
            .iter()
            .find(|(_, p, _)| p == plugin)
            .map_or("fetch", |(_, _, a)| *a);
        return Ok((plugin.clone(), action.to_string()));
    }

    let name = source.source.to_ascii_lowercase();
    if name == "mock_email" {
        return Ok(("mock_email".to_string(), "fetch".to_string()));
    }
    SOURCE_RULES
        .iter()
        .find(|(fragment, _, _)| name.contains(*fragment))
        .map(|(_, plugin, action)| (plugin.to_string(), action.to_string()))
        .ok_or_else(|| StrategyError::UnknownSource(source.source.clone()))
}

fn read_params(source: &DataSource) -> Map<String, Value> {
    let mut params = source.config.clone();
    if let Some(filter) = &source.filter {
        params.insert("query".into(), Value::String(filter.clone()));
    }
    params
}

fn delivery_action(rule: &DeliveryRule, index: usize) -> Result<(String, String), StrategyError> {
    let channel = rule.channel.as_deref().map(str::to_ascii_lowercase);
    let to = rule.to.trim();

    if to.is_empty() && channel.as_deref() != Some("log") {
        return Err(StrategyError::MissingRecipient(index));
    }

    let pair = match channel.as_deref() {
        Some(explicit) if explicit.contains('.') => {
            let (plugin, action) = explicit.split_once('.').unwrap_or((explicit, "send"));
            (plugin, action)
        }
        Some("slack") => ("slack", "post_message"),
        Some("log") => ("log", "write"),
        Some("email" | "gmail" | "mail") => ("google-mail", "send_email"),
        Some(other) => return Err(StrategyError::UnknownChannel(other.to_string())),
        None if to.starts_with('#') => ("slack", "post_message"),
        None if to == "log" => ("log", "write"),
        None => ("google-mail", "send_email"),
    };
    Ok((pair.0.to_string(), pair.1.to_string()))
}

fn delivery_params(plugin: &str, rule: &DeliveryRule, goal: &str, body: String) -> Map<String, Value> {
    let mut params = Map::new();
    match plugin {
        "slack" => {
            params.insert("channel".into(), Value::String(rule.to.clone()));
            params.insert("text".into(), Value::String(body));
        }
        "log" => {
            params.insert("message".into(), Value::String(body));
        }
        _ => {
            params.insert("to".into(), Value::String(rule.to.clone()));
            let subject = rule.subject.clone().unwrap_or_else(|| capitalize(goal));
            params.insert("subject".into(), Value::String(subject));
            params.insert("body".into(), Value::String(body));
        }
    }
    params
}

fn processing_operation(goal: &str) -> Option<&'static str> {
    let goal = goal.to_ascii_lowercase();
    PROCESSING_VERBS
        .iter()
        .find(|(fragment, _)| goal.contains(*fragment))
        .map(|(_, op)| *op)
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
