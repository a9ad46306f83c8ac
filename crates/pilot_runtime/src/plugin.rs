//! Plugin execution.
//!
//! Action and `ai_processing` steps call out through [`PluginExecutor`].
//! [`PluginRegistry`] is the in-process implementation: handlers are
//! registered per `plugin.action` pair and looked up on every call.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::info;

/// Plugin name used for `ai_processing` steps
pub const AI_PLUGIN: &str = "ai";
/// Action name used for `ai_processing` steps
pub const AI_ACTION: &str = "process";

/// Plugin call failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PluginError {
    /// No handler for the pair
    #[error("no handler registered for {plugin}.{action}")]
    UnknownAction {
        /// Plugin name
        plugin: String,
        /// Action name
        action: String,
    },

    /// A required parameter is absent or empty
    #[error("missing required parameter '{name}'")]
    MissingParameter {
        /// Parameter name
        name: String,
    },

    /// A parameter has the wrong shape
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter {
        /// Parameter name
        name: String,
        /// What is wrong
        reason: String,
    },

    /// The plugin lacks a connection or credentials
    #[error("plugin {plugin} is not configured: {reason}")]
    NotConfigured {
        /// Plugin name
        plugin: String,
        /// What is missing
        reason: String,
    },

    /// The call itself failed
    #[error("{0}")]
    Failed(String),
}

impl PluginError {
    /// Parameter name for parameter errors
    #[must_use]
    pub fn parameter(&self) -> Option<&str> {
        match self {
            Self::MissingParameter { name } | Self::InvalidParameter { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// Successful plugin call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginOutput {
    /// Returned payload
    pub data: Value,
    /// Generative tokens consumed, if any
    #[serde(default)]
    pub tokens_used: u64,
}

impl PluginOutput {
    /// Output without token usage
    #[must_use]
    pub fn new(data: Value) -> Self {
        Self { data, tokens_used: 0 }
    }

    /// Attach token usage
    #[must_use]
    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }
}

/// Plugin execution collaborator
#[async_trait]
pub trait PluginExecutor: Send + Sync {
    /// Run `plugin.action` with resolved parameters
    async fn execute(&self, plugin: &str, action: &str, params: &Map<String, Value>) -> Result<PluginOutput, PluginError>;
}

/// One registered action
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Run with resolved parameters
    async fn run(&self, params: &Map<String, Value>) -> Result<PluginOutput, PluginError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> ActionHandler for FnHandler<F>
where
    F: Fn(&Map<String, Value>) -> Result<Value, PluginError> + Send + Sync,
{
    async fn run(&self, params: &Map<String, Value>) -> Result<PluginOutput, PluginError> {
        (self.0)(params).map(PluginOutput::new)
    }
}

/// Handler registry keyed by `plugin.action`
#[derive(Default, Clone)]
pub struct PluginRegistry {
    handlers: IndexMap<String, Arc<dyn ActionHandler>>,
}

impl PluginRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the builtin handlers; `mock_email.fetch` serves `messages`
    #[must_use]
    pub fn with_builtins(messages: Vec<Value>) -> Self {
        let mut registry = Self::new();
        registry.register("mock_email", "fetch", Arc::new(MockEmailFetch { messages }));
        registry.register("email", "send", Arc::new(EmailSend));
        registry.register("log", "write", Arc::new(LogWrite));
        registry.register(AI_PLUGIN, AI_ACTION, Arc::new(PromptEcho));
        registry
    }

    /// Register or replace a handler
    pub fn register(&mut self, plugin: &str, action: &str, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(format!("{}.{}", plugin, action), handler);
    }

    /// Register a synchronous closure
    pub fn register_fn<F>(&mut self, plugin: &str, action: &str, f: F)
    where
        F: Fn(&Map<String, Value>) -> Result<Value, PluginError> + Send + Sync + 'static,
    {
        self.register(plugin, action, Arc::new(FnHandler(f)));
    }

    /// Whether a handler exists
    #[must_use]
    pub fn contains(&self, plugin: &str, action: &str) -> bool {
        self.handlers.contains_key(&format!("{}.{}", plugin, action))
    }

    /// Registered `plugin.action` names
    pub fn actions(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.handlers.keys()).finish()
    }
}

#[async_trait]
impl PluginExecutor for PluginRegistry {
    async fn execute(&self, plugin: &str, action: &str, params: &Map<String, Value>) -> Result<PluginOutput, PluginError> {
        let handler = self
            .handlers
            .get(&format!("{}.{}", plugin, action))
            .ok_or_else(|| PluginError::UnknownAction {
                plugin: plugin.to_string(),
                action: action.to_string(),
            })?;
        handler.run(params).await
    }
}

/// Required non-empty string parameter
fn required_str<'a>(params: &'a Map<String, Value>, name: &str) -> Result<&'a str, PluginError> {
    match params.get(name) {
        None | Some(Value::Null) => Err(PluginError::MissingParameter { name: name.to_string() }),
        Some(Value::String(s)) if s.trim().is_empty() => Err(PluginError::MissingParameter { name: name.to_string() }),
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(PluginError::InvalidParameter {
            name: name.to_string(),
            reason: format!("expected a string, got {}", other),
        }),
    }
}

fn text_len(value: Option<&Value>) -> usize {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::String(s)) => s.chars().count(),
        Some(other) => other.to_string().chars().count(),
    }
}

/// Serves a fixed inbox; `limit` truncates
struct MockEmailFetch {
    messages: Vec<Value>,
}

#[async_trait]
impl ActionHandler for MockEmailFetch {
    async fn run(&self, params: &Map<String, Value>) -> Result<PluginOutput, PluginError> {
        let limit = match params.get("limit") {
            None | Some(Value::Null) => self.messages.len(),
            Some(value) => value
                .as_u64()
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| PluginError::InvalidParameter {
                    name: "limit".into(),
                    reason: "expected a non-negative integer".into(),
                })?,
        };
        Ok(PluginOutput::new(Value::Array(
            self.messages.iter().take(limit).cloned().collect(),
        )))
    }
}

/// Simulated send
struct EmailSend;

#[async_trait]
impl ActionHandler for EmailSend {
    async fn run(&self, params: &Map<String, Value>) -> Result<PluginOutput, PluginError> {
        let to = required_str(params, "to")?;
        let subject = params.get("subject").and_then(Value::as_str).unwrap_or_default();
        Ok(PluginOutput::new(json!({
            "sent": true,
            "to": to,
            "subject": subject,
            "body_len": text_len(params.get("body")),
        })))
    }
}

/// Echoes its parameters
struct LogWrite;

#[async_trait]
impl ActionHandler for LogWrite {
    async fn run(&self, params: &Map<String, Value>) -> Result<PluginOutput, PluginError> {
        let logged = Value::Object(params.clone());
        info!(target: "pilot::log_action", params = %logged, "log.write");
        Ok(PluginOutput::new(json!({ "logged": params })))
    }
}

/// Offline stand-in for a generative backend: returns the rendered prompt
struct PromptEcho;

#[async_trait]
impl ActionHandler for PromptEcho {
    async fn run(&self, params: &Map<String, Value>) -> Result<PluginOutput, PluginError> {
        let prompt = required_str(params, "prompt")?;
        let tokens = u64::try_from(prompt.split_whitespace().count()).unwrap_or(u64::MAX);
        Ok(PluginOutput::new(json!({
            "operation": params.get("operation").cloned().unwrap_or(Value::Null),
            "result": prompt,
        }))
        .with_tokens(tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_builtins() {
        let registry = PluginRegistry::with_builtins(vec![json!({"subject": "Invoice 1"}), json!({"subject": "Hi"})]);

        let fetched = registry.execute("mock_email", "fetch", &Map::new()).await.unwrap();
        assert_eq!(fetched.data.as_array().unwrap().len(), 2);
        let limited = registry
            .execute("mock_email", "fetch", &params(json!({"limit": 1})))
            .await
            .unwrap();
        assert_eq!(limited.data.as_array().unwrap().len(), 1);

        let sent = registry
            .execute("email", "send", &params(json!({"to": "a@example.com", "subject": "S", "body": "hello"})))
            .await
            .unwrap();
        assert_eq!(sent.data, json!({"sent": true, "to": "a@example.com", "subject": "S", "body_len": 5}));

        let logged = registry
            .execute("log", "write", &params(json!({"message": "m"})))
            .await
            .unwrap();
        assert_eq!(logged.data, json!({"logged": {"message": "m"}}));

        let processed = registry
            .execute(AI_PLUGIN, AI_ACTION, &params(json!({"prompt": "summarize these two"})))
            .await
            .unwrap();
        assert_eq!(processed.tokens_used, 3);
    }

    #[tokio::test]
    async fn test_errors() {
        let registry = PluginRegistry::with_builtins(Vec::new());
        let err = registry.execute("email", "send", &params(json!({"to": ""}))).await.unwrap_err();
        assert_eq!(err, PluginError::MissingParameter { name: "to".into() });
        assert_eq!(err.parameter(), Some("to"));

        let err = registry.execute("email", "send", &params(json!({"to": 3}))).await.unwrap_err();
        assert!(matches!(err, PluginError::InvalidParameter { .. }));

        let err = registry
            .execute("google-mail", "search_emails", &Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::UnknownAction { .. }));
    }

    #[tokio::test]
    async fn test_register_fn_replaces() {
        let mut registry = PluginRegistry::with_builtins(Vec::new());
        registry.register_fn("log", "write", |_| Ok(json!("custom")));
        assert!(registry.contains("log", "write"));
        let out = registry.execute("log", "write", &Map::new()).await.unwrap();
        assert_eq!(out.data, json!("custom"));
    }
}
