//! Dual-strategy compiler.
//!
//! Both strategies implement [`CompilerStrategy`] and return the same step
//! list shape. The [`Compiler`] orchestrator validates the IR, tries the
//! deterministic strategy first, falls back to the assisted one on any
//! error, then normalizes and checks graph integrity.

mod assisted;
mod deterministic;

pub use assisted::{AssistedStrategy, GraphSynthesizer, SynthesisRequest, SynthesisResponse, STEP_SCHEMA};
pub use deterministic::DeterministicStrategy;

use crate::graph::{GraphError, StepGraph};
use crate::ir::DeclarativeIr;
use crate::normalize::{for_each_step, Normalizer, DEFAULT_SIMPLIFY_THRESHOLD};
use crate::step::{CompiledStep, StepKind, DEFAULT_MAX_DEPTH};
use crate::validate::{IrValidator, ValidationReport};
use async_trait::async_trait;
use pilot_core::PilotError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

/// Which strategy produced a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompilerKind {
    /// Rule-based, no external calls
    Deterministic,
    /// Generative fallback
    Assisted,
}

impl fmt::Display for CompilerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deterministic => f.write_str("deterministic"),
            Self::Assisted => f.write_str("assisted"),
        }
    }
}

/// Strategy selection policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompilerMode {
    /// Deterministic first, assisted on failure
    #[default]
    Auto,
    /// Never call the assisted strategy
    DeterministicOnly,
    /// Skip the deterministic strategy
    AssistedOnly,
}

/// Compiler configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Strategy selection
    pub mode: CompilerMode,
    /// Maximum nesting depth of loops and scatter branches
    pub max_nesting_depth: usize,
    /// Minimum disjunction size collapsed into a keyword set
    pub simplify_threshold: usize,
}

impl CompilerConfig {
    /// Set the mode
    #[must_use]
    pub fn with_mode(mut self, mode: CompilerMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the nesting depth limit
    #[must_use]
    pub fn with_max_nesting_depth(mut self, depth: usize) -> Self {
        self.max_nesting_depth = depth;
        self
    }
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            mode: CompilerMode::Auto,
            max_nesting_depth: DEFAULT_MAX_DEPTH,
            simplify_threshold: DEFAULT_SIMPLIFY_THRESHOLD,
        }
    }
}

/// Upstream planning context consumed by the assisted strategy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineContext {
    /// Semantic plan produced before compilation
    #[serde(default)]
    pub semantic_plan: Option<Value>,
    /// Facts grounded against the user's connected data
    #[serde(default)]
    pub grounded_facts: Option<Value>,
}

/// Inputs shared by every strategy
#[derive(Debug, Clone, Default)]
pub struct CompileContext {
    /// Optional planning context
    pub pipeline: Option<PipelineContext>,
    /// Nesting depth limit for synthesized steps
    pub max_nesting_depth: usize,
}

/// Generative token accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens
    pub input_tokens: u64,
    /// Completion tokens
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Sum of both directions
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Accumulate another usage
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Successful strategy result
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyOutput {
    /// Compiled steps, before normalization
    pub workflow: Vec<CompiledStep>,
    /// `plugin` names used by action steps
    pub plugins_used: Vec<String>,
    /// Generative usage, if any
    pub token_usage: Option<TokenUsage>,
}

/// Strategy failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StrategyError {
    /// The IR has no data sources
    #[error("IR has no data sources")]
    NoSources,
    /// The IR has no delivery rules
    #[error("IR has no delivery rules")]
    NoDeliveries,
    /// No rule maps this source to a read action
    #[error("no rule for data source '{0}'")]
    UnknownSource(String),
    /// No rule maps this delivery channel to a send action
    #[error("no rule for delivery channel '{0}'")]
    UnknownChannel(String),
    /// A delivery rule without a recipient
    #[error("delivery rule {0} has no recipient")]
    MissingRecipient(usize),
    /// No assisted strategy is configured
    #[error("assisted compilation is not available")]
    Unavailable,
    /// The generative collaborator failed
    #[error("graph synthesis failed: {0}")]
    Synthesis(String),
    /// Output did not match the step schema after all attempts
    #[error("malformed synthesized graph after {attempts} attempts: {last_error}")]
    MalformedOutput {
        /// Attempts made
        attempts: u32,
        /// Last parse error
        last_error: String,
    },
}

/// A compilation strategy
#[async_trait]
pub trait CompilerStrategy: Send + Sync {
    /// Which strategy this is
    fn kind(&self) -> CompilerKind;

    /// Compile an IR into steps
    async fn compile(&self, ir: &DeclarativeIr, ctx: &CompileContext) -> Result<StrategyOutput, StrategyError>;
}

/// Compilation metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileMetadata {
    /// Wall time
    pub compilation_time_ms: u64,
    /// Top-level steps after normalization
    pub step_count: usize,
    /// Plugins used by action steps
    pub plugins_used: Vec<String>,
    /// Generative usage, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    /// Strategy that produced the workflow
    pub compiler_used: CompilerKind,
    /// Why the deterministic strategy was not used
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

/// Successful compilation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileOutput {
    /// Normalized steps
    pub workflow: Vec<CompiledStep>,
    /// Validation report of the IR
    pub validation: ValidationReport,
    /// Normalizer warnings
    pub warnings: Vec<String>,
    /// Normalization passes that changed the graph
    pub normalization: Vec<String>,
    /// Metadata
    pub metadata: CompileMetadata,
}

/// Compilation failure
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    /// The IR is not declarative
    #[error("IR validation failed with {} error(s)", .0.errors.len())]
    Validation(ValidationReport),
    /// The IR does not deserialize
    #[error("malformed IR: {0}")]
    Malformed(String),
    /// Every attempted strategy failed
    #[error("compilation failed: deterministic [{}], assisted [{}]", .deterministic.join("; "), .assisted.join("; "))]
    Compilation {
        /// Deterministic strategy errors
        deterministic: Vec<String>,
        /// Assisted strategy errors
        assisted: Vec<String>,
    },
    /// The normalized graph is still broken
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl From<CompileError> for PilotError {
    fn from(err: CompileError) -> Self {
        match err {
            CompileError::Validation(report) => PilotError::Validation {
                errors: report.errors.iter().map(ToString::to_string).collect(),
            },
            CompileError::Malformed(reason) => PilotError::Validation { errors: vec![reason] },
            CompileError::Compilation {
                deterministic,
                assisted,
            } => PilotError::Compilation {
                errors: deterministic
                    .into_iter()
                    .map(|e| format!("deterministic: {}", e))
                    .chain(assisted.into_iter().map(|e| format!("assisted: {}", e)))
                    .collect(),
            },
            CompileError::Graph(err) => err.into(),
        }
    }
}

/// Compile request as accepted over the wire
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompileRequest {
    /// Raw IR document
    pub ir: Value,
    /// Optional planning context
    #[serde(default)]
    pub pipeline_context: Option<PipelineContext>,
    /// Optional per-request configuration
    #[serde(default)]
    pub compiler_config: Option<CompilerConfig>,
}

/// Compile response as returned over the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileResponse {
    /// Whether a workflow was produced
    pub success: bool,
    /// Normalized steps
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow: Option<Vec<CompiledStep>>,
    /// Validation report, when validation ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
    /// Errors, when unsuccessful
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Normalizer warnings
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Metadata, when successful
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<CompileMetadata>,
}

impl From<Result<CompileOutput, CompileError>> for CompileResponse {
    fn from(result: Result<CompileOutput, CompileError>) -> Self {
        match result {
            Ok(out) => Self {
                success: true,
                workflow: Some(out.workflow),
                validation: Some(out.validation),
                errors: Vec::new(),
                warnings: out.warnings,
                metadata: Some(out.metadata),
            },
            Err(CompileError::Validation(report)) => Self {
                success: false,
                workflow: None,
                errors: report.errors.iter().map(ToString::to_string).collect(),
                validation: Some(report),
                warnings: Vec::new(),
                metadata: None,
            },
            Err(CompileError::Compilation {
                deterministic,
                assisted,
            }) => Self {
                success: false,
                workflow: None,
                validation: None,
                errors: deterministic
                    .into_iter()
                    .map(|e| format!("deterministic: {}", e))
                    .chain(assisted.into_iter().map(|e| format!("assisted: {}", e)))
                    .collect(),
                warnings: Vec::new(),
                metadata: None,
            },
            Err(other) => Self {
                success: false,
                workflow: None,
                validation: None,
                errors: vec![other.to_string()],
                warnings: Vec::new(),
                metadata: None,
            },
        }
    }
}

/// The compilation orchestrator
pub struct Compiler {
    config: CompilerConfig,
    validator: IrValidator,
    deterministic: Arc<dyn CompilerStrategy>,
    assisted: Option<Arc<dyn CompilerStrategy>>,
}

impl Compiler {
    /// Compiler with only the deterministic strategy
    #[must_use]
    pub fn new(config: CompilerConfig) -> Self {
        Self {
            config,
            validator: IrValidator::new(),
            deterministic: Arc::new(DeterministicStrategy::new()),
            assisted: None,
        }
    }

    /// Install an assisted fallback strategy
    #[must_use]
    pub fn with_assisted(mut self, strategy: Arc<dyn CompilerStrategy>) -> Self {
        self.assisted = Some(strategy);
        self
    }

    /// Install an assisted fallback backed by a graph synthesizer
    #[must_use]
    pub fn with_synthesizer(self, synthesizer: Arc<dyn GraphSynthesizer>) -> Self {
        self.with_assisted(Arc::new(AssistedStrategy::new(synthesizer)))
    }

    /// Replace the deterministic strategy
    #[must_use]
    pub fn with_deterministic(mut self, strategy: Arc<dyn CompilerStrategy>) -> Self {
        self.deterministic = strategy;
        self
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Same strategies with a different configuration
    #[must_use]
    pub fn reconfigured(&self, config: CompilerConfig) -> Self {
        Self {
            config,
            validator: self.validator.clone(),
            deterministic: Arc::clone(&self.deterministic),
            assisted: self.assisted.clone(),
        }
    }

    /// Compile a typed IR
    ///
    /// # Errors
    ///
    /// See [`Compiler::compile`]
    pub async fn compile_ir(
        &self,
        ir: &DeclarativeIr,
        pipeline: Option<PipelineContext>,
    ) -> Result<CompileOutput, CompileError> {
        let raw = serde_json::to_value(ir).map_err(|e| CompileError::Malformed(e.to_string()))?;
        self.compile(&raw, pipeline).await
    }

    /// Validate, compile, normalize and check a raw IR document
    ///
    /// # Errors
    ///
    /// Returns error if the IR is not declarative, every permitted strategy
    /// fails, or the normalized graph has a cycle or dangling edge
    #[instrument(skip_all, fields(mode = ?self.config.mode))]
    pub async fn compile(&self, ir: &Value, pipeline: Option<PipelineContext>) -> Result<CompileOutput, CompileError> {
        let started = Instant::now();

        let validation = self.validator.validate(ir);
        if !validation.valid {
            warn!(errors = validation.errors.len(), "IR rejected");
            return Err(CompileError::Validation(validation));
        }
        let typed: DeclarativeIr = serde_json::from_value(ir.clone()).map_err(|e| CompileError::Malformed(e.to_string()))?;

        let ctx = CompileContext {
            pipeline,
            max_nesting_depth: self.config.max_nesting_depth,
        };
        let (output, compiler_used, fallback_reason) = self.run_strategies(&typed, &ctx).await?;

        let normalized = Normalizer::with_simplify_threshold(self.config.simplify_threshold).normalize(output.workflow);
        let graph = StepGraph::from_steps(normalized.steps)?;
        graph.validate()?;

        let workflow = graph.into_steps();
        let mut plugins_used = output.plugins_used;
        for plugin in plugins_in(&workflow) {
            if !plugins_used.contains(&plugin) {
                plugins_used.push(plugin);
            }
        }

        let metadata = CompileMetadata {
            compilation_time_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            step_count: workflow.len(),
            plugins_used,
            token_usage: output.token_usage,
            compiler_used,
            fallback_reason,
        };
        info!(
            compiler = %compiler_used,
            steps = metadata.step_count,
            passes = ?normalized.applied,
            "compiled workflow"
        );

        Ok(CompileOutput {
            workflow,
            validation,
            warnings: normalized.warnings,
            normalization: normalized.applied,
            metadata,
        })
    }

    async fn run_strategies(
        &self,
        ir: &DeclarativeIr,
        ctx: &CompileContext,
    ) -> Result<(StrategyOutput, CompilerKind, Option<String>), CompileError> {
        let mut deterministic_errors = Vec::new();

        if self.config.mode != CompilerMode::AssistedOnly {
            match self.deterministic.compile(ir, ctx).await {
                Ok(out) => return Ok((out, self.deterministic.kind(), None)),
                Err(err) => {
                    warn!(error = %err, "deterministic compilation failed");
                    deterministic_errors.push(err.to_string());
                }
            }
        }

        if self.config.mode == CompilerMode::DeterministicOnly {
            return Err(CompileError::Compilation {
                deterministic: deterministic_errors,
                assisted: Vec::new(),
            });
        }

        let fallback_reason = deterministic_errors.first().cloned();
        let Some(assisted) = &self.assisted else {
            return Err(CompileError::Compilation {
                deterministic: deterministic_errors,
                assisted: vec![StrategyError::Unavailable.to_string()],
            });
        };

        match assisted.compile(ir, ctx).await {
            Ok(out) => {
                if let Some(reason) = &fallback_reason {
                    info!(reason = %reason, "fell back to assisted compilation");
                }
                Ok((out, assisted.kind(), fallback_reason))
            }
            Err(err) => Err(CompileError::Compilation {
                deterministic: deterministic_errors,
                assisted: vec![err.to_string()],
            }),
        }
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new(CompilerConfig::default())
    }
}

/// Distinct plugin names of action steps, nested ones included
pub(crate) fn plugins_in(steps: &[CompiledStep]) -> Vec<String> {
    let mut plugins: Vec<String> = Vec::new();
    for_each_step(steps, &mut |step| {
        if let StepKind::Action { plugin, .. } = &step.kind {
            if !plugins.contains(plugin) {
                plugins.push(plugin.clone());
            }
        }
    });
    plugins
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CannedSynthesizer {
        calls: AtomicU32,
        replies: Vec<String>,
    }

    #[async_trait]
    impl GraphSynthesizer for CannedSynthesizer {
        async fn synthesize(&self, _request: &SynthesisRequest) -> Result<SynthesisResponse, StrategyError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            Ok(SynthesisResponse {
                content: self.replies[n.min(self.replies.len() - 1)].clone(),
                token_usage: TokenUsage {
                    input_tokens: 100,
                    output_tokens: 20,
                },
            })
        }
    }

    fn scenario_ir() -> Value {
        json!({
            "goal": "summarize inbox and email manager",
            "data_sources": ["gmail-inbox"],
            "delivery_rules": [{"to": "manager"}]
        })
    }

    #[tokio::test]
    async fn test_scenario_three_steps_two_edges() {
        let out = Compiler::default().compile(&scenario_ir(), None).await.unwrap();
        let graph = StepGraph::from_steps(out.workflow.clone()).unwrap();

        assert_eq!(out.workflow.len(), 3);
        assert_eq!(graph.edge_count(), 2);
        assert!(graph.validate().is_ok());
        let types: Vec<&str> = out.workflow.iter().map(CompiledStep::type_name).collect();
        assert_eq!(types, vec!["action", "ai_processing", "action"]);
        assert_eq!(out.metadata.compiler_used, CompilerKind::Deterministic);
        assert_eq!(out.metadata.step_count, 3);
        assert_eq!(out.metadata.plugins_used, vec!["google-mail"]);
        assert!(out.metadata.fallback_reason.is_none());
    }

    #[tokio::test]
    async fn test_validation_failure_never_compiles() {
        let err = Compiler::default()
            .compile(&json!({"goal": "x", "steps": []}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CompileError::Validation(_)));
        let response = CompileResponse::from(Err(err));
        assert!(!response.success);
        assert!(response.validation.is_some_and(|v| !v.valid));
    }

    #[tokio::test]
    async fn test_fallback_records_reason_and_retries_once() {
        let synth = Arc::new(CannedSynthesizer {
            calls: AtomicU32::new(0),
            replies: vec![
                "not json".to_string(),
                r#"```json
[{"id": "step1", "type": "action", "plugin": "crm", "action": "list_leads"},
 {"id": "step2", "type": "action", "plugin": "slack", "action": "post_message",
  "params": {"text": "{{step1}}"}}]
```"#
                    .to_string(),
            ],
        });
        let compiler = Compiler::default().with_synthesizer(synth.clone());
        let ir = json!({
            "goal": "post new leads",
            "data_sources": ["crm-leads"],
            "delivery_rules": [{"to": "#sales"}]
        });

        let out = compiler.compile(&ir, Some(PipelineContext::default())).await.unwrap();
        assert_eq!(out.metadata.compiler_used, CompilerKind::Assisted);
        assert!(out.metadata.fallback_reason.as_deref().unwrap().contains("crm-leads"));
        assert_eq!(synth.calls.load(Ordering::SeqCst), 2);
        assert_eq!(out.metadata.token_usage.unwrap().total(), 240);
        // Reference audit added the missing edge
        assert!(out.workflow[1].dependencies.contains("step1"));
    }

    #[tokio::test]
    async fn test_both_strategies_fail() {
        let synth = Arc::new(CannedSynthesizer {
            calls: AtomicU32::new(0),
            replies: vec!["{}".to_string()],
        });
        let compiler = Compiler::default().with_synthesizer(synth.clone());
        let err = compiler
            .compile(&json!({"goal": "g", "data_sources": ["unknown-system"], "delivery_rules": [{"to": "x@y.z"}]}), None)
            .await
            .unwrap_err();
        match &err {
            CompileError::Compilation {
                deterministic,
                assisted,
            } => {
                assert_eq!(deterministic.len(), 1);
                assert!(assisted[0].contains("2 attempts"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(synth.calls.load(Ordering::SeqCst), 2);
        assert_eq!(PilotError::from(err).kind(), "compilation_error");
    }

    #[tokio::test]
    async fn test_modes() {
        let deterministic_only = Compiler::new(CompilerConfig::default().with_mode(CompilerMode::DeterministicOnly));
        let err = deterministic_only
            .compile(&json!({"goal": "g", "data_sources": ["nowhere"], "delivery_rules": [{"to": "a@b.c"}]}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CompileError::Compilation { ref assisted, .. } if assisted.is_empty()));

        let assisted_only = Compiler::new(CompilerConfig::default().with_mode(CompilerMode::AssistedOnly));
        let err = assisted_only.compile(&scenario_ir(), None).await.unwrap_err();
        assert!(matches!(err, CompileError::Compilation { ref deterministic, .. } if deterministic.is_empty()));
    }
}
