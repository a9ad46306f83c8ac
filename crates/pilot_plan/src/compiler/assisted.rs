//! Assisted (generative) compilation fallback.

use super::{
    plugins_in, CompileContext, CompilerKind, CompilerStrategy, PipelineContext, StrategyError, StrategyOutput,
    TokenUsage,
};
use crate::ir::DeclarativeIr;
use crate::step::StepParser;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Output schema the synthesizer must follow
pub const STEP_SCHEMA: &str = r#"Return only a JSON array of steps. Each step:
{"id": "step<N>", "name": string, "type": "action"|"transform"|"conditional"|"loop"|"scatter_gather"|"ai_processing",
 "dependencies": [step ids], "outputVariable": string (transform and scatter_gather only),
 action: {"plugin", "action", "params"}, transform: {"operation", "config"},
 conditional: {"condition", "trueBranch", "falseBranch"},
 loop: {"iterateOver", "maxIterations", "loopSteps"},
 scatter_gather: {"scatter": {"input", "steps", "itemVariable", "maxIterations"}, "gather": {"operation"}},
 ai_processing: {"prompt", "params"}}
Reference earlier outputs as {{stepN}} or {{outputVariable}}, user inputs as {{input.name}}."#;

/// What the synthesizer is asked to produce
#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    /// IR to compile
    pub ir: DeclarativeIr,
    /// Required output schema
    pub schema: &'static str,
    /// Planning context, if supplied
    pub pipeline: Option<PipelineContext>,
    /// Parse error of the previous attempt
    pub previous_error: Option<String>,
    /// 1-based attempt number
    pub attempt: u32,
}

/// Raw synthesizer reply
#[derive(Debug, Clone)]
pub struct SynthesisResponse {
    /// JSON text, possibly fenced
    pub content: String,
    /// Usage for this call
    pub token_usage: TokenUsage,
}

/// Generative collaborator that drafts step graphs
#[async_trait]
pub trait GraphSynthesizer: Send + Sync {
    /// Draft a step list for the request
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesisResponse, StrategyError>;
}

/// Fallback strategy delegating to a [`GraphSynthesizer`]
pub struct AssistedStrategy {
    synthesizer: Arc<dyn GraphSynthesizer>,
    max_attempts: u32,
}

impl AssistedStrategy {
    /// Create with one retry on malformed output
    #[must_use]
    pub fn new(synthesizer: Arc<dyn GraphSynthesizer>) -> Self {
        Self {
            synthesizer,
            max_attempts: 2,
        }
    }
}

#[async_trait]
impl CompilerStrategy for AssistedStrategy {
    fn kind(&self) -> CompilerKind {
        CompilerKind::Assisted
    }

    async fn compile(&self, ir: &DeclarativeIr, ctx: &CompileContext) -> Result<StrategyOutput, StrategyError> {
        let parser = match ctx.max_nesting_depth {
            0 => StepParser::new(),
            depth => StepParser::new().with_max_depth(depth),
        };
        let mut usage = TokenUsage::default();
        let mut previous_error = None;

        for attempt in 1..=self.max_attempts {
            let request = SynthesisRequest {
                ir: ir.clone(),
                schema: STEP_SCHEMA,
                pipeline: ctx.pipeline.clone(),
                previous_error: previous_error.take(),
                attempt,
            };
            let response = self.synthesizer.synthesize(&request).await?;
            usage.add(response.token_usage);

            let parsed = serde_json::from_str::<serde_json::Value>(strip_code_fence(&response.content))
                .map_err(|e| e.to_string())
                .and_then(|value| parser.parse(&value).map_err(|e| e.to_string()))
                .and_then(|steps| {
                    if steps.is_empty() {
                        Err("no steps returned".to_string())
                    } else {
                        Ok(steps)
                    }
                });

            match parsed {
                Ok(workflow) => {
                    debug!(attempt, steps = workflow.len(), "synthesized graph accepted");
                    return Ok(StrategyOutput {
                        plugins_used: plugins_in(&workflow),
                        workflow,
                        token_usage: Some(usage),
                    });
                }
                Err(err) => {
                    warn!(attempt, error = %err, "synthesized graph rejected");
                    previous_error = Some(err);
                }
            }
        }

        Err(StrategyError::MalformedOutput {
            attempts: self.max_attempts,
            last_error: previous_error.unwrap_or_default(),
        })
    }
}

/// Strip a surrounding Markdown code fence, if any
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording {
        seen: Mutex<Vec<(u32, Option<String>)>>,
    }

    #[async_trait]
    impl GraphSynthesizer for Recording {
        async fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesisResponse, StrategyError> {
            self.seen
                .lock()
                .unwrap()
                .push((request.attempt, request.previous_error.clone()));
            let content = if request.attempt == 1 {
                "[{\"id\": \"step1\"}]".to_string()
            } else {
                "[{\"id\": \"step1\", \"prompt\": \"hi\"}]".to_string()
            };
            Ok(SynthesisResponse {
                content,
                token_usage: TokenUsage::default(),
            })
        }
    }

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```json\n[1]\n```"), "[1]");
        assert_eq!(strip_code_fence("  [2] "), "[2]");
        assert_eq!(strip_code_fence("```\n[3]```"), "[3]");
    }

    #[tokio::test]
    async fn test_previous_error_fed_back() {
        let synth = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
        });
        let strategy = AssistedStrategy::new(synth.clone());
        let ctx = CompileContext {
            pipeline: None,
            max_nesting_depth: 4,
        };
        let out = strategy.compile(&DeclarativeIr::new("greet"), &ctx).await.unwrap();
        assert_eq!(out.workflow[0].type_name(), "ai_processing");

        let seen = synth.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].1.is_none());
        assert!(seen[1].1.as_deref().unwrap().contains("no recognizable type"));
    }
}
