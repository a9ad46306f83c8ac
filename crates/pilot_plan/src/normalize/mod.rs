//! Graph normalization pipeline.
//!
//! A fixed, ordered list of rewrites applied to every compiled step list,
//! whichever strategy produced it. Each pass reports whether it changed the
//! graph; running the pipeline on its own output changes nothing.

mod rewire;
mod shape;
mod simplify;

pub use rewire::{DeadStepEliminator, DependencyRepair, ReferenceAudit};
pub use shape::ScatterShapeUnifier;
pub use simplify::{ConditionSimplifier, OutputVariablePruner, UnusedVariablePruner};

use crate::step::CompiledStep;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Minimum disjunction size collapsed by the condition simplifier
pub const DEFAULT_SIMPLIFY_THRESHOLD: usize = 10;

/// One rewrite over the step list
pub trait NormalizePass: Send + Sync {
    /// Stable pass name reported in [`NormalizeOutcome::applied`]
    fn name(&self) -> &'static str;

    /// Rewrite in place; return whether anything changed
    fn run(&self, steps: &mut Vec<CompiledStep>, warnings: &mut Vec<String>) -> bool;
}

/// Result of running the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizeOutcome {
    /// Normalized steps
    pub steps: Vec<CompiledStep>,
    /// Names of the passes that changed the graph, in order
    pub applied: Vec<String>,
    /// Non-fatal findings
    pub warnings: Vec<String>,
}

/// The ordered pass pipeline
pub struct Normalizer {
    passes: Vec<Box<dyn NormalizePass>>,
}

impl Normalizer {
    /// The standard pipeline
    #[must_use]
    pub fn standard() -> Self {
        Self::with_simplify_threshold(DEFAULT_SIMPLIFY_THRESHOLD)
    }

    /// The standard pipeline with a custom simplifier threshold
    #[must_use]
    pub fn with_simplify_threshold(min_terms: usize) -> Self {
        Self {
            passes: vec![
                Box::new(ConditionSimplifier::new(min_terms)),
                Box::new(OutputVariablePruner),
                Box::new(ScatterShapeUnifier),
                Box::new(DeadStepEliminator),
                Box::new(DependencyRepair),
                Box::new(ReferenceAudit),
                Box::new(UnusedVariablePruner),
            ],
        }
    }

    /// Pass names in execution order
    #[must_use]
    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Run every pass in order
    #[must_use]
    pub fn normalize(&self, mut steps: Vec<CompiledStep>) -> NormalizeOutcome {
        let mut applied = Vec::new();
        let mut warnings = Vec::new();
        for pass in &self.passes {
            if pass.run(&mut steps, &mut warnings) {
                debug!(pass = pass.name(), "normalization pass changed graph");
                applied.push(pass.name().to_string());
            }
        }
        NormalizeOutcome {
            steps,
            applied,
            warnings,
        }
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::standard()
    }
}

/// Apply `f` to every step, nested ones included, depth first
pub(crate) fn for_each_step_mut(steps: &mut [CompiledStep], f: &mut dyn FnMut(&mut CompiledStep)) {
    for step in steps {
        f(step);
        if let Some(nested) = step.kind.nested_steps_mut() {
            for_each_step_mut(nested, f);
        }
    }
}

/// Visit every step, nested ones included, depth first
pub(crate) fn for_each_step(steps: &[CompiledStep], f: &mut dyn FnMut(&CompiledStep)) {
    for step in steps {
        f(step);
        for_each_step(step.kind.nested_steps(), f);
    }
}
