//! Condition simplification and output-variable pruning.

use super::{for_each_step, for_each_step_mut, NormalizePass};
use crate::condition::Condition;
use crate::reference::rewrite_root_in_str;
use crate::step::{CompiledStep, StepKind, TransformOp};
use std::collections::HashSet;
use tracing::debug;

/// Collapses large keyword disjunctions into keyword-set checks
pub struct ConditionSimplifier {
    min_terms: usize,
}

impl ConditionSimplifier {
    /// Collapse disjunctions of at least `min_terms` checks
    #[must_use]
    pub const fn new(min_terms: usize) -> Self {
        Self { min_terms }
    }
}

impl NormalizePass for ConditionSimplifier {
    fn name(&self) -> &'static str {
        "condition_simplifier"
    }

    fn run(&self, steps: &mut Vec<CompiledStep>, _warnings: &mut Vec<String>) -> bool {
        let mut changed = false;
        for_each_step_mut(steps, &mut |step| match &mut step.kind {
            StepKind::Conditional { condition, .. } => {
                let simplified = condition.clone().simplify(self.min_terms);
                if simplified != *condition {
                    debug!(step = %step.id, "collapsed keyword disjunction");
                    *condition = simplified;
                    changed = true;
                }
            }
            StepKind::Transform {
                operation: TransformOp::Filter,
                config,
            } => {
                let Some(raw) = config.get("condition") else {
                    return;
                };
                let Ok(condition) = serde_json::from_value::<Condition>(raw.clone()) else {
                    return;
                };
                let simplified = condition.clone().simplify(self.min_terms);
                if simplified != condition {
                    if let Ok(value) = serde_json::to_value(&simplified) {
                        config.insert("condition".into(), value);
                        changed = true;
                    }
                }
            }
            _ => {}
        });
        changed
    }
}

/// Removes output-variable names that downstream steps cannot or do not use.
///
/// Only transform and scatter/gather steps publish named variables. Other
/// steps lose theirs after references are moved to the step id. Transforms
/// keep a name only while something references it; scatter/gather steps
/// always keep theirs.
pub struct OutputVariablePruner;

impl NormalizePass for OutputVariablePruner {
    fn name(&self) -> &'static str {
        "output_variable_pruner"
    }

    fn run(&self, steps: &mut Vec<CompiledStep>, _warnings: &mut Vec<String>) -> bool {
        let mut changed = false;

        // Names on steps that cannot publish them: re-address by step id
        let mut renames = Vec::new();
        for_each_step_mut(steps, &mut |step| {
            if step.kind.may_expose_variable() {
                return;
            }
            if let Some(var) = step.output_variable.take() {
                changed = true;
                if var != step.id.as_str() {
                    renames.push((var, step.id.to_string()));
                }
            }
        });
        for (var, id) in &renames {
            for_each_step_mut(steps, &mut |step| {
                step.visit_strings_mut(false, &mut |s| {
                    if let Some(new) = rewrite_root_in_str(s, var, id) {
                        *s = new;
                    }
                });
            });
        }

        changed |= prune_unused_transform_names(steps);
        changed
    }
}

/// Drops transform variable names left unreferenced by the edge rewrites.
///
/// Runs last: dead-step elimination can remove the only reader of a name.
pub struct UnusedVariablePruner;

impl NormalizePass for UnusedVariablePruner {
    fn name(&self) -> &'static str {
        "unused_variable_pruner"
    }

    fn run(&self, steps: &mut Vec<CompiledStep>, _warnings: &mut Vec<String>) -> bool {
        prune_unused_transform_names(steps)
    }
}

fn prune_unused_transform_names(steps: &mut [CompiledStep]) -> bool {
    let mut referenced = HashSet::new();
    for_each_step(steps, &mut |step| {
        for r in step.references(false) {
            referenced.insert(r.root);
        }
    });
    let mut changed = false;
    for_each_step_mut(steps, &mut |step| {
        if !matches!(step.kind, StepKind::Transform { .. }) {
            return;
        }
        let unused = step
            .output_variable
            .as_ref()
            .is_some_and(|var| !referenced.contains(var));
        if unused {
            debug!(step = %step.id, "dropped unreferenced output variable");
            step.output_variable = None;
            changed = true;
        }
    });
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Operator;
    use serde_json::{json, Map};

    #[test]
    fn test_filter_condition_simplified() {
        let cond = Condition::Or {
            conditions: (0..10)
                .map(|i| Condition::simple("subject", Operator::Contains, json!(format!("k{}", i))))
                .collect(),
        };
        let mut config = Map::new();
        config.insert("condition".into(), serde_json::to_value(cond).unwrap());
        let mut steps = vec![CompiledStep::new(
            "f",
            "filter",
            StepKind::Transform {
                operation: TransformOp::Filter,
                config,
            },
        )];
        let mut warnings = Vec::new();
        assert!(ConditionSimplifier::new(10).run(&mut steps, &mut warnings));
        let StepKind::Transform { config, .. } = &steps[0].kind else {
            panic!("expected transform");
        };
        assert_eq!(config["condition"]["conditionType"], "keyword_set");
        assert!(!ConditionSimplifier::new(10).run(&mut steps, &mut warnings));
    }

    #[test]
    fn test_pruner_keeps_referenced_transform_variable() {
        let mut config = Map::new();
        config.insert("input".into(), json!("{{input.rows}}"));
        let mut params = Map::new();
        params.insert("message".into(), json!("{{rows_sorted}}"));
        let mut steps = vec![
            CompiledStep::new(
                "step1",
                "sort",
                StepKind::Transform {
                    operation: TransformOp::Sort,
                    config,
                },
            )
            .with_output_variable("rows_sorted"),
            CompiledStep::action("step2", "log", "write", params),
        ];
        assert!(!OutputVariablePruner.run(&mut steps, &mut Vec::new()));
        assert_eq!(steps[0].output_variable.as_deref(), Some("rows_sorted"));
    }
}
