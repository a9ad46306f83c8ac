//! Scatter/gather and loop shape unification.

use super::NormalizePass;
use crate::reference::rewrite_root_in_str;
use crate::step::{CompiledStep, StepKind};
use pilot_core::StepId;

/// Brings nested step lists into their canonical form.
///
/// Legacy `data`/`actions` scatter shapes are already converted while
/// parsing; this pass namespaces nested ids under their parent
/// (`{parent}_{child}`), rewrites nested dependencies and references to the
/// new ids and fills in the default item variable.
pub struct ScatterShapeUnifier;

impl NormalizePass for ScatterShapeUnifier {
    fn name(&self) -> &'static str {
        "scatter_shape_unifier"
    }

    fn run(&self, steps: &mut Vec<CompiledStep>, _warnings: &mut Vec<String>) -> bool {
        steps.iter_mut().fold(false, |acc, step| unify(step) || acc)
    }
}

fn unify(step: &mut CompiledStep) -> bool {
    let mut changed = false;

    if let StepKind::ScatterGather { scatter, .. } = &mut step.kind {
        if scatter.item_variable.is_none() {
            scatter.item_variable = Some("item".to_string());
            changed = true;
        }
    }

    let parent = step.id.clone();
    let Some(nested) = step.kind.nested_steps_mut() else {
        return changed;
    };

    let renames: Vec<(StepId, StepId)> = nested
        .iter()
        .filter(|child| !child.id.is_child_of(&parent))
        .map(|child| (child.id.clone(), parent.child(child.id.as_str())))
        .collect();

    if !renames.is_empty() {
        changed = true;
        for child in nested.iter_mut() {
            for (old, new) in &renames {
                if child.id == *old {
                    child.id = new.clone();
                }
                if child.dependencies.shift_remove(old) {
                    child.dependencies.insert(new.clone());
                }
                child.visit_strings_mut(true, &mut |s| {
                    if let Some(rewritten) = rewrite_root_in_str(s, old.as_str(), new.as_str()) {
                        *s = rewritten;
                    }
                });
            }
        }
    }

    for child in nested.iter_mut() {
        changed |= unify(child);
    }
    changed
}
