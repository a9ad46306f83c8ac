//! Passes that rewrite edges: dead-step elimination, dependency repair and
//! the reference audit.

use super::{for_each_step, NormalizePass};
use crate::reference::{is_reserved_root, rewrite_root_in_str};
use crate::step::{CompiledStep, StepKind};
use indexmap::IndexSet;
use pilot_core::StepId;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Removes identity `map` and always-true `filter` transforms.
///
/// Every reference to a removed step (by id or by its variable name) is
/// redirected to the removed step's own input, and its dependents inherit
/// its dependencies. Removal repeats until no such step remains, so chains
/// collapse onto the nearest retained step.
pub struct DeadStepEliminator;

impl NormalizePass for DeadStepEliminator {
    fn name(&self) -> &'static str {
        "dead_step_elimination"
    }

    fn run(&self, steps: &mut Vec<CompiledStep>, _warnings: &mut Vec<String>) -> bool {
        let mut changed = false;
        while let Some((pos, target)) = steps.iter().enumerate().find_map(|(i, s)| {
            if !(s.is_identity_map() || s.is_always_true_filter()) {
                return None;
            }
            let target = s.upstream_input()?;
            let root = target.split('.').next().unwrap_or_default();
            (root != s.id.as_str()).then_some((i, target))
        }) {
            let removed = steps.remove(pos);
            debug!(step = %removed.id, target = %target, "removed no-op transform");
            for step in steps.iter_mut() {
                redirect(step, &removed, &target);
            }
            changed = true;
        }
        changed
    }
}

fn redirect(step: &mut CompiledStep, removed: &CompiledStep, target: &str) {
    let removed_id = removed.id.as_str();
    let removed_var = removed.output_variable.as_deref();
    step.visit_strings_mut(true, &mut |s| {
        if let Some(new) = rewrite_root_in_str(s, removed_id, target) {
            *s = new;
        }
        if let Some(var) = removed_var {
            if let Some(new) = rewrite_root_in_str(s, var, target) {
                *s = new;
            }
        }
    });

    if step.dependencies.shift_remove(removed_id) {
        for dep in &removed.dependencies {
            if dep != &step.id {
                step.dependencies.insert(dep.clone());
            }
        }
    }
    if let StepKind::Conditional {
        true_branch,
        false_branch,
        ..
    } = &mut step.kind
    {
        true_branch.retain(|id| id != removed_id);
        false_branch.retain(|id| id != removed_id);
    }
}

/// Drops dependency and branch edges that point at absent steps, and
/// self-edges.
///
/// Nested steps may depend on their siblings or on top-level steps.
pub struct DependencyRepair;

impl NormalizePass for DependencyRepair {
    fn name(&self) -> &'static str {
        "dependency_repair"
    }

    fn run(&self, steps: &mut Vec<CompiledStep>, warnings: &mut Vec<String>) -> bool {
        let top: HashSet<StepId> = steps.iter().map(|s| s.id.clone()).collect();
        repair_list(steps, &top, &HashSet::new(), warnings)
    }
}

fn repair_list(
    steps: &mut [CompiledStep],
    top: &HashSet<StepId>,
    siblings: &HashSet<StepId>,
    warnings: &mut Vec<String>,
) -> bool {
    let mut changed = false;
    for step in steps.iter_mut() {
        let known = |id: &StepId| top.contains(id) || siblings.contains(id);
        let before = step.dependencies.len();
        let own = step.id.clone();
        step.dependencies.retain(|dep| {
            let keep = dep != &own && known(dep);
            if !keep {
                warnings.push(format!("step {} dropped dependency on {}", own, dep));
            }
            keep
        });
        changed |= step.dependencies.len() != before;

        if let StepKind::Conditional {
            true_branch,
            false_branch,
            ..
        } = &mut step.kind
        {
            for branch in [true_branch, false_branch] {
                let before = branch.len();
                branch.retain(|id| id != &own && top.contains(id));
                changed |= branch.len() != before;
            }
        }

        if let Some(nested) = step.kind.nested_steps_mut() {
            let nested_ids: HashSet<StepId> = nested.iter().map(|s| s.id.clone()).collect();
            changed |= repair_list(nested, top, &nested_ids, warnings);
        }
    }
    changed
}

/// Reconciles templated references with the dependency relation.
///
/// A reference by step id to a step that publishes a named variable is
/// rewritten to the variable name. A referenced upstream step missing from
/// `dependencies` is added unless that would close a cycle. References that
/// resolve to nothing become warnings.
pub struct ReferenceAudit;

impl NormalizePass for ReferenceAudit {
    fn name(&self) -> &'static str {
        "reference_audit"
    }

    fn run(&self, steps: &mut Vec<CompiledStep>, warnings: &mut Vec<String>) -> bool {
        let top: HashSet<StepId> = steps.iter().map(|s| s.id.clone()).collect();
        let var_owner: HashMap<String, StepId> = steps
            .iter()
            .filter_map(|s| s.exposed_variable().map(|v| (v.to_string(), s.id.clone())))
            .collect();
        let mut changed = false;

        for i in 0..steps.len() {
            let own = steps[i].id.clone();
            let scope = nested_scope(&steps[i]);
            let mut needed: IndexSet<StepId> = IndexSet::new();
            let mut renames: Vec<(String, String)> = Vec::new();

            for reference in steps[i].references(true) {
                let root = reference.root.as_str();
                if is_reserved_root(root) || scope.contains(root) || root == own.as_str() {
                    continue;
                }
                if let Some(owner) = var_owner.get(root) {
                    if owner != &own {
                        needed.insert(owner.clone());
                    }
                } else if top.contains(root) {
                    let exposed = steps
                        .iter()
                        .find(|s| s.id == root)
                        .and_then(CompiledStep::exposed_variable);
                    if let Some(var) = exposed {
                        if !renames.iter().any(|(from, _)| from == root) {
                            renames.push((root.to_string(), var.to_string()));
                        }
                    }
                    needed.insert(StepId::new(root));
                } else {
                    let message = format!("step {} references unknown '{}'", own, root);
                    warn!(step = %own, root = %root, "unresolvable reference");
                    if !warnings.contains(&message) {
                        warnings.push(message);
                    }
                }
            }

            for (from, to) in &renames {
                steps[i].visit_strings_mut(true, &mut |s| {
                    if let Some(new) = rewrite_root_in_str(s, from, to) {
                        *s = new;
                    }
                });
                changed = true;
            }

            for dep in needed {
                if steps[i].dependencies.contains(&dep) {
                    continue;
                }
                if reaches(steps, &dep, &own) {
                    warnings.push(format!(
                        "step {} references {} but depending on it would create a cycle",
                        own, dep
                    ));
                    continue;
                }
                debug!(step = %own, dependency = %dep, "added missing dependency");
                steps[i].dependencies.insert(dep);
                changed = true;
            }
        }
        changed
    }
}

/// Nested step ids and item variables visible inside a step
fn nested_scope(step: &CompiledStep) -> HashSet<String> {
    let mut scope = HashSet::new();
    let mut add = |s: &CompiledStep| {
        if let Some(var) = s.kind.item_variable() {
            scope.insert(var.to_string());
        }
        for child in s.kind.nested_steps() {
            scope.insert(child.id.to_string());
        }
    };
    add(step);
    for_each_step(step.kind.nested_steps(), &mut add);
    scope
}

/// Whether `from` depends, directly or transitively, on `to`
fn reaches(steps: &[CompiledStep], from: &StepId, to: &StepId) -> bool {
    let deps: HashMap<&StepId, &IndexSet<StepId>> = steps.iter().map(|s| (&s.id, &s.dependencies)).collect();
    let mut stack = vec![from];
    let mut seen = HashSet::new();
    while let Some(current) = stack.pop() {
        if current == to {
            return true;
        }
        if seen.insert(current) {
            if let Some(next) = deps.get(current) {
                stack.extend(next.iter());
            }
        }
    }
    false
}
