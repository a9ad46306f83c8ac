//! Step graph: the compiled steps indexed by id with dependency queries.

use crate::step::CompiledStep;
use indexmap::{IndexMap, IndexSet};
use pilot_core::{PilotError, StepId};
use std::collections::VecDeque;

/// Graph integrity errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// Two steps share an id
    #[error("duplicate step id {0}")]
    Duplicate(StepId),
    /// A dependency names a step that does not exist
    #[error("step {step} depends on missing step {missing}")]
    Dangling {
        /// Depending step
        step: StepId,
        /// Missing dependency
        missing: StepId,
    },
    /// The dependency relation has a cycle
    #[error("dependency cycle involving {}", .steps.iter().map(StepId::as_str).collect::<Vec<_>>().join(", "))]
    Cycle {
        /// Steps left unordered
        steps: Vec<StepId>,
    },
}

impl From<GraphError> for PilotError {
    fn from(err: GraphError) -> Self {
        PilotError::GraphIntegrity {
            reason: err.to_string(),
        }
    }
}

/// Compiled steps indexed by id, in compilation order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepGraph {
    steps: IndexMap<StepId, CompiledStep>,
}

impl StepGraph {
    /// Index a step list
    ///
    /// # Errors
    ///
    /// Returns error if two top-level steps share an id
    pub fn from_steps(steps: Vec<CompiledStep>) -> Result<Self, GraphError> {
        let mut map = IndexMap::with_capacity(steps.len());
        for step in steps {
            if map.contains_key(&step.id) {
                return Err(GraphError::Duplicate(step.id));
            }
            map.insert(step.id.clone(), step);
        }
        Ok(Self { steps: map })
    }

    /// Check that every dependency exists and the graph is acyclic
    ///
    /// # Errors
    ///
    /// Returns the first dangling edge or the cycle found
    pub fn validate(&self) -> Result<(), GraphError> {
        for step in self.steps.values() {
            for dep in &step.dependencies {
                if !self.steps.contains_key(dep) {
                    return Err(GraphError::Dangling {
                        step: step.id.clone(),
                        missing: dep.clone(),
                    });
                }
            }
        }
        self.topological_order().map(|_| ())
    }

    /// Kahn ordering; ties keep compilation order
    ///
    /// # Errors
    ///
    /// Returns error if the graph has a cycle
    pub fn topological_order(&self) -> Result<Vec<StepId>, GraphError> {
        let mut indegree: IndexMap<&StepId, usize> = self
            .steps
            .values()
            .map(|s| {
                let known = s.dependencies.iter().filter(|d| self.steps.contains_key(*d)).count();
                (&s.id, known)
            })
            .collect();

        let mut ready: VecDeque<&StepId> = indegree
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.steps.len());

        while let Some(id) = ready.pop_front() {
            order.push(id.clone());
            for dependent in self.dependents(id.as_str()) {
                if let Some(n) = indegree.get_mut(dependent) {
                    *n -= 1;
                    if *n == 0 {
                        ready.push_back(dependent);
                    }
                }
            }
        }

        if order.len() == self.steps.len() {
            Ok(order)
        } else {
            let placed: IndexSet<&StepId> = order.iter().collect();
            Err(GraphError::Cycle {
                steps: self.steps.keys().filter(|id| !placed.contains(id)).cloned().collect(),
            })
        }
    }

    /// Get step by id
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&CompiledStep> {
        self.steps.get(id)
    }

    /// Whether a top-level step exists
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.steps.contains_key(id)
    }

    /// Steps that `id` depends on
    #[must_use]
    pub fn dependencies(&self, id: &str) -> Vec<&StepId> {
        self.steps
            .get(id)
            .map(|s| s.dependencies.iter().collect())
            .unwrap_or_default()
    }

    /// Steps that depend on `id`
    #[must_use]
    pub fn dependents(&self, id: &str) -> Vec<&StepId> {
        self.steps
            .values()
            .filter(|s| s.dependencies.contains(id))
            .map(|s| &s.id)
            .collect()
    }

    /// Every step reachable downstream of `id`, excluding `id`
    #[must_use]
    pub fn downstream(&self, id: &str) -> IndexSet<StepId> {
        let mut seen = IndexSet::new();
        let mut stack: Vec<&StepId> = self.dependents(id);
        while let Some(next) = stack.pop() {
            if seen.insert(next.clone()) {
                stack.extend(self.dependents(next.as_str()));
            }
        }
        seen
    }

    /// Iterate steps in compilation order
    pub fn iter(&self) -> impl Iterator<Item = &CompiledStep> {
        self.steps.values()
    }

    /// Step ids in compilation order
    pub fn ids(&self) -> impl Iterator<Item = &StepId> {
        self.steps.keys()
    }

    /// Number of top-level steps
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the graph has no steps
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Number of dependency edges
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.steps.values().map(|s| s.dependencies.len()).sum()
    }

    /// Back to a step list
    #[must_use]
    pub fn into_steps(self) -> Vec<CompiledStep> {
        self.steps.into_values().collect()
    }
}
