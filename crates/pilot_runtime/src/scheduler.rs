//! Readiness tracking for one execution attempt.
//!
//! The scheduler is a pure state machine over the top-level steps:
//! - A step is ready once every dependency has completed
//! - A skipped dependency skips its dependents
//! - A failed dependency blocks its dependents, which stay pending
//! - Branch steps of a conditional implicitly depend on it
//!
//! Steps recorded as completed or skipped by an earlier attempt start in
//! that state, so a resumed execution only runs what is left.

use indexmap::{IndexMap, IndexSet};
use pilot_core::StepId;
use pilot_plan::{StepGraph, StepKind};
use pilot_storage::ExecutionTrace;

/// Per-step scheduling state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    /// Not yet dispatched
    Pending,
    /// Dispatched, awaiting its result
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Not run because its branch was not taken
    Skipped,
}

impl StepState {
    /// Whether no further transition can happen in this attempt
    #[must_use]
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// What the engine should do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleDecision {
    /// Dispatch these steps
    Run(Vec<StepId>),
    /// Wait for running steps
    Wait,
    /// Every step settled
    Complete,
    /// Pending steps remain but none can become ready
    Blocked(Vec<StepId>),
}

/// Step readiness state machine
#[derive(Debug, Clone)]
pub struct Scheduler {
    /// Dispatch order (topological, ties in compilation order)
    order: Vec<StepId>,
    states: IndexMap<StepId, StepState>,
    /// Effective dependencies, including conditional branch membership
    dependencies: IndexMap<StepId, IndexSet<StepId>>,
}

impl Scheduler {
    /// Build from a graph, carrying over settled steps from `trace`
    #[must_use]
    pub fn new(graph: &StepGraph, trace: &ExecutionTrace) -> Self {
        let order = graph
            .topological_order()
            .unwrap_or_else(|_| graph.ids().cloned().collect());

        let mut dependencies: IndexMap<StepId, IndexSet<StepId>> = graph
            .iter()
            .map(|step| {
                let known = step
                    .dependencies
                    .iter()
                    .filter(|d| graph.contains(d.as_str()))
                    .cloned()
                    .collect();
                (step.id.clone(), known)
            })
            .collect();

        for step in graph.iter() {
            if let StepKind::Conditional {
                true_branch,
                false_branch,
                ..
            } = &step.kind
            {
                for member in true_branch.iter().chain(false_branch) {
                    if member != &step.id {
                        if let Some(deps) = dependencies.get_mut(member) {
                            deps.insert(step.id.clone());
                        }
                    }
                }
            }
        }

        let states = order
            .iter()
            .map(|id| {
                let state = if trace.is_completed(id.as_str()) {
                    StepState::Completed
                } else if trace.is_skipped(id.as_str()) {
                    StepState::Skipped
                } else {
                    StepState::Pending
                };
                (id.clone(), state)
            })
            .collect();

        Self {
            order,
            states,
            dependencies,
        }
    }

    /// Current state of a step
    #[must_use]
    pub fn state(&self, id: &str) -> Option<StepState> {
        self.states.get(id).copied()
    }

    /// Pending steps whose dependencies all completed, in dispatch order
    #[must_use]
    pub fn ready(&self) -> Vec<StepId> {
        self.order
            .iter()
            .filter(|id| self.state(id.as_str()) == Some(StepState::Pending))
            .filter(|id| {
                self.dependencies
                    .get(*id)
                    .is_none_or(|deps| deps.iter().all(|d| self.state(d.as_str()) == Some(StepState::Completed)))
            })
            .cloned()
            .collect()
    }

    /// Mark every pending step downstream of a skipped one as skipped.
    ///
    /// Returns the newly skipped steps in dispatch order.
    pub fn take_skippable(&mut self) -> Vec<StepId> {
        let mut skipped = Vec::new();
        loop {
            let next: Vec<StepId> = self
                .order
                .iter()
                .filter(|id| self.state(id.as_str()) == Some(StepState::Pending))
                .filter(|id| {
                    self.dependencies
                        .get(*id)
                        .is_some_and(|deps| deps.iter().any(|d| self.state(d.as_str()) == Some(StepState::Skipped)))
                })
                .cloned()
                .collect();
            if next.is_empty() {
                return skipped;
            }
            for id in next {
                self.set(&id, StepState::Skipped);
                skipped.push(id);
            }
        }
    }

    /// Skip the pending members of an untaken branch
    pub fn skip_branch(&mut self, members: &[StepId]) -> Vec<StepId> {
        let mut skipped = Vec::new();
        for id in members {
            if self.state(id.as_str()) == Some(StepState::Pending) {
                self.set(id, StepState::Skipped);
                skipped.push(id.clone());
            }
        }
        skipped
    }

    /// Pending → running
    pub fn mark_running(&mut self, id: &StepId) {
        self.set(id, StepState::Running);
    }

    /// Running → completed
    pub fn mark_completed(&mut self, id: &StepId) {
        self.set(id, StepState::Completed);
    }

    /// Running → failed
    pub fn mark_failed(&mut self, id: &StepId) {
        self.set(id, StepState::Failed);
    }

    fn set(&mut self, id: &StepId, state: StepState) {
        if let Some(slot) = self.states.get_mut(id) {
            *slot = state;
        }
    }

    /// Next decision
    #[must_use]
    pub fn decide(&self) -> ScheduleDecision {
        let ready = self.ready();
        if !ready.is_empty() {
            return ScheduleDecision::Run(ready);
        }
        if self.count(StepState::Running) > 0 {
            return ScheduleDecision::Wait;
        }
        let pending = self.in_state(StepState::Pending);
        if pending.is_empty() {
            ScheduleDecision::Complete
        } else {
            ScheduleDecision::Blocked(pending)
        }
    }

    /// Steps currently in `state`, in dispatch order
    #[must_use]
    pub fn in_state(&self, state: StepState) -> Vec<StepId> {
        self.order
            .iter()
            .filter(|id| self.state(id.as_str()) == Some(state))
            .cloned()
            .collect()
    }

    /// Number of steps in `state`
    #[must_use]
    pub fn count(&self, state: StepState) -> usize {
        self.states.values().filter(|s| **s == state).count()
    }
}
