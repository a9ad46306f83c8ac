//! PILOT Runtime
//!
//! Runs compiled workflows and resumes them after failures:
//!
//! - [`engine`]: dispatches ready steps with bounded parallelism and
//!   persists every transition
//! - [`executor`]: evaluates one step, including loops and scatter-gather
//! - [`resume`]: continues a failed or paused execution under the
//!   distributed lock
//! - [`status`]: user-facing progress and pending decisions
//! - [`trigger`]: runs stored workflows on an interval
//!
//! [`PilotRuntime`] wires all services from [`Settings`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod classify;
pub mod engine;
pub mod executor;
pub mod plugin;
pub mod resolver;
pub mod resume;
pub mod runtime;
pub mod scheduler;
pub mod settings;
pub mod status;
pub mod trigger;

pub use classify::{classify, StepError};
pub use engine::{EngineConfig, ExecutionEngine, PauseRegistry, RunSummary};
pub use executor::{NestedRun, StepExecutor, StepRun};
pub use plugin::{ActionHandler, PluginError, PluginExecutor, PluginOutput, PluginRegistry};
pub use resolver::{Resolved, VariablePool};
pub use resume::{ResumeConfig, ResumeResponse, ResumeResult, ResumeService};
pub use runtime::PilotRuntime;
pub use scheduler::{ScheduleDecision, Scheduler, StepState};
pub use settings::{Settings, SettingsError};
pub use status::{DecisionRequest, Progress, StatusReport, StatusReporter, StepStatusReport};
pub use trigger::WorkflowTrigger;
