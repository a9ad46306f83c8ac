//! Service wiring.
//!
//! [`PilotRuntime`] builds every service from [`Settings`] once per
//! process and hands out shared handles. Binaries and scenario tests use
//! it; library users may wire the services by hand instead.

use crate::engine::ExecutionEngine;
use crate::plugin::{PluginExecutor, PluginRegistry};
use crate::resume::ResumeService;
use crate::settings::Settings;
use crate::status::StatusReporter;
use crate::trigger::WorkflowTrigger;
use pilot_core::{PilotResult, WorkflowId};
use pilot_log::EventEmitter;
use pilot_plan::{CompileOutput, Compiler, PipelineContext};
use pilot_storage::{ExecutionStore, LockManager, MemoryLockManager, MemoryStore, RedbStore, WorkflowRecord};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

/// Every service of a process, wired to one store
pub struct PilotRuntime {
    settings: Settings,
    compiler: Arc<Compiler>,
    store: Arc<dyn ExecutionStore>,
    locks: Arc<dyn LockManager>,
    events: Arc<EventEmitter>,
    engine: Arc<ExecutionEngine>,
    resume: Arc<ResumeService>,
    status: Arc<StatusReporter>,
    trigger: Arc<WorkflowTrigger>,
}

impl std::fmt::Debug for PilotRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PilotRuntime")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl PilotRuntime {
    /// Wire services from settings, opening the redb store when a
    /// `store_path` is set
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be opened
    pub fn from_settings(settings: Settings) -> PilotResult<Self> {
        let plugins = Arc::new(PluginRegistry::with_builtins(settings.mock_messages.clone()));
        Self::with_plugins(settings, plugins)
    }

    /// Like [`PilotRuntime::from_settings`] with a custom plugin executor
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be opened
    pub fn with_plugins(settings: Settings, plugins: Arc<dyn PluginExecutor>) -> PilotResult<Self> {
        let (store, locks): (Arc<dyn ExecutionStore>, Arc<dyn LockManager>) = match &settings.store_path {
            Some(path) => {
                let redb = Arc::new(RedbStore::open(path)?);
                let store: Arc<dyn ExecutionStore> = redb.clone();
                let locks: Arc<dyn LockManager> = redb;
                (store, locks)
            }
            None => {
                let store: Arc<dyn ExecutionStore> = Arc::new(MemoryStore::new());
                let locks: Arc<dyn LockManager> = Arc::new(MemoryLockManager::new());
                (store, locks)
            }
        };

        let events = Arc::new(EventEmitter::new());
        let engine = Arc::new(
            ExecutionEngine::new(Arc::clone(&store), plugins, Arc::clone(&events)).with_config(settings.engine),
        );
        let resume = Arc::new(
            ResumeService::new(Arc::clone(&store), Arc::clone(&locks), Arc::clone(&engine))
                .with_config(settings.resume),
        );
        let status = Arc::new(StatusReporter::new(Arc::clone(&store)));
        let trigger = Arc::new(WorkflowTrigger::new(Arc::clone(&engine)));
        let compiler = Arc::new(Compiler::new(settings.compiler.clone()));

        info!(
            env = %settings.env,
            durable = settings.store_path.is_some(),
            parallelism = settings.engine.parallelism,
            "runtime ready"
        );
        Ok(Self {
            settings,
            compiler,
            store,
            locks,
            events,
            engine,
            resume,
            status,
            trigger,
        })
    }

    /// Default settings with in-memory persistence
    #[must_use]
    pub fn in_memory() -> Self {
        let settings = Settings::default();
        let plugins = Arc::new(PluginRegistry::with_builtins(Vec::new()));
        let store: Arc<dyn ExecutionStore> = Arc::new(MemoryStore::new());
        let locks: Arc<dyn LockManager> = Arc::new(MemoryLockManager::new());
        let events = Arc::new(EventEmitter::new());
        let engine = Arc::new(ExecutionEngine::new(Arc::clone(&store), plugins, Arc::clone(&events)));
        Self {
            compiler: Arc::new(Compiler::new(settings.compiler.clone())),
            resume: Arc::new(ResumeService::new(Arc::clone(&store), Arc::clone(&locks), Arc::clone(&engine))),
            status: Arc::new(StatusReporter::new(Arc::clone(&store))),
            trigger: Arc::new(WorkflowTrigger::new(Arc::clone(&engine))),
            settings,
            store,
            locks,
            events,
            engine,
        }
    }

    /// Replace the compiler, e.g. to install an assisted fallback
    #[must_use]
    pub fn with_compiler(mut self, compiler: Compiler) -> Self {
        self.compiler = Arc::new(compiler);
        self
    }

    /// Compile an IR document and persist the result as a workflow
    ///
    /// # Errors
    ///
    /// Returns error if compilation fails or the workflow cannot be saved
    pub async fn create_workflow(
        &self,
        name: &str,
        ir: &Value,
        pipeline: Option<PipelineContext>,
    ) -> PilotResult<(WorkflowRecord, CompileOutput)> {
        let output = self.compiler.compile(ir, pipeline).await?;
        let mut workflow = WorkflowRecord::new(name, output.workflow.clone());
        if let Some(goal) = ir.get("goal").and_then(Value::as_str) {
            workflow = workflow.with_goal(goal);
        }
        self.store.save_workflow(&workflow).await?;
        info!(workflow = %workflow.id, steps = workflow.steps.len(), "workflow stored");
        Ok((workflow, output))
    }

    /// Settings the runtime was built from
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Compiler
    #[must_use]
    pub fn compiler(&self) -> &Arc<Compiler> {
        &self.compiler
    }

    /// Record store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    /// Resume lock manager
    #[must_use]
    pub fn locks(&self) -> &Arc<dyn LockManager> {
        &self.locks
    }

    /// Event emitter
    #[must_use]
    pub fn events(&self) -> &Arc<EventEmitter> {
        &self.events
    }

    /// Execution engine
    #[must_use]
    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    /// Resume service
    #[must_use]
    pub fn resume(&self) -> &Arc<ResumeService> {
        &self.resume
    }

    /// Status reporter
    #[must_use]
    pub fn status(&self) -> &Arc<StatusReporter> {
        &self.status
    }

    /// Interval trigger
    #[must_use]
    pub fn trigger(&self) -> &Arc<WorkflowTrigger> {
        &self.trigger
    }

    /// Load a stored workflow
    ///
    /// # Errors
    ///
    /// Returns error if the workflow is missing
    pub async fn workflow(&self, id: WorkflowId) -> PilotResult<WorkflowRecord> {
        Ok(self.store.load_workflow(id).await?)
    }
}
