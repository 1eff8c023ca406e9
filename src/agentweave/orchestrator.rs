//! Workflow orchestrator façade.
//!
//! The [`Orchestrator`] owns the agent registry, resolves the merge LLM,
//! carries the consumed infrastructure seams (bus, shared memory, tracer,
//! optional LLM concurrency semaphore), and dispatches a
//! [`WorkflowPattern`] to the matching executor.
//!
//! # Ownership
//!
//! Registered agents live for the orchestrator's lifetime and are shared
//! into executors as `Arc` clones; executors reference agents by id and
//! never own them.  Each execution owns its own in-flight state; nothing is
//! shared between two concurrent `execute_pattern` calls except the
//! registry, the progress-callback slot, and (when configured) the
//! process-wide LLM semaphore.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentweave::{Orchestrator, WorkflowPattern};
//! use agentweave::pattern::{PipelinePattern, PipelineStage};
//! # use agentweave::agent_api::{AgentReply, WorkflowAgent};
//! # use async_trait::async_trait;
//! # struct Stub;
//! # #[async_trait]
//! # impl WorkflowAgent for Stub {
//! #     async fn chat(&self, _s: &str, p: &str) -> Result<AgentReply, Box<dyn std::error::Error + Send + Sync>> { Ok(AgentReply::text(p)) }
//! #     fn name(&self) -> &str { "writer" }
//! #     fn llm_model(&self) -> &str { "m" }
//! #     fn llm_provider_name(&self) -> &str { "p" }
//! # }
//!
//! # async {
//! let orchestrator = Orchestrator::new();
//! orchestrator.register_agent("writer", std::sync::Arc::new(Stub)).await;
//!
//! let pattern = WorkflowPattern::Pipeline(
//!     PipelinePattern::new("draft", "Write a haiku about rivers")
//!         .with_stage(PipelineStage::new("writer", "{{previous}}")),
//! );
//! let result = orchestrator.execute_pattern(&pattern).await.unwrap();
//! println!("{}", result.merged_output);
//! # };
//! ```

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, Semaphore};

use crate::agentweave::agent_api::{BoxError, LlmRole, WorkflowAgent};
use crate::agentweave::bus::MessageBus;
use crate::agentweave::executors;
use crate::agentweave::memory::SharedMemory;
use crate::agentweave::pattern::{interpolate_variables, WorkflowPattern};
use crate::agentweave::provider::LlmProvider;
use crate::agentweave::result::{AgentResult, WorkflowResult};
use crate::agentweave::trace::{NoopTracer, Tracer};

/// Errors surfaced by the orchestration engine.
#[derive(Debug, Clone)]
pub enum WorkflowError {
    /// A referenced agent id is not registered and the external registry
    /// (when configured) does not know it either.
    AgentNotFound(String),
    /// A constituent execution failed in a way the pattern cannot absorb.
    ExecutionFailed(String),
    /// The pattern configuration is structurally invalid (no stages, no
    /// voters, unresolvable branch, …).
    InvalidPattern(String),
    /// A fan-out exceeded its configured deadline.
    Timeout(String),
    /// An accepted restart pushed the iteration counter past the bound.
    MaxIterationsExceeded(u32),
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowError::AgentNotFound(id) => write!(f, "Agent not found: {}", id),
            WorkflowError::ExecutionFailed(msg) => write!(f, "Execution failed: {}", msg),
            WorkflowError::InvalidPattern(msg) => write!(f, "Invalid pattern: {}", msg),
            WorkflowError::Timeout(msg) => write!(f, "Timed out: {}", msg),
            WorkflowError::MaxIterationsExceeded(max) => {
                write!(f, "max iterations ({}) exceeded", max)
            }
        }
    }
}

impl Error for WorkflowError {}

/// External agent registry consulted when the local map misses.
///
/// Successful lookups are cached into the local registry so subsequent
/// executions resolve without another round-trip.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    /// Resolve an agent by id, or `None` when unknown.
    async fn lookup(&self, agent_id: &str) -> Option<Arc<dyn WorkflowAgent>>;
}

/// Snapshot handed to the progress callback.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    /// Pattern discriminator of the running workflow.
    pub pattern_type: String,
    /// Human-readable progress message.
    pub message: String,
    /// Progress in `[0, 100]`.
    pub progress: f64,
    /// Agent currently executing, when one is.
    pub current_agent_id: Option<String>,
    /// Results accumulated so far.
    pub partial_results: Vec<AgentResult>,
}

/// Single registerable progress callback.
pub type ProgressCallback = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;

/// The orchestration engine: registry, merge-LLM resolution, and pattern
/// dispatch.
pub struct Orchestrator {
    agents: RwLock<HashMap<String, Arc<dyn WorkflowAgent>>>,
    external_registry: Option<Arc<dyn AgentDirectory>>,
    merge_llm: Option<Arc<dyn LlmProvider>>,
    message_bus: Option<Arc<dyn MessageBus>>,
    shared_memory: Option<Arc<dyn SharedMemory>>,
    tracer: Arc<dyn Tracer>,
    llm_semaphore: Option<Arc<Semaphore>>,
    progress_callback: std::sync::RwLock<Option<ProgressCallback>>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    /// Create an orchestrator with no agents, no merge LLM, and a no-op
    /// tracer.  Use the `with_*` builders to attach infrastructure.
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            external_registry: None,
            merge_llm: None,
            message_bus: None,
            shared_memory: None,
            tracer: Arc::new(NoopTracer),
            llm_semaphore: None,
            progress_callback: std::sync::RwLock::new(None),
        }
    }

    /// Configure the explicit merge LLM (builder pattern).
    ///
    /// With an explicit provider configured, merge-LLM resolution is
    /// deterministic; without one the orchestrator scans registered agents
    /// for an orchestrator-role LLM in unspecified order.
    pub fn with_merge_llm(mut self, llm: Arc<dyn LlmProvider>) -> Self {
        self.merge_llm = Some(llm);
        self
    }

    /// Attach a message bus for iterative restart coordination (builder pattern).
    pub fn with_message_bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.message_bus = Some(bus);
        self
    }

    /// Attach shared memory for hybrid context persistence (builder pattern).
    pub fn with_shared_memory(mut self, memory: Arc<dyn SharedMemory>) -> Self {
        self.shared_memory = Some(memory);
        self
    }

    /// Replace the default no-op tracer (builder pattern).
    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Attach an external agent registry consulted on local misses (builder pattern).
    pub fn with_external_registry(mut self, registry: Arc<dyn AgentDirectory>) -> Self {
        self.external_registry = Some(registry);
        self
    }

    /// Bound concurrent LLM calls across all parallel-pattern tasks with a
    /// process-wide semaphore (builder pattern).  Pass the same `Arc` to
    /// every orchestrator that should share the bound.
    pub fn with_llm_semaphore(mut self, semaphore: Arc<Semaphore>) -> Self {
        self.llm_semaphore = Some(semaphore);
        self
    }

    /// Register an agent under `agent_id`, overwriting any previous
    /// registration for the same id.
    pub async fn register_agent(&self, agent_id: impl Into<String>, agent: Arc<dyn WorkflowAgent>) {
        self.agents.write().await.insert(agent_id.into(), agent);
    }

    /// Resolve an agent: local registry first, then the external registry,
    /// caching external hits locally.
    pub async fn get_agent(&self, agent_id: &str) -> Option<Arc<dyn WorkflowAgent>> {
        if let Some(agent) = self.agents.read().await.get(agent_id) {
            return Some(agent.clone());
        }
        if let Some(registry) = &self.external_registry {
            if let Some(agent) = registry.lookup(agent_id).await {
                self.agents
                    .write()
                    .await
                    .insert(agent_id.to_string(), agent.clone());
                return Some(agent);
            }
        }
        None
    }

    /// Resolve an agent or fail with [`WorkflowError::AgentNotFound`].
    pub async fn require_agent(&self, agent_id: &str) -> Result<Arc<dyn WorkflowAgent>, BoxError> {
        self.get_agent(agent_id)
            .await
            .ok_or_else(|| Box::new(WorkflowError::AgentNotFound(agent_id.to_string())) as BoxError)
    }

    /// Fail fast unless every id resolves.
    pub async fn require_agents(&self, agent_ids: &[String]) -> Result<(), BoxError> {
        for agent_id in agent_ids {
            self.require_agent(agent_id).await?;
        }
        Ok(())
    }

    /// Resolve the LLM used for merges and validation.
    ///
    /// Precedence: (1) the explicitly configured provider; (2) the first
    /// registered agent exposing an orchestrator-role LLM.  Under (2) the
    /// scan order over the agent map is unspecified: when several agents
    /// qualify a warning names the selection and the full candidate set, and
    /// callers wanting determinism should configure (1).
    pub async fn resolve_merge_llm(&self) -> Option<Arc<dyn LlmProvider>> {
        if let Some(llm) = &self.merge_llm {
            return Some(llm.clone());
        }

        let agents = self.agents.read().await;
        let mut selected: Option<(String, Arc<dyn LlmProvider>)> = None;
        let mut candidates: Vec<String> = Vec::new();
        for (agent_id, agent) in agents.iter() {
            if let Some(llm) = agent.llm_for_role(LlmRole::Orchestrator) {
                candidates.push(agent_id.clone());
                if selected.is_none() {
                    selected = Some((agent_id.clone(), llm));
                }
            }
        }
        if candidates.len() > 1 {
            if let Some((chosen, _)) = &selected {
                log::warn!(
                    "multiple agents expose an orchestrator-role LLM; selected '{}' from \
                     candidates {:?} (selection order is unspecified; configure an explicit \
                     merge LLM for determinism)",
                    chosen,
                    candidates
                );
            }
        }
        selected.map(|(_, llm)| llm)
    }

    /// Register the single progress callback, replacing any previous one.
    pub fn set_progress_callback(&self, callback: ProgressCallback) {
        *self.progress_callback.write().unwrap() = Some(callback);
    }

    /// Emit a progress update to the registered callback, if any.
    pub(crate) fn emit_progress(
        &self,
        pattern_type: &str,
        message: &str,
        progress: f64,
        current_agent_id: Option<&str>,
        partial_results: &[AgentResult],
    ) {
        let callback = self.progress_callback.read().unwrap().clone();
        if let Some(callback) = callback {
            callback(&ProgressUpdate {
                pattern_type: pattern_type.to_string(),
                message: message.to_string(),
                progress,
                current_agent_id: current_agent_id.map(|id| id.to_string()),
                partial_results: partial_results.to_vec(),
            });
        }
    }

    /// The tracer every executor opens spans through.
    pub fn tracer(&self) -> &Arc<dyn Tracer> {
        &self.tracer
    }

    /// The configured message bus, if any.
    pub fn message_bus(&self) -> Option<Arc<dyn MessageBus>> {
        self.message_bus.clone()
    }

    /// The configured shared memory, if any.
    pub fn shared_memory(&self) -> Option<Arc<dyn SharedMemory>> {
        self.shared_memory.clone()
    }

    /// The process-wide LLM concurrency semaphore, if configured.
    pub fn llm_semaphore(&self) -> Option<Arc<Semaphore>> {
        self.llm_semaphore.clone()
    }

    /// Interpolate caller variables into the pattern, then execute it.
    pub async fn execute_with_variables(
        &self,
        pattern: &WorkflowPattern,
        vars: &HashMap<String, String>,
    ) -> Result<WorkflowResult, BoxError> {
        let interpolated = interpolate_variables(pattern, vars);
        self.execute_pattern(&interpolated).await
    }

    /// Execute a pattern by dispatching to the matching executor.
    ///
    /// Emits progress at start (0%), completion (100%), and failure (0% with
    /// the error message); executors emit the mid-execution updates.
    ///
    /// Returns an explicitly boxed future (rather than being declared
    /// `async fn`) because the conditional executor calls back into this
    /// method recursively; a concrete `Pin<Box<dyn Future + Send>>` return
    /// type breaks the self-referential `Send` cycle that an opaque
    /// `async fn` return type would otherwise create.
    pub fn execute_pattern<'a>(
        &'a self,
        pattern: &'a WorkflowPattern,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<WorkflowResult, BoxError>> + Send + 'a>,
    > {
        Box::pin(async move {
            let pattern_type = pattern.pattern_type();
            self.emit_progress(pattern_type, "workflow started", 0.0, None, &[]);

            let outcome = match pattern {
                WorkflowPattern::Pipeline(p) => executors::pipeline::execute(self, p).await,
                WorkflowPattern::ForkJoin(p) => executors::fork_join::execute(self, p).await,
                WorkflowPattern::Parallel(p) => executors::parallel::execute(self, p).await,
                WorkflowPattern::Debate(p) => executors::debate::execute(self, p).await,
                WorkflowPattern::Conditional(p) => executors::conditional::execute(self, p).await,
                WorkflowPattern::Swarm(p) => executors::swarm::execute(self, p).await,
                WorkflowPattern::Iterative(p) => executors::iterative::execute(self, p).await,
                WorkflowPattern::PairProgramming(p) => {
                    executors::pairing::execute_pair(self, p).await
                }
                WorkflowPattern::TeacherStudent(p) => {
                    executors::pairing::execute_teacher_student(self, p).await
                }
            };

            match &outcome {
                Ok(result) => {
                    self.emit_progress(
                        pattern_type,
                        "workflow completed",
                        100.0,
                        None,
                        &result.agent_results,
                    );
                }
                Err(error) => {
                    self.emit_progress(pattern_type, &error.to_string(), 0.0, None, &[]);
                }
            }
            outcome
        })
    }
}
