//! Workflow pattern model.
//!
//! A [`WorkflowPattern`] is a declarative description of how a set of agents
//! should be composed into a single workflow.  Exactly one variant is
//! populated per value; `Conditional` branches carry nested patterns, so the
//! type is recursive.
//!
//! The model is deliberately plain data: executors interpret it, the
//! [`Orchestrator`](crate::Orchestrator) dispatches on it, and
//! [`interpolate_variables`] deep-clones it with `{{key}}` placeholders
//! substituted into every prompt-bearing field.
//!
//! # Example
//!
//! ```rust
//! use agentweave::pattern::{PipelinePattern, PipelineStage, WorkflowPattern};
//!
//! let pipeline = PipelinePattern::new("review", "Draft the design doc")
//!     .with_stage(PipelineStage::new("writer", "Write a first draft: {{previous}}"))
//!     .with_stage(PipelineStage::new("editor", "Edit for clarity:\n{{previous}}"));
//!
//! let pattern = WorkflowPattern::Pipeline(pipeline);
//! assert_eq!(pattern.pattern_type(), "pipeline");
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How multiple agent outputs are reduced into a single string.
///
/// `First` and `Concatenate` are deterministic; the remaining strategies
/// delegate to the orchestrator's merge LLM and fail when none is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeStrategy {
    /// First result's output; empty string when there are no results.
    First,
    /// All outputs labeled per agent and joined with blank lines.
    Concatenate,
    /// LLM synthesis of a consensus view.
    Consensus,
    /// LLM pick of the most convincing option, with rationale.
    Voting,
    /// LLM summary highlighting key points.
    Summary,
    /// LLM selection of the single best result.
    Best,
}

/// How a swarm turns individual votes into a collective decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VotingStrategy {
    /// Winner by count; threshold met when it holds a strict majority.
    Majority,
    /// Winner by count; threshold at two thirds of all votes.
    Supermajority,
    /// Winner by count; threshold only when every vote agrees.
    Unanimous,
    /// Winner by count; threshold on the winners' mean confidence.
    Weighted,
    /// Winner by summed confidence per choice.
    RankedChoice,
}

/// One step of a pipeline, bound to a single agent and a prompt template.
///
/// Templates may reference `{{previous}}`, `{{history}}`,
/// `{{structured_context}}`, and any caller-supplied variables.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineStage {
    /// Id of the agent that executes this stage.
    pub agent_id: String,
    /// Prompt template expanded per execution.
    pub prompt_template: String,
    /// Optional validation prompt; when set, the stage output is checked by
    /// the merge LLM with `{{output}}` substituted.
    pub validation_prompt: Option<String>,
}

impl PipelineStage {
    /// Create a stage with no validation prompt.
    pub fn new(agent_id: impl Into<String>, prompt_template: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            prompt_template: prompt_template.into(),
            validation_prompt: None,
        }
    }

    /// Attach a validation prompt (builder pattern).
    pub fn with_validation(mut self, prompt: impl Into<String>) -> Self {
        self.validation_prompt = Some(prompt.into());
        self
    }
}

/// Sequential stages, each feeding the next.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelinePattern {
    /// Display name used in logs and traces.
    pub name: String,
    /// Seed input substituted for `{{previous}}` in the first stage.
    pub initial_prompt: String,
    /// Ordered stages.
    pub stages: Vec<PipelineStage>,
    /// When set, stages whose templates reference no placeholders get the
    /// accumulated history appended after the template.
    pub pass_full_history: bool,
}

impl PipelinePattern {
    /// Create an empty pipeline.
    pub fn new(name: impl Into<String>, initial_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            initial_prompt: initial_prompt.into(),
            stages: Vec::new(),
            pass_full_history: false,
        }
    }

    /// Append a stage (builder pattern).
    pub fn with_stage(mut self, stage: PipelineStage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Enable history pass-through for placeholder-free templates (builder pattern).
    pub fn with_full_history(mut self) -> Self {
        self.pass_full_history = true;
        self
    }
}

/// Fan-out of one prompt to many agents, then a merge.
#[derive(Debug, Clone, PartialEq)]
pub struct ForkJoinPattern {
    /// Display name used in logs and traces.
    pub name: String,
    /// Agents that receive the prompt concurrently.
    pub agent_ids: Vec<String>,
    /// The shared prompt.
    pub prompt: String,
    /// How branch outputs are reduced.
    pub merge_strategy: MergeStrategy,
    /// Deadline for the whole fan-out; `0` disables the deadline.
    pub timeout_seconds: u64,
}

/// One independently prompted task inside a [`ParallelPattern`].
#[derive(Debug, Clone, PartialEq)]
pub struct AgentTask {
    /// Id of the agent executing the task.
    pub agent_id: String,
    /// Task-specific prompt.
    pub prompt: String,
    /// Metadata propagated into the task's [`AgentResult`](crate::AgentResult).
    pub metadata: HashMap<String, String>,
}

impl AgentTask {
    /// Create a task with empty metadata.
    pub fn new(agent_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            prompt: prompt.into(),
            metadata: HashMap::new(),
        }
    }
}

/// Independent tasks running concurrently, then a merge.
#[derive(Debug, Clone, PartialEq)]
pub struct ParallelPattern {
    /// Display name used in logs and traces.
    pub name: String,
    /// The tasks; index order labels results.
    pub tasks: Vec<AgentTask>,
    /// How task outputs are reduced.
    pub merge_strategy: MergeStrategy,
    /// Deadline for the whole fan-out; `0` disables the deadline.
    pub timeout_seconds: u64,
}

/// Multi-round discussion with an optional moderator synthesis.
#[derive(Debug, Clone, PartialEq)]
pub struct DebatePattern {
    /// Display name used in logs and traces.
    pub name: String,
    /// The debaters, invoked in this order each round.
    pub agent_ids: Vec<String>,
    /// The debate topic.
    pub topic: String,
    /// Number of rounds.
    pub rounds: u32,
    /// Optional moderator invoked once after the final round.
    pub moderator_id: Option<String>,
    /// How debater outputs are reduced.
    pub merge_strategy: MergeStrategy,
}

/// Classifier-routed branching.  Branch values are full nested patterns.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalPattern {
    /// Display name used in logs and traces.
    pub name: String,
    /// Agent that classifies the input.
    pub condition_agent_id: String,
    /// Prompt sent to the classifier.
    pub condition_prompt: String,
    /// Branch key to nested pattern.
    pub branches: HashMap<String, WorkflowPattern>,
    /// Fallback branch when no key matches.
    pub default_branch: Option<Box<WorkflowPattern>>,
}

/// Collective voting over a question.
#[derive(Debug, Clone, PartialEq)]
pub struct SwarmPattern {
    /// Display name used in logs and traces.
    pub name: String,
    /// The voters; configuration order defines voting order when votes are
    /// shared.
    pub agent_ids: Vec<String>,
    /// The question under vote.
    pub question: String,
    /// How votes are aggregated.
    pub voting_strategy: VotingStrategy,
    /// Confidence threshold consumed by [`VotingStrategy::Weighted`].
    pub confidence_threshold: f64,
    /// When true, voting is sequential and each voter sees prior votes.
    pub share_votes: bool,
    /// Optional tie-break judge.
    pub judge_agent_id: Option<String>,
}

/// Restart rules for an iterative pipeline.
///
/// `max_validation_retries` distinguishes "unset" from "explicitly zero":
/// `None` enables validation with the default retry budget of 2, while
/// `Some(0)` skips structure validation entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// Master switch; when false the iterative pattern degenerates to a
    /// plain pipeline.
    pub enabled: bool,
    /// Whitelist of stage ids that may be restarted; empty means all.
    #[serde(default)]
    pub restartable_stages: Vec<String>,
    /// Minimum seconds between restarts of the same stage; `0` disables.
    #[serde(default)]
    pub cooldown_seconds: u64,
    /// When true, an accepted restart wipes the workflow shared-memory
    /// namespace.
    #[serde(default)]
    pub reset_shared_memory: bool,
    /// When false, an accepted restart evicts working outputs at and after
    /// the target stage.
    #[serde(default = "default_preserve_outputs")]
    pub preserve_outputs: bool,
    /// Structure-validation retry budget.  `None` = default of 2,
    /// `Some(0)` = skip validation.
    #[serde(default)]
    pub max_validation_retries: Option<u32>,
}

fn default_preserve_outputs() -> bool {
    true
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            restartable_stages: Vec::new(),
            cooldown_seconds: 0,
            reset_shared_memory: false,
            preserve_outputs: true,
            max_validation_retries: None,
        }
    }
}

/// A pipeline augmented with restart coordination over a message bus.
#[derive(Debug, Clone, PartialEq)]
pub struct IterativePattern {
    /// Display name used in logs and traces.
    pub name: String,
    /// The wrapped pipeline.
    pub pipeline: PipelinePattern,
    /// Upper bound on iterations (initial pass counts as 1).
    pub max_iterations: u32,
    /// Restart rules.
    pub restart_policy: RestartPolicy,
    /// Whitelist of stage ids authorized to publish restart requests;
    /// empty means any stage.
    pub restart_triggers: Vec<String>,
    /// Bus topic the executor subscribes to for restart requests.
    pub restart_topic: String,
}

impl IterativePattern {
    /// Wrap a pipeline with the default iteration bound (3) and topic.
    pub fn new(name: impl Into<String>, pipeline: PipelinePattern) -> Self {
        Self {
            name: name.into(),
            pipeline,
            max_iterations: 3,
            restart_policy: RestartPolicy::default(),
            restart_triggers: Vec::new(),
            restart_topic: crate::agentweave::bus::RESTART_TOPIC.to_string(),
        }
    }

    /// Override the iteration bound (builder pattern).
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Install a restart policy (builder pattern).
    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }
}

/// Driver/navigator alternation over a shared task.
#[derive(Debug, Clone, PartialEq)]
pub struct PairProgrammingPattern {
    /// Display name used in logs and traces.
    pub name: String,
    /// Agent producing the work each round.
    pub driver_id: String,
    /// Agent reviewing the driver's output each round.
    pub navigator_id: String,
    /// The task both agents work on.
    pub task: String,
    /// Number of driver/navigator alternations.
    pub rounds: u32,
}

/// Student attempts, teacher critiques, student refines.
#[derive(Debug, Clone, PartialEq)]
pub struct TeacherStudentPattern {
    /// Display name used in logs and traces.
    pub name: String,
    /// The critiquing agent.
    pub teacher_id: String,
    /// The attempting agent.
    pub student_id: String,
    /// The learning objective the student works toward.
    pub objective: String,
    /// Number of attempt/critique exchanges.
    pub rounds: u32,
}

/// Tagged-variant description of every supported composition.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowPattern {
    /// Sequential stages.
    Pipeline(PipelinePattern),
    /// Concurrent same-prompt fan-out with merge.
    ForkJoin(ForkJoinPattern),
    /// Concurrent independent tasks with merge.
    Parallel(ParallelPattern),
    /// Multi-round discussion.
    Debate(DebatePattern),
    /// Classifier-routed branches.
    Conditional(ConditionalPattern),
    /// Collective voting.
    Swarm(SwarmPattern),
    /// Self-correcting pipeline with restart coordination.
    Iterative(IterativePattern),
    /// Driver/navigator alternation.
    PairProgramming(PairProgrammingPattern),
    /// Guided attempt/critique refinement.
    TeacherStudent(TeacherStudentPattern),
}

impl WorkflowPattern {
    /// Stable discriminator used in workflow ids, span names, and results.
    pub fn pattern_type(&self) -> &'static str {
        match self {
            WorkflowPattern::Pipeline(_) => "pipeline",
            WorkflowPattern::ForkJoin(_) => "fork_join",
            WorkflowPattern::Parallel(_) => "parallel",
            WorkflowPattern::Debate(_) => "debate",
            WorkflowPattern::Conditional(_) => "conditional",
            WorkflowPattern::Swarm(_) => "swarm",
            WorkflowPattern::Iterative(_) => "iterative_pipeline",
            WorkflowPattern::PairProgramming(_) => "pair_programming",
            WorkflowPattern::TeacherStudent(_) => "teacher_student",
        }
    }

    /// Display name of the pattern as configured by the caller.
    pub fn name(&self) -> &str {
        match self {
            WorkflowPattern::Pipeline(p) => &p.name,
            WorkflowPattern::ForkJoin(p) => &p.name,
            WorkflowPattern::Parallel(p) => &p.name,
            WorkflowPattern::Debate(p) => &p.name,
            WorkflowPattern::Conditional(p) => &p.name,
            WorkflowPattern::Swarm(p) => &p.name,
            WorkflowPattern::Iterative(p) => &p.name,
            WorkflowPattern::PairProgramming(p) => &p.name,
            WorkflowPattern::TeacherStudent(p) => &p.name,
        }
    }
}

/// Replace every `{{key}}` in `text` with the matching value from `vars`.
///
/// Unknown placeholders remain literal.
fn apply_vars(text: &str, vars: &HashMap<String, String>) -> String {
    let mut out = text.to_string();
    for (key, value) in vars {
        let placeholder = format!("{{{{{}}}}}", key);
        if out.contains(&placeholder) {
            out = out.replace(&placeholder, value);
        }
    }
    out
}

/// Deep-clone `pattern` with `{{key}}` placeholders substituted into every
/// prompt-bearing field.
///
/// Substitution reaches: pipeline initial prompt and each stage's prompt
/// template + validation prompt; fork-join prompt; each parallel task prompt;
/// debate topic; conditional condition prompt and, recursively, every branch
/// and the default branch; swarm question; the iterative pattern's inner
/// pipeline; pair-programming task; teacher-student objective.
///
/// An empty variable map short-circuits to a plain clone, so
/// `interpolate_variables(p, &HashMap::new()) == *p` holds for every pattern.
pub fn interpolate_variables(
    pattern: &WorkflowPattern,
    vars: &HashMap<String, String>,
) -> WorkflowPattern {
    if vars.is_empty() {
        return pattern.clone();
    }

    match pattern {
        WorkflowPattern::Pipeline(p) => WorkflowPattern::Pipeline(interpolate_pipeline(p, vars)),
        WorkflowPattern::ForkJoin(p) => {
            let mut out = p.clone();
            out.prompt = apply_vars(&out.prompt, vars);
            WorkflowPattern::ForkJoin(out)
        }
        WorkflowPattern::Parallel(p) => {
            let mut out = p.clone();
            for task in &mut out.tasks {
                task.prompt = apply_vars(&task.prompt, vars);
            }
            WorkflowPattern::Parallel(out)
        }
        WorkflowPattern::Debate(p) => {
            let mut out = p.clone();
            out.topic = apply_vars(&out.topic, vars);
            WorkflowPattern::Debate(out)
        }
        WorkflowPattern::Conditional(p) => {
            let mut out = p.clone();
            out.condition_prompt = apply_vars(&out.condition_prompt, vars);
            out.branches = p
                .branches
                .iter()
                .map(|(key, branch)| (key.clone(), interpolate_variables(branch, vars)))
                .collect();
            out.default_branch = p
                .default_branch
                .as_ref()
                .map(|branch| Box::new(interpolate_variables(branch, vars)));
            WorkflowPattern::Conditional(out)
        }
        WorkflowPattern::Swarm(p) => {
            let mut out = p.clone();
            out.question = apply_vars(&out.question, vars);
            WorkflowPattern::Swarm(out)
        }
        WorkflowPattern::Iterative(p) => {
            let mut out = p.clone();
            out.pipeline = interpolate_pipeline(&p.pipeline, vars);
            WorkflowPattern::Iterative(out)
        }
        WorkflowPattern::PairProgramming(p) => {
            let mut out = p.clone();
            out.task = apply_vars(&out.task, vars);
            WorkflowPattern::PairProgramming(out)
        }
        WorkflowPattern::TeacherStudent(p) => {
            let mut out = p.clone();
            out.objective = apply_vars(&out.objective, vars);
            WorkflowPattern::TeacherStudent(out)
        }
    }
}

fn interpolate_pipeline(pipeline: &PipelinePattern, vars: &HashMap<String, String>) -> PipelinePattern {
    let mut out = pipeline.clone();
    out.initial_prompt = apply_vars(&out.initial_prompt, vars);
    for stage in &mut out.stages {
        stage.prompt_template = apply_vars(&stage.prompt_template, vars);
        stage.validation_prompt = stage
            .validation_prompt
            .as_ref()
            .map(|prompt| apply_vars(prompt, vars));
    }
    out
}

/// Every agent id transitively referenced by `pattern`, deduplicated while
/// preserving first occurrence.
///
/// Used by outer layers to preload agents from an external registry before
/// dispatch.
pub fn extract_agent_ids(pattern: &WorkflowPattern) -> Vec<String> {
    let mut ids = Vec::new();
    collect_agent_ids(pattern, &mut ids);
    ids
}

fn push_unique(ids: &mut Vec<String>, id: &str) {
    if !id.is_empty() && !ids.iter().any(|existing| existing == id) {
        ids.push(id.to_string());
    }
}

fn collect_agent_ids(pattern: &WorkflowPattern, ids: &mut Vec<String>) {
    match pattern {
        WorkflowPattern::Pipeline(p) => {
            for stage in &p.stages {
                push_unique(ids, &stage.agent_id);
            }
        }
        WorkflowPattern::ForkJoin(p) => {
            for id in &p.agent_ids {
                push_unique(ids, id);
            }
        }
        WorkflowPattern::Parallel(p) => {
            for task in &p.tasks {
                push_unique(ids, &task.agent_id);
            }
        }
        WorkflowPattern::Debate(p) => {
            for id in &p.agent_ids {
                push_unique(ids, id);
            }
            if let Some(moderator) = &p.moderator_id {
                push_unique(ids, moderator);
            }
        }
        WorkflowPattern::Conditional(p) => {
            push_unique(ids, &p.condition_agent_id);
            // Branch keys are sorted so extraction order is stable even
            // though the branch map itself is unordered.
            let mut keys: Vec<&String> = p.branches.keys().collect();
            keys.sort();
            for key in keys {
                collect_agent_ids(&p.branches[key], ids);
            }
            if let Some(default_branch) = &p.default_branch {
                collect_agent_ids(default_branch, ids);
            }
        }
        WorkflowPattern::Swarm(p) => {
            for id in &p.agent_ids {
                push_unique(ids, id);
            }
            if let Some(judge) = &p.judge_agent_id {
                push_unique(ids, judge);
            }
        }
        WorkflowPattern::Iterative(p) => {
            collect_agent_ids(&WorkflowPattern::Pipeline(p.pipeline.clone()), ids);
        }
        WorkflowPattern::PairProgramming(p) => {
            push_unique(ids, &p.driver_id);
            push_unique(ids, &p.navigator_id);
        }
        WorkflowPattern::TeacherStudent(p) => {
            push_unique(ids, &p.teacher_id);
            push_unique(ids, &p.student_id);
        }
    }
}
