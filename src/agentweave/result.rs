//! Result and cost types shared by every executor.
//!
//! Each agent invocation produces an [`AgentResult`]; a whole pattern run
//! produces a [`WorkflowResult`] whose [`WorkflowCost`] is the commutative
//! roll-up of the per-result costs.  Failed invocations are represented as
//! *degraded* results (confidence `0.0`, `metadata["error"]`, output
//! `"Error: <message>"`) so partial failures stay visible in the result set
//! instead of vanishing.

use std::collections::HashMap;

use crate::agentweave::agent_api::ChatUsage;

/// Token and dollar accounting for a single agent invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CostInfo {
    /// Total tokens billed for the invocation.
    pub total_tokens: usize,
    /// Prompt/input tokens.
    pub input_tokens: usize,
    /// Completion/output tokens.
    pub output_tokens: usize,
    /// Dollar cost, `0.0` when the provider does not price calls.
    pub cost_usd: f64,
}

impl From<&ChatUsage> for CostInfo {
    fn from(usage: &ChatUsage) -> Self {
        Self {
            total_tokens: usage.total_tokens,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost_usd: usage.cost_usd,
        }
    }
}

/// The outcome of one agent invocation within a pattern.
#[derive(Debug, Clone)]
pub struct AgentResult {
    /// Id of the agent that produced this result.
    pub agent_id: String,
    /// The agent's output text, or `"Error: <message>"` for a degraded result.
    pub output: String,
    /// Executor-populated metadata (stage index, round, task index, error).
    pub metadata: HashMap<String, String>,
    /// Confidence in `[0,1]`; degraded results carry `0.0`.
    pub confidence_score: f64,
    /// Wall-clock duration of the invocation in milliseconds.
    pub duration_ms: u64,
    /// Token/cost accounting for the invocation.
    pub cost: CostInfo,
}

impl AgentResult {
    /// Build a successful result from an agent reply.
    pub fn success(
        agent_id: impl Into<String>,
        output: impl Into<String>,
        usage: Option<&ChatUsage>,
        duration_ms: u64,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            output: output.into(),
            metadata: HashMap::new(),
            confidence_score: 1.0,
            duration_ms,
            cost: usage.map(CostInfo::from).unwrap_or_default(),
        }
    }

    /// Build a degraded result for a failed invocation.
    ///
    /// The error message lands in both `metadata["error"]` and the output so
    /// that downstream merges surface the failure instead of silently
    /// skipping the agent.
    pub fn degraded(agent_id: impl Into<String>, message: &str, duration_ms: u64) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("error".to_string(), message.to_string());
        Self {
            agent_id: agent_id.into(),
            output: format!("Error: {}", message),
            metadata,
            confidence_score: 0.0,
            duration_ms,
            cost: CostInfo::default(),
        }
    }

    /// Attach a metadata pair (builder pattern).
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether this result records a failed invocation.
    pub fn is_error(&self) -> bool {
        self.metadata.contains_key("error")
    }
}

/// Cost roll-up for a whole pattern execution.
///
/// Absorbing results commutes: the totals are independent of the order in
/// which results arrive from concurrent branches.
#[derive(Debug, Clone, Default)]
pub struct WorkflowCost {
    /// Sum of all per-result dollar costs.
    pub total_cost_usd: f64,
    /// Sum of all per-result token totals.
    pub total_tokens: usize,
    /// Number of agent invocations that contributed cost.
    pub llm_calls: usize,
    /// Per-agent dollar totals keyed by agent id.
    pub agent_costs_usd: HashMap<String, f64>,
}

impl WorkflowCost {
    /// Fold one result's cost into the totals.
    pub fn absorb(&mut self, result: &AgentResult) {
        self.total_cost_usd += result.cost.cost_usd;
        self.total_tokens += result.cost.total_tokens;
        self.llm_calls += 1;
        *self
            .agent_costs_usd
            .entry(result.agent_id.clone())
            .or_insert(0.0) += result.cost.cost_usd;
    }

    /// Fold a raw usage record into the totals, for LLM calls whose result
    /// does not join the agent-result list: merge calls, validation prompts,
    /// and similar coordination traffic.  `None` usage still counts the
    /// call.
    pub fn absorb_usage(&mut self, agent_id: &str, usage: Option<&ChatUsage>) {
        if let Some(usage) = usage {
            self.total_cost_usd += usage.cost_usd;
            self.total_tokens += usage.total_tokens;
            *self.agent_costs_usd.entry(agent_id.to_string()).or_insert(0.0) += usage.cost_usd;
        }
        self.llm_calls += 1;
    }

    /// Fold another roll-up into this one (used when a conditional inherits
    /// its selected branch's cost).
    pub fn merge(&mut self, other: &WorkflowCost) {
        self.total_cost_usd += other.total_cost_usd;
        self.total_tokens += other.total_tokens;
        self.llm_calls += other.llm_calls;
        for (agent_id, cost) in &other.agent_costs_usd {
            *self.agent_costs_usd.entry(agent_id.clone()).or_insert(0.0) += cost;
        }
    }
}

/// The outcome of executing one workflow pattern.
#[derive(Debug, Clone)]
pub struct WorkflowResult {
    /// Pattern discriminator, e.g. `"pipeline"`, `"iterative_pipeline"`.
    pub pattern_type: String,
    /// Every agent result produced during the execution.
    pub agent_results: Vec<AgentResult>,
    /// The reduced output (last stage, merge product, winning vote, …).
    pub merged_output: String,
    /// Pattern-specific metadata (stage counts, selected branch, …).
    pub metadata: HashMap<String, String>,
    /// Wall-clock duration of the whole execution in milliseconds.
    pub duration_ms: u64,
    /// Cost roll-up across all invocations.
    pub cost: WorkflowCost,
    /// Model identifier per participating agent id.
    pub models_used: HashMap<String, String>,
}
