//! Consumed agent interface.
//!
//! The engine never constructs agents; it coordinates values that implement
//! [`WorkflowAgent`].  The trait abstracts over whatever agent runtime the
//! caller already has (an in-process LLM session, a remote worker, a mock in
//! tests) while the supporting structs describe chat replies and token/cost
//! accounting in a uniform shape.
//!
//! # Sessions
//!
//! Every invocation carries a `session_id`.  Executors mint a fresh session id
//! per stage/task/branch/round (`<workflow_id>-<role>-<agent_id>`) so the
//! agent's LLM sees a clean conversation for each unit of work.  Agents are
//! free to ignore the id, but well-behaved implementations key their
//! conversation state on it.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentweave::agent_api::{AgentReply, WorkflowAgent};
//! use async_trait::async_trait;
//!
//! struct EchoAgent;
//!
//! #[async_trait]
//! impl WorkflowAgent for EchoAgent {
//!     async fn chat(
//!         &self,
//!         _session_id: &str,
//!         prompt: &str,
//!     ) -> Result<AgentReply, Box<dyn std::error::Error + Send + Sync>> {
//!         Ok(AgentReply::text(prompt))
//!     }
//!
//!     fn name(&self) -> &str {
//!         "echo"
//!     }
//!
//!     fn llm_model(&self) -> &str {
//!         "none"
//!     }
//!
//!     fn llm_provider_name(&self) -> &str {
//!         "local"
//!     }
//! }
//! ```

use crate::agentweave::provider::LlmProvider;
use async_trait::async_trait;
use std::error::Error;
use std::sync::Arc;

/// Boxed error type shared by every async seam in the crate.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Roles an agent's underlying LLMs can serve.
///
/// Agents may carry more than one provider (a cheap fast model for routine
/// work, a stronger one for coordination).  The engine asks for
/// [`LlmRole::Orchestrator`] when it needs a merge or validation LLM and no
/// explicit provider was configured on the [`Orchestrator`](crate::Orchestrator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LlmRole {
    /// The agent's default conversational model.
    Primary,
    /// A model the agent designates for cross-agent coordination work
    /// (merging, synthesis, validation).
    Orchestrator,
}

/// How many tokens were spent on prompt vs. completion, and what they cost.
#[derive(Debug, Clone, Default)]
pub struct ChatUsage {
    /// Number of prompt/input tokens billed by the provider.
    pub input_tokens: usize,
    /// Number of generated/output tokens billed by the provider.
    pub output_tokens: usize,
    /// Convenience total equal to `input_tokens + output_tokens`.
    pub total_tokens: usize,
    /// Dollar cost of the call as reported by the provider, or `0.0` when the
    /// provider does not price calls.
    pub cost_usd: f64,
}

/// A tool invocation the agent performed while producing its reply.
///
/// The iterative executor merges these runtime records into the stage's
/// structured-context evidence (`evidence.tool_calls`), so
/// [`validate_tool_executions`](crate::agentweave::structured_context::StructuredContext::validate_tool_executions)
/// checks what the agent actually executed, not just what its text claims.
#[derive(Debug, Clone)]
pub struct ToolExecution {
    /// Name of the tool that was executed (e.g. `"shared_memory_read"`).
    pub tool_name: String,
    /// Raw JSON parameters the agent passed to the tool.
    pub parameters: serde_json::Value,
    /// Short human-readable summary of the tool result.
    pub result_summary: String,
}

/// Response body returned from [`WorkflowAgent::chat`].
#[derive(Debug, Clone)]
pub struct AgentReply {
    /// Final message content.
    pub content: String,
    /// Optional token/cost usage aggregated across the agent's internal LLM
    /// round-trips for this call.
    pub usage: Option<ChatUsage>,
    /// Tools the agent executed while producing `content`, in execution order.
    pub tool_executions: Vec<ToolExecution>,
}

impl AgentReply {
    /// Convenience constructor for a plain-text reply with no usage data.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            usage: None,
            tool_executions: Vec::new(),
        }
    }

    /// Attach usage accounting (builder pattern).
    pub fn with_usage(mut self, usage: ChatUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Attach the tools executed while producing this reply (builder pattern).
    pub fn with_tool_executions(mut self, tool_executions: Vec<ToolExecution>) -> Self {
        self.tool_executions = tool_executions;
        self
    }
}

/// Trait-driven abstraction over a runnable agent.
///
/// All implementations **must** be thread-safe (`Send + Sync`) so they can be
/// shared between concurrently executing workflow branches.  The engine holds
/// agents behind `Arc<dyn WorkflowAgent>` and never assumes exclusive access.
#[async_trait]
pub trait WorkflowAgent: Send + Sync {
    /// Send a prompt and await the agent's reply.
    ///
    /// The `session_id` scopes conversation state; two calls with different
    /// session ids must not share history.  Cancellation is cooperative:
    /// dropping the returned future abandons the call.
    async fn chat(&self, session_id: &str, prompt: &str) -> Result<AgentReply, BoxError>;

    /// Stable identifier of the agent as registered with the orchestrator.
    fn name(&self) -> &str;

    /// Identifier of the model backing this agent (e.g. `"gpt-4o"`).
    fn llm_model(&self) -> &str;

    /// Name of the provider backing this agent (e.g. `"openai"`).
    fn llm_provider_name(&self) -> &str;

    /// Expose an LLM provider for a specific [`LlmRole`], if the agent carries
    /// one.  The default implementation exposes nothing; agents that want to
    /// volunteer as merge/validation LLMs override this for
    /// [`LlmRole::Orchestrator`].
    fn llm_for_role(&self, role: LlmRole) -> Option<Arc<dyn LlmProvider>> {
        let _ = role;
        None
    }
}
