// src/lib.rs

// Import the top-level `agentweave` module.
pub mod agentweave;

// Re-export the modules at the crate root so callers write
// `agentweave::pattern::...` instead of navigating the whole hierarchy.
pub use agentweave::{
    agent_api, bus, executors, memory, merge, orchestrator, pattern, provider, result,
    stage_context, structured_context, trace,
};

// Re-exporting key items for easier external access.
pub use agentweave::agent_api::{AgentReply, ChatUsage, LlmRole, ToolExecution, WorkflowAgent};
pub use agentweave::orchestrator::Orchestrator;
pub use agentweave::pattern::{MergeStrategy, VotingStrategy, WorkflowPattern};
pub use agentweave::result::{AgentResult, WorkflowResult};
