//! Pattern executors.
//!
//! One module per pattern family.  Every executor follows the same contract:
//! referenced agent ids are resolved up front (missing agent fails fast), a
//! workflow-level span named `workflow.<pattern>` is opened under a unique
//! workflow id, each agent invocation runs in a fresh session
//! (`<workflow_id>-<role>-<agent_id>`), per-result costs roll up into the
//! workflow cost, and failed invocations become degraded results. The whole
//! pattern fails only when every constituent execution failed (or the
//! pattern is inherently sequential, like a pipeline stage).

pub mod conditional;
pub mod debate;
pub mod fork_join;
pub mod iterative;
pub mod pairing;
pub mod parallel;
pub mod pipeline;
pub mod swarm;

use std::sync::Arc;
use std::time::Instant;

use uuid::Uuid;

use crate::agentweave::agent_api::{ToolExecution, WorkflowAgent};
use crate::agentweave::result::AgentResult;

/// Mint a unique workflow id: `<pattern>-<8-hex>`.
pub(crate) fn new_workflow_id(pattern_type: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{}-{}", pattern_type, &hex[..8])
}

/// Session id for one agent invocation: `<workflow_id>-<role>-<agent_id>`.
///
/// A fresh role per stage/task/branch/round gives the LLM a clean
/// conversation for every unit of work.
pub(crate) fn session_id(workflow_id: &str, role: &str, agent_id: &str) -> String {
    format!("{}-{}-{}", workflow_id, role, agent_id)
}

/// Invoke one agent and shape the outcome into an [`AgentResult`], keeping
/// the tools the agent reported executing.
///
/// Failures become degraded results (confidence `0.0`, `metadata["error"]`,
/// output `"Error: <message>"`) so callers can keep peers running and decide
/// pattern-level failure themselves.  The iterative executor feeds the tool
/// executions into the stage's structured-context evidence; everyone else
/// uses [`invoke_agent`].
pub(crate) async fn invoke_agent_with_tools(
    agent: &Arc<dyn WorkflowAgent>,
    agent_id: &str,
    session_id: &str,
    prompt: &str,
) -> (AgentResult, Vec<ToolExecution>) {
    let started = Instant::now();
    match agent.chat(session_id, prompt).await {
        Ok(reply) => {
            let result = AgentResult::success(
                agent_id,
                reply.content,
                reply.usage.as_ref(),
                started.elapsed().as_millis() as u64,
            );
            (result, reply.tool_executions)
        }
        Err(error) => {
            log::error!("agent '{}' failed: {}", agent_id, error);
            let result = AgentResult::degraded(
                agent_id,
                &error.to_string(),
                started.elapsed().as_millis() as u64,
            );
            (result, Vec::new())
        }
    }
}

/// Invoke one agent, discarding its tool-execution records.
pub(crate) async fn invoke_agent(
    agent: &Arc<dyn WorkflowAgent>,
    agent_id: &str,
    session_id: &str,
    prompt: &str,
) -> AgentResult {
    invoke_agent_with_tools(agent, agent_id, session_id, prompt)
        .await
        .0
}
