//! Fork-join executor.
//!
//! Every agent receives the same prompt concurrently; results are collected
//! in completion order and reduced by the configured merge strategy.  A
//! positive `timeout_seconds` bounds the whole fan-out; hitting the
//! deadline aborts the in-flight agent calls and fails the pattern.
//! Individual agent failures surface as degraded results; the pattern fails
//! only when every branch failed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinSet;

use crate::agentweave::agent_api::BoxError;
use crate::agentweave::merge;
use crate::agentweave::orchestrator::{Orchestrator, WorkflowError};
use crate::agentweave::pattern::ForkJoinPattern;
use crate::agentweave::result::{AgentResult, WorkflowCost, WorkflowResult};

use super::{invoke_agent, new_workflow_id, session_id};

pub async fn execute(
    orchestrator: &Orchestrator,
    pattern: &ForkJoinPattern,
) -> Result<WorkflowResult, BoxError> {
    if pattern.agent_ids.is_empty() {
        return Err(Box::new(WorkflowError::InvalidPattern(format!(
            "fork-join '{}' has no agents",
            pattern.name
        ))));
    }
    orchestrator.require_agents(&pattern.agent_ids).await?;

    let workflow_id = new_workflow_id("fork_join");
    let mut span = orchestrator.tracer().start_span("workflow.fork_join");
    span.set_attribute("workflow_id", &workflow_id);
    span.set_attribute("agent_count", &pattern.agent_ids.len().to_string());

    let started = Instant::now();
    let models_used: Arc<Mutex<HashMap<String, String>>> = Arc::new(Mutex::new(HashMap::new()));

    orchestrator.emit_progress(
        "fork_join",
        &format!("fanning out to {} agents", pattern.agent_ids.len()),
        20.0,
        None,
        &[],
    );

    let mut join_set = JoinSet::new();
    for agent_id in &pattern.agent_ids {
        let agent = orchestrator.require_agent(agent_id).await?;
        let session = session_id(&workflow_id, "fork", agent_id);
        let prompt = pattern.prompt.clone();
        let agent_id = agent_id.clone();
        let tracer = orchestrator.tracer().clone();
        let models = models_used.clone();

        join_set.spawn(async move {
            let mut agent_span = tracer.start_span(&format!("fork_join.agent.{}", agent_id));
            models
                .lock()
                .unwrap()
                .insert(agent_id.clone(), agent.llm_model().to_string());
            let result = invoke_agent(&agent, &agent_id, &session, &prompt).await;
            agent_span.end();
            result
        });
    }

    let mut results: Vec<AgentResult> = Vec::new();
    let deadline = Duration::from_secs(pattern.timeout_seconds);
    loop {
        let next = if pattern.timeout_seconds > 0 {
            let remaining = deadline.saturating_sub(started.elapsed());
            match tokio::time::timeout(remaining, join_set.join_next()).await {
                Ok(joined) => joined,
                Err(_) => {
                    // Deadline hit: dropping the set aborts in-flight calls.
                    join_set.abort_all();
                    span.end();
                    return Err(Box::new(WorkflowError::Timeout(format!(
                        "fork-join '{}' exceeded {}s deadline with {}/{} results",
                        pattern.name,
                        pattern.timeout_seconds,
                        results.len(),
                        pattern.agent_ids.len()
                    ))));
                }
            }
        } else {
            join_set.join_next().await
        };
        match next {
            Some(Ok(result)) => results.push(result),
            Some(Err(join_error)) => {
                log::error!("fork-join '{}' worker panicked: {}", pattern.name, join_error);
            }
            None => break,
        }
    }

    if results.iter().all(|result| result.is_error()) {
        span.end();
        return Err(Box::new(WorkflowError::ExecutionFailed(format!(
            "fork-join '{}': all {} agents failed",
            pattern.name,
            pattern.agent_ids.len()
        ))));
    }

    let mut cost = WorkflowCost::default();
    for result in &results {
        cost.absorb(result);
    }

    let llm = orchestrator.resolve_merge_llm().await;
    let merge_outcome =
        merge::merge_results(pattern.merge_strategy, &pattern.prompt, &results, llm.as_ref())
            .await?;
    if merge_outcome.llm_called {
        let merge_label = llm
            .as_ref()
            .map(|llm| llm.name().to_string())
            .unwrap_or_else(|| "merge-llm".to_string());
        cost.absorb_usage(&merge_label, merge_outcome.usage.as_ref());
    }
    let merged_output = merge_outcome.output;

    let mut metadata = HashMap::new();
    metadata.insert("agent_count".to_string(), pattern.agent_ids.len().to_string());
    metadata.insert(
        "merge_strategy".to_string(),
        merge::strategy_name(pattern.merge_strategy).to_string(),
    );

    let models_used = Arc::try_unwrap(models_used)
        .map(|mutex| mutex.into_inner().unwrap())
        .unwrap_or_else(|shared| shared.lock().unwrap().clone());

    span.end();
    Ok(WorkflowResult {
        pattern_type: "fork_join".to_string(),
        agent_results: results,
        merged_output,
        metadata,
        duration_ms: started.elapsed().as_millis() as u64,
        cost,
        models_used,
    })
}
