//! Parallel-tasks executor.
//!
//! Like fork-join, but every task carries its own prompt and optional
//! metadata (propagated into the task's result along with `task_index`).
//! When the orchestrator carries an LLM concurrency semaphore, each task
//! acquires a permit around its agent call so the process-wide bound holds
//! across concurrently running parallel patterns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinSet;

use crate::agentweave::agent_api::BoxError;
use crate::agentweave::merge;
use crate::agentweave::orchestrator::{Orchestrator, WorkflowError};
use crate::agentweave::pattern::ParallelPattern;
use crate::agentweave::result::{AgentResult, WorkflowCost, WorkflowResult};

use super::{invoke_agent, new_workflow_id, session_id};

pub async fn execute(
    orchestrator: &Orchestrator,
    pattern: &ParallelPattern,
) -> Result<WorkflowResult, BoxError> {
    if pattern.tasks.is_empty() {
        return Err(Box::new(WorkflowError::InvalidPattern(format!(
            "parallel '{}' has no tasks",
            pattern.name
        ))));
    }
    let agent_ids: Vec<String> = pattern
        .tasks
        .iter()
        .map(|task| task.agent_id.clone())
        .collect();
    orchestrator.require_agents(&agent_ids).await?;

    let workflow_id = new_workflow_id("parallel");
    let mut span = orchestrator.tracer().start_span("workflow.parallel");
    span.set_attribute("workflow_id", &workflow_id);
    span.set_attribute("task_count", &pattern.tasks.len().to_string());

    let started = Instant::now();
    let models_used: Arc<Mutex<HashMap<String, String>>> = Arc::new(Mutex::new(HashMap::new()));

    orchestrator.emit_progress(
        "parallel",
        &format!("running {} tasks", pattern.tasks.len()),
        20.0,
        None,
        &[],
    );

    let mut join_set = JoinSet::new();
    for (task_index, task) in pattern.tasks.iter().enumerate() {
        let agent = orchestrator.require_agent(&task.agent_id).await?;
        let session = session_id(&workflow_id, &format!("task{}", task_index), &task.agent_id);
        let prompt = task.prompt.clone();
        let task_metadata = task.metadata.clone();
        let agent_id = task.agent_id.clone();
        let tracer = orchestrator.tracer().clone();
        let semaphore = orchestrator.llm_semaphore();
        let models = models_used.clone();

        join_set.spawn(async move {
            let mut task_span = tracer.start_span(&format!("parallel.agent.{}", agent_id));
            models
                .lock()
                .unwrap()
                .insert(agent_id.clone(), agent.llm_model().to_string());

            // Gate the LLM call, not the bookkeeping around it.
            let permit = match semaphore {
                Some(semaphore) => semaphore.acquire_owned().await.ok(),
                None => None,
            };
            let mut result = invoke_agent(&agent, &agent_id, &session, &prompt).await;
            drop(permit);

            for (key, value) in task_metadata {
                result.metadata.insert(key, value);
            }
            result
                .metadata
                .insert("task_index".to_string(), task_index.to_string());
            task_span.end();
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
                    join_set.abort_all();
                    span.end();
                    return Err(Box::new(WorkflowError::Timeout(format!(
                        "parallel '{}' exceeded {}s deadline with {}/{} results",
                        pattern.name,
                        pattern.timeout_seconds,
                        results.len(),
                        pattern.tasks.len()
                    ))));
                }
            }
        } else {
            join_set.join_next().await
        };
        match next {
            Some(Ok(result)) => results.push(result),
            Some(Err(join_error)) => {
                log::error!("parallel '{}' worker panicked: {}", pattern.name, join_error);
            }
            None => break,
        }
    }

    if results.iter().all(|result| result.is_error()) {
        span.end();
        return Err(Box::new(WorkflowError::ExecutionFailed(format!(
            "parallel '{}': all {} tasks failed",
            pattern.name,
            pattern.tasks.len()
        ))));
    }

    let mut cost = WorkflowCost::default();
    for result in &results {
        cost.absorb(result);
    }

    let llm = orchestrator.resolve_merge_llm().await;
    let merge_outcome =
        merge::merge_results(pattern.merge_strategy, "", &results, llm.as_ref()).await?;
    if merge_outcome.llm_called {
        let merge_label = llm
            .as_ref()
            .map(|llm| llm.name().to_string())
            .unwrap_or_else(|| "merge-llm".to_string());
        cost.absorb_usage(&merge_label, merge_outcome.usage.as_ref());
    }
    let merged_output = merge_outcome.output;

    let mut metadata = HashMap::new();
    metadata.insert("task_count".to_string(), pattern.tasks.len().to_string());
    metadata.insert(
        "merge_strategy".to_string(),
        merge::strategy_name(pattern.merge_strategy).to_string(),
    );

    let models_used = Arc::try_unwrap(models_used)
        .map(|mutex| mutex.into_inner().unwrap())
        .unwrap_or_else(|shared| shared.lock().unwrap().clone());

    span.end();
    Ok(WorkflowResult {
        pattern_type: "parallel".to_string(),
        agent_results: results,
        merged_output,
        metadata,
        duration_ms: started.elapsed().as_millis() as u64,
        cost,
        models_used,
    })
}
