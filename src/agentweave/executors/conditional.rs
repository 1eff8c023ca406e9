//! Conditional executor.
//!
//! A classifier agent answers the condition prompt; its trimmed, lowercased
//! reply selects a branch.  Selection precedence: exact key match,
//! case-insensitive key match, substring containment of a branch key in the
//! reply, then the default branch.  The chosen branch is dispatched
//! recursively; the outer result inherits the inner agent results, merged
//! output, and cost, re-labeled as a conditional.

use std::time::Instant;

use crate::agentweave::agent_api::BoxError;
use crate::agentweave::orchestrator::{Orchestrator, WorkflowError};
use crate::agentweave::pattern::{ConditionalPattern, WorkflowPattern};
use crate::agentweave::result::WorkflowResult;

use super::{invoke_agent, new_workflow_id, session_id};

/// Pick the branch for a classifier reply, or `None` when nothing matches
/// and no default exists.  Keys are scanned in sorted order so substring
/// matching is deterministic even though the branch map is not.
fn select_branch<'a>(
    pattern: &'a ConditionalPattern,
    condition_result: &str,
) -> Option<(String, &'a WorkflowPattern)> {
    if let Some(branch) = pattern.branches.get(condition_result) {
        return Some((condition_result.to_string(), branch));
    }

    let mut keys: Vec<&String> = pattern.branches.keys().collect();
    keys.sort();

    for key in &keys {
        if key.to_lowercase() == condition_result {
            return Some(((*key).clone(), &pattern.branches[*key]));
        }
    }
    for key in &keys {
        if condition_result.contains(&key.to_lowercase()) {
            return Some(((*key).clone(), &pattern.branches[*key]));
        }
    }
    pattern
        .default_branch
        .as_deref()
        .map(|branch| ("default".to_string(), branch))
}

pub async fn execute(
    orchestrator: &Orchestrator,
    pattern: &ConditionalPattern,
) -> Result<WorkflowResult, BoxError> {
    orchestrator.require_agent(&pattern.condition_agent_id).await?;

    let workflow_id = new_workflow_id("conditional");
    let mut span = orchestrator.tracer().start_span("workflow.conditional");
    span.set_attribute("workflow_id", &workflow_id);

    let started = Instant::now();
    orchestrator.emit_progress(
        "conditional",
        "classifying input",
        20.0,
        Some(&pattern.condition_agent_id),
        &[],
    );

    let classifier = orchestrator.require_agent(&pattern.condition_agent_id).await?;
    let session = session_id(&workflow_id, "condition", &pattern.condition_agent_id);
    let mut condition_span = orchestrator
        .tracer()
        .start_span(&format!("conditional.agent.{}", pattern.condition_agent_id));
    let condition_result_raw = invoke_agent(
        &classifier,
        &pattern.condition_agent_id,
        &session,
        &pattern.condition_prompt,
    )
    .await;
    condition_span.end();

    if condition_result_raw.is_error() {
        span.end();
        return Err(Box::new(WorkflowError::ExecutionFailed(format!(
            "conditional '{}': condition agent '{}' failed: {}",
            pattern.name,
            pattern.condition_agent_id,
            condition_result_raw.output
        ))));
    }

    let condition_result = condition_result_raw.output.trim().to_lowercase();
    let (selected_branch, branch_pattern) = select_branch(pattern, &condition_result)
        .ok_or_else(|| {
            Box::new(WorkflowError::InvalidPattern(format!(
                "conditional '{}': no branch matches condition result '{}' and no default branch \
                 is configured",
                pattern.name, condition_result
            ))) as BoxError
        })?;

    log::info!(
        "conditional '{}': routing to branch '{}' (condition result '{}')",
        pattern.name,
        selected_branch,
        condition_result
    );
    let mut branch_span = orchestrator
        .tracer()
        .start_span(&format!("conditional.branch.{}", selected_branch));

    let inner = orchestrator.execute_pattern(branch_pattern).await?;
    branch_span.end();

    let mut metadata = inner.metadata.clone();
    metadata.insert("selected_branch".to_string(), selected_branch);
    metadata.insert("condition_result".to_string(), condition_result);
    metadata.insert(
        "condition_agent".to_string(),
        pattern.condition_agent_id.clone(),
    );
    metadata.insert(
        "branch_pattern".to_string(),
        branch_pattern.pattern_type().to_string(),
    );

    let mut cost = inner.cost.clone();
    cost.absorb(&condition_result_raw);

    let mut models_used = inner.models_used.clone();
    models_used.insert(
        pattern.condition_agent_id.clone(),
        classifier.llm_model().to_string(),
    );

    span.end();
    Ok(WorkflowResult {
        pattern_type: "conditional".to_string(),
        agent_results: inner.agent_results,
        merged_output: inner.merged_output,
        metadata,
        duration_ms: started.elapsed().as_millis() as u64,
        cost,
        models_used,
    })
}
