//! Debate executor.
//!
//! Debaters speak in configuration order for a fixed number of rounds; from
//! the second round on, each prompt carries the arguments made so far.
//! Results are flat-ordered `[round1-agent1, round1-agent2, …]`.  An
//! optional moderator is invoked once after the final round; its synthesis
//! rides in the result metadata and its cost joins the roll-up, but it is
//! not counted as a debater result.

use std::collections::HashMap;
use std::time::Instant;

use crate::agentweave::agent_api::BoxError;
use crate::agentweave::merge;
use crate::agentweave::orchestrator::{Orchestrator, WorkflowError};
use crate::agentweave::pattern::DebatePattern;
use crate::agentweave::result::{AgentResult, WorkflowCost, WorkflowResult};

use super::{invoke_agent, new_workflow_id, session_id};

/// Labeled transcript of the arguments made so far.
fn transcript(results: &[AgentResult]) -> String {
    results
        .iter()
        .map(|result| format!("[{}]: {}", result.agent_id, result.output))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn debate_prompt(topic: &str, round_number: u32, prior: &[AgentResult]) -> String {
    if prior.is_empty() {
        format!(
            "Round {} of debate: {}\n\n\
             Present your opening position.",
            round_number, topic
        )
    } else {
        format!(
            "Round {} of debate: {}\n\n\
             Arguments so far:\n{}\n\n\
             Consider the arguments presented and provide your position. \
             Acknowledge strong points and challenge weak ones.",
            round_number,
            topic,
            transcript(prior)
        )
    }
}

pub async fn execute(
    orchestrator: &Orchestrator,
    pattern: &DebatePattern,
) -> Result<WorkflowResult, BoxError> {
    if pattern.agent_ids.is_empty() {
        return Err(Box::new(WorkflowError::InvalidPattern(format!(
            "debate '{}' has no debaters",
            pattern.name
        ))));
    }
    let mut referenced = pattern.agent_ids.clone();
    if let Some(moderator_id) = &pattern.moderator_id {
        referenced.push(moderator_id.clone());
    }
    orchestrator.require_agents(&referenced).await?;

    let workflow_id = new_workflow_id("debate");
    let mut span = orchestrator.tracer().start_span("workflow.debate");
    span.set_attribute("workflow_id", &workflow_id);
    span.set_attribute("rounds", &pattern.rounds.to_string());

    let started = Instant::now();
    let mut results: Vec<AgentResult> = Vec::new();
    let mut cost = WorkflowCost::default();
    let mut models_used = HashMap::new();

    orchestrator.emit_progress(
        "debate",
        &format!(
            "{} debaters over {} rounds",
            pattern.agent_ids.len(),
            pattern.rounds
        ),
        20.0,
        None,
        &results,
    );

    for round in 1..=pattern.rounds {
        for agent_id in &pattern.agent_ids {
            let mut agent_span = orchestrator
                .tracer()
                .start_span(&format!("debate.agent.{}", agent_id));
            let agent = orchestrator.require_agent(agent_id).await?;
            let session = session_id(&workflow_id, &format!("round{}", round), agent_id);
            let prompt = debate_prompt(&pattern.topic, round, &results);

            let result = invoke_agent(&agent, agent_id, &session, &prompt)
                .await
                .with_metadata("round", round.to_string());
            models_used.insert(agent_id.clone(), agent.llm_model().to_string());
            cost.absorb(&result);
            results.push(result);
            agent_span.end();
        }
    }

    if results.iter().all(|result| result.is_error()) {
        span.end();
        return Err(Box::new(WorkflowError::ExecutionFailed(format!(
            "debate '{}': all debaters failed",
            pattern.name
        ))));
    }

    let mut metadata = HashMap::new();
    metadata.insert("rounds".to_string(), pattern.rounds.to_string());
    metadata.insert("debater_count".to_string(), pattern.agent_ids.len().to_string());

    if let Some(moderator_id) = &pattern.moderator_id {
        let mut moderator_span = orchestrator
            .tracer()
            .start_span(&format!("debate.agent.{}", moderator_id));
        let moderator = orchestrator.require_agent(moderator_id).await?;
        let session = session_id(&workflow_id, "moderator", moderator_id);
        let prompt = format!(
            "The debate has concluded: {}\n\n\
             Full transcript:\n{}\n\n\
             As moderator, synthesize the strongest points into a final answer.",
            pattern.topic,
            transcript(&results)
        );
        let moderator_result = invoke_agent(&moderator, moderator_id, &session, &prompt).await;
        models_used.insert(moderator_id.clone(), moderator.llm_model().to_string());
        cost.absorb(&moderator_result);
        if moderator_result.is_error() {
            log::warn!(
                "debate '{}': moderator '{}' failed, continuing without synthesis",
                pattern.name,
                moderator_id
            );
        } else {
            metadata.insert("moderator".to_string(), moderator_id.clone());
            metadata.insert(
                "moderator_synthesis".to_string(),
                moderator_result.output.clone(),
            );
        }
        moderator_span.end();
    }

    let llm = orchestrator.resolve_merge_llm().await;
    let merge_outcome =
        merge::merge_results(pattern.merge_strategy, &pattern.topic, &results, llm.as_ref())
            .await?;
    if merge_outcome.llm_called {
        let merge_label = llm
            .as_ref()
            .map(|llm| llm.name().to_string())
            .unwrap_or_else(|| "merge-llm".to_string());
        cost.absorb_usage(&merge_label, merge_outcome.usage.as_ref());
    }
    let merged_output = merge_outcome.output;

    span.end();
    Ok(WorkflowResult {
        pattern_type: "debate".to_string(),
        agent_results: results,
        merged_output,
        metadata,
        duration_ms: started.elapsed().as_millis() as u64,
        cost,
        models_used,
    })
}
