//! Sequential pipeline executor.
//!
//! Stages run strictly in order.  Stage *i* sees `{{previous}}` (the prior
//! stage's output, seeded from the initial prompt for the first stage) and
//! `{{history}}` (all prior outputs, labeled by stage index).  A stage
//! failure fails the pipeline, since there are no peers to fall back on.

use std::collections::HashMap;
use std::time::Instant;

use crate::agentweave::agent_api::BoxError;
use crate::agentweave::orchestrator::{Orchestrator, WorkflowError};
use crate::agentweave::pattern::{extract_agent_ids, PipelinePattern, WorkflowPattern};
use crate::agentweave::provider::ProviderMessage;
use crate::agentweave::result::{WorkflowCost, WorkflowResult};
use crate::agentweave::stage_context::{expand_stage_template, history_block, references_placeholders};

use super::{invoke_agent, new_workflow_id, session_id};

/// Whether a validation reply counts as a pass: it contains `valid`, `yes`,
/// or `true`, case-insensitively.
pub(crate) fn validation_passes(reply: &str) -> bool {
    let lower = reply.to_lowercase();
    lower.contains("valid") || lower.contains("yes") || lower.contains("true")
}

/// Run the stage's validation prompt through the merge LLM.  Non-pass is
/// logged but never fatal; a missing merge LLM downgrades validation to a
/// warning.  A completed validation call is billed into `cost` like any
/// other invocation.
async fn validate_stage_output(
    orchestrator: &Orchestrator,
    pipeline_name: &str,
    stage_number: usize,
    validation_prompt: &str,
    output: &str,
    cost: &mut WorkflowCost,
) {
    let prompt = validation_prompt.replace("{{output}}", output);
    match orchestrator.resolve_merge_llm().await {
        Some(llm) => match llm.chat(&[ProviderMessage::user(prompt)], None).await {
            Ok(response) => {
                cost.absorb_usage(llm.name(), response.usage.as_ref());
                if validation_passes(&response.content) {
                    log::debug!(
                        "pipeline '{}' stage {} passed validation",
                        pipeline_name,
                        stage_number
                    );
                } else {
                    log::warn!(
                        "pipeline '{}' stage {} failed validation: {}",
                        pipeline_name,
                        stage_number,
                        response.content.trim()
                    );
                }
            }
            Err(error) => {
                log::warn!(
                    "pipeline '{}' stage {} validation call failed: {}",
                    pipeline_name,
                    stage_number,
                    error
                );
            }
        },
        None => {
            log::warn!(
                "pipeline '{}' stage {}: no merge LLM available, skipping validation",
                pipeline_name,
                stage_number
            );
        }
    }
}

pub async fn execute(
    orchestrator: &Orchestrator,
    pattern: &PipelinePattern,
) -> Result<WorkflowResult, BoxError> {
    if pattern.stages.is_empty() {
        return Err(Box::new(WorkflowError::InvalidPattern(format!(
            "pipeline '{}' has no stages",
            pattern.name
        ))));
    }
    let agent_ids = extract_agent_ids(&WorkflowPattern::Pipeline(pattern.clone()));
    orchestrator.require_agents(&agent_ids).await?;

    let workflow_id = new_workflow_id("pipeline");
    let mut span = orchestrator.tracer().start_span("workflow.pipeline");
    span.set_attribute("workflow_id", &workflow_id);
    span.set_attribute("stage_count", &pattern.stages.len().to_string());

    let started = Instant::now();
    let mut results = Vec::new();
    let mut prior_outputs: Vec<String> = Vec::new();
    let mut cost = WorkflowCost::default();
    let mut models_used = HashMap::new();

    orchestrator.emit_progress(
        "pipeline",
        &format!("executing {} stages", pattern.stages.len()),
        20.0,
        Some(&pattern.stages[0].agent_id),
        &results,
    );

    for (index, stage) in pattern.stages.iter().enumerate() {
        let stage_number = index + 1;
        let mut stage_span = orchestrator
            .tracer()
            .start_span(&format!("pipeline.stage.{}", stage_number));
        stage_span.set_attribute("agent_id", &stage.agent_id);

        let previous = if index == 0 {
            pattern.initial_prompt.as_str()
        } else {
            prior_outputs[index - 1].as_str()
        };
        let mut prompt = expand_stage_template(&stage.prompt_template, previous, &prior_outputs, None);
        if pattern.pass_full_history && !references_placeholders(&stage.prompt_template) {
            prompt.push_str("\n\n");
            prompt.push_str(&history_block(&prior_outputs));
        }

        let agent = orchestrator.require_agent(&stage.agent_id).await?;
        let session = session_id(&workflow_id, &format!("stage{}", stage_number), &stage.agent_id);
        let result = invoke_agent(&agent, &stage.agent_id, &session, &prompt)
            .await
            .with_metadata("stage", stage_number.to_string());

        models_used.insert(stage.agent_id.clone(), agent.llm_model().to_string());
        cost.absorb(&result);
        stage_span.end();

        if result.is_error() {
            let message = result
                .metadata
                .get("error")
                .cloned()
                .unwrap_or_else(|| "unknown error".to_string());
            span.end();
            return Err(Box::new(WorkflowError::ExecutionFailed(format!(
                "pipeline '{}' stage {} (agent '{}') failed: {}",
                pattern.name, stage_number, stage.agent_id, message
            ))));
        }

        if let Some(validation_prompt) = stage
            .validation_prompt
            .as_deref()
            .filter(|prompt| !prompt.is_empty())
        {
            validate_stage_output(
                orchestrator,
                &pattern.name,
                stage_number,
                validation_prompt,
                &result.output,
                &mut cost,
            )
            .await;
        }

        prior_outputs.push(result.output.clone());
        results.push(result);
    }

    let merged_output = results
        .last()
        .map(|result| result.output.clone())
        .unwrap_or_default();

    let mut metadata = HashMap::new();
    metadata.insert("stage_count".to_string(), pattern.stages.len().to_string());
    metadata.insert(
        "pass_full_history".to_string(),
        pattern.pass_full_history.to_string(),
    );

    span.end();
    Ok(WorkflowResult {
        pattern_type: "pipeline".to_string(),
        agent_results: results,
        merged_output,
        metadata,
        duration_ms: started.elapsed().as_millis() as u64,
        cost,
        models_used,
    })
}
