//! Iterative pipeline executor.
//!
//! Runs the wrapped pipeline under a restart policy: downstream stages may
//! publish [`RestartRequest`]s on the bus asking to rewind execution to an
//! earlier stage.  Requests are examined only at the poll point between
//! stages, never mid-stage, so exactly one stage is executing at any time.
//!
//! Each stage's full output is persisted to the workflow shared-memory
//! namespace; the prompt pipeline carries only a size-bounded summary plus a
//! context header teaching the agent where the full data lives.  Stage
//! outputs are additionally parsed into the [`StructuredContext`] so later
//! stages (and validators) can check claims against what actually happened.

use std::collections::HashMap;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::agentweave::agent_api::{BoxError, ToolExecution};
use crate::agentweave::bus::{BusMessage, MessageBus, RestartRequest, RestartResponse};
use crate::agentweave::memory::{MemoryEntry, SharedMemory, WORKFLOW_NAMESPACE};
use crate::agentweave::orchestrator::{Orchestrator, WorkflowError};
use crate::agentweave::pattern::{extract_agent_ids, IterativePattern, WorkflowPattern};
use crate::agentweave::result::{AgentResult, WorkflowCost, WorkflowResult};
use crate::agentweave::stage_context::{
    expand_stage_template, references_placeholders, shared_memory_header, stage_memory_key,
    truncate_for_context, DEFAULT_MAX_CONTEXT_BYTES,
};
use crate::agentweave::structured_context::{
    find_ignore_ascii_case, parse_stage_output, validate_output_structure, StructuredContext,
    ToolCallRecord,
};

use super::{invoke_agent_with_tools, new_workflow_id, pipeline, session_id};

/// Capacity of the restart request channel; overflow drops with a warning.
const RESTART_BUFFER: usize = 10;

/// Validation retry budget applied when the policy leaves it unset.
const DEFAULT_VALIDATION_RETRIES: u32 = 2;

/// Live restart subscription: a forwarder task decodes bus messages into
/// typed requests on a bounded channel the stage loop polls.
struct RestartListener {
    requests: mpsc::Receiver<RestartRequest>,
    shutdown: watch::Sender<bool>,
    forwarder: JoinHandle<()>,
    subscription_id: String,
    bus: std::sync::Arc<dyn MessageBus>,
}

impl RestartListener {
    async fn subscribe(
        bus: std::sync::Arc<dyn MessageBus>,
        workflow_id: &str,
        topic: &str,
    ) -> Result<Self, BoxError> {
        let subscription = bus
            .subscribe(workflow_id, topic, None, RESTART_BUFFER)
            .await?;
        let subscription_id = subscription.id.clone();
        let mut bus_receiver = subscription.receiver;
        let (request_tx, request_rx) = mpsc::channel::<RestartRequest>(RESTART_BUFFER);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let forwarder = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    message = bus_receiver.recv() => {
                        let Some(message) = message else { break };
                        match message.decode_restart_request() {
                            Ok(Some(request)) => {
                                if let Err(mpsc::error::TrySendError::Full(dropped)) =
                                    request_tx.try_send(request)
                                {
                                    log::warn!(
                                        "restart channel full, dropping request targeting '{}'",
                                        dropped.target_stage_id
                                    );
                                }
                            }
                            Ok(None) => {}
                            Err(error) => {
                                log::warn!("undecodable restart message: {}", error);
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            requests: request_rx,
            shutdown: shutdown_tx,
            forwarder,
            subscription_id,
            bus,
        })
    }

    /// Non-blocking poll of the restart channel.
    fn poll(&mut self) -> Option<RestartRequest> {
        self.requests.try_recv().ok()
    }

    /// Cancel the subscription and wait for the forwarder to exit, so no bus
    /// interaction happens after the workflow's public return.
    async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(error) = self.bus.unsubscribe(&self.subscription_id).await {
            log::warn!("unsubscribe failed: {}", error);
        }
        if let Err(error) = self.forwarder.await {
            log::warn!("restart forwarder join failed: {}", error);
        }
    }

    async fn respond(&self, requester_id: &str, response: &RestartResponse) {
        match BusMessage::restart_response(requester_id, response) {
            Ok(message) => {
                let topic = message.topic.clone();
                if let Err(error) = self.bus.publish(&topic, message).await {
                    log::warn!("failed to publish restart response to '{}': {}", topic, error);
                }
            }
            Err(error) => log::warn!("failed to encode restart response: {}", error),
        }
    }
}

/// Validate a restart request against the policy and the current cursor.
/// Returns the target stage index, or the rejection reason.
fn validate_restart(
    pattern: &IterativePattern,
    request: &RestartRequest,
    current_index: usize,
    last_restart_time: &HashMap<String, Instant>,
) -> Result<usize, String> {
    let policy = &pattern.restart_policy;
    if !policy.enabled {
        return Err("restart policy is disabled".to_string());
    }
    let target_index = pattern
        .pipeline
        .stages
        .iter()
        .position(|stage| stage.agent_id == request.target_stage_id)
        .ok_or_else(|| format!("target stage '{}' not found", request.target_stage_id))?;
    if target_index >= current_index {
        return Err("can only restart earlier stages".to_string());
    }
    if !policy.restartable_stages.is_empty()
        && !policy
            .restartable_stages
            .iter()
            .any(|stage_id| stage_id == &request.target_stage_id)
    {
        return Err(format!(
            "target stage '{}' not in restartable_stages list",
            request.target_stage_id
        ));
    }
    if !pattern.restart_triggers.is_empty()
        && !pattern
            .restart_triggers
            .iter()
            .any(|stage_id| stage_id == &request.requester_stage_id)
    {
        return Err(format!(
            "stage '{}' not authorized to trigger restarts",
            request.requester_stage_id
        ));
    }
    if policy.cooldown_seconds > 0 {
        if let Some(last) = last_restart_time.get(&request.target_stage_id) {
            if last.elapsed().as_secs() < policy.cooldown_seconds {
                return Err("cooldown period not elapsed".to_string());
            }
        }
    }
    Ok(target_index)
}

/// Preamble prepended when a validation retry re-prompts the agent.
fn retry_preamble(validation_error: &str, original_prompt: &str) -> String {
    format!(
        "Your previous response failed structure validation: {}\n\n\
         Reply with a structured stage output, for example:\n\
         ```json\n\
         {{\"stage_id\": \"<your stage>\", \"status\": \"completed\", \"outputs\": {{}}}}\n\
         ```\n\n\
         Original request follows.\n\n{}",
        validation_error, original_prompt
    )
}

/// Extract a complete HTML document from agent output, case-insensitively.
fn extract_html_document(output: &str) -> Option<&str> {
    let start = find_ignore_ascii_case(output, "<!doctype html", 0)?;
    let end = find_ignore_ascii_case(output, "</html>", start)?;
    Some(&output[start..end + "</html>".len()])
}

/// Wipe every key in the workflow shared-memory namespace, logging (but not
/// failing on) individual delete errors.
async fn reset_workflow_memory(memory: &std::sync::Arc<dyn SharedMemory>) {
    match memory.list(WORKFLOW_NAMESPACE).await {
        Ok(keys) => {
            for key in keys {
                if let Err(error) = memory.delete(WORKFLOW_NAMESPACE, &key).await {
                    log::warn!("failed to delete shared-memory key '{}': {}", key, error);
                }
            }
        }
        Err(error) => log::warn!("failed to list shared-memory keys for reset: {}", error),
    }
}

pub async fn execute(
    orchestrator: &Orchestrator,
    pattern: &IterativePattern,
) -> Result<WorkflowResult, BoxError> {
    if !pattern.restart_policy.enabled {
        log::info!(
            "iterative '{}': restart policy disabled, running as a plain pipeline",
            pattern.name
        );
        return pipeline::execute(orchestrator, &pattern.pipeline).await;
    }
    if pattern.pipeline.stages.is_empty() {
        return Err(Box::new(WorkflowError::InvalidPattern(format!(
            "iterative pipeline '{}' has no stages",
            pattern.name
        ))));
    }
    let agent_ids = extract_agent_ids(&WorkflowPattern::Pipeline(pattern.pipeline.clone()));
    orchestrator.require_agents(&agent_ids).await?;

    let workflow_id = new_workflow_id("iterative_pipeline");
    let mut span = orchestrator.tracer().start_span("workflow.iterative_pipeline");
    span.set_attribute("workflow_id", &workflow_id);
    span.set_attribute("max_iterations", &pattern.max_iterations.to_string());

    let mut init_span = orchestrator
        .tracer()
        .start_span("workflow.structured_context.init");
    let mut context = StructuredContext::new(&workflow_id, "iterative_pipeline");
    init_span.end();

    let mut listener = match orchestrator.message_bus() {
        Some(bus) => Some(
            RestartListener::subscribe(bus, &workflow_id, &pattern.restart_topic).await?,
        ),
        None => {
            log::warn!(
                "iterative '{}': no message bus configured, restart requests cannot be received",
                pattern.name
            );
            None
        }
    };

    let started = Instant::now();
    let stage_count = pattern.pipeline.stages.len();
    let policy = &pattern.restart_policy;
    let (max_retries, skip_validation) = match policy.max_validation_retries {
        Some(0) => (0, true),
        Some(retries) => (retries, false),
        None => (DEFAULT_VALIDATION_RETRIES, false),
    };

    let mut results: Vec<AgentResult> = Vec::new();
    let mut cost = WorkflowCost::default();
    let mut models_used = HashMap::new();
    // Size-bounded summaries, indexed by stage; None when evicted by restart.
    let mut stage_summaries: Vec<Option<String>> = vec![None; stage_count];
    // Working map keyed by agent id (plus `<agent>_html_report` entries).
    let mut working_outputs: HashMap<String, String> = HashMap::new();
    let mut last_restart_time: HashMap<String, Instant> = HashMap::new();
    let mut iterations_used: u32 = 1;
    let mut final_output = String::new();

    orchestrator.emit_progress(
        "iterative_pipeline",
        &format!("{} stages, max {} iterations", stage_count, pattern.max_iterations),
        20.0,
        Some(&pattern.pipeline.stages[0].agent_id),
        &results,
    );

    let mut index = 0usize;
    while index < stage_count {
        let stage = &pattern.pipeline.stages[index];
        let stage_number = index + 1;
        let memory_key = stage_memory_key(stage_number);

        let mut prompt_span = orchestrator
            .tracer()
            .start_span("workflow.structured_context.build_prompt");
        let previous = if index == 0 {
            pattern.pipeline.initial_prompt.clone()
        } else {
            stage_summaries[index - 1].clone().unwrap_or_default()
        };
        let prior: Vec<String> = stage_summaries[..index]
            .iter()
            .map(|summary| summary.clone().unwrap_or_default())
            .collect();
        let context_json = context.to_json().ok();
        let mut expanded = expand_stage_template(
            &stage.prompt_template,
            &previous,
            &prior,
            context_json.as_deref(),
        );
        if pattern.pipeline.pass_full_history && !references_placeholders(&stage.prompt_template) {
            expanded.push_str("\n\n");
            expanded.push_str(&crate::agentweave::stage_context::history_block(&prior));
        }
        let prompt = format!("{}{}", shared_memory_header(index), expanded);
        prompt_span.end();

        let agent = orchestrator.require_agent(&stage.agent_id).await?;
        models_used.insert(stage.agent_id.clone(), agent.llm_model().to_string());

        let mut stage_span = orchestrator
            .tracer()
            .start_span(&format!("iterative_pipeline.stage.{}", stage_number));
        stage_span.set_attribute("agent_id", &stage.agent_id);
        stage_span.set_attribute("iteration", &iterations_used.to_string());

        let stage_started_at = Utc::now().to_rfc3339();
        let mut result: Option<AgentResult> = None;
        let mut runtime_tool_calls: Vec<ToolExecution> = Vec::new();
        let mut validation_error = String::new();
        for retry in 0..=max_retries {
            let role = if retry == 0 {
                format!("stage{}", stage_number)
            } else {
                // Fresh conversation for each validation retry.
                format!("retry{}-stage{}", retry, stage_number)
            };
            let session = session_id(&workflow_id, &role, &stage.agent_id);
            let attempt_prompt = if retry == 0 {
                prompt.clone()
            } else {
                retry_preamble(&validation_error, &prompt)
            };

            let (attempt, tool_executions) =
                invoke_agent_with_tools(&agent, &stage.agent_id, &session, &attempt_prompt).await;
            let attempt = attempt
                .with_metadata("stage", stage_number.to_string())
                .with_metadata("iteration", iterations_used.to_string());
            cost.absorb(&attempt);
            runtime_tool_calls = tool_executions;

            if attempt.is_error() {
                let message = attempt
                    .metadata
                    .get("error")
                    .cloned()
                    .unwrap_or_else(|| "unknown error".to_string());
                results.push(attempt);
                stage_span.end();
                span.end();
                if let Some(listener) = listener.take() {
                    listener.shutdown().await;
                }
                return Err(Box::new(WorkflowError::ExecutionFailed(format!(
                    "iterative pipeline '{}' stage {} (agent '{}') failed: {}",
                    pattern.name, stage_number, stage.agent_id, message
                ))));
            }

            if skip_validation {
                result = Some(attempt);
                break;
            }
            match validate_output_structure(&attempt.output) {
                Ok(()) => {
                    result = Some(attempt);
                    break;
                }
                Err(error) => {
                    validation_error = error.to_string();
                    if retry < max_retries {
                        log::warn!(
                            "stage {} (agent '{}') output failed validation (attempt {}): {}",
                            stage_number,
                            stage.agent_id,
                            retry + 1,
                            validation_error
                        );
                        result = Some(attempt);
                        continue;
                    }
                    log::error!(
                        "stage {} (agent '{}') output still invalid after {} retries: {}; \
                         proceeding with last output",
                        stage_number,
                        stage.agent_id,
                        max_retries,
                        validation_error
                    );
                    result = Some(attempt);
                }
            }
        }
        let result = result.expect("at least one attempt ran");
        let output = result.output.clone();
        stage_span.end();

        // Persist the full output; prompts only ever carry the summary.
        if let Some(memory) = orchestrator.shared_memory() {
            let mut entry_metadata = HashMap::new();
            entry_metadata.insert("timestamp".to_string(), Utc::now().to_rfc3339());
            entry_metadata.insert("stage".to_string(), stage_number.to_string());
            let entry = MemoryEntry {
                namespace: WORKFLOW_NAMESPACE.to_string(),
                key: memory_key.clone(),
                value: output.clone().into_bytes(),
                agent_id: stage.agent_id.clone(),
                metadata: entry_metadata,
            };
            if let Err(error) = memory.put(entry).await {
                log::warn!("failed to persist '{}' to shared memory: {}", memory_key, error);
            }
        }

        let (summary, truncated) =
            truncate_for_context(&output, DEFAULT_MAX_CONTEXT_BYTES, &memory_key);
        if truncated {
            log::debug!(
                "stage {} output truncated from {} bytes for downstream context",
                stage_number,
                output.len()
            );
        }
        working_outputs.insert(stage.agent_id.clone(), summary.clone());
        stage_summaries[index] = Some(summary);
        final_output = output.clone();
        results.push(result);

        let mut parse_span = orchestrator
            .tracer()
            .start_span("workflow.structured_context.parse_output");
        match parse_stage_output(&output) {
            Ok(mut stage_output) => {
                if stage_output.started_at.is_empty() {
                    stage_output.started_at = stage_started_at.clone();
                }
                if stage_output.completed_at.is_empty() {
                    stage_output.completed_at = Utc::now().to_rfc3339();
                }
                // Evidence records what the agent actually executed, so the
                // runtime-reported tool calls join whatever the output text
                // declared (deduplicated by tool name).
                for execution in &runtime_tool_calls {
                    let declared = stage_output
                        .evidence
                        .tool_calls
                        .iter()
                        .any(|call| call.tool_name == execution.tool_name);
                    if !declared {
                        stage_output
                            .evidence
                            .tool_calls
                            .push(ToolCallRecord::from(execution));
                    }
                }
                if let Err(error) =
                    context.add_stage_output(&format!("stage-{}", stage_number), stage_output)
                {
                    log::warn!("could not record stage {} in context: {}", stage_number, error);
                }
            }
            Err(error) => {
                log::warn!(
                    "stage {} output is not a structured stage output: {}",
                    stage_number,
                    error
                );
            }
        }
        parse_span.end();

        // Persist any embedded HTML report next to the workflow.
        if let Some(document) = extract_html_document(&output) {
            let report_dir = std::env::temp_dir()
                .join("agentweave-reports")
                .join(&workflow_id);
            let report_path = report_dir.join(format!("stage-{}.html", stage_number));
            let write_result = std::fs::create_dir_all(&report_dir)
                .and_then(|_| std::fs::write(&report_path, document));
            match write_result {
                Ok(()) => {
                    working_outputs.insert(
                        format!("{}_html_report", stage.agent_id),
                        report_path.to_string_lossy().into_owned(),
                    );
                }
                Err(error) => log::warn!("failed to persist HTML report: {}", error),
            }
        }

        // Restart requests are examined only here, between stages.
        let mut next_index = index + 1;
        let polled = listener.as_mut().and_then(RestartListener::poll);
        if let Some(request) = polled {
            match validate_restart(pattern, &request, index, &last_restart_time) {
                Ok(target_index) => {
                    iterations_used += 1;
                    if iterations_used > pattern.max_iterations {
                        span.end();
                        if let Some(listener) = listener.take() {
                            listener.shutdown().await;
                        }
                        return Err(Box::new(WorkflowError::MaxIterationsExceeded(
                            pattern.max_iterations,
                        )));
                    }
                    if !policy.preserve_outputs {
                        for evicted in &pattern.pipeline.stages[target_index..] {
                            working_outputs.remove(&evicted.agent_id);
                            working_outputs.remove(&format!("{}_html_report", evicted.agent_id));
                        }
                        for summary in stage_summaries[target_index..].iter_mut() {
                            *summary = None;
                        }
                    }
                    if policy.reset_shared_memory {
                        if let Some(memory) = orchestrator.shared_memory() {
                            reset_workflow_memory(&memory).await;
                        }
                    }
                    last_restart_time.insert(request.target_stage_id.clone(), Instant::now());
                    log::info!(
                        "restart accepted: '{}' rewinds to stage '{}' (iteration {}/{}): {}",
                        request.requester_stage_id,
                        request.target_stage_id,
                        iterations_used,
                        pattern.max_iterations,
                        request.reason
                    );
                    if let Some(active) = listener.as_ref() {
                        active
                            .respond(
                                &request.requester_stage_id,
                                &RestartResponse {
                                    target_stage_id: request.target_stage_id.clone(),
                                    success: true,
                                    error: String::new(),
                                    iteration: iterations_used,
                                },
                            )
                            .await;
                    }
                    next_index = target_index;
                }
                Err(reason) => {
                    log::warn!(
                        "restart rejected ('{}' -> '{}'): {}",
                        request.requester_stage_id,
                        request.target_stage_id,
                        reason
                    );
                    if let Some(active) = listener.as_ref() {
                        active
                            .respond(
                                &request.requester_stage_id,
                                &RestartResponse {
                                    target_stage_id: request.target_stage_id.clone(),
                                    success: false,
                                    error: reason,
                                    iteration: iterations_used,
                                },
                            )
                            .await;
                    }
                }
            }
        }
        index = next_index;
    }

    if let Some(listener) = listener.take() {
        listener.shutdown().await;
    }

    let mut metadata = HashMap::new();
    metadata.insert("iterations_used".to_string(), iterations_used.to_string());
    metadata.insert("max_iterations".to_string(), pattern.max_iterations.to_string());
    metadata.insert("stage_count".to_string(), stage_count.to_string());
    metadata.insert("restarts_enabled".to_string(), "true".to_string());

    span.end();
    Ok(WorkflowResult {
        pattern_type: "iterative_pipeline".to_string(),
        agent_results: results,
        merged_output: final_output,
        metadata,
        duration_ms: started.elapsed().as_millis() as u64,
        cost,
        models_used,
    })
}
