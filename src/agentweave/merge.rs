//! Merge strategies.
//!
//! Reduces a set of [`AgentResult`]s to a single string.  `FIRST` and
//! `CONCATENATE` are deterministic string operations; the remaining
//! strategies build a single user message from a strategy-specific template
//! and return whatever the merge LLM replies.
//!
//! Labels follow the producing pattern: fork-join results are labeled by
//! agent id, parallel results prepend the task index
//! (`=== Agent 0-researcher ===`).

use std::sync::Arc;

use crate::agentweave::agent_api::{BoxError, ChatUsage};
use crate::agentweave::pattern::MergeStrategy;
use crate::agentweave::provider::{LlmProvider, ProviderMessage};
use crate::agentweave::result::AgentResult;

/// The product of a merge, including what the merge itself cost.
///
/// `llm_called` is true whenever an LLM-based strategy made a provider call;
/// `usage` is additionally present when that provider reported accounting.
/// Executors fold both into the workflow cost so merge calls are billed like
/// any other invocation.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// The reduced output string.
    pub output: String,
    /// Whether a merge LLM call was made.
    pub llm_called: bool,
    /// Token/cost accounting for the merge call, when reported.
    pub usage: Option<ChatUsage>,
}

impl MergeOutcome {
    fn deterministic(output: String) -> Self {
        Self {
            output,
            llm_called: false,
            usage: None,
        }
    }
}

/// Wire-stable uppercase name of a strategy, used in logs and errors.
pub fn strategy_name(strategy: MergeStrategy) -> &'static str {
    match strategy {
        MergeStrategy::First => "FIRST",
        MergeStrategy::Concatenate => "CONCATENATE",
        MergeStrategy::Consensus => "CONSENSUS",
        MergeStrategy::Voting => "VOTING",
        MergeStrategy::Summary => "SUMMARY",
        MergeStrategy::Best => "BEST",
    }
}

/// Label for one result: the agent id, with the task index prepended when
/// the result carries one.
fn result_label(result: &AgentResult) -> String {
    match result.metadata.get("task_index") {
        Some(index) => format!("{}-{}", index, result.agent_id),
        None => result.agent_id.clone(),
    }
}

/// Closing directive appended to each LLM merge template.
fn directive(strategy: MergeStrategy) -> &'static str {
    match strategy {
        MergeStrategy::Consensus => {
            "Synthesize the results above into a consensus view."
        }
        MergeStrategy::Voting => {
            "Identify which option is most convincing and explain why."
        }
        MergeStrategy::Summary => {
            "Provide a concise summary highlighting key points."
        }
        MergeStrategy::Best => {
            "Select and return the best result based on clarity, accuracy, and depth."
        }
        MergeStrategy::First | MergeStrategy::Concatenate => "",
    }
}

/// Reduce `results` according to `strategy`.
///
/// `original_prompt` is the prompt or topic the results answer; LLM-based
/// strategies prepend it so the merge model has the question in front of it.
/// Calling an LLM-based strategy without a provider fails the merge step.
pub async fn merge_results(
    strategy: MergeStrategy,
    original_prompt: &str,
    results: &[AgentResult],
    llm: Option<&Arc<dyn LlmProvider>>,
) -> Result<MergeOutcome, BoxError> {
    match strategy {
        MergeStrategy::First => Ok(MergeOutcome::deterministic(
            results
                .first()
                .map(|result| result.output.clone())
                .unwrap_or_default(),
        )),
        MergeStrategy::Concatenate => Ok(MergeOutcome::deterministic(
            results
                .iter()
                .map(|result| format!("=== Agent {} ===\n{}", result_label(result), result.output))
                .collect::<Vec<_>>()
                .join("\n\n"),
        )),
        MergeStrategy::Consensus
        | MergeStrategy::Voting
        | MergeStrategy::Summary
        | MergeStrategy::Best => {
            let llm = llm.ok_or_else(|| {
                Box::new(MergeError::ProviderMissing(strategy_name(strategy))) as BoxError
            })?;
            let prompt = build_llm_prompt(strategy, original_prompt, results);
            log::debug!(
                "merge: {} over {} results via {}/{}",
                strategy_name(strategy),
                results.len(),
                llm.name(),
                llm.model()
            );
            let response = llm.chat(&[ProviderMessage::user(prompt)], None).await?;
            Ok(MergeOutcome {
                output: response.content,
                llm_called: true,
                usage: response.usage,
            })
        }
    }
}

/// Build the single user message for an LLM-based merge.
fn build_llm_prompt(
    strategy: MergeStrategy,
    original_prompt: &str,
    results: &[AgentResult],
) -> String {
    let mut prompt = String::new();
    if !original_prompt.is_empty() {
        prompt.push_str("Original prompt:\n");
        prompt.push_str(original_prompt);
        prompt.push_str("\n\n");
    }
    for (index, result) in results.iter().enumerate() {
        prompt.push_str(&format!(
            "Result {} (Agent {}):\n{}\n\n",
            index + 1,
            result_label(result),
            result.output
        ));
    }
    prompt.push_str(directive(strategy));
    prompt
}

/// Errors produced by the merge layer.
#[derive(Debug, Clone)]
pub enum MergeError {
    /// An LLM-based strategy was requested but no provider is configured and
    /// no registered agent volunteers one.
    ProviderMissing(&'static str),
}

impl std::fmt::Display for MergeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeError::ProviderMissing(strategy) => {
                write!(f, "merge strategy {} requires an LLM provider", strategy)
            }
        }
    }
}

impl std::error::Error for MergeError {}
