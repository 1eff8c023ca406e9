//! Swarm voting executor.
//!
//! Every agent casts a structured vote over the question.  With
//! `share_votes` set, voting is sequential in configuration order and each
//! voter sees the votes cast so far; otherwise all voters run concurrently
//! with identical prompts.  Aggregation follows the configured
//! [`VotingStrategy`]; count ties can be broken by an optional judge agent
//! whose reply must name one of the tied choices.

use std::collections::HashMap;
use std::time::Instant;

use futures_util::future::join_all;

use crate::agentweave::agent_api::BoxError;
use crate::agentweave::orchestrator::{Orchestrator, WorkflowError};
use crate::agentweave::pattern::{SwarmPattern, VotingStrategy};
use crate::agentweave::result::{AgentResult, WorkflowCost, WorkflowResult};

use super::{invoke_agent, new_workflow_id, session_id};

/// One parsed ballot.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Vote {
    pub agent_id: String,
    pub choice: String,
    pub confidence: f64,
    pub reasoning: String,
}

/// Case-insensitive check that a line starts a labeled field, returning the
/// remainder after the label.  Labels are ASCII, so a byte-level match keeps
/// the split on a char boundary.
fn labeled<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    let trimmed = line.trim_start();
    let bytes = trimmed.as_bytes();
    let label = label.as_bytes();
    if bytes.len() >= label.len() && bytes[..label.len()].eq_ignore_ascii_case(label) {
        Some(trimmed[label.len()..].trim())
    } else {
        None
    }
}

fn is_any_label(line: &str) -> bool {
    labeled(line, "VOTE:").is_some()
        || labeled(line, "CONFIDENCE:").is_some()
        || labeled(line, "REASONING:").is_some()
}

/// Parse a ballot out of free-form voter text.
///
/// Recognizes three labeled lines, case-insensitively: `VOTE:<choice>`,
/// `CONFIDENCE:<float>`, `REASONING:<text>` (reasoning may continue on
/// subsequent lines until another label).  A missing vote becomes
/// `abstain`; a missing or out-of-range confidence becomes `0.5`.
pub(crate) fn parse_vote(agent_id: &str, text: &str) -> Vote {
    let mut choice: Option<String> = None;
    let mut confidence: Option<f64> = None;
    let mut reasoning = String::new();
    let mut in_reasoning = false;

    for line in text.lines() {
        if let Some(value) = labeled(line, "VOTE:") {
            choice = Some(value.to_string());
            in_reasoning = false;
        } else if let Some(value) = labeled(line, "CONFIDENCE:") {
            confidence = value.parse::<f64>().ok();
            in_reasoning = false;
        } else if let Some(value) = labeled(line, "REASONING:") {
            reasoning = value.to_string();
            in_reasoning = true;
        } else if in_reasoning && !is_any_label(line) {
            if !reasoning.is_empty() {
                reasoning.push('\n');
            }
            reasoning.push_str(line);
        }
    }

    let confidence = match confidence {
        Some(value) if (0.0..=1.0).contains(&value) => value,
        _ => 0.5,
    };

    Vote {
        agent_id: agent_id.to_string(),
        choice: choice.filter(|c| !c.is_empty()).unwrap_or_else(|| "abstain".to_string()),
        confidence,
        reasoning,
    }
}

/// Per-choice tallies in first-appearance order.
#[derive(Debug)]
struct Tally {
    choice: String,
    count: usize,
    confidence_sum: f64,
}

fn tally_votes(votes: &[Vote]) -> Vec<Tally> {
    let mut tallies: Vec<Tally> = Vec::new();
    for vote in votes {
        match tallies.iter_mut().find(|t| t.choice == vote.choice) {
            Some(tally) => {
                tally.count += 1;
                tally.confidence_sum += vote.confidence;
            }
            None => tallies.push(Tally {
                choice: vote.choice.clone(),
                count: 1,
                confidence_sum: vote.confidence,
            }),
        }
    }
    tallies
}

fn strategy_label(strategy: VotingStrategy) -> &'static str {
    match strategy {
        VotingStrategy::Majority => "MAJORITY",
        VotingStrategy::Supermajority => "SUPERMAJORITY",
        VotingStrategy::Unanimous => "UNANIMOUS",
        VotingStrategy::Weighted => "WEIGHTED",
        VotingStrategy::RankedChoice => "RANKED_CHOICE",
    }
}

/// Outcome of vote aggregation, before any judge tie-break.
#[derive(Debug)]
pub(crate) struct VoteOutcome {
    pub winner: String,
    pub winner_votes: usize,
    pub threshold_met: bool,
    /// All choices sharing the maximum count (len > 1 means a count tie).
    pub tied_choices: Vec<String>,
}

/// Aggregate votes under a strategy.  Winners are decided by count (or by
/// summed confidence for ranked choice), with first-appearance order
/// breaking exact ties.
pub(crate) fn aggregate_votes(
    votes: &[Vote],
    strategy: VotingStrategy,
    confidence_threshold: f64,
) -> VoteOutcome {
    let total = votes.len();
    let tallies = tally_votes(votes);

    if strategy == VotingStrategy::RankedChoice {
        let best_sum = tallies
            .iter()
            .map(|t| t.confidence_sum)
            .fold(f64::MIN, f64::max);
        let winner = tallies
            .iter()
            .find(|t| t.confidence_sum == best_sum)
            .expect("non-empty tallies");
        return VoteOutcome {
            winner: winner.choice.clone(),
            winner_votes: winner.count,
            threshold_met: best_sum > total as f64 / 2.0,
            tied_choices: vec![winner.choice.clone()],
        };
    }

    let max_count = tallies.iter().map(|t| t.count).max().unwrap_or(0);
    let tied_choices: Vec<String> = tallies
        .iter()
        .filter(|t| t.count == max_count)
        .map(|t| t.choice.clone())
        .collect();
    let winner = tied_choices[0].clone();

    let threshold_met = match strategy {
        VotingStrategy::Majority => max_count * 2 > total,
        VotingStrategy::Supermajority => max_count >= (2 * total) / 3,
        VotingStrategy::Unanimous => max_count == total,
        VotingStrategy::Weighted => {
            let winners: Vec<&Vote> = votes.iter().filter(|v| v.choice == winner).collect();
            let mean = winners.iter().map(|v| v.confidence).sum::<f64>() / winners.len() as f64;
            mean >= confidence_threshold
        }
        VotingStrategy::RankedChoice => unreachable!(),
    };

    VoteOutcome {
        winner,
        winner_votes: max_count,
        threshold_met,
        tied_choices,
    }
}

/// Truncate reasoning for shared-vote prompts (char-safe, max 100).
fn brief_reasoning(reasoning: &str) -> String {
    if reasoning.chars().count() <= 100 {
        reasoning.to_string()
    } else {
        reasoning.chars().take(100).collect()
    }
}

fn ballot_instructions() -> &'static str {
    "Respond with exactly:\n\
     VOTE: <your choice>\n\
     CONFIDENCE: <a number between 0.0 and 1.0>\n\
     REASONING: <why you voted this way>"
}

fn voting_prompt(question: &str, prior_votes: &[Vote]) -> String {
    if prior_votes.is_empty() {
        format!("{}\n\n{}", question, ballot_instructions())
    } else {
        let shared = prior_votes
            .iter()
            .map(|vote| {
                format!(
                    "- {}: {} (confidence {:.2}): {}",
                    vote.agent_id,
                    vote.choice,
                    vote.confidence,
                    brief_reasoning(&vote.reasoning)
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "{}\n\nVotes cast so far:\n{}\n\n{}",
            question,
            shared,
            ballot_instructions()
        )
    }
}

pub async fn execute(
    orchestrator: &Orchestrator,
    pattern: &SwarmPattern,
) -> Result<WorkflowResult, BoxError> {
    if pattern.agent_ids.is_empty() {
        return Err(Box::new(WorkflowError::InvalidPattern(format!(
            "swarm '{}' has no voters",
            pattern.name
        ))));
    }
    let mut referenced = pattern.agent_ids.clone();
    if let Some(judge_id) = &pattern.judge_agent_id {
        referenced.push(judge_id.clone());
    }
    orchestrator.require_agents(&referenced).await?;

    let workflow_id = new_workflow_id("swarm");
    let mut span = orchestrator.tracer().start_span("workflow.swarm");
    span.set_attribute("workflow_id", &workflow_id);
    span.set_attribute("voter_count", &pattern.agent_ids.len().to_string());

    let started = Instant::now();
    let mut results: Vec<AgentResult> = Vec::new();
    let mut votes: Vec<Vote> = Vec::new();
    let mut cost = WorkflowCost::default();
    let mut models_used = HashMap::new();

    orchestrator.emit_progress(
        "swarm",
        &format!("collecting {} votes", pattern.agent_ids.len()),
        20.0,
        None,
        &results,
    );

    if pattern.share_votes {
        // Collaborative: configuration order defines voting order and each
        // voter sees what came before.
        for agent_id in &pattern.agent_ids {
            let agent = orchestrator.require_agent(agent_id).await?;
            let session = session_id(&workflow_id, "voter", agent_id);
            let prompt = voting_prompt(&pattern.question, &votes);
            let result = invoke_agent(&agent, agent_id, &session, &prompt).await;
            models_used.insert(agent_id.clone(), agent.llm_model().to_string());
            cost.absorb(&result);
            if !result.is_error() {
                votes.push(parse_vote(agent_id, &result.output));
            }
            results.push(result);
        }
    } else {
        // Independent: all voters see the identical prompt, concurrently.
        let prompt = voting_prompt(&pattern.question, &[]);
        let mut calls = Vec::new();
        for agent_id in &pattern.agent_ids {
            let agent = orchestrator.require_agent(agent_id).await?;
            models_used.insert(agent_id.clone(), agent.llm_model().to_string());
            let session = session_id(&workflow_id, "voter", agent_id);
            let prompt = prompt.clone();
            let agent_id = agent_id.clone();
            calls.push(async move {
                let result = invoke_agent(&agent, &agent_id, &session, &prompt).await;
                (agent_id, result)
            });
        }
        for (agent_id, result) in join_all(calls).await {
            cost.absorb(&result);
            if !result.is_error() {
                votes.push(parse_vote(&agent_id, &result.output));
            }
            results.push(result);
        }
    }

    if votes.is_empty() {
        span.end();
        return Err(Box::new(WorkflowError::ExecutionFailed(format!(
            "swarm '{}': all voters failed",
            pattern.name
        ))));
    }

    let outcome = aggregate_votes(&votes, pattern.voting_strategy, pattern.confidence_threshold);
    let mut winner = outcome.winner.clone();

    // Count tie with a configured judge: let the judge pick among the tied
    // choices; a reply outside the tied set is rejected and the original
    // choice stands.
    if outcome.tied_choices.len() > 1 {
        if let Some(judge_id) = &pattern.judge_agent_id {
            let judge = orchestrator.require_agent(judge_id).await?;
            let session = session_id(&workflow_id, "judge", judge_id);
            let ballots = votes
                .iter()
                .map(|vote| {
                    format!(
                        "- {}: {} (confidence {:.2}): {}",
                        vote.agent_id, vote.choice, vote.confidence, vote.reasoning
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");
            let prompt = format!(
                "{}\n\nThe vote is tied between: {}.\n\nAll votes:\n{}\n\n\
                 Reply with exactly one of the tied options.",
                pattern.question,
                outcome.tied_choices.join(", "),
                ballots
            );
            let judge_result = invoke_agent(&judge, judge_id, &session, &prompt).await;
            models_used.insert(judge_id.clone(), judge.llm_model().to_string());
            cost.absorb(&judge_result);
            if !judge_result.is_error() {
                let verdict = judge_result.output.trim().to_string();
                if outcome.tied_choices.iter().any(|choice| choice == &verdict) {
                    winner = verdict;
                } else {
                    log::warn!(
                        "swarm '{}': judge '{}' picked '{}', not among tied options {:?}; \
                         keeping '{}'",
                        pattern.name,
                        judge_id,
                        verdict,
                        outcome.tied_choices,
                        winner
                    );
                }
            }
        }
    }

    let consensus_analysis = format!(
        "{}/{} votes for '{}' under {}; threshold met: {}",
        outcome.winner_votes,
        votes.len(),
        winner,
        strategy_label(pattern.voting_strategy),
        outcome.threshold_met
    );

    let mut metadata = HashMap::new();
    metadata.insert("winning_choice".to_string(), winner.clone());
    metadata.insert("threshold_met".to_string(), outcome.threshold_met.to_string());
    metadata.insert("consensus_analysis".to_string(), consensus_analysis);
    metadata.insert(
        "voting_strategy".to_string(),
        strategy_label(pattern.voting_strategy).to_string(),
    );
    metadata.insert("share_votes".to_string(), pattern.share_votes.to_string());

    span.end();
    Ok(WorkflowResult {
        pattern_type: "swarm".to_string(),
        agent_results: results,
        merged_output: winner,
        metadata,
        duration_ms: started.elapsed().as_millis() as u64,
        cost,
        models_used,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(agent_id: &str, choice: &str, confidence: f64) -> Vote {
        Vote {
            agent_id: agent_id.to_string(),
            choice: choice.to_string(),
            confidence,
            reasoning: String::new(),
        }
    }

    #[test]
    fn parse_vote_happy_path() {
        let parsed = parse_vote(
            "v1",
            "VOTE: Postgres\nCONFIDENCE: 0.9\nREASONING: battle tested\nand boring",
        );
        assert_eq!(parsed.choice, "Postgres");
        assert_eq!(parsed.confidence, 0.9);
        assert_eq!(parsed.reasoning, "battle tested\nand boring");
    }

    #[test]
    fn parse_vote_is_case_insensitive() {
        let parsed = parse_vote("v1", "vote: Mongo\nconfidence: 0.4\nreasoning: flexible");
        assert_eq!(parsed.choice, "Mongo");
        assert_eq!(parsed.confidence, 0.4);
    }

    #[test]
    fn missing_vote_is_abstain() {
        let parsed = parse_vote("v1", "I cannot decide.");
        assert_eq!(parsed.choice, "abstain");
        assert_eq!(parsed.confidence, 0.5);
    }

    #[test]
    fn out_of_range_confidence_defaults() {
        let parsed = parse_vote("v1", "VOTE: a\nCONFIDENCE: 1.5\nREASONING: sure");
        assert_eq!(parsed.confidence, 0.5);
        let parsed = parse_vote("v1", "VOTE: a\nCONFIDENCE: definitely\nREASONING: sure");
        assert_eq!(parsed.confidence, 0.5);
    }

    #[test]
    fn majority_threshold() {
        let votes = vec![vote("a", "x", 0.8), vote("b", "x", 0.8), vote("c", "y", 0.9)];
        let outcome = aggregate_votes(&votes, VotingStrategy::Majority, 0.0);
        assert_eq!(outcome.winner, "x");
        assert!(outcome.threshold_met);
        assert_eq!(outcome.tied_choices, vec!["x"]);

        let split = vec![vote("a", "x", 0.8), vote("b", "y", 0.8)];
        let outcome = aggregate_votes(&split, VotingStrategy::Majority, 0.0);
        assert!(!outcome.threshold_met);
        assert_eq!(outcome.tied_choices.len(), 2);
    }

    #[test]
    fn supermajority_threshold() {
        let votes = vec![
            vote("a", "x", 0.5),
            vote("b", "x", 0.5),
            vote("c", "y", 0.5),
        ];
        let outcome = aggregate_votes(&votes, VotingStrategy::Supermajority, 0.0);
        assert!(outcome.threshold_met); // 2 >= floor(6/3)

        let votes = vec![
            vote("a", "x", 0.5),
            vote("b", "y", 0.5),
            vote("c", "z", 0.5),
        ];
        let outcome = aggregate_votes(&votes, VotingStrategy::Supermajority, 0.0);
        assert!(!outcome.threshold_met);
    }

    #[test]
    fn unanimous_threshold() {
        let votes = vec![vote("a", "x", 0.5), vote("b", "x", 0.5)];
        assert!(aggregate_votes(&votes, VotingStrategy::Unanimous, 0.0).threshold_met);
        let votes = vec![vote("a", "x", 0.5), vote("b", "y", 0.5)];
        assert!(!aggregate_votes(&votes, VotingStrategy::Unanimous, 0.0).threshold_met);
    }

    #[test]
    fn weighted_uses_mean_winner_confidence() {
        let votes = vec![vote("a", "x", 0.9), vote("b", "x", 0.7), vote("c", "y", 1.0)];
        let outcome = aggregate_votes(&votes, VotingStrategy::Weighted, 0.75);
        assert_eq!(outcome.winner, "x");
        assert!(outcome.threshold_met); // mean(0.9, 0.7) = 0.8

        let outcome = aggregate_votes(&votes, VotingStrategy::Weighted, 0.85);
        assert!(!outcome.threshold_met);
    }

    #[test]
    fn ranked_choice_sums_confidence() {
        let votes = vec![
            vote("a", "x", 0.9),
            vote("b", "y", 0.6),
            vote("c", "y", 0.6),
        ];
        let outcome = aggregate_votes(&votes, VotingStrategy::RankedChoice, 0.0);
        assert_eq!(outcome.winner, "y"); // 1.2 > 0.9
        assert!(!outcome.threshold_met); // 1.2 <= 3/2

        let votes = vec![vote("a", "x", 0.9), vote("b", "x", 0.9), vote("c", "y", 0.1)];
        let outcome = aggregate_votes(&votes, VotingStrategy::RankedChoice, 0.0);
        assert_eq!(outcome.winner, "x");
        assert!(outcome.threshold_met); // 1.8 > 1.5
    }

    #[test]
    fn count_ties_keep_first_appearance_order() {
        let votes = vec![
            vote("a", "Postgres", 0.8),
            vote("b", "Mongo", 0.8),
            vote("c", "Postgres", 0.8),
            vote("d", "Mongo", 0.8),
        ];
        let outcome = aggregate_votes(&votes, VotingStrategy::Majority, 0.0);
        assert_eq!(outcome.winner, "Postgres");
        assert_eq!(outcome.tied_choices, vec!["Postgres", "Mongo"]);
    }

    #[test]
    fn shared_prompt_truncates_reasoning() {
        let long_reasoning = "r".repeat(300);
        let votes = vec![Vote {
            agent_id: "a".to_string(),
            choice: "x".to_string(),
            confidence: 0.9,
            reasoning: long_reasoning,
        }];
        let prompt = voting_prompt("q", &votes);
        assert!(prompt.contains(&"r".repeat(100)));
        assert!(!prompt.contains(&"r".repeat(101)));
    }
}
