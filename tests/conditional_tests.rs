use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use agentweave::agent_api::{AgentReply, WorkflowAgent};
use agentweave::orchestrator::Orchestrator;
use agentweave::pattern::{
    ConditionalPattern, ForkJoinPattern, MergeStrategy, WorkflowPattern,
};

struct MockAgent {
    name: String,
    response: String,
}

impl MockAgent {
    fn new(name: &str, response: &str) -> Self {
        Self {
            name: name.to_string(),
            response: response.to_string(),
        }
    }
}

#[async_trait]
impl WorkflowAgent for MockAgent {
    async fn chat(
        &self,
        _session_id: &str,
        _prompt: &str,
    ) -> Result<AgentReply, Box<dyn std::error::Error + Send + Sync>> {
        Ok(AgentReply::text(self.response.clone()))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn llm_model(&self) -> &str {
        "mock-model"
    }

    fn llm_provider_name(&self) -> &str {
        "mock"
    }
}

fn leaf(agent_id: &str) -> WorkflowPattern {
    WorkflowPattern::ForkJoin(ForkJoinPattern {
        name: format!("{}-branch", agent_id),
        agent_ids: vec![agent_id.to_string()],
        prompt: "handle it".to_string(),
        merge_strategy: MergeStrategy::First,
        timeout_seconds: 0,
    })
}

fn router(with_default: bool) -> WorkflowPattern {
    let mut branches = HashMap::new();
    branches.insert("bug".to_string(), leaf("bug-handler"));
    branches.insert("feature".to_string(), leaf("feature-handler"));
    WorkflowPattern::Conditional(ConditionalPattern {
        name: "triage".to_string(),
        condition_agent_id: "classifier".to_string(),
        condition_prompt: "Classify this ticket.".to_string(),
        branches,
        default_branch: with_default.then(|| Box::new(leaf("generalist"))),
    })
}

async fn orchestrator_with(classifier_reply: &str) -> Orchestrator {
    let orchestrator = Orchestrator::new();
    orchestrator
        .register_agent("classifier", Arc::new(MockAgent::new("classifier", classifier_reply)))
        .await;
    orchestrator
        .register_agent("bug-handler", Arc::new(MockAgent::new("bug-handler", "patched")))
        .await;
    orchestrator
        .register_agent(
            "feature-handler",
            Arc::new(MockAgent::new("feature-handler", "specced")),
        )
        .await;
    orchestrator
        .register_agent("generalist", Arc::new(MockAgent::new("generalist", "triaged")))
        .await;
    orchestrator
}

#[tokio::test]
async fn routes_on_exact_match() {
    let orchestrator = orchestrator_with("bug").await;
    let result = orchestrator.execute_pattern(&router(true)).await.unwrap();

    assert_eq!(result.pattern_type, "conditional");
    assert_eq!(result.metadata["selected_branch"], "bug");
    assert_eq!(result.metadata["condition_result"], "bug");
    assert_eq!(result.metadata["condition_agent"], "classifier");
    assert_eq!(result.metadata["branch_pattern"], "fork_join");
    assert_eq!(result.merged_output, "patched");
    assert_eq!(result.agent_results.len(), 1);
    assert_eq!(result.agent_results[0].agent_id, "bug-handler");
}

#[tokio::test]
async fn condition_result_is_trimmed_and_lowercased() {
    let orchestrator = orchestrator_with("  BUG  ").await;
    let result = orchestrator.execute_pattern(&router(true)).await.unwrap();
    assert_eq!(result.metadata["condition_result"], "bug");
    assert_eq!(result.metadata["selected_branch"], "bug");
}

#[tokio::test]
async fn routes_on_substring_containment() {
    let orchestrator = orchestrator_with("This looks like a feature request to me.").await;
    let result = orchestrator.execute_pattern(&router(true)).await.unwrap();
    assert_eq!(result.metadata["selected_branch"], "feature");
    assert_eq!(result.merged_output, "specced");
}

#[tokio::test]
async fn falls_back_to_default_branch() {
    let orchestrator = orchestrator_with("unclear").await;
    let result = orchestrator.execute_pattern(&router(true)).await.unwrap();
    assert_eq!(result.metadata["selected_branch"], "default");
    assert_eq!(result.merged_output, "triaged");
}

#[tokio::test]
async fn no_match_and_no_default_fails() {
    let orchestrator = orchestrator_with("unclear").await;
    let err = orchestrator.execute_pattern(&router(false)).await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("no branch matches"));
    assert!(message.contains("unclear"));
}

#[tokio::test]
async fn condition_call_is_billed_on_top_of_branch_cost() {
    let orchestrator = orchestrator_with("bug").await;
    let result = orchestrator.execute_pattern(&router(true)).await.unwrap();
    // One classifier call plus one branch agent call.
    assert_eq!(result.cost.llm_calls, 2);
    assert!(result.models_used.contains_key("classifier"));
    assert!(result.models_used.contains_key("bug-handler"));
}

#[tokio::test]
async fn nested_conditionals_dispatch_recursively() {
    let mut inner_branches = HashMap::new();
    inner_branches.insert("ui".to_string(), leaf("bug-handler"));
    let inner = WorkflowPattern::Conditional(ConditionalPattern {
        name: "inner".to_string(),
        condition_agent_id: "classifier2".to_string(),
        condition_prompt: "Which subsystem?".to_string(),
        branches: inner_branches,
        default_branch: None,
    });

    let mut outer_branches = HashMap::new();
    outer_branches.insert("bug".to_string(), inner);
    let outer = WorkflowPattern::Conditional(ConditionalPattern {
        name: "outer".to_string(),
        condition_agent_id: "classifier".to_string(),
        condition_prompt: "Classify.".to_string(),
        branches: outer_branches,
        default_branch: None,
    });

    let orchestrator = orchestrator_with("bug").await;
    orchestrator
        .register_agent("classifier2", Arc::new(MockAgent::new("classifier2", "ui")))
        .await;

    let result = orchestrator.execute_pattern(&outer).await.unwrap();
    assert_eq!(result.pattern_type, "conditional");
    assert_eq!(result.metadata["selected_branch"], "bug");
    assert_eq!(result.merged_output, "patched");
}
