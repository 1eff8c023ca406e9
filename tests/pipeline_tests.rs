use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use agentweave::agent_api::{AgentReply, ChatUsage, WorkflowAgent};
use agentweave::orchestrator::Orchestrator;
use agentweave::pattern::{PipelinePattern, PipelineStage, WorkflowPattern};
use agentweave::provider::{LlmProvider, ProviderMessage, ProviderResponse, ProviderToolDefinition};

struct MockAgent {
    name: String,
    response: String,
    fail: bool,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl MockAgent {
    fn new(name: &str, response: &str) -> Self {
        Self {
            name: name.to_string(),
            response: response.to_string(),
            fail: false,
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn failing(name: &str) -> Self {
        Self {
            fail: true,
            ..Self::new(name, "")
        }
    }
}

#[async_trait]
impl WorkflowAgent for MockAgent {
    async fn chat(
        &self,
        _session_id: &str,
        prompt: &str,
    ) -> Result<AgentReply, Box<dyn std::error::Error + Send + Sync>> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if self.fail {
            return Err("provider unreachable".into());
        }
        Ok(AgentReply::text(self.response.clone()).with_usage(ChatUsage {
            input_tokens: 10,
            output_tokens: 5,
            total_tokens: 15,
            cost_usd: 0.01,
        }))
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

struct ApprovingLlm {
    reply: String,
    prompts: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl LlmProvider for ApprovingLlm {
    async fn chat(
        &self,
        messages: &[ProviderMessage],
        _tools: Option<Vec<ProviderToolDefinition>>,
    ) -> Result<ProviderResponse, Box<dyn std::error::Error + Send + Sync>> {
        self.prompts
            .lock()
            .unwrap()
            .push(messages[0].content.clone());
        Ok(ProviderResponse {
            content: self.reply.clone(),
            usage: Some(ChatUsage {
                input_tokens: 5,
                output_tokens: 2,
                total_tokens: 7,
                cost_usd: 0.004,
            }),
        })
    }

    fn name(&self) -> &str {
        "mock-llm"
    }

    fn model(&self) -> &str {
        "mock-merge-model"
    }
}

fn three_stage_pattern() -> WorkflowPattern {
    WorkflowPattern::Pipeline(
        PipelinePattern::new("triad", "seed")
            .with_stage(PipelineStage::new("a", "{{previous}}"))
            .with_stage(PipelineStage::new("b", "{{previous}}"))
            .with_stage(PipelineStage::new("c", "{{previous}}")),
    )
}

#[tokio::test]
async fn pipeline_happy_path() {
    let _ = env_logger::builder().is_test(true).try_init();
    let orchestrator = Orchestrator::new();
    orchestrator
        .register_agent("a", Arc::new(MockAgent::new("a", "out-a")))
        .await;
    orchestrator
        .register_agent("b", Arc::new(MockAgent::new("b", "out-b")))
        .await;
    orchestrator
        .register_agent("c", Arc::new(MockAgent::new("c", "out-c")))
        .await;

    let result = orchestrator
        .execute_pattern(&three_stage_pattern())
        .await
        .unwrap();

    assert_eq!(result.pattern_type, "pipeline");
    assert_eq!(result.agent_results.len(), 3);
    let stages: Vec<&str> = result
        .agent_results
        .iter()
        .map(|r| r.metadata["stage"].as_str())
        .collect();
    assert_eq!(stages, vec!["1", "2", "3"]);
    assert_eq!(result.merged_output, "out-c");
    assert_eq!(result.cost.llm_calls, 3);
    assert_eq!(result.cost.total_tokens, 45);
    assert_eq!(result.metadata["stage_count"], "3");
    assert_eq!(result.models_used["b"], "mock-model");
}

#[tokio::test]
async fn stage_two_sees_stage_one_output() {
    let agent_a = Arc::new(MockAgent::new("a", "alpha says hi"));
    let agent_b = Arc::new(MockAgent::new("b", "beta"));
    let prompts_a = agent_a.prompts.clone();
    let prompts_b = agent_b.prompts.clone();

    let orchestrator = Orchestrator::new();
    orchestrator.register_agent("a", agent_a).await;
    orchestrator.register_agent("b", agent_b).await;

    let pattern = WorkflowPattern::Pipeline(
        PipelinePattern::new("pair", "the seed prompt")
            .with_stage(PipelineStage::new("a", "First: {{previous}}"))
            .with_stage(PipelineStage::new("b", "Refine: {{previous}}\nAll: {{history}}")),
    );
    orchestrator.execute_pattern(&pattern).await.unwrap();

    assert_eq!(prompts_a.lock().unwrap()[0], "First: the seed prompt");
    let second = prompts_b.lock().unwrap()[0].clone();
    assert!(second.contains("Refine: alpha says hi"));
    assert!(second.contains("Stage 1 output:\nalpha says hi"));
}

#[tokio::test]
async fn pass_full_history_appends_when_template_has_no_placeholders() {
    let agent_a = Arc::new(MockAgent::new("a", "first result"));
    let agent_b = Arc::new(MockAgent::new("b", "second result"));
    let prompts_b = agent_b.prompts.clone();

    let orchestrator = Orchestrator::new();
    orchestrator.register_agent("a", agent_a).await;
    orchestrator.register_agent("b", agent_b).await;

    let pattern = WorkflowPattern::Pipeline(
        PipelinePattern::new("hist", "seed")
            .with_stage(PipelineStage::new("a", "{{previous}}"))
            .with_stage(PipelineStage::new("b", "Just do the thing."))
            .with_full_history(),
    );
    orchestrator.execute_pattern(&pattern).await.unwrap();

    let prompt = prompts_b.lock().unwrap()[0].clone();
    assert!(prompt.starts_with("Just do the thing."));
    assert!(prompt.contains("Stage 1 output:\nfirst result"));
}

#[tokio::test]
async fn missing_agent_fails_fast() {
    let orchestrator = Orchestrator::new();
    orchestrator
        .register_agent("a", Arc::new(MockAgent::new("a", "out")))
        .await;

    let err = orchestrator
        .execute_pattern(&three_stage_pattern())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Agent not found: b"));
}

#[tokio::test]
async fn stage_failure_fails_the_pipeline() {
    let orchestrator = Orchestrator::new();
    orchestrator
        .register_agent("a", Arc::new(MockAgent::new("a", "out-a")))
        .await;
    orchestrator
        .register_agent("b", Arc::new(MockAgent::failing("b")))
        .await;
    orchestrator
        .register_agent("c", Arc::new(MockAgent::new("c", "out-c")))
        .await;

    let err = orchestrator
        .execute_pattern(&three_stage_pattern())
        .await
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("stage 2"));
    assert!(message.contains("'b'"));
    assert!(message.contains("provider unreachable"));
}

#[tokio::test]
async fn validation_prompt_runs_through_merge_llm() {
    let llm_prompts = Arc::new(Mutex::new(Vec::new()));
    let orchestrator = Orchestrator::new().with_merge_llm(Arc::new(ApprovingLlm {
        reply: "VALID".to_string(),
        prompts: llm_prompts.clone(),
    }));
    orchestrator
        .register_agent("a", Arc::new(MockAgent::new("a", "the draft")))
        .await;

    let pattern = WorkflowPattern::Pipeline(
        PipelinePattern::new("checked", "seed").with_stage(
            PipelineStage::new("a", "{{previous}}")
                .with_validation("Is this acceptable? {{output}}"),
        ),
    );
    let result = orchestrator.execute_pattern(&pattern).await.unwrap();

    assert_eq!(result.merged_output, "the draft");
    let sent = llm_prompts.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0], "Is this acceptable? the draft");

    // The validation call is billed alongside the stage call.
    assert_eq!(result.cost.llm_calls, 2);
    assert_eq!(result.cost.total_tokens, 15 + 7);
    assert!((result.cost.agent_costs_usd["mock-llm"] - 0.004).abs() < 1e-12);
}

#[tokio::test]
async fn failed_validation_is_not_fatal() {
    let orchestrator = Orchestrator::new().with_merge_llm(Arc::new(ApprovingLlm {
        reply: "this output is unacceptable".to_string(),
        prompts: Arc::new(Mutex::new(Vec::new())),
    }));
    orchestrator
        .register_agent("a", Arc::new(MockAgent::new("a", "the draft")))
        .await;

    let pattern = WorkflowPattern::Pipeline(
        PipelinePattern::new("checked", "seed").with_stage(
            PipelineStage::new("a", "{{previous}}").with_validation("Check: {{output}}"),
        ),
    );
    let result = orchestrator.execute_pattern(&pattern).await.unwrap();
    assert_eq!(result.merged_output, "the draft");
}

#[tokio::test]
async fn variables_are_interpolated_before_dispatch() {
    let agent = Arc::new(MockAgent::new("a", "done"));
    let prompts = agent.prompts.clone();

    let orchestrator = Orchestrator::new();
    orchestrator.register_agent("a", agent).await;

    let pattern = WorkflowPattern::Pipeline(
        PipelinePattern::new("vars", "analyze {{target}}")
            .with_stage(PipelineStage::new("a", "{{previous}} carefully")),
    );
    let mut vars = HashMap::new();
    vars.insert("target".to_string(), "the login flow".to_string());
    orchestrator
        .execute_with_variables(&pattern, &vars)
        .await
        .unwrap();

    assert_eq!(prompts.lock().unwrap()[0], "analyze the login flow carefully");
}
