use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use agentweave::agent_api::{AgentReply, ChatUsage, WorkflowAgent};
use agentweave::orchestrator::Orchestrator;
use agentweave::pattern::{DebatePattern, MergeStrategy, WorkflowPattern};

struct MockAgent {
    name: String,
    response: String,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl MockAgent {
    fn new(name: &str, response: &str) -> Self {
        Self {
            name: name.to_string(),
            response: response.to_string(),
            prompts: Arc::new(Mutex::new(Vec::new())),
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
        Ok(AgentReply::text(self.response.clone()).with_usage(ChatUsage {
            input_tokens: 2,
            output_tokens: 2,
            total_tokens: 4,
            cost_usd: 0.001,
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

fn debate(rounds: u32, moderator: Option<&str>) -> WorkflowPattern {
    WorkflowPattern::Debate(DebatePattern {
        name: "tabs-vs-spaces".to_string(),
        agent_ids: vec!["pro".to_string(), "con".to_string()],
        topic: "tabs or spaces".to_string(),
        rounds,
        moderator_id: moderator.map(|id| id.to_string()),
        merge_strategy: MergeStrategy::Concatenate,
    })
}

#[tokio::test]
async fn results_are_flat_ordered_by_round_then_agent() {
    let orchestrator = Orchestrator::new();
    orchestrator
        .register_agent("pro", Arc::new(MockAgent::new("pro", "tabs!")))
        .await;
    orchestrator
        .register_agent("con", Arc::new(MockAgent::new("con", "spaces!")))
        .await;

    let result = orchestrator.execute_pattern(&debate(2, None)).await.unwrap();

    assert_eq!(result.pattern_type, "debate");
    assert_eq!(result.agent_results.len(), 4);
    let order: Vec<(String, String)> = result
        .agent_results
        .iter()
        .map(|r| (r.metadata["round"].clone(), r.agent_id.clone()))
        .collect();
    assert_eq!(
        order,
        vec![
            ("1".to_string(), "pro".to_string()),
            ("1".to_string(), "con".to_string()),
            ("2".to_string(), "pro".to_string()),
            ("2".to_string(), "con".to_string()),
        ]
    );
    assert_eq!(result.cost.llm_calls, 4);
}

#[tokio::test]
async fn later_rounds_carry_prior_arguments() {
    let pro = Arc::new(MockAgent::new("pro", "tabs are semantic"));
    let con = Arc::new(MockAgent::new("con", "spaces are uniform"));
    let con_prompts = con.prompts.clone();
    let pro_prompts = pro.prompts.clone();

    let orchestrator = Orchestrator::new();
    orchestrator.register_agent("pro", pro).await;
    orchestrator.register_agent("con", con).await;

    orchestrator.execute_pattern(&debate(2, None)).await.unwrap();

    // First speaker of round 1 has no prior arguments.
    let first = pro_prompts.lock().unwrap()[0].clone();
    assert!(first.contains("Round 1"));
    assert!(!first.contains("Arguments so far"));

    // Second speaker of round 1 sees the first speaker.
    let second = con_prompts.lock().unwrap()[0].clone();
    assert!(second.contains("[pro]: tabs are semantic"));

    // Round 2 sees everything from round 1.
    let third = pro_prompts.lock().unwrap()[1].clone();
    assert!(third.contains("Round 2"));
    assert!(third.contains("[con]: spaces are uniform"));
}

#[tokio::test]
async fn moderator_synthesis_rides_in_metadata() {
    let orchestrator = Orchestrator::new();
    orchestrator
        .register_agent("pro", Arc::new(MockAgent::new("pro", "tabs!")))
        .await;
    orchestrator
        .register_agent("con", Arc::new(MockAgent::new("con", "spaces!")))
        .await;
    let moderator = Arc::new(MockAgent::new("mod", "use an autoformatter"));
    let moderator_prompts = moderator.prompts.clone();
    orchestrator.register_agent("mod", moderator).await;

    let result = orchestrator
        .execute_pattern(&debate(1, Some("mod")))
        .await
        .unwrap();

    // The moderator is not a debater result.
    assert_eq!(result.agent_results.len(), 2);
    assert!(result.agent_results.iter().all(|r| r.agent_id != "mod"));
    assert_eq!(result.metadata["moderator"], "mod");
    assert_eq!(result.metadata["moderator_synthesis"], "use an autoformatter");
    // But its invocation is billed.
    assert_eq!(result.cost.llm_calls, 3);
    assert!(result.cost.agent_costs_usd.contains_key("mod"));

    let prompt = moderator_prompts.lock().unwrap()[0].clone();
    assert!(prompt.contains("[pro]: tabs!"));
    assert!(prompt.contains("[con]: spaces!"));
}
