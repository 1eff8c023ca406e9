//! Consumed LLM-provider interface.
//!
//! LLM-based merge strategies and pipeline validation need a raw chat surface
//! that is not tied to any particular agent.  [`LlmProvider`] is that seam:
//! a provider-agnostic request/response trait the engine calls with a small
//! message array and reads a single completion back from.
//!
//! The engine resolves a provider in two ways: an explicit one configured on
//! the [`Orchestrator`](crate::Orchestrator), or, failing that, one
//! volunteered by a registered agent through
//! [`WorkflowAgent::llm_for_role`](crate::agentweave::agent_api::WorkflowAgent::llm_for_role).

use crate::agentweave::agent_api::{BoxError, ChatUsage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Conversation roles understood by [`LlmProvider::chat`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderRole {
    /// A system authored message that primes or constrains assistant behaviour.
    System,
    /// A user authored message.
    User,
    /// An assistant authored message.
    Assistant,
}

/// A single message in a provider chat request.
#[derive(Debug, Clone)]
pub struct ProviderMessage {
    /// The role associated with the message.
    pub role: ProviderRole,
    /// The message body.
    pub content: String,
    /// When the message was created.  Merge calls stamp this at build time.
    pub timestamp: DateTime<Utc>,
}

impl ProviderMessage {
    /// Build a user-role message stamped with the current time.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ProviderRole::User,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Provider-agnostic tool schema forwarded along with a chat request.
///
/// Merge and validation calls never pass tools; the parameter exists so a
/// single provider implementation can serve both this engine and richer
/// agent runtimes.
#[derive(Debug, Clone)]
pub struct ProviderToolDefinition {
    /// Tool name as it will appear in the provider's `tools` array.
    pub name: String,
    /// Human-readable description surfaced to the LLM.
    pub description: String,
    /// JSON Schema object describing the accepted parameters.
    pub parameters_schema: serde_json::Value,
}

/// Response returned from [`LlmProvider::chat`].
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    /// The completion content.
    pub content: String,
    /// Token/cost accounting for the call, when the provider reports it.
    pub usage: Option<ChatUsage>,
}

/// Trait defining the interface to a raw chat-completion backend.
///
/// Implementations must be thread-safe; the engine shares providers behind
/// `Arc<dyn LlmProvider>` across concurrent merge calls.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a full request/response style chat completion.
    async fn chat(
        &self,
        messages: &[ProviderMessage],
        tools: Option<Vec<ProviderToolDefinition>>,
    ) -> Result<ProviderResponse, BoxError>;

    /// Name of the provider (e.g. `"anthropic"`).
    fn name(&self) -> &str;

    /// Identifier of the model served (e.g. `"claude-sonnet-4-5"`).
    fn model(&self) -> &str;
}
