//! Consumed message-bus interface and the restart wire format.
//!
//! Iterative pipelines coordinate restarts over a pub/sub bus rather than
//! shared state: the executor owns the only consumer of restart requests and
//! the bus is the only publisher surface.  This module defines the
//! [`MessageBus`] trait the engine consumes, the [`BusMessage`] envelope, and
//! the serde types for restart requests and responses.
//!
//! # Wire format
//!
//! Restart requests travel on topic `"workflow.restart"` (configurable per
//! pattern); responses are published to
//! `"workflow.restart.response.<requester_id>"`.  The JSON-encoded
//! [`RestartRequest`] / [`RestartResponse`] rides in `payload.value`, and
//! `metadata["type"]` is `"restart_request"` or `"restart_response"`.

use crate::agentweave::agent_api::BoxError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Default topic on which iterative pipelines listen for restart requests.
pub const RESTART_TOPIC: &str = "workflow.restart";

/// Topic prefix for restart responses; the requester stage id is appended.
pub const RESTART_RESPONSE_TOPIC_PREFIX: &str = "workflow.restart.response.";

/// Metadata type tag carried by restart request messages.
pub const MESSAGE_TYPE_RESTART_REQUEST: &str = "restart_request";

/// Metadata type tag carried by restart response messages.
pub const MESSAGE_TYPE_RESTART_RESPONSE: &str = "restart_response";

/// A request from a downstream stage to restart an earlier stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestartRequest {
    /// Stage id of the requester (the stage asking for the rewind).
    pub requester_stage_id: String,
    /// Stage id to rewind execution to.
    pub target_stage_id: String,
    /// Free-form reason, surfaced in logs and responses.
    pub reason: String,
    /// The requester's view of the current iteration number.
    pub iteration: u32,
    /// Milliseconds since the Unix epoch when the request was created.
    pub timestamp_ms: i64,
}

/// The executor's verdict on a [`RestartRequest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestartResponse {
    /// Echo of the requested target stage id.
    pub target_stage_id: String,
    /// Whether the restart was accepted.
    pub success: bool,
    /// Rejection reason when `success` is false, empty otherwise.
    #[serde(default)]
    pub error: String,
    /// The iteration counter after the decision.
    pub iteration: u32,
}

/// Payload wrapper: the JSON-encoded request/response rides in `value`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusPayload {
    /// JSON encoding of the typed payload.
    #[serde(default)]
    pub value: String,
}

/// Envelope for everything that crosses the bus.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusMessage {
    /// Topic the message was (or is to be) published on.
    pub topic: String,
    /// Typed payload, JSON-encoded in [`BusPayload::value`].
    pub payload: BusPayload,
    /// Envelope metadata; `"type"` discriminates the payload kind.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl BusMessage {
    /// Wrap a [`RestartRequest`] for publication on the given topic.
    pub fn restart_request(topic: &str, request: &RestartRequest) -> Result<Self, BoxError> {
        let mut metadata = HashMap::new();
        metadata.insert("type".to_string(), MESSAGE_TYPE_RESTART_REQUEST.to_string());
        Ok(Self {
            topic: topic.to_string(),
            payload: BusPayload {
                value: serde_json::to_string(request)?,
            },
            metadata,
        })
    }

    /// Wrap a [`RestartResponse`] addressed to the requester's response topic.
    pub fn restart_response(requester_id: &str, response: &RestartResponse) -> Result<Self, BoxError> {
        let mut metadata = HashMap::new();
        metadata.insert("type".to_string(), MESSAGE_TYPE_RESTART_RESPONSE.to_string());
        Ok(Self {
            topic: format!("{}{}", RESTART_RESPONSE_TOPIC_PREFIX, requester_id),
            payload: BusPayload {
                value: serde_json::to_string(response)?,
            },
            metadata,
        })
    }

    /// Decode the payload as a [`RestartRequest`].
    ///
    /// Returns `None` when the metadata type tag is present but names a
    /// different payload kind; returns an error for a malformed payload.
    pub fn decode_restart_request(&self) -> Result<Option<RestartRequest>, BoxError> {
        if let Some(kind) = self.metadata.get("type") {
            if kind != MESSAGE_TYPE_RESTART_REQUEST {
                return Ok(None);
            }
        }
        let request = serde_json::from_str(&self.payload.value)?;
        Ok(Some(request))
    }
}

/// A live subscription handed back by [`MessageBus::subscribe`].
///
/// Messages arrive on `receiver`.  The channel's capacity is the `buffer`
/// passed at subscribe time; a bus implementation that cannot enqueue (full
/// buffer) is expected to drop the message rather than block publishers.
pub struct Subscription {
    /// Bus-assigned subscription id, used for [`MessageBus::unsubscribe`].
    pub id: String,
    /// Stream of matching messages.
    pub receiver: mpsc::Receiver<BusMessage>,
}

/// Trait defining the pub/sub surface the engine consumes.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Subscribe to a topic.
    ///
    /// `filter` is an optional bus-specific match expression; `buffer` is the
    /// requested channel capacity.  Implementations must deliver messages for
    /// `topic` into the returned [`Subscription`] until `unsubscribe` is
    /// called with its id (closing the channel).
    async fn subscribe(
        &self,
        subscriber_id: &str,
        topic: &str,
        filter: Option<String>,
        buffer: usize,
    ) -> Result<Subscription, BoxError>;

    /// Publish a message to a topic.
    async fn publish(&self, topic: &str, message: BusMessage) -> Result<(), BoxError>;

    /// Tear down a subscription; the subscription's channel closes.
    async fn unsubscribe(&self, subscription_id: &str) -> Result<(), BoxError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_request_round_trip() {
        let request = RestartRequest {
            requester_stage_id: "validator".to_string(),
            target_stage_id: "extractor".to_string(),
            reason: "schema drift".to_string(),
            iteration: 2,
            timestamp_ms: 1_700_000_000_000,
        };

        let msg = BusMessage::restart_request(RESTART_TOPIC, &request).unwrap();
        assert_eq!(msg.topic, RESTART_TOPIC);
        assert_eq!(msg.metadata["type"], MESSAGE_TYPE_RESTART_REQUEST);

        let decoded = msg.decode_restart_request().unwrap().unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn response_topic_carries_requester_id() {
        let response = RestartResponse {
            target_stage_id: "extractor".to_string(),
            success: false,
            error: "cooldown period not elapsed".to_string(),
            iteration: 1,
        };

        let msg = BusMessage::restart_response("validator", &response).unwrap();
        assert_eq!(msg.topic, "workflow.restart.response.validator");
        assert_eq!(msg.metadata["type"], MESSAGE_TYPE_RESTART_RESPONSE);
    }

    #[test]
    fn mismatched_type_tag_decodes_to_none() {
        let response = RestartResponse {
            target_stage_id: "s".to_string(),
            success: true,
            error: String::new(),
            iteration: 1,
        };
        let msg = BusMessage::restart_response("s2", &response).unwrap();
        assert!(msg.decode_restart_request().unwrap().is_none());
    }
}
