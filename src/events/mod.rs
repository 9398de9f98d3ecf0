//! CloudEvent publish/subscribe fallback path.
//!
//! For topologies where generation runs in a separate process, the gateway
//! publishes a `generation.requested` event instead of calling the model
//! inline. The subject encodes `"<channel>:<thread_id>"` so a later
//! `generation.completed` event can be routed back to the originating
//! conversation and posted as a thread reply. No incremental edits on this
//! path — decoupling trades away streaming.

use crate::errors::{SwitchboardError, SwitchboardResult};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

const EVENT_SOURCE: &str = "switchboard/gateway";
const CONNECT_TIMEOUT_SECS: u64 = 5;
const REQUEST_TIMEOUT_SECS: u64 = 10;

pub const GENERATION_REQUESTED: &str = "generation.requested";
pub const GENERATION_COMPLETED: &str = "generation.completed";

/// A typed, addressable event envelope (structured-mode JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudEvent {
    pub id: String,
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Routes replies back to the originating conversation:
    /// `"<channel>:<thread_id>"`.
    #[serde(default)]
    pub subject: Option<String>,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
}

impl CloudEvent {
    pub fn new(event_type: impl Into<String>, subject: Option<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source: EVENT_SOURCE.to_string(),
            event_type: event_type.into(),
            subject,
            time: Utc::now(),
            data,
        }
    }

    /// Build the reply-routing subject for a conversation.
    pub fn subject_for(channel: &str, thread_id: &str) -> String {
        format!("{}:{}", channel, thread_id)
    }

    /// Split a subject back into `(channel, thread_id)`. Thread ids contain
    /// no `:`; channel ids never do either, but splitting on the first
    /// colon keeps the parse unambiguous regardless.
    pub fn parse_subject(subject: &str) -> Option<(&str, &str)> {
        let (channel, thread_id) = subject.split_once(':')?;
        if channel.is_empty() {
            return None;
        }
        Some((channel, thread_id))
    }
}

/// Publishes CloudEvents to the configured HTTP sink.
pub struct EventPublisher {
    client: Client,
    sink_url: String,
}

impl EventPublisher {
    pub fn new(sink_url: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| Client::new()),
            sink_url: sink_url.into(),
        }
    }

    pub async fn publish(&self, event: &CloudEvent) -> SwitchboardResult<()> {
        let resp = self
            .client
            .post(&self.sink_url)
            .header("content-type", "application/cloudevents+json")
            .json(event)
            .send()
            .await
            .map_err(|e| SwitchboardError::Event(format!("publish failed: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(SwitchboardError::Event(format!(
                "event sink returned {}",
                status
            )));
        }
        debug!(
            "published {} event {} (subject {:?})",
            event.event_type, event.id, event.subject
        );
        Ok(())
    }

    /// Publish a generation request for a conversation. The worker process
    /// answers later with a `generation.completed` event on the same
    /// subject.
    pub async fn publish_generation_request(
        &self,
        channel: &str,
        thread_id: &str,
        prompt: Value,
    ) -> SwitchboardResult<()> {
        let event = CloudEvent::new(
            GENERATION_REQUESTED,
            Some(CloudEvent::subject_for(channel, thread_id)),
            prompt,
        );
        self.publish(&event).await
    }
}
