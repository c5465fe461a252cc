//! Pull subscriber for device events

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

use super::sdm::ApiError;
use crate::events::CaptureEvent;
use crate::utils::sos::SignalOfStop;

const MAX_MESSAGES: u32 = 10;
const RETRY_DELAY: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct PullResponse {
    #[serde(rename = "receivedMessages", default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Debug, Deserialize)]
struct ReceivedMessage {
    #[serde(rename = "ackId")]
    ack_id: String,
    message: PubsubMessage,
}

#[derive(Debug, Deserialize)]
struct PubsubMessage {
    #[serde(default)]
    data: String,
}

#[derive(Debug, Deserialize)]
struct EventPayload {
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "resourceUpdate")]
    resource_update: Option<ResourceUpdate>,
}

#[derive(Debug, Deserialize)]
struct ResourceUpdate {
    #[serde(default)]
    name: String,
    #[serde(default)]
    events: HashMap<String, Value>,
}

/// Decodes one message's base64 payload into the events it reports.
///
/// Messages that are not event updates (trait changes, relation updates)
/// yield nothing.
pub fn parse_message(data: &str) -> Vec<CaptureEvent> {
    let Ok(bytes) = STANDARD.decode(data) else {
        debug!("Skipping message with undecodable data");
        return Vec::new();
    };
    let Ok(payload) = serde_json::from_slice::<EventPayload>(&bytes) else {
        debug!("Skipping message that is not an event payload");
        return Vec::new();
    };
    let Some(update) = payload.resource_update else {
        return Vec::new();
    };

    let timestamp = payload.timestamp.unwrap_or_default();
    let mut events: Vec<CaptureEvent> = update
        .events
        .into_iter()
        .map(|(event_type, body)| {
            let event_id = body
                .get("eventId")
                .and_then(Value::as_str)
                .unwrap_or_default();
            CaptureEvent::new(update.name.clone(), event_type, event_id, timestamp)
        })
        .collect();
    events.sort_by(|a, b| a.event_type.cmp(&b.event_type));
    events
}

pub struct PubSubListener {
    client: Client,
    base_url: String,
    subscription: String,
    token: String,
}

impl PubSubListener {
    pub fn new(base_url: &str, subscription: &str, token: &str) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            subscription: subscription.to_string(),
            token: token.to_string(),
        })
    }

    async fn post(&self, action: &str, body: Value) -> Result<reqwest::Response, ApiError> {
        let response = self
            .client
            .post(format!("{}/{}:{}", self.base_url, self.subscription, action))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status { status, body });
        }
        Ok(response)
    }

    async fn pull(&self) -> Result<Vec<ReceivedMessage>, ApiError> {
        let response = self.post("pull", json!({ "maxMessages": MAX_MESSAGES })).await?;
        let body = response.bytes().await?;
        let pulled: PullResponse = serde_json::from_slice(&body)?;
        Ok(pulled.received_messages)
    }

    async fn acknowledge(&self, ack_ids: Vec<String>) -> Result<(), ApiError> {
        self.post("acknowledge", json!({ "ackIds": ack_ids })).await?;
        Ok(())
    }

    /// Pulls until `sos` fires or the receiving side goes away.
    pub async fn listen(&self, events: mpsc::Sender<CaptureEvent>, sos: SignalOfStop) {
        info!("Listening for events on {}", self.subscription);

        while !sos.cancelled() {
            let messages = match sos.select(self.pull()).await {
                None => break,
                Some(Ok(messages)) => messages,
                Some(Err(e)) => {
                    warn!("Pull failed: {}", e);
                    if sos.select(tokio::time::sleep(RETRY_DELAY)).await.is_none() {
                        break;
                    }
                    continue;
                }
            };

            let mut ack_ids = Vec::with_capacity(messages.len());
            for message in messages {
                for event in parse_message(&message.message.data) {
                    if events.send(event).await.is_err() {
                        debug!("Event receiver closed");
                        return;
                    }
                }
                ack_ids.push(message.ack_id);
            }

            if !ack_ids.is_empty()
                && let Err(e) = self.acknowledge(ack_ids).await
            {
                warn!("Acknowledge failed: {}", e);
            }
        }

        info!("Stopped listening for events");
    }
}
