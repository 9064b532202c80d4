//! Real-time event fan-out.
//!
//! Events are best-effort: delivered at most once to whoever is subscribed
//! when they are published, never persisted or replayed. Each channel is a
//! `tokio::sync::broadcast` channel created on first subscription and dropped
//! once it has no receivers left.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::MarketError;

/// A subscription channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Events about a single job (`job:<id>`).
    Job(String),
    /// Events addressed to a provider (`provider:<id>`).
    Provider(String),
    /// Marketplace-wide events.
    Marketplace,
    /// Notifications for a job owner (`user:<id>`).
    User(String),
}

impl Channel {
    /// Channel for a job.
    #[must_use]
    pub fn job(id: impl Into<String>) -> Self {
        Self::Job(id.into())
    }

    /// Channel for a provider.
    #[must_use]
    pub fn provider(id: impl Into<String>) -> Self {
        Self::Provider(id.into())
    }

    /// Channel for a user.
    #[must_use]
    pub fn user(id: impl Into<String>) -> Self {
        Self::User(id.into())
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Job(id) => write!(f, "job:{id}"),
            Self::Provider(id) => write!(f, "provider:{id}"),
            Self::Marketplace => f.write_str("marketplace"),
            Self::User(id) => write!(f, "user:{id}"),
        }
    }
}

impl FromStr for Channel {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "marketplace" {
            return Ok(Self::Marketplace);
        }
        let (prefix, id) = s
            .split_once(':')
            .filter(|(_, id)| !id.is_empty())
            .ok_or_else(|| MarketError::validation(format!("invalid channel: {s}")))?;
        match prefix {
            "job" => Ok(Self::job(id)),
            "provider" => Ok(Self::provider(id)),
            "user" => Ok(Self::user(id)),
            _ => Err(MarketError::validation(format!("invalid channel: {s}"))),
        }
    }
}

/// Kind of event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// A job was submitted.
    JobCreated,
    /// A job changed without a more specific event (e.g. an error was recorded).
    JobUpdated,
    /// A provider was chosen for a job.
    JobAssigned,
    /// A job was offered to the provider.
    JobOffered,
    /// A progress report was ingested.
    JobProgress,
    /// Worker log lines were ingested.
    JobLogs,
    /// A job reached a terminal state.
    JobCompleted,
    /// Owner notification of a terminal job.
    JobCompletionNotification,
    /// A failed job was put back in the queue.
    JobReassigning,
    /// A failed job ran out of reassignments.
    JobExhausted,
    /// Escrow lock or settlement progress.
    EscrowUpdate,
    /// A provider was paid for a job.
    EarningsUpdate,
    /// A provider joined the marketplace.
    ProviderRegistered,
    /// A provider took a job.
    ProviderBusy,
    /// A provider became idle.
    ProviderAvailable,
    /// A provider stopped sending heartbeats.
    ProviderOffline,
}

/// An event delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketEvent {
    /// Channel the event was published on; set by the broadcaster.
    pub channel: String,
    /// Event kind.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Job the event concerns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Job or escrow status string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Confirmations observed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmations: Option<u32>,
    /// Confirmations required.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_confirmations: Option<u32>,
    /// Human-readable "n/required".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmation_text: Option<String>,
    /// Job revision the event was committed with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
    /// Event-specific payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Publication time.
    pub timestamp: DateTime<Utc>,
}

impl MarketEvent {
    /// A bare event of the given type.
    #[must_use]
    pub fn new(event_type: EventType) -> Self {
        Self {
            channel: String::new(),
            event_type,
            job_id: None,
            status: None,
            confirmations: None,
            required_confirmations: None,
            confirmation_text: None,
            revision: None,
            data: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach the job id.
    #[must_use]
    pub fn job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Attach a status string.
    #[must_use]
    pub fn status(mut self, status: impl ToString) -> Self {
        self.status = Some(status.to_string());
        self
    }

    /// Attach a confirmation count.
    #[must_use]
    pub fn confirmations(mut self, confirmations: u32, required: u32) -> Self {
        self.confirmations = Some(confirmations);
        self.required_confirmations = Some(required);
        self.confirmation_text = Some(format!("{confirmations}/{required}"));
        self
    }

    /// Attach the job revision.
    #[must_use]
    pub fn revision(mut self, revision: u64) -> Self {
        self.revision = Some(revision);
        self
    }

    /// Attach a payload.
    #[must_use]
    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Fans events out to per-channel subscribers.
#[derive(Debug)]
pub struct EventBroadcaster {
    capacity: usize,
    channels: RwLock<HashMap<Channel, broadcast::Sender<MarketEvent>>>,
    all: broadcast::Sender<MarketEvent>,
}

impl EventBroadcaster {
    /// Create a broadcaster whose channels buffer `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (all, _) = broadcast::channel(capacity);
        Self {
            capacity,
            channels: RwLock::new(HashMap::new()),
            all,
        }
    }

    /// Subscribe to a channel.
    #[must_use]
    pub fn subscribe(&self, channel: Channel) -> broadcast::Receiver<MarketEvent> {
        let mut channels = self.channels.write();
        channels
            .entry(channel)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Subscribe to every event on every channel.
    #[must_use]
    pub fn subscribe_all(&self) -> broadcast::Receiver<MarketEvent> {
        self.all.subscribe()
    }

    /// Publish an event to a channel.
    ///
    /// Returns the number of channel subscribers that received the event.
    pub fn publish(&self, channel: &Channel, mut event: MarketEvent) -> usize {
        event.channel = channel.to_string();
        trace!(channel = %event.channel, event_type = ?event.event_type, "publishing event");

        let _ = self.all.send(event.clone());

        let sender = self.channels.read().get(channel).cloned();
        let Some(sender) = sender else {
            return 0;
        };
        match sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                let mut channels = self.channels.write();
                if channels
                    .get(channel)
                    .is_some_and(|tx| tx.receiver_count() == 0)
                {
                    channels.remove(channel);
                }
                0
            }
        }
    }

    /// Number of live subscribers on a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        self.channels
            .read()
            .get(channel)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Number of channels currently tracked.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
