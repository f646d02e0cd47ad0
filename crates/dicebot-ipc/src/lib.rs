//! Dicebot IPC - Inter-Process Communication
//!
//! Message model and event bus for adapter-to-core communication

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

static NEXT_TRACE_COUNTER: AtomicU64 = AtomicU64::new(1);

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn generate_trace_id() -> String {
    let ts = now_unix_secs();
    let n = NEXT_TRACE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("trace-{}-{}", ts, n)
}

fn generate_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Group,
    Private,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Sender {
    pub user_id: String,
    #[serde(default)]
    pub nickname: String,
}

/// An inbound chat message as seen by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(default = "generate_message_id")]
    pub id: String,
    #[serde(default = "generate_trace_id")]
    pub trace_id: String,
    pub message_type: MessageType,
    /// Platform group id; empty for private messages.
    #[serde(default)]
    pub group_id: String,
    pub sender: Sender,
    pub text: String,
    #[serde(default)]
    pub platform: String,
}

impl Message {
    pub fn group(group_id: &str, user_id: &str, nickname: &str, text: &str) -> Self {
        Self {
            id: generate_message_id(),
            trace_id: generate_trace_id(),
            message_type: MessageType::Group,
            group_id: group_id.to_string(),
            sender: Sender {
                user_id: user_id.to_string(),
                nickname: nickname.to_string(),
            },
            text: text.to_string(),
            platform: String::new(),
        }
    }

    pub fn private(user_id: &str, nickname: &str, text: &str) -> Self {
        Self {
            id: generate_message_id(),
            trace_id: generate_trace_id(),
            message_type: MessageType::Private,
            group_id: String::new(),
            sender: Sender {
                user_id: user_id.to_string(),
                nickname: nickname.to_string(),
            },
            text: text.to_string(),
            platform: String::new(),
        }
    }

    pub fn with_platform(mut self, platform: &str) -> Self {
        self.platform = platform.to_string();
        self
    }

    pub fn is_group(&self) -> bool {
        self.message_type == MessageType::Group
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundTarget {
    Group,
    Person,
}

/// One physical message handed to an adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub target: OutboundTarget,
    /// Group id or user id depending on `target`.
    pub recipient: String,
    pub text: String,
    #[serde(default)]
    pub flag: String,
}

pub const EVENT_BUS_CAPACITY: usize = 256;
pub const OUTBOUND_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    inbound: broadcast::Sender<Message>,
    outbound: broadcast::Sender<OutboundMessage>,
}

impl EventBus {
    pub fn new() -> Self {
        let (inbound_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let (outbound_tx, _) = broadcast::channel(OUTBOUND_CAPACITY);

        Self {
            inbound: inbound_tx,
            outbound: outbound_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.inbound.subscribe()
    }

    pub fn publish(&self, message: Message) -> anyhow::Result<()> {
        self.inbound.send(message)?;
        Ok(())
    }

    pub fn receiver_count(&self) -> usize {
        self.inbound.receiver_count()
    }

    pub fn outbound_sender(&self) -> broadcast::Sender<OutboundMessage> {
        self.outbound.clone()
    }

    pub fn outbound_subscribe(&self) -> broadcast::Receiver<OutboundMessage> {
        self.outbound.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
