//! Transport adapter capability and the event-bus backed implementation.

use anyhow::{anyhow, Result};
use dicebot_ipc::{OutboundMessage, OutboundTarget};
use tokio::sync::broadcast;

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send_to_group(&self, group_id: &str, text: &str, flag: &str) -> Result<()>;
    async fn send_to_person(&self, user_id: &str, text: &str, flag: &str) -> Result<()>;
}

/// Publishes every send on the outbound channel of an `EventBus`, where
/// platform adapters pick it up.
#[derive(Clone)]
pub struct BusTransport {
    outbound: broadcast::Sender<OutboundMessage>,
}

impl BusTransport {
    pub fn new(outbound: broadcast::Sender<OutboundMessage>) -> Self {
        Self { outbound }
    }

    fn publish(&self, target: OutboundTarget, recipient: &str, text: &str, flag: &str) -> Result<()> {
        self.outbound
            .send(OutboundMessage {
                target,
                recipient: recipient.to_string(),
                text: text.to_string(),
                flag: flag.to_string(),
            })
            .map_err(|_| anyhow!("no outbound adapter listening"))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for BusTransport {
    async fn send_to_group(&self, group_id: &str, text: &str, flag: &str) -> Result<()> {
        self.publish(OutboundTarget::Group, group_id, text, flag)
    }

    async fn send_to_person(&self, user_id: &str, text: &str, flag: &str) -> Result<()> {
        self.publish(OutboundTarget::Person, user_id, text, flag)
    }
}
