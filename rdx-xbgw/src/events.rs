//! Lifecycle events the gateway core announces on its own bus.
//!
//! They are ordinary bus messages under [`SYSTEM_TOPIC`], so anything that
//! wants to watch the dispatcher (a snoop, a test) simply subscribes.

use crate::bus::{Message, MessageBus};
use crate::common::{Payload, Topic};
use crate::error::BusError;
use tracing::warn;

/// The topic prefix for every [`SystemEvent`].
pub const SYSTEM_TOPIC: &str = "gateway.system";

#[derive(Debug, Clone, PartialEq)]
pub enum SystemEvent {
    /// Fired once when the dispatcher's `run` loop begins.
    EngineStarted,
    /// Fired once when shutdown has been requested.
    EngineStopping,
    /// Fired once after the final drain, just before `run` returns.
    EngineStopped,
    /// Fired when an I/O handle is registered with the dispatcher.
    HandleRegistered { name: String },
    /// Fired when an I/O handle is removed, after a fault or at shutdown.
    HandleRemoved { name: String, reason: String },
}

impl SystemEvent {
    pub fn topic(&self) -> String {
        let leaf = match self {
            SystemEvent::EngineStarted => "started",
            SystemEvent::EngineStopping => "stopping",
            SystemEvent::EngineStopped => "stopped",
            SystemEvent::HandleRegistered { .. } => "handle_registered",
            SystemEvent::HandleRemoved { .. } => "handle_removed",
        };
        format!("{}.{}", SYSTEM_TOPIC, leaf)
    }

    pub fn payload(&self) -> Payload {
        match self {
            SystemEvent::HandleRegistered { name } => Payload::new().with("handle", name.as_str()),
            SystemEvent::HandleRemoved { name, reason } => Payload::new()
                .with("handle", name.as_str())
                .with("reason", reason.as_str()),
            _ => Payload::new(),
        }
    }

    pub fn message(&self) -> Result<Message, BusError> {
        Ok(Message::new(Topic::new(&self.topic())?, self.payload()))
    }

    /// Publishes the event synchronously. Must run on the dispatcher thread.
    pub(crate) fn announce(self, bus: &MessageBus) {
        if let Err(err) = bus.publish(self.topic(), self.payload()) {
            warn!("Could not announce {:?}: {}", self, err);
        }
    }
}
