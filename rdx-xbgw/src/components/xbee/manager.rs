//! The XBee socket event manager: serial data, I/O samples and transmit status.

use super::{
    explicit, IoSample, SampleFilter, SlotsFull, TxStatusSlots, XBeeAddress, DIGI_PROFILE,
    IO_CLUSTER, SERIAL_CLUSTER, TX_STATUS_CLUSTER,
};
use crate::bus::{Message, MessageBus};
use crate::common::{Payload, Value};
use crate::components::command::{CommandProcessor, CommandSpec, ParamType};
use crate::components::{EventManager, ManagerContext};
use crate::dispatcher::{IoHandle, Readiness};
use crate::error::{ConfigError, RadioError};
use crate::radio::{Frame, RadioLink};
use crate::reactor::Waker;
use crate::reply::{DeferredReply, ErrorCatalog, Reply};
use crate::settings::{SettingsGroup, SettingsRegistry};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Error identifiers reported by the `send_serial` command.
pub const XBEE_ERRORS: ErrorCatalog = &[
    ("address", "Invalid address"),
    ("encoding", "Unrecognized encoding"),
    ("base64", "Unable to decode as base64"),
    ("invalidattr", "Attribute value is incorrect"),
    ("missingattr", "Missing required command attribute"),
    ("toomanyattrs", "Too many attributes were given"),
    ("txfailed", "Transmit operation failed"),
    ("txfull", "Too many outstanding transmits"),
    ("txstatus", "TX Status delivery failure"),
    ("unexpected", "Unexpected/unclassified error"),
];

const TX_STATUSES: &[(u8, &str)] = &[
    (0x00, "Success"),
    (0x01, "MAC ACK Failure"),
    (0x02, "CCA Failure"),
    (0x15, "Invalid destination endpoint"),
    (0x21, "Network ACK Failure"),
    (0x22, "Not joined to network"),
    (0x23, "Self addressed"),
    (0x24, "Address not found"),
    (0x25, "Route not found"),
    (0x26, "Broadcast source failed to hear a neighbor relay the message"),
    (0x2b, "Invalid binding table index"),
    (0x2c, "Resource error; lack of free buffers, timers, etc"),
    (0x2d, "Attempted broadcast with APS transmission"),
    (0x2e, "Attempted unicast with APS transmission, but EE=0"),
    (0x32, "Resource error; lack of free buffers, times, etc"),
    (0x74, "Data payload too large"),
];

fn tx_status_text(status: u8) -> &'static str {
    TX_STATUSES
        .iter()
        .find(|(code, _)| *code == status)
        .map(|(_, text)| *text)
        .unwrap_or("Unknown")
}

/// Frames handled per readiness callback before yielding to other handles.
const MAX_FRAMES_PER_READ: usize = 16;

/// Settings of the `xbee_manager` group.
#[derive(Debug, Clone, PartialEq)]
pub struct XBeeSettings {
    /// Don't publish repeated analog readings.
    pub filter_analog_duplicates: bool,
    /// Smallest analog difference to report.
    pub minimum_analog_change: i64,
    /// Don't publish repeated digital readings.
    pub filter_digital_duplicates: bool,
}

impl Default for XBeeSettings {
    fn default() -> Self {
        Self {
            filter_analog_duplicates: true,
            minimum_analog_change: 1,
            filter_digital_duplicates: true,
        }
    }
}

impl SettingsGroup for XBeeSettings {
    const GROUP: &'static str = "xbee_manager";

    fn defaults() -> Vec<(&'static str, Value)> {
        let d = Self::default();
        vec![
            ("filter_analog_duplicates", d.filter_analog_duplicates.into()),
            ("minimum_analog_change", d.minimum_analog_change.into()),
            ("filter_digital_duplicates", d.filter_digital_duplicates.into()),
        ]
    }

    fn from_registry(registry: &SettingsRegistry) -> Result<Self, ConfigError> {
        Ok(Self {
            filter_analog_duplicates: registry.get_bool(Self::GROUP, "filter_analog_duplicates")?,
            minimum_analog_change: registry.get_int(Self::GROUP, "minimum_analog_change")?,
            filter_digital_duplicates: registry
                .get_bool(Self::GROUP, "filter_digital_duplicates")?,
        })
    }
}

enum Outgoing {
    Publish(String, Payload),
    Complete(DeferredReply, Reply),
}

/// State shared by the socket handle and the command listener.
struct Core {
    link: Box<dyn RadioLink>,
    filter: SampleFilter,
    pending: TxStatusSlots<DeferredReply>,
}

impl Core {
    /// Processes up to [`MAX_FRAMES_PER_READ`] frames into `out`. Frames read
    /// before a link error are kept.
    fn receive(&mut self, out: &mut Vec<Outgoing>) -> Result<(), RadioError> {
        for _ in 0..MAX_FRAMES_PER_READ {
            match self.link.recv_frame()? {
                Some(frame) => self.process_frame(frame, out),
                None => break,
            }
        }
        Ok(())
    }

    fn process_frame(&mut self, frame: Frame, out: &mut Vec<Outgoing>) {
        let (address, data) = match frame {
            Frame::Explicit { address, data } => (address, data),
            Frame::Ddo { address, .. } => {
                debug!("Ignoring DDO frame from {} on the XBee socket", address.node);
                return;
            }
        };
        debug!("Received frame from {}", address);

        if address.profile != DIGI_PROFILE {
            info!("Received data for profile {:x}, discarding", address.profile);
            return;
        }
        match address.cluster {
            SERIAL_CLUSTER => {
                debug!("Received serial data from {}: {:?}", address.node, data);
                out.push(Outgoing::Publish(
                    format!("xbee.serial.{}", address.node.topic_segment()),
                    Payload::new()
                        .with("value", data)
                        .with("addr", address.node.to_string()),
                ));
            }
            IO_CLUSTER => self.process_io(address.node, &data, out),
            TX_STATUS_CLUSTER => self.process_tx_status(address.tx_id, &data, out),
            other => {
                info!("Unhandled XBee packet from {} (cluster {:#x})", address, other);
                debug!("Unhandled packet payload: {:?}", data);
            }
        }
    }

    fn process_io(&mut self, node: XBeeAddress, data: &[u8], out: &mut Vec<Outgoing>) {
        let sample = match IoSample::parse(data) {
            Ok(sample) => sample,
            Err(err) => {
                warn!("Discarding I/O sample from {}: {}", node, err);
                return;
            }
        };
        let device = node.topic_segment();
        for (channel, value) in sample.analog {
            if self.filter.admit_analog(node, channel, f64::from(value)) {
                out.push(Outgoing::Publish(
                    format!("xbee.sample.analog.{}.ad{}", device, channel),
                    Payload::new()
                        .with("value", value)
                        .with("addr", node.to_string())
                        .with("channel", format!("AD{}", channel)),
                ));
            }
        }
        for (channel, value) in sample.digital {
            if self.filter.admit_digital(node, channel, value) {
                out.push(Outgoing::Publish(
                    format!("xbee.sample.digital.{}.dio{}", device, channel),
                    Payload::new()
                        .with("value", value)
                        .with("addr", node.to_string())
                        .with("channel", format!("DIO{}", channel)),
                ));
            }
        }
    }

    fn process_tx_status(&mut self, tx_id: u8, data: &[u8], out: &mut Vec<Outgoing>) {
        let deferred = match self.pending.take(tx_id) {
            Ok(Some(deferred)) => deferred,
            Ok(None) => {
                info!("No reply pending for transmission ID {}", tx_id);
                return;
            }
            Err(err) => {
                error!("Problem handling TX status: {}", err);
                return;
            }
        };

        let reply = match data {
            [_, _, _, _, retries, delivery, discovery, ..] => {
                debug!(
                    retries,
                    delivery, discovery, "TX status for transmission {}", tx_id
                );
                if *delivery == 0 {
                    Reply::ack()
                } else {
                    let hint = format!("{:#04x}: {}", delivery, tx_status_text(*delivery));
                    warn!("Failed TX: {}", hint);
                    Reply::error("txstatus", XBEE_ERRORS, Some(hint))
                }
            }
            _ => Reply::error(
                "unexpected",
                XBEE_ERRORS,
                Some(format!("malformed TX status ({} bytes)", data.len())),
            ),
        };
        out.push(Outgoing::Complete(deferred, reply));
    }

    fn send_serial(&mut self, message: &Message) {
        let Some(responder) = message.responder() else {
            warn!("send_serial published without a reply channel, ignoring");
            return;
        };
        let payload = message.payload();
        let fail = |id: &str, hint: Option<String>| responder.error(id, XBEE_ERRORS, hint);

        let Some(target) = payload.get("addr").and_then(Value::as_str) else {
            fail(
                "missingattr",
                Some("No destination XBee address (attribute 'addr') given.".to_string()),
            );
            return;
        };
        let node = match XBeeAddress::parse_target(target) {
            Ok(node) => node,
            Err(err) => {
                fail("address", Some(err.to_string()));
                return;
            }
        };

        let text = payload.get("data").and_then(Value::as_str).unwrap_or_default();
        let encoding = payload
            .get("encoding")
            .and_then(Value::as_str)
            .unwrap_or("base64");
        let data = match encoding {
            "base64" => match BASE64.decode(text.trim()) {
                Ok(bytes) => bytes,
                Err(_) => {
                    fail("base64", None);
                    return;
                }
            },
            "utf-8" => text.as_bytes().to_vec(),
            other => {
                error!("Unrecognized encoding: {}", other);
                fail("encoding", Some(other.to_string()));
                return;
            }
        };

        // The reply waits for the transmit status frame.
        let tx_id = match self.pending.allocate(responder.defer()) {
            Ok(tx_id) => tx_id,
            Err(SlotsFull(deferred)) => {
                deferred.complete(Reply::error("txfull", XBEE_ERRORS, None));
                return;
            }
        };
        debug!("Sending {} bytes of serial data to {}", data.len(), node);
        if let Err(err) = self
            .link
            .send_frame(explicit(node, SERIAL_CLUSTER, tx_id, data))
        {
            info!("Problem sending serial data: {}", err);
            if let Ok(Some(deferred)) = self.pending.take(tx_id) {
                deferred.complete(Reply::error("txfailed", XBEE_ERRORS, Some(err.to_string())));
            }
        }
    }
}

/// The dispatcher's view of the XBee socket.
struct XBeeSocket {
    core: Arc<Mutex<Core>>,
}

impl IoHandle for XBeeSocket {
    fn name(&self) -> &str {
        "xbee"
    }

    fn poll_ready(&mut self) -> Readiness {
        self.core.lock().link.poll_ready()
    }

    fn attach(&mut self, waker: Waker) {
        self.core.lock().link.attach(waker);
    }

    fn handle_read(&mut self, bus: &MessageBus) -> anyhow::Result<()> {
        // Publish only after the lock is released: subscribers may send.
        let mut outgoing = Vec::new();
        let received = self.core.lock().receive(&mut outgoing);
        for item in outgoing {
            match item {
                Outgoing::Publish(topic, payload) => {
                    bus.publish(topic, payload)?;
                }
                Outgoing::Complete(deferred, reply) => deferred.complete(reply),
            }
        }
        received?;
        Ok(())
    }

    fn handle_close(&mut self) {
        let orphaned: Vec<_> = self.core.lock().pending.drain().collect();
        if !orphaned.is_empty() {
            warn!("XBee socket closed with {} transmit(s) outstanding", orphaned.len());
        }
        for deferred in orphaned {
            deferred.complete(Reply::error(
                "txfailed",
                XBEE_ERRORS,
                Some(RadioError::Closed.to_string()),
            ));
        }
        info!("XBee socket closed");
    }
}

/// Bridges the explicit-addressing radio socket onto the bus.
///
/// Publishes serial data on `xbee.serial.<addr>` and filtered I/O samples on
/// `xbee.sample.analog.<addr>.ad<n>` and `xbee.sample.digital.<addr>.dio<n>`,
/// and implements the `send_serial` command.
pub struct XBeeEventManager {
    core: Arc<Mutex<Core>>,
}

impl XBeeEventManager {
    pub const SEND_SERIAL: &'static str = "send_serial";

    pub fn new(link: Box<dyn RadioLink>, settings: &XBeeSettings) -> Self {
        info!("Initializing XBeeEventManager");
        Self {
            core: Arc::new(Mutex::new(Core {
                link,
                filter: SampleFilter::new(
                    settings.filter_analog_duplicates,
                    settings.minimum_analog_change as f64,
                    settings.filter_digital_duplicates,
                ),
                pending: TxStatusSlots::default(),
            })),
        }
    }

    pub fn send_serial_spec() -> CommandSpec {
        CommandSpec::new(
            Self::SEND_SERIAL,
            "Send serial data to an XBee node; the reply waits for its transmit status",
        )
        .required("addr", ParamType::Str)
        .required("data", ParamType::Str)
        .optional_or("encoding", ParamType::Str, "base64")
    }

    /// Transmissions still waiting for their status frame.
    pub fn pending_transmits(&self) -> usize {
        self.core.lock().pending.in_use()
    }
}

impl EventManager for XBeeEventManager {
    fn name(&self) -> &str {
        "xbee_manager"
    }

    fn attach(&mut self, ctx: &mut ManagerContext<'_>) -> anyhow::Result<()> {
        ctx.dispatcher.register(Box::new(XBeeSocket {
            core: self.core.clone(),
        }))?;
        ctx.commands.declare(Self::send_serial_spec())?;
        let core = self.core.clone();
        ctx.bus.subscribe(
            CommandProcessor::topic_for(Self::SEND_SERIAL)?,
            move |message: &Message| {
                core.lock().send_serial(message);
                Ok(())
            },
        )?;
        Ok(())
    }
}
