//! The DDO event manager: remote AT commands, currently `set_digital_output`.

use super::{ddo_status, SlotsFull, TxStatusSlots, XBeeAddress, DDO_OPT_APPLY};
use crate::bus::{Message, MessageBus};
use crate::common::{Payload, Value};
use crate::components::command::{parse_bool_word, CommandProcessor, CommandSpec, ParamType};
use crate::components::{EventManager, ManagerContext};
use crate::dispatcher::{IoHandle, Readiness};
use crate::error::RadioError;
use crate::radio::{DdoAddress, Frame, RadioLink};
use crate::reactor::Waker;
use crate::reply::{DeferredReply, ErrorCatalog, Reply};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const DDO_ERRORS: ErrorCatalog = &[
    ("address", "Invalid address"),
    ("badoutput", "Invalid digital output value"),
    ("invalidattr", "Attribute value is incorrect"),
    ("missingattr", "Missing required command attribute"),
    ("toomanyattrs", "Too many attributes were given"),
    ("ddo_error", "DDO command error"),
    ("badcmd", "Invalid DDO command name"),
    ("badparam", "Invalid DDO command value"),
    ("txfailed", "Transmit operation failed"),
    ("txfull", "Too many outstanding transmits"),
    ("unexpected", "Unexpected/unclassified error"),
];

const MAX_PIN: i64 = 12;

/// Pin aliases that exist on the module but can't be driven as outputs here.
const BAD_NAMES: &[(&str, u8)] = &[
    ("ASSOC", 5),
    ("RTS", 6),
    ("CTS", 7),
    ("DTR", 8),
    ("SLEEP_RQ", 8),
    ("ON", 9),
    ("SLEEP", 9),
    ("PWM0", 10),
    ("RSSI", 10),
    ("P0", 10),
    ("PWM", 11),
    ("P1", 11),
    ("P2", 12),
    ("AD0", 0),
    ("AD1", 1),
    ("AD2", 2),
    ("AD3", 3),
    ("AD4", 4),
    ("AD5", 5),
    ("AD6", 6),
];

/// The accepted names of a pin: `DIOn`, plus `Dn` below 10.
fn pin_names(pin: u8) -> Vec<String> {
    let mut names = vec![format!("DIO{}", pin)];
    if pin < 10 {
        names.push(format!("D{}", pin));
    }
    names
}

fn pin_from_name(name: &str) -> Option<u8> {
    let number = name
        .strip_prefix("DIO")
        .map(|n| (n, 12))
        .or_else(|| name.strip_prefix('D').map(|n| (n, 9)));
    let (digits, max) = number?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // Reject leading zeros so "D01" isn't taken for "D1".
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    digits.parse::<u8>().ok().filter(|pin| *pin <= max)
}

/// The AT setting that configures `pin`: `Dn` below 10, `P(n-10)` above.
fn pin_setting(pin: u8) -> String {
    if pin < 10 {
        format!("D{}", pin)
    } else {
        format!("P{}", pin - 10)
    }
}

/// 4 drives the pin low, 5 drives it high.
fn parse_output_value(text: &str) -> Option<u32> {
    match text.to_ascii_lowercase().as_str() {
        "low" => Some(4),
        "high" => Some(5),
        other => parse_bool_word(other).map(|high| if high { 5 } else { 4 }),
    }
}

type Rejection = (&'static str, String);

fn resolve_pin(index: Option<i64>, name: Option<&str>) -> Result<u8, Rejection> {
    let pin = match (index, name) {
        (None, None) => {
            return Err((
                "missingattr",
                "No digital output pin number (attribute 'index') or name alias \
                 (attribute 'name') given"
                    .to_string(),
            ))
        }
        (Some(_), Some(_)) => {
            return Err((
                "toomanyattrs",
                "Must specify only an index or a name, not both.".to_string(),
            ))
        }
        (Some(index), None) => match u8::try_from(index) {
            Ok(pin) if i64::from(pin) <= MAX_PIN => pin,
            _ => {
                return Err((
                    "invalidattr",
                    "Pin number ('index') must be an integer between 0 and 12".to_string(),
                ))
            }
        },
        (None, Some(name)) => {
            if let Some((_, pin)) = BAD_NAMES.iter().find(|(bad, _)| *bad == name) {
                let hint = format!(
                    "Bad digital output name; use {} instead.",
                    pin_names(*pin).join(" or ")
                );
                return Err(("invalidattr", hint));
            }
            pin_from_name(name).ok_or_else(|| {
                (
                    "invalidattr",
                    format!("Unrecognized digital output name: '{}'", name),
                )
            })?
        }
    };
    if pin == 9 {
        return Err((
            "invalidattr",
            "DIO9 cannot be configured for digital".to_string(),
        ));
    }
    Ok(pin)
}

struct Core {
    link: Box<dyn RadioLink>,
    pending: TxStatusSlots<DeferredReply>,
}

impl Core {
    /// Collects completed commands into `done`, keeping those read before a
    /// link error.
    fn receive(&mut self, done: &mut Vec<(DeferredReply, Reply)>) -> Result<(), RadioError> {
        while let Some(frame) = self.link.recv_frame()? {
            match frame {
                Frame::Ddo { address, data } => {
                    debug!("Received DDO status from {}", address.node);
                    if let Some(completion) = self.process_status(address, data) {
                        done.push(completion);
                    }
                }
                Frame::Explicit { address, .. } => {
                    debug!("Ignoring explicit frame from {} on the DDO socket", address);
                }
            }
        }
        Ok(())
    }

    fn process_status(
        &mut self,
        address: DdoAddress,
        data: Vec<u8>,
    ) -> Option<(DeferredReply, Reply)> {
        let deferred = match self.pending.take(address.tx_id) {
            Ok(Some(deferred)) => deferred,
            Ok(None) => {
                info!("No reply pending for transmission ID {}", address.tx_id);
                return None;
            }
            Err(err) => {
                error!("Problem handling TX status: {}", err);
                return None;
            }
        };

        let reply = match address.status {
            ddo_status::OK => {
                info!("DDO command succeeded");
                if data.is_empty() {
                    Reply::ack()
                } else {
                    Reply::success(Payload::new().with("value", data))
                }
            }
            ddo_status::TX_FAILURE => {
                warn!("Failed TX: {}", address.status);
                Reply::error("txfailed", DDO_ERRORS, Some(address.node.to_string()))
            }
            ddo_status::BAD_COMMAND => {
                warn!("Failed command - bad command ({})", address.command);
                Reply::error("badcmd", DDO_ERRORS, Some(address.command))
            }
            ddo_status::BAD_PARAMETER => {
                warn!("Failed command - bad parameter");
                Reply::error("badparam", DDO_ERRORS, None)
            }
            ddo_status::ERROR => {
                warn!("Failed command - DDO error status");
                Reply::error("ddo_error", DDO_ERRORS, None)
            }
            other => {
                warn!("Unexpected status: {}", other);
                Reply::error(
                    "unexpected",
                    DDO_ERRORS,
                    Some(format!("Unexpected status: {}", other)),
                )
            }
        };
        Some((deferred, reply))
    }

    fn set_digital_output(&mut self, message: &Message) {
        let Some(responder) = message.responder() else {
            warn!("set_digital_output published without a reply channel, ignoring");
            return;
        };
        let payload = message.payload();

        let target = payload.get("addr").and_then(Value::as_str).unwrap_or_default();
        if target.is_empty() {
            responder.error(
                "missingattr",
                DDO_ERRORS,
                Some("No destination XBee address (attribute 'addr') given.".to_string()),
            );
            return;
        }
        let node = match XBeeAddress::parse_target(target) {
            Ok(node) => node,
            Err(err) => {
                responder.error("address", DDO_ERRORS, Some(err.to_string()));
                return;
            }
        };

        let index = payload.get("index").and_then(Value::as_int);
        let name = payload.get("name").and_then(Value::as_str);
        let pin = match resolve_pin(index, name) {
            Ok(pin) => pin,
            Err((id, hint)) => {
                responder.error(id, DDO_ERRORS, Some(hint));
                return;
            }
        };
        let setting = pin_setting(pin);

        let text = payload
            .get("value")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim();
        let Some(value) = parse_output_value(text) else {
            responder.error("badoutput", DDO_ERRORS, Some(text.to_string()));
            return;
        };

        let tx_id = match self.pending.allocate(responder.defer()) {
            Ok(tx_id) => tx_id,
            Err(SlotsFull(deferred)) => {
                deferred.complete(Reply::error("txfull", DDO_ERRORS, None));
                return;
            }
        };
        debug!("Attempting to set {}={} on {}", setting, value, node);
        let frame = Frame::Ddo {
            address: DdoAddress {
                node,
                command: setting,
                options: DDO_OPT_APPLY,
                tx_id,
                status: 0,
            },
            data: value.to_be_bytes().to_vec(),
        };
        if let Err(err) = self.link.send_frame(frame) {
            info!("Problem sending DDO command: {}", err);
            if let Ok(Some(deferred)) = self.pending.take(tx_id) {
                deferred.complete(Reply::error("txfailed", DDO_ERRORS, Some(err.to_string())));
            }
        }
    }
}

struct DdoSocket {
    core: Arc<Mutex<Core>>,
}

impl IoHandle for DdoSocket {
    fn name(&self) -> &str {
        "ddo"
    }

    fn poll_ready(&mut self) -> Readiness {
        self.core.lock().link.poll_ready()
    }

    fn attach(&mut self, waker: Waker) {
        self.core.lock().link.attach(waker);
    }

    fn handle_read(&mut self, _bus: &MessageBus) -> anyhow::Result<()> {
        let mut done = Vec::new();
        let received = self.core.lock().receive(&mut done);
        for (deferred, reply) in done {
            deferred.complete(reply);
        }
        received?;
        Ok(())
    }

    fn handle_close(&mut self) {
        let orphaned: Vec<_> = self.core.lock().pending.drain().collect();
        for deferred in orphaned {
            deferred.complete(Reply::error(
                "txfailed",
                DDO_ERRORS,
                Some(RadioError::Closed.to_string()),
            ));
        }
        info!("DDO socket closed");
    }
}

/// Implements `set_digital_output` over a DDO link.
pub struct DdoEventManager {
    core: Arc<Mutex<Core>>,
}

impl DdoEventManager {
    pub const SET_DIGITAL_OUTPUT: &'static str = "set_digital_output";

    pub fn new(link: Box<dyn RadioLink>) -> Self {
        info!("Initializing DdoEventManager");
        Self {
            core: Arc::new(Mutex::new(Core {
                link,
                pending: TxStatusSlots::default(),
            })),
        }
    }

    pub fn set_digital_output_spec() -> CommandSpec {
        CommandSpec::new(
            Self::SET_DIGITAL_OUTPUT,
            "Drive a remote XBee pin high or low; give either index or name",
        )
        .required("addr", ParamType::Str)
        .optional("index", ParamType::Int)
        .optional("name", ParamType::Str)
        .required("value", ParamType::Str)
    }
}

impl EventManager for DdoEventManager {
    fn name(&self) -> &str {
        "ddo_manager"
    }

    fn attach(&mut self, ctx: &mut ManagerContext<'_>) -> anyhow::Result<()> {
        ctx.dispatcher.register(Box::new(DdoSocket {
            core: self.core.clone(),
        }))?;
        ctx.commands.declare(Self::set_digital_output_spec())?;
        let core = self.core.clone();
        ctx.bus.subscribe(
            CommandProcessor::topic_for(Self::SET_DIGITAL_OUTPUT)?,
            move |message: &Message| {
                core.lock().set_digital_output(message);
                Ok(())
            },
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::xbee::acknowledge;
    use crate::dispatcher::{Dispatcher, DispatcherConfig};
    use crate::radio::{channel_radio, RadioPeer};
    use crate::settings::SettingsRegistry;
    use std::time::Duration;

    #[test]
    fn pins_resolve_from_index_or_name() {
        assert_eq!(resolve_pin(Some(0), None), Ok(0));
        assert_eq!(resolve_pin(None, Some("DIO12")), Ok(12));
        assert_eq!(resolve_pin(None, Some("D4")), Ok(4));
        assert_eq!(pin_setting(4), "D4");
        assert_eq!(pin_setting(11), "P1");
    }

    #[test]
    fn pin_errors_match_the_reported_hints() {
        let err = |index, name| resolve_pin(index, name).unwrap_err();

        assert_eq!(err(None, None).0, "missingattr");
        assert_eq!(err(Some(1), Some("D1")).0, "toomanyattrs");
        assert_eq!(
            err(Some(13), None),
            (
                "invalidattr",
                "Pin number ('index') must be an integer between 0 and 12".to_string()
            )
        );
        assert_eq!(err(Some(-1), None).0, "invalidattr");
        assert_eq!(
            err(None, Some("AD5")).1,
            "Bad digital output name; use DIO5 or D5 instead."
        );
        assert_eq!(
            err(None, Some("PWM0")).1,
            "Bad digital output name; use DIO10 instead."
        );
        assert_eq!(
            err(None, Some("D10")).1,
            "Unrecognized digital output name: 'D10'"
        );
        assert_eq!(err(None, Some("D9")).1, "DIO9 cannot be configured for digital");
        assert_eq!(err(Some(9), None).1, "DIO9 cannot be configured for digital");
    }

    #[test]
    fn output_values() {
        assert_eq!(parse_output_value("LOW"), Some(4));
        assert_eq!(parse_output_value("high"), Some(5));
        assert_eq!(parse_output_value("on"), Some(5));
        assert_eq!(parse_output_value("0"), Some(4));
        assert_eq!(parse_output_value("medium"), None);
        assert_eq!(parse_output_value(""), None);
    }

    struct Rig {
        dispatcher: Dispatcher,
        commands: Arc<CommandProcessor>,
        peer: RadioPeer,
    }

    fn rig() -> Rig {
        let bus = MessageBus::new();
        let mut dispatcher = Dispatcher::new(
            bus.clone(),
            DispatcherConfig {
                poll_timeout: Duration::from_millis(5),
            },
        );
        let mut commands = CommandProcessor::new(bus.clone(), Duration::from_secs(5));
        let (link, peer) = channel_radio();
        DdoEventManager::new(Box::new(link))
            .attach(&mut ManagerContext {
                bus: &bus,
                dispatcher: &mut dispatcher,
                commands: &mut commands,
                settings: &SettingsRegistry::new().freeze(),
            })
            .unwrap();
        Rig {
            dispatcher,
            commands: Arc::new(commands),
            peer,
        }
    }

    fn set_output(rig: &mut Rig, args: Payload, status: u8) -> (Vec<Reply>, Vec<Frame>) {
        let commands = rig.commands.clone();
        let caller = std::thread::spawn(move || {
            commands
                .invoke(DdoEventManager::SET_DIGITAL_OUTPUT, &args)
                .unwrap()
                .replies
        });
        let mut sent = Vec::new();
        while !caller.is_finished() {
            rig.dispatcher.run_once();
            if let Some(frame) = rig.peer.try_recv_sent() {
                if let Some(ack) = acknowledge(&frame, status) {
                    rig.peer.inject(ack).unwrap();
                }
                sent.push(frame);
            }
        }
        (caller.join().unwrap(), sent)
    }

    #[test]
    fn set_digital_output_sends_an_applied_setting() {
        let mut rig = rig();
        let (replies, sent) = set_output(
            &mut rig,
            Payload::new()
                .with("addr", "00:13:a2:00:40:0a:0b:0c")
                .with("name", "DIO11")
                .with("value", " high "),
            ddo_status::OK,
        );
        assert_eq!(replies, vec![Reply::ack()]);
        match sent.as_slice() {
            [Frame::Ddo { address, data }] => {
                assert_eq!(address.command, "P1");
                assert_eq!(address.options, DDO_OPT_APPLY);
                assert_eq!(address.node, XBeeAddress::new(0x0013_A200_400A_0B0C));
                assert_eq!(data, &vec![0, 0, 0, 5]);
            }
            other => panic!("unexpected frames {:?}", other),
        }
    }

    #[test]
    fn ddo_statuses_map_to_errors() {
        let mut rig = rig();
        let cases = [
            (ddo_status::ERROR, "ddo_error"),
            (ddo_status::BAD_COMMAND, "badcmd"),
            (ddo_status::BAD_PARAMETER, "badparam"),
            (ddo_status::TX_FAILURE, "txfailed"),
            (42, "unexpected"),
        ];
        for (status, expected) in cases {
            let (replies, _) = set_output(
                &mut rig,
                Payload::new()
                    .with("addr", "1")
                    .with("index", 3i64)
                    .with("value", "low"),
                status,
            );
            match replies.as_slice() {
                [Reply::Error { error }] => assert_eq!(error.id, expected),
                other => panic!("unexpected replies {:?}", other),
            }
        }
    }

    #[test]
    fn status_read_before_the_link_closes_still_answers() {
        let mut rig = rig();
        let commands = rig.commands.clone();
        let caller = std::thread::spawn(move || {
            commands
                .invoke(
                    DdoEventManager::SET_DIGITAL_OUTPUT,
                    &Payload::new()
                        .with("addr", "1")
                        .with("index", 3i64)
                        .with("value", "high"),
                )
                .unwrap()
                .replies
        });
        let sent = loop {
            rig.dispatcher.run_once();
            if let Some(frame) = rig.peer.try_recv_sent() {
                break frame;
            }
        };
        rig.peer
            .inject(acknowledge(&sent, ddo_status::OK).unwrap())
            .unwrap();
        drop(rig.peer);

        while !caller.is_finished() {
            rig.dispatcher.run_once();
        }
        assert_eq!(caller.join().unwrap(), vec![Reply::ack()]);
        assert_eq!(rig.dispatcher.handle_count(), 0);
    }

    #[test]
    fn rejected_commands_send_nothing() {
        let mut rig = rig();
        let (replies, sent) = set_output(
            &mut rig,
            Payload::new()
                .with("addr", "1")
                .with("index", 2i64)
                .with("value", "sideways"),
            ddo_status::OK,
        );
        assert!(sent.is_empty());
        match replies.as_slice() {
            [Reply::Error { error }] => {
                assert_eq!(error.id, "badoutput");
                assert_eq!(error.hint.as_deref(), Some("sideways"));
            }
            other => panic!("unexpected replies {:?}", other),
        }
    }
}
