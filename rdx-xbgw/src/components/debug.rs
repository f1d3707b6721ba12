//! Diagnostics: test commands, a topic snoop and a fault injector.

use crate::bus::{Message, MessageBus};
use crate::common::{Payload, SubscriptionId, Value};
use crate::components::command::{CommandProcessor, CommandSpec, ParamType};
use crate::components::{EventManager, ManagerContext, Reporter, ShutdownReport};
use crate::error::BusError;
use crate::reply::{ErrorCatalog, Reply};
use crate::settings::SettingsRegistry;
use anyhow::Context;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const DEBUG_ERRORS: ErrorCatalog = &[
    ("missingattr", "Missing required command attribute"),
    ("setting", "No such setting"),
];

fn text_arg(message: &Message) -> String {
    message
        .payload()
        .get("text")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Declares `echo`, `delayed_echo` and `get_setting`.
#[derive(Debug, Default)]
pub struct DebugCommands;

impl DebugCommands {
    pub fn new() -> Self {
        Self
    }

    pub fn specs() -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("echo", "Reply with the given text").required("text", ParamType::Str),
            CommandSpec::new(
                "delayed_echo",
                "Reply with the given text after a delay, from another thread",
            )
            .required("text", ParamType::Str)
            .optional_or("delay_ms", ParamType::Int, 5000i64),
            CommandSpec::new("get_setting", "Show the effective value of one setting")
                .required("group", ParamType::Str)
                .required("key", ParamType::Str),
        ]
    }
}

fn echo(message: &Message) -> anyhow::Result<()> {
    if let Some(responder) = message.responder() {
        responder.reply(Reply::success(Payload::new().with("text", text_arg(message))));
    }
    Ok(())
}

fn delayed_echo(message: &Message) -> anyhow::Result<()> {
    let Some(responder) = message.responder() else {
        return Ok(());
    };
    let text = text_arg(message);
    let delay = message
        .payload()
        .get("delay_ms")
        .and_then(Value::as_int)
        .and_then(|ms| u64::try_from(ms).ok())
        .map(Duration::from_millis)
        .unwrap_or_default();
    debug!("Echoing '{}' in {:?}", text, delay);

    let deferred = responder.defer();
    std::thread::Builder::new()
        .name("xbgw-delayed-echo".to_string())
        .spawn(move || {
            std::thread::sleep(delay);
            deferred.complete(Reply::success(Payload::new().with("text", text)));
        })
        .context("failed to spawn delayed echo")?;
    Ok(())
}

fn get_setting(registry: &SettingsRegistry, message: &Message) -> anyhow::Result<()> {
    let Some(responder) = message.responder() else {
        return Ok(());
    };
    let payload = message.payload();
    let group = payload.get("group").and_then(Value::as_str).unwrap_or_default();
    let key = payload.get("key").and_then(Value::as_str).unwrap_or_default();
    match registry.get(group, key) {
        Ok(value) => responder.reply(Reply::success(
            Payload::new()
                .with("group", group)
                .with("key", key)
                .with("value", value.clone()),
        )),
        Err(err) => responder.error("setting", DEBUG_ERRORS, Some(err.to_string())),
    }
    Ok(())
}

impl EventManager for DebugCommands {
    fn name(&self) -> &str {
        "debug"
    }

    fn attach(&mut self, ctx: &mut ManagerContext<'_>) -> anyhow::Result<()> {
        for spec in Self::specs() {
            ctx.commands.declare(spec)?;
        }
        ctx.bus.subscribe(CommandProcessor::topic_for("echo")?, echo)?;
        ctx.bus
            .subscribe(CommandProcessor::topic_for("delayed_echo")?, delayed_echo)?;
        let registry = ctx.settings.clone();
        ctx.bus.subscribe(
            CommandProcessor::topic_for("get_setting")?,
            move |message: &Message| get_setting(&registry, message),
        )?;
        Ok(())
    }
}

/// Called with every snooped message.
pub type SnoopSink = Arc<dyn Fn(&Message) + Send + Sync>;

/// A reporter that only logs what it sees.
#[derive(Default)]
pub struct TopicSnoop {
    subscriptions: BTreeMap<String, SubscriptionId>,
    sink: Option<SnoopSink>,
    seen: Arc<AtomicU64>,
}

impl TopicSnoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also hands every message to `sink`.
    pub fn with_sink(sink: impl Fn(&Message) + Send + Sync + 'static) -> Self {
        Self {
            sink: Some(Arc::new(sink)),
            ..Self::default()
        }
    }

    pub fn seen(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.keys().map(String::as_str)
    }
}

impl Reporter for TopicSnoop {
    fn name(&self) -> &str {
        "topic_snoop"
    }

    fn start_reporting(&mut self, bus: &MessageBus, topic: &str) -> Result<(), BusError> {
        if self.subscriptions.contains_key(topic) {
            return Ok(());
        }
        let sink = self.sink.clone();
        let seen = self.seen.clone();
        let id = bus.subscribe(topic, move |message: &Message| {
            debug!(topic = %message.topic(), payload = ?message.payload(), "Snooped");
            seen.fetch_add(1, Ordering::Relaxed);
            if let Some(sink) = &sink {
                sink(message);
            }
            Ok(())
        })?;
        info!("Snooping on {}", topic);
        self.subscriptions.insert(topic.to_string(), id);
        Ok(())
    }

    fn stop_reporting(&mut self, bus: &MessageBus, topic: &str) -> bool {
        self.subscriptions
            .remove(topic)
            .is_some_and(|id| bus.unsubscribe(id))
    }

    fn shutdown(&mut self, _grace: Duration) -> ShutdownReport {
        ShutdownReport {
            delivered: self.seen(),
            ..ShutdownReport::default()
        }
    }
}

/// Subscribes a listener that fails on every message at or below `topic`.
///
/// Useful for checking that one broken subscriber leaves the others alone.
pub fn fail_on(bus: &MessageBus, topic: &str) -> Result<SubscriptionId, BusError> {
    bus.subscribe(topic, |message: &Message| {
        Err(anyhow::anyhow!("deliberate failure on {}", message.topic()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::command::CommandResponse;
    use crate::settings::SettingsGroup;
    use crate::config::GatewaySettings;
    use std::sync::Mutex;

    fn processor() -> (MessageBus, Arc<CommandProcessor>) {
        let bus = MessageBus::new();
        let mut dispatcher = crate::dispatcher::Dispatcher::new(bus.clone(), Default::default());
        let mut commands = CommandProcessor::new(bus.clone(), Duration::from_secs(5));
        let mut registry = SettingsRegistry::new();
        registry.register::<GatewaySettings>().unwrap();
        DebugCommands::new()
            .attach(&mut ManagerContext {
                bus: &bus,
                dispatcher: &mut dispatcher,
                commands: &mut commands,
                settings: &registry.freeze(),
            })
            .unwrap();
        (bus, Arc::new(commands))
    }

    /// Invokes from a helper thread and drains the bus on this one.
    fn invoke(bus: &MessageBus, commands: &Arc<CommandProcessor>, name: &str, args: Payload) -> CommandResponse {
        let commands = commands.clone();
        let name = name.to_string();
        let caller = std::thread::spawn(move || commands.invoke(&name, &args).unwrap());
        while !caller.is_finished() {
            bus.drain_pending();
            std::thread::sleep(Duration::from_millis(1));
        }
        caller.join().unwrap()
    }

    #[test]
    fn echo_replies_immediately() {
        let (bus, commands) = processor();
        let response = invoke(&bus, &commands, "echo", Payload::new().with("text", "hi"));
        assert_eq!(
            response.replies,
            vec![Reply::success(Payload::new().with("text", "hi"))]
        );
    }

    #[test]
    fn delayed_echo_replies_from_another_thread() {
        let (bus, commands) = processor();
        let response = invoke(
            &bus,
            &commands,
            "delayed_echo",
            Payload::new().with("text", "later").with("delay_ms", "20"),
        );
        assert_eq!(
            response.replies,
            vec![Reply::success(Payload::new().with("text", "later"))]
        );
    }

    #[test]
    fn get_setting_reports_values_and_unknown_keys() {
        let (bus, commands) = processor();
        let found = invoke(
            &bus,
            &commands,
            "get_setting",
            Payload::new()
                .with("group", GatewaySettings::GROUP)
                .with("key", "poll_timeout_ms"),
        );
        match found.replies.as_slice() {
            [Reply::Success { body }] => assert_eq!(body.get("value"), Some(&Value::Int(100))),
            other => panic!("unexpected replies {:?}", other),
        }

        let missing = invoke(
            &bus,
            &commands,
            "get_setting",
            Payload::new().with("group", "gateway").with("key", "nope"),
        );
        assert!(missing.is_error());
    }

    #[test]
    fn snoop_sees_everything_below_its_prefix() {
        let bus = MessageBus::new();
        let topics = Arc::new(Mutex::new(Vec::new()));
        let sink = topics.clone();
        let mut snoop = TopicSnoop::with_sink(move |message| {
            sink.lock().unwrap().push(message.topic().to_string());
        });
        snoop.start_reporting(&bus, "xbee").unwrap();
        fail_on(&bus, "xbee.serial").unwrap();

        bus.publish("xbee.serial.1", Payload::new()).unwrap();
        bus.publish("gateway.system.started", Payload::new()).unwrap();
        bus.publish("xbee.sample.digital.1.dio0", Payload::new()).unwrap();

        assert_eq!(
            *topics.lock().unwrap(),
            vec!["xbee.serial.1", "xbee.sample.digital.1.dio0"]
        );
        assert!(snoop.stop_reporting(&bus, "xbee"));
        bus.publish("xbee.serial.2", Payload::new()).unwrap();
        assert_eq!(snoop.shutdown(Duration::ZERO).delivered, 2);
    }
}
