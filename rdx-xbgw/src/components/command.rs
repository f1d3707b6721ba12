//! The command processor: declared remote commands, validated then published.
//!
//! A remote caller names a command and supplies arguments. The processor checks
//! them against the command's declared [`CommandSpec`], coercing textual
//! arguments to the declared types, and only then publishes `command.<name>`
//! on the bus with a [`Responder`](crate::reply::Responder) attached. Listeners
//! answer through that responder; the processor gathers their replies until all
//! of them have finished or the command timeout passes.

use crate::bus::{Message, MessageBus};
use crate::common::{Payload, Topic, Value, ValueKind};
use crate::error::{BusError, ValidationError};
use crate::reply::{self, Reply, PROCESSOR_ERRORS};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The topic prefix under which commands are published.
pub const COMMAND_TOPIC: &str = "command";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Bool,
    Int,
    Float,
    Str,
}

impl ParamType {
    pub fn kind(&self) -> ValueKind {
        match self {
            ParamType::Bool => ValueKind::Bool,
            ParamType::Int => ValueKind::Int,
            ParamType::Float => ValueKind::Float,
            ParamType::Str => ValueKind::Str,
        }
    }

    /// Converts `value` to this type, if it is one or can be read as one.
    fn coerce(&self, value: &Value) -> Option<Value> {
        match (self, value) {
            (ParamType::Bool, Value::Bool(_))
            | (ParamType::Int, Value::Int(_))
            | (ParamType::Float, Value::Float(_))
            | (ParamType::Str, Value::Str(_)) => Some(value.clone()),
            (ParamType::Float, Value::Int(i)) => Some(Value::Float(*i as f64)),
            (ParamType::Bool, Value::Str(s)) => parse_bool_word(s).map(Value::Bool),
            (ParamType::Int, Value::Str(s)) => s.trim().parse::<i64>().ok().map(Value::Int),
            (ParamType::Float, Value::Str(s)) => s.trim().parse::<f64>().ok().map(Value::Float),
            _ => None,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind(), f)
    }
}

/// Reads the usual spellings of a boolean: `true`/`false`, `yes`/`no`,
/// `on`/`off`, `t`/`f`, `y`/`n` and `1`/`0`, ignoring case.
pub fn parse_bool_word(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" | "t" | "true" | "on" | "1" => Some(true),
        "n" | "no" | "f" | "false" | "off" | "0" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub ty: ParamType,
    pub required: bool,
    pub default: Option<Value>,
}

/// The declared shape of one remote command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub name: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
}

impl CommandSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            params: Vec::new(),
        }
    }

    pub fn required(mut self, name: impl Into<String>, ty: ParamType) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            ty,
            required: true,
            default: None,
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, ty: ParamType) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            ty,
            required: false,
            default: None,
        });
        self
    }

    /// An optional parameter filled in with `default` when absent.
    pub fn optional_or(
        mut self,
        name: impl Into<String>,
        ty: ParamType,
        default: impl Into<Value>,
    ) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            ty,
            required: false,
            default: Some(default.into()),
        });
        self
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    /// A one-line usage summary, e.g. `send_serial addr=<str> [encoding=<str>]`.
    pub fn usage(&self) -> String {
        let mut usage = self.name.clone();
        for param in &self.params {
            if param.required {
                usage.push_str(&format!(" {}=<{}>", param.name, param.ty));
            } else {
                usage.push_str(&format!(" [{}=<{}>]", param.name, param.ty));
            }
        }
        usage
    }
}

/// Everything the listeners of one command replied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResponse {
    pub command: String,
    pub replies: Vec<Reply>,
}

impl CommandResponse {
    pub fn is_error(&self) -> bool {
        self.replies.iter().any(Reply::is_error)
    }
}

pub struct CommandProcessor {
    bus: MessageBus,
    specs: BTreeMap<String, CommandSpec>,
    timeout: Duration,
}

impl CommandProcessor {
    pub fn new(bus: MessageBus, timeout: Duration) -> Self {
        info!("Command processor initialized");
        Self {
            bus,
            specs: BTreeMap::new(),
            timeout,
        }
    }

    /// The topic a command is published on.
    pub fn topic_for(name: &str) -> Result<Topic, BusError> {
        Topic::new(COMMAND_TOPIC)?.child(name)
    }

    /// Declares a command. A later declaration under the same name replaces
    /// the earlier one.
    pub fn declare(&mut self, spec: CommandSpec) -> Result<(), BusError> {
        Self::topic_for(&spec.name)?;
        debug!(command = %spec.name, "Declared command");
        if let Some(old) = self.specs.insert(spec.name.clone(), spec) {
            warn!(command = %old.name, "Command declared twice; keeping the later schema");
        }
        Ok(())
    }

    pub fn spec(&self, name: &str) -> Option<&CommandSpec> {
        self.specs.get(name)
    }

    pub fn specs(&self) -> impl Iterator<Item = &CommandSpec> {
        self.specs.values()
    }

    /// Checks `args` against the declared schema and returns the payload to
    /// publish: coerced values plus defaults for absent optional parameters.
    pub fn validate(&self, name: &str, args: &Payload) -> Result<Payload, ValidationError> {
        let spec = self
            .specs
            .get(name)
            .ok_or_else(|| ValidationError::UnknownCommand(name.to_string()))?;

        if let Some((key, _)) = args.iter().find(|(key, _)| spec.param(key).is_none()) {
            return Err(ValidationError::UnexpectedParameter {
                command: name.to_string(),
                param: key.clone(),
            });
        }

        let mut payload = Payload::new();
        for param in &spec.params {
            match (args.get(&param.name), &param.default) {
                (Some(raw), _) => {
                    let value =
                        param
                            .ty
                            .coerce(raw)
                            .ok_or_else(|| ValidationError::WrongType {
                                command: name.to_string(),
                                param: param.name.clone(),
                                expected: param.ty.kind(),
                                found: raw.to_string(),
                            })?;
                    payload = payload.with(param.name.clone(), value);
                }
                (None, Some(default)) => {
                    payload = payload.with(param.name.clone(), default.clone());
                }
                (None, None) if param.required => {
                    return Err(ValidationError::MissingParameter {
                        command: name.to_string(),
                        param: param.name.clone(),
                    });
                }
                (None, None) => {}
            }
        }
        Ok(payload)
    }

    /// Validates, publishes and collects the replies of one command.
    ///
    /// Blocks the calling thread for at most the command timeout.
    ///
    /// On the dispatcher thread the command is published synchronously and
    /// never waited on: only immediate replies are collected, and each
    /// deferred one is answered with a `command.pending` error.
    pub fn invoke(&self, name: &str, args: &Payload) -> Result<CommandResponse, ValidationError> {
        let payload = self.validate(name, args)?;
        let topic =
            Self::topic_for(name).map_err(|_| ValidationError::UnknownCommand(name.to_string()))?;
        info!("Processing command: {}", name);

        let (responder, collector) = reply::channel();
        let message = Message::new(topic, payload).with_responder(responder);
        let (limit, outstanding_id) = if self.bus.on_dispatch_thread() {
            self.bus.publish_message(message);
            (Duration::ZERO, "command.pending")
        } else {
            self.bus.enqueue(message);
            (self.timeout, "command.timeout")
        };

        let collected = collector.collect(limit);
        let mut replies = collected.replies;
        if collected.unanswered {
            replies.push(Reply::error(
                "command.unknown",
                PROCESSOR_ERRORS,
                Some(name.to_string()),
            ));
        }
        for _ in 0..collected.outstanding {
            replies.push(Reply::error(outstanding_id, PROCESSOR_ERRORS, None));
        }
        Ok(CommandResponse {
            command: name.to_string(),
            replies,
        })
    }

    /// Like [`invoke`](Self::invoke), but reports validation failures as an
    /// error reply instead of a Rust error, the way a remote caller sees them.
    pub fn process(&self, name: &str, args: &Payload) -> CommandResponse {
        match self.invoke(name, args) {
            Ok(response) => response,
            Err(err) => {
                warn!("Rejected command {}: {}", name, err);
                CommandResponse {
                    command: name.to_string(),
                    replies: vec![Reply::error(
                        err.id(),
                        VALIDATION_ERRORS,
                        Some(err.to_string()),
                    )],
                }
            }
        }
    }
}

/// Descriptions for validation failures reported as replies.
pub const VALIDATION_ERRORS: reply::ErrorCatalog = &[
    ("command.unknown", "Command not handled"),
    ("invalidattr", "Attribute value is incorrect"),
    ("missingattr", "Missing required command attribute"),
    ("toomanyattrs", "Too many attributes were given"),
];
