//! The gateway's error taxonomy.
//!
//! Only [`ConfigError`] is fatal, and only at startup. Every other category is
//! recovered at the boundary that observes it: subscriber faults at the bus,
//! handle faults at the dispatcher, delivery failures inside the reporter
//! worker, and validation errors by answering the remote caller.

use crate::common::ValueKind;
use crate::dispatcher::DispatcherState;
use std::convert::Infallible;
use thiserror::Error;

/// Errors raised while building the settings registry.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("settings group '{0}' is already registered")]
    DuplicateGroup(String),

    #[error("settings group '{0}' was never registered")]
    UnknownGroup(String),

    #[error("settings group '{group}' has no key '{key}'")]
    UnknownKey { group: String, key: String },

    #[error("setting '{group}.{key}' expects a {expected} value, got {found}")]
    TypeMismatch {
        group: String,
        key: String,
        expected: ValueKind,
        found: ValueKind,
    },

    #[error("setting '{group}.{key}' is out of range: {reason}")]
    OutOfRange {
        group: String,
        key: String,
        reason: String,
    },

    #[error("setting '{group}.{key}' is not supported: {reason}")]
    Unsupported {
        group: String,
        key: String,
        reason: String,
    },

    #[error("failed to load settings: {0}")]
    Source(#[from] config::ConfigError),
}

/// Errors raised by the message bus API itself (never by subscribers).
#[derive(Debug, Error)]
pub enum BusError {
    #[error("invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: &'static str },
}

impl BusError {
    pub(crate) fn invalid_topic(topic: &str, reason: &'static str) -> Self {
        BusError::InvalidTopic {
            topic: topic.to_string(),
            reason,
        }
    }
}

impl From<Infallible> for BusError {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}

/// A subscriber callback failed or panicked while handling a message.
#[derive(Debug, Error)]
#[error("subscriber to '{pattern}' failed on '{topic}': {reason}")]
pub struct SubscriberError {
    pub pattern: String,
    pub topic: String,
    pub reason: String,
}

/// An I/O handle callback failed or panicked.
#[derive(Debug, Error)]
#[error("handle '{handle}' faulted: {reason}")]
pub struct HandleFault {
    pub handle: String,
    pub reason: String,
}

/// Errors returned by dispatcher control operations.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatcher is {0:?} and no longer accepts handles")]
    NotAccepting(DispatcherState),

    #[error("dispatcher has already stopped")]
    Stopped,
}

/// Errors raised by a radio link.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RadioError {
    /// The link cannot take a frame right now.
    #[error("radio link not available for write")]
    Unavailable,

    #[error("radio link is closed")]
    Closed,

    #[error("radio I/O error: {0}")]
    Io(String),
}

/// A reporter's outbound delivery attempt failed.
#[derive(Debug, Clone, Error)]
pub enum DeliveryFailure {
    /// The collector asked us to slow down. Retried after a backoff.
    #[error("collector throttled the upload: {0}")]
    Throttled(String),

    /// The collector could not be reached. Retried after a backoff.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The collector refused the batch. Retrying would not help.
    #[error("collector rejected the upload: {0}")]
    Rejected(String),
}

impl DeliveryFailure {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DeliveryFailure::Rejected(_))
    }
}

/// A remote command invocation with malformed parameters.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("command '{command}' requires parameter '{param}'")]
    MissingParameter { command: String, param: String },

    #[error("command '{command}' does not accept parameter '{param}'")]
    UnexpectedParameter { command: String, param: String },

    #[error("parameter '{param}' of '{command}' expects {expected}, got '{found}'")]
    WrongType {
        command: String,
        param: String,
        expected: ValueKind,
        found: String,
    },
}

impl ValidationError {
    /// The identifier used when this error is reported as a reply.
    pub fn id(&self) -> &'static str {
        match self {
            ValidationError::UnknownCommand(_) => "command.unknown",
            ValidationError::MissingParameter { .. } => "missingattr",
            ValidationError::UnexpectedParameter { .. } => "toomanyattrs",
            ValidationError::WrongType { .. } => "invalidattr",
        }
    }
}
