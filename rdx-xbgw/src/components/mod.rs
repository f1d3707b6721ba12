//! The pluggable parts of the gateway.
//!
//! Everything the gateway does beyond routing lives in a component. Components
//! come in two capabilities:
//!
//! - [`EventManager`]s turn external input into bus messages. They may own I/O
//!   handles driven by the dispatcher and may declare remote commands.
//! - [`Reporter`]s turn bus messages into outbound deliveries, optionally on a
//!   worker thread of their own.

pub mod command;
pub mod debug;
pub mod reporter;
pub mod xbee;

use crate::bus::MessageBus;
use crate::dispatcher::Dispatcher;
use crate::error::BusError;
use crate::settings::SettingsRegistry;
use command::CommandProcessor;
use std::sync::Arc;
use std::time::Duration;

/// What an event manager may wire itself into while the gateway is assembled.
pub struct ManagerContext<'a> {
    pub bus: &'a MessageBus,
    pub dispatcher: &'a mut Dispatcher,
    pub commands: &'a mut CommandProcessor,
    pub settings: &'a Arc<SettingsRegistry>,
}

/// A component that produces bus messages from external input.
pub trait EventManager: Send {
    fn name(&self) -> &str;

    /// Registers the manager's handles, command schemas and command
    /// listeners. Called once, before the dispatcher runs.
    fn attach(&mut self, ctx: &mut ManagerContext<'_>) -> anyhow::Result<()>;
}

/// How a reporter's shutdown went.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Data points delivered over the reporter's lifetime.
    pub delivered: u64,
    /// Data points given up on over the reporter's lifetime.
    pub dropped: u64,
    /// True if the worker was still busy at the deadline and was left behind.
    pub detached: bool,
}

/// A component that consumes bus messages and performs outbound delivery.
pub trait Reporter: Send {
    fn name(&self) -> &str;

    /// Subscribes to every message published on or below `topic`.
    fn start_reporting(&mut self, bus: &MessageBus, topic: &str) -> Result<(), BusError>;

    /// Drops the subscription made for `topic`. Returns `false` if there
    /// was none.
    fn stop_reporting(&mut self, bus: &MessageBus, topic: &str) -> bool;

    /// Flushes what it can within `grace` and stops.
    fn shutdown(&mut self, grace: Duration) -> ShutdownReport;
}
