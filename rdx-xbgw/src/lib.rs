//! # xbgw
//!
//! The event-routing core of a radio-to-cloud telemetry gateway.
//!
//! xbgw bridges locally attached XBee radios to a remote data collector. Radio
//! input is normalized into bus messages, filtered and routed to whoever is
//! interested, without producers knowing their consumers.
//!
//! ## Core Concepts
//!
//! - **Dispatcher**: a single-threaded cooperative loop that polls registered
//!   I/O handles for readiness, runs their callbacks and drains messages that
//!   other threads queued for it.
//! - **Message Bus**: hierarchical publish/subscribe. A subscription to
//!   `xbee.sample` receives `xbee.sample.analog.<addr>.ad0`. Worker threads
//!   publish through a queue that only the dispatcher thread drains.
//! - **Settings Registry**: every component registers a group of defaulted
//!   settings; overrides from a file or the environment are merged and
//!   checked once at startup, then the registry is frozen.
//! - **Components**: event managers (radio sockets, remote commands) produce
//!   messages; reporters (the data-point uploader, a topic snoop) consume
//!   them, optionally on their own worker thread.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use xbgw::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // 1. Create an in-memory radio. `peer` plays the radio network.
//!     let (radio, _peer) = channel_radio();
//!
//!     // 2. Assemble the gateway: settings first, then components.
//!     let gateway = Gateway::builder()
//!         .overrides(load_overrides(None)?)
//!         .with_xbee(Box::new(radio))
//!         .with_debug_commands()
//!         .with_data_point_reporter(Box::new(LogCollector::new()))
//!         .build()?;
//!
//!     // 3. Run until Ctrl+C, then flush the reporters.
//!     gateway.run().await?;
//!     Ok(())
//! }
//! ```

pub const NAME: &str = "XBee Gateway";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod bus;
pub mod common;
pub mod components;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod gateway;
pub mod radio;
pub mod reactor;
pub mod reply;
pub mod settings;

/// A prelude module for easy importing of the most common xbgw types.
pub mod prelude {
    pub use crate::bus::{CrossThreadPublisher, Message, MessageBus};
    pub use crate::common::{HandleId, Payload, SubscriptionId, Topic, Value};
    pub use crate::components::command::{CommandProcessor, CommandSpec, ParamType};
    pub use crate::components::debug::{DebugCommands, TopicSnoop};
    pub use crate::components::reporter::{
        Collector, DataPoint, DataPointReporter, LogCollector, ReporterSettings, RetryPolicy,
    };
    pub use crate::components::xbee::{DdoEventManager, XBeeAddress, XBeeEventManager};
    pub use crate::components::{EventManager, Reporter, ShutdownReport};
    pub use crate::config::{load_overrides, GatewaySettings};
    pub use crate::dispatcher::{Dispatcher, DispatcherConfig, DispatcherState, IoHandle, Readiness};
    pub use crate::events::SystemEvent;
    pub use crate::gateway::{Gateway, GatewayBuilder};
    pub use crate::radio::{channel_radio, Frame, RadioLink, RadioPeer};
    pub use crate::reply::{Reply, Responder};
    pub use crate::settings::{SettingsGroup, SettingsRegistry};
}
