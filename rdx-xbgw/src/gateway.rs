//! Assembling and running a gateway process.

use crate::bus::MessageBus;
use crate::components::command::CommandProcessor;
use crate::components::debug::DebugCommands;
use crate::components::reporter::{Collector, DataPointReporter, ReporterSettings};
use crate::components::xbee::{DdoEventManager, XBeeEventManager, XBeeSettings};
use crate::components::{EventManager, ManagerContext, Reporter, ShutdownReport};
use crate::config::GatewaySettings;
use crate::dispatcher::{Dispatcher, DispatcherConfig, DispatcherControl};
use crate::error::ConfigError;
use crate::radio::RadioLink;
use crate::settings::{Overrides, SettingsGroup, SettingsRegistry};
use anyhow::Context;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

type GroupRegistration = fn(&mut SettingsRegistry) -> Result<(), ConfigError>;
type ManagerFactory = Box<dyn FnOnce(&SettingsRegistry) -> anyhow::Result<Box<dyn EventManager>>>;
type ReporterFactory = Box<dyn FnOnce(&SettingsRegistry) -> anyhow::Result<Box<dyn Reporter>>>;

/// Topics the data-point reporter uploads.
pub const REPORTED_TOPICS: &[&str] = &["xbee.sample", "xbee.serial"];

/// Collects the parts of a gateway, then wires them together in order:
/// settings groups are registered, overrides applied, the registry frozen,
/// and only then are components constructed and attached.
pub struct GatewayBuilder {
    groups: Vec<GroupRegistration>,
    overrides: Overrides,
    managers: Vec<ManagerFactory>,
    reporters: Vec<(Vec<String>, ReporterFactory)>,
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayBuilder {
    pub fn new() -> Self {
        Self {
            groups: vec![SettingsRegistry::register::<GatewaySettings>],
            overrides: Overrides::new(),
            managers: Vec::new(),
            reporters: Vec::new(),
        }
    }

    pub fn settings_group<G: SettingsGroup>(mut self) -> Self {
        self.groups.push(SettingsRegistry::register::<G>);
        self
    }

    pub fn overrides(mut self, overrides: Overrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Adds an event manager, constructed once settings are final.
    pub fn manager<F>(mut self, factory: F) -> Self
    where
        F: FnOnce(&SettingsRegistry) -> anyhow::Result<Box<dyn EventManager>> + 'static,
    {
        self.managers.push(Box::new(factory));
        self
    }

    /// Adds a reporter that will report everything under `topics`.
    pub fn reporter<F>(mut self, topics: &[&str], factory: F) -> Self
    where
        F: FnOnce(&SettingsRegistry) -> anyhow::Result<Box<dyn Reporter>> + 'static,
    {
        let topics = topics.iter().map(|t| t.to_string()).collect();
        self.reporters.push((topics, Box::new(factory)));
        self
    }

    /// The XBee socket manager on `link`.
    pub fn with_xbee(self, link: Box<dyn RadioLink>) -> Self {
        self.settings_group::<XBeeSettings>().manager(move |registry| {
            let settings = XBeeSettings::from_registry(registry)?;
            Ok(Box::new(XBeeEventManager::new(link, &settings)))
        })
    }

    /// The DDO manager on `link`.
    pub fn with_ddo(self, link: Box<dyn RadioLink>) -> Self {
        self.manager(move |_| Ok(Box::new(DdoEventManager::new(link))))
    }

    pub fn with_debug_commands(self) -> Self {
        self.manager(|_| Ok(Box::new(DebugCommands::new())))
    }

    /// The data-point reporter for samples and serial data.
    pub fn with_data_point_reporter(self, collector: Box<dyn Collector>) -> Self {
        self.settings_group::<ReporterSettings>()
            .reporter(REPORTED_TOPICS, move |registry| {
                let settings = ReporterSettings::from_registry(registry)?;
                Ok(Box::new(DataPointReporter::new(settings, collector)?))
            })
    }

    pub fn build(self) -> anyhow::Result<Gateway> {
        let mut registry = SettingsRegistry::new();
        for register in &self.groups {
            register(&mut registry)?;
        }
        registry
            .apply_all(&self.overrides)
            .context("invalid settings overrides")?;
        let settings = registry.freeze();
        let gateway_settings = GatewaySettings::from_registry(&settings)?;

        let bus = MessageBus::new();
        let mut dispatcher = Dispatcher::new(
            bus.clone(),
            DispatcherConfig {
                poll_timeout: gateway_settings.poll_timeout,
            },
        );
        let mut commands = CommandProcessor::new(bus.clone(), gateway_settings.command_timeout);

        let mut managers = Vec::with_capacity(self.managers.len());
        for factory in self.managers {
            let mut manager = factory(settings.as_ref())?;
            manager
                .attach(&mut ManagerContext {
                    bus: &bus,
                    dispatcher: &mut dispatcher,
                    commands: &mut commands,
                    settings: &settings,
                })
                .with_context(|| format!("failed to attach {}", manager.name()))?;
            info!("Attached event manager {}", manager.name());
            managers.push(manager);
        }

        let mut reporters = Vec::with_capacity(self.reporters.len());
        for (topics, factory) in self.reporters {
            let mut reporter = factory(settings.as_ref())?;
            for topic in &topics {
                reporter.start_reporting(&bus, topic)?;
            }
            reporters.push(reporter);
        }

        Ok(Gateway {
            bus,
            dispatcher,
            commands: Arc::new(commands),
            settings,
            gateway_settings,
            managers,
            reporters,
        })
    }
}

/// A fully wired gateway, ready to run.
pub struct Gateway {
    bus: MessageBus,
    dispatcher: Dispatcher,
    commands: Arc<CommandProcessor>,
    settings: Arc<SettingsRegistry>,
    gateway_settings: GatewaySettings,
    managers: Vec<Box<dyn EventManager>>,
    reporters: Vec<Box<dyn Reporter>>,
}

/// What happened to each reporter at shutdown.
pub type ShutdownSummary = Vec<(String, ShutdownReport)>;

impl Gateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// The command entry point for transports. Safe to use from any thread.
    pub fn commands(&self) -> Arc<CommandProcessor> {
        self.commands.clone()
    }

    pub fn settings(&self) -> &Arc<SettingsRegistry> {
        &self.settings
    }

    pub fn control(&self) -> DispatcherControl {
        self.dispatcher.control()
    }

    /// Direct access to the loop, for stepping it by hand.
    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher {
        &mut self.dispatcher
    }

    pub fn reporters_mut(&mut self) -> &mut [Box<dyn Reporter>] {
        &mut self.reporters
    }

    /// Runs until Ctrl+C.
    pub async fn run(self) -> anyhow::Result<ShutdownSummary> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", err);
            }
        })
        .await
    }

    /// Runs the dispatcher until `shutdown` completes or the dispatcher is
    /// stopped through its control, then flushes reporters within the
    /// configured grace period. A dispatcher error is returned only after the
    /// reporters have been flushed.
    pub async fn run_until<F>(self, shutdown: F) -> anyhow::Result<ShutdownSummary>
    where
        F: Future<Output = ()>,
    {
        let Gateway {
            mut dispatcher,
            gateway_settings,
            managers,
            reporters,
            ..
        } = self;
        info!(
            "{} v{} starting with {} handle(s)",
            crate::NAME,
            crate::VERSION,
            dispatcher.handle_count()
        );
        let control = dispatcher.control();
        let mut event_loop = tokio::task::spawn_blocking(move || {
            let result = dispatcher.run();
            (dispatcher, result)
        });

        let finished = tokio::select! {
            _ = shutdown => {
                info!("Shutdown signal received. Stopping the dispatcher...");
                None
            }
            joined = &mut event_loop => Some(joined),
        };
        control.shutdown();
        let (dispatcher, result) = match finished {
            Some(joined) => joined,
            None => event_loop.await,
        }
        .context("dispatcher thread failed")?;
        drop(dispatcher);
        drop(managers);
        if let Err(err) = &result {
            error!("Dispatcher failed: {}. Flushing reporters anyway.", err);
        }

        let grace = gateway_settings.shutdown_grace;
        let summary = tokio::task::spawn_blocking(move || {
            let deadline = Instant::now() + grace;
            reporters
                .into_iter()
                .map(|mut reporter| {
                    let report =
                        reporter.shutdown(deadline.saturating_duration_since(Instant::now()));
                    info!(
                        "{} stopped: {} delivered, {} dropped{}",
                        reporter.name(),
                        report.delivered,
                        report.dropped,
                        if report.detached { " (detached)" } else { "" }
                    );
                    (reporter.name().to_string(), report)
                })
                .collect::<Vec<_>>()
        })
        .await
        .context("reporter shutdown failed")?;

        result?;
        info!("Gateway has shut down.");
        Ok(summary)
    }
}
