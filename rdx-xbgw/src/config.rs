//! Loading setting overrides, and the gateway's own settings group.
//!
//! Overrides come from an optional TOML file layered under environment
//! variables of the form `XBGW__<GROUP>__<KEY>`:
//!
//! ```toml
//! [xbee_manager]
//! minimum_analog_change = 5
//!
//! [devicecloud]
//! encode_serial = true
//! ```
//!
//! Every top-level table names a settings group; its keys are merged into the
//! registry with [`SettingsRegistry::apply_all`].

use crate::common::Value;
use crate::error::ConfigError;
use crate::settings::{GroupOverrides, Overrides, SettingsGroup, SettingsRegistry};
use config::{Config, Environment, File, FileFormat, ValueKind as RawKind};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Looked for in the working directory when no path is given.
pub const SETTINGS_FILE: &str = "xbgw_settings.toml";

pub const ENV_PREFIX: &str = "XBGW";
const ENV_SEPARATOR: &str = "__";

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_SEPARATOR)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
}

/// Loads overrides from `path` (required to exist) or, without one, from
/// [`SETTINGS_FILE`] if present; environment variables win over the file.
pub fn load_overrides(path: Option<&Path>) -> Result<Overrides, ConfigError> {
    let file = match path {
        Some(path) => {
            info!("Loading settings from {}", path.display());
            File::from(path).required(true)
        }
        None => File::with_name(SETTINGS_FILE).required(false),
    };
    let raw = Config::builder()
        .add_source(file)
        .add_source(environment())
        .build()?;
    convert(raw)
}

/// Parses overrides from TOML text alone, ignoring the environment.
pub fn overrides_from_toml(text: &str) -> Result<Overrides, ConfigError> {
    let raw = Config::builder()
        .add_source(File::from_str(text, FileFormat::Toml))
        .build()?;
    convert(raw)
}

fn convert(raw: Config) -> Result<Overrides, ConfigError> {
    let root: config::Map<String, config::Value> = raw.try_deserialize()?;
    let mut overrides = Overrides::new();
    for (group, table) in root {
        let table = match table.kind {
            RawKind::Table(table) => table,
            _ => {
                return Err(ConfigError::Unsupported {
                    group,
                    key: String::new(),
                    reason: "top-level settings must be tables named after a group".into(),
                })
            }
        };
        let mut values = GroupOverrides::new();
        for (key, value) in table {
            let value = convert_value(value.kind).map_err(|reason| ConfigError::Unsupported {
                group: group.clone(),
                key: key.clone(),
                reason,
            })?;
            debug!(group = %group, key = %key, "Loaded override");
            values.insert(key, value);
        }
        overrides.insert(group, values);
    }
    Ok(overrides)
}

fn convert_value(kind: RawKind) -> Result<Value, String> {
    Ok(match kind {
        RawKind::Boolean(b) => Value::Bool(b),
        RawKind::I64(n) => Value::Int(n),
        RawKind::I128(n) => Value::Int(i64::try_from(n).map_err(|_| format!("{} is too large", n))?),
        RawKind::U64(n) => Value::Int(i64::try_from(n).map_err(|_| format!("{} is too large", n))?),
        RawKind::U128(n) => Value::Int(i64::try_from(n).map_err(|_| format!("{} is too large", n))?),
        RawKind::Float(x) => Value::Float(x),
        RawKind::String(s) => Value::Str(s),
        RawKind::Array(items) => Value::List(
            items
                .into_iter()
                .map(|item| convert_value(item.kind))
                .collect::<Result<_, _>>()?,
        ),
        RawKind::Table(_) => return Err("nested tables are not supported".into()),
        RawKind::Nil => return Err("empty values are not supported".into()),
    })
}

/// Settings of the `gateway` group.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewaySettings {
    /// Longest the dispatcher waits for readiness before re-polling.
    pub poll_timeout: Duration,
    /// Longest a command invocation waits for replies.
    pub command_timeout: Duration,
    /// Time reporters get to flush on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(100),
            command_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_millis(2000),
        }
    }
}

impl SettingsGroup for GatewaySettings {
    const GROUP: &'static str = "gateway";

    fn defaults() -> Vec<(&'static str, Value)> {
        let d = Self::default();
        vec![
            ("poll_timeout_ms", (d.poll_timeout.as_millis() as i64).into()),
            ("command_timeout_secs", (d.command_timeout.as_secs() as i64).into()),
            ("shutdown_grace_ms", (d.shutdown_grace.as_millis() as i64).into()),
        ]
    }

    fn from_registry(registry: &SettingsRegistry) -> Result<Self, ConfigError> {
        Ok(Self {
            poll_timeout: registry.get_millis(Self::GROUP, "poll_timeout_ms")?,
            command_timeout: registry.get_secs(Self::GROUP, "command_timeout_secs")?,
            shutdown_grace: registry.get_millis(Self::GROUP, "shutdown_grace_ms")?,
        })
    }
}
