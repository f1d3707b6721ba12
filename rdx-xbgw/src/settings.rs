//! The Settings Registry: a typed, two-level (group, key) configuration store.
//!
//! Components register a group of defaults once at startup, override data from
//! the outside world is merged on top, and the registry is then frozen behind an
//! `Arc`. After that point it is only ever read, from any thread, without locks.
//!
//! Overrides are validated strictly: a group or key that was never registered,
//! or a value whose type differs from the default's, fails the whole call and
//! leaves the registry untouched.

use crate::common::{Value, ValueKind};
use crate::error::ConfigError;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Override data for a single group: key -> value.
pub type GroupOverrides = BTreeMap<String, Value>;

/// Override data for the whole registry: group -> key -> value.
pub type Overrides = BTreeMap<String, GroupOverrides>;

/// A typed view over one registered settings group.
///
/// Implementors declare the group's name and defaults, and know how to pull
/// their effective values back out of a registry.
pub trait SettingsGroup: Sized {
    const GROUP: &'static str;

    fn defaults() -> Vec<(&'static str, Value)>;

    fn from_registry(registry: &SettingsRegistry) -> Result<Self, ConfigError>;
}

#[derive(Debug, Clone)]
struct Entry {
    default: Value,
    current: Option<Value>,
}

impl Entry {
    fn effective(&self) -> &Value {
        self.current.as_ref().unwrap_or(&self.default)
    }
}

/// One setting as reported by [`SettingsRegistry::entries`].
#[derive(Debug, Clone, PartialEq)]
pub struct SettingView<'a> {
    pub key: &'a str,
    pub value: &'a Value,
    pub overridden: bool,
}

#[derive(Debug, Default)]
pub struct SettingsRegistry {
    groups: BTreeMap<String, BTreeMap<String, Entry>>,
}

impl SettingsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a group and its defaults. Each group may be registered once.
    pub fn register_group<K, I>(&mut self, name: &str, defaults: I) -> Result<(), ConfigError>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        if self.groups.contains_key(name) {
            return Err(ConfigError::DuplicateGroup(name.to_string()));
        }
        let entries = defaults
            .into_iter()
            .map(|(key, default)| {
                (
                    key.into(),
                    Entry {
                        default,
                        current: None,
                    },
                )
            })
            .collect::<BTreeMap<_, _>>();
        tracing::debug!(group = name, keys = entries.len(), "Registered settings group");
        self.groups.insert(name.to_string(), entries);
        Ok(())
    }

    /// Registers the defaults of a typed [`SettingsGroup`].
    pub fn register<G: SettingsGroup>(&mut self) -> Result<(), ConfigError> {
        self.register_group(G::GROUP, G::defaults())
    }

    /// Merges override values into a registered group.
    ///
    /// Every key is checked before anything is written, so a failed call has
    /// no effect.
    pub fn apply_overrides(
        &mut self,
        name: &str,
        overrides: &GroupOverrides,
    ) -> Result<(), ConfigError> {
        self.check_overrides(name, overrides)?;
        self.commit_overrides(name, overrides);
        Ok(())
    }

    /// Merges override data for several groups, all-or-nothing.
    pub fn apply_all(&mut self, overrides: &Overrides) -> Result<(), ConfigError> {
        for (name, group) in overrides {
            self.check_overrides(name, group)?;
        }
        for (name, group) in overrides {
            self.commit_overrides(name, group);
        }
        Ok(())
    }

    fn check_overrides(&self, name: &str, overrides: &GroupOverrides) -> Result<(), ConfigError> {
        let group = self
            .groups
            .get(name)
            .ok_or_else(|| ConfigError::UnknownGroup(name.to_string()))?;
        for (key, value) in overrides {
            let entry = group.get(key).ok_or_else(|| ConfigError::UnknownKey {
                group: name.to_string(),
                key: key.clone(),
            })?;
            if entry.default.kind() != value.kind() {
                return Err(ConfigError::TypeMismatch {
                    group: name.to_string(),
                    key: key.clone(),
                    expected: entry.default.kind(),
                    found: value.kind(),
                });
            }
        }
        Ok(())
    }

    fn commit_overrides(&mut self, name: &str, overrides: &GroupOverrides) {
        if let Some(group) = self.groups.get_mut(name) {
            for (key, value) in overrides {
                if let Some(entry) = group.get_mut(key) {
                    tracing::info!(group = name, key = %key, value = %value, "Setting overridden");
                    entry.current = Some(value.clone());
                }
            }
        }
    }

    /// Returns the effective value: the override if present, else the default.
    pub fn get(&self, name: &str, key: &str) -> Result<&Value, ConfigError> {
        let group = self
            .groups
            .get(name)
            .ok_or_else(|| ConfigError::UnknownGroup(name.to_string()))?;
        group
            .get(key)
            .map(Entry::effective)
            .ok_or_else(|| ConfigError::UnknownKey {
                group: name.to_string(),
                key: key.to_string(),
            })
    }

    pub fn get_bool(&self, name: &str, key: &str) -> Result<bool, ConfigError> {
        let value = self.get(name, key)?;
        value
            .as_bool()
            .ok_or_else(|| mismatch(name, key, ValueKind::Bool, value))
    }

    pub fn get_int(&self, name: &str, key: &str) -> Result<i64, ConfigError> {
        let value = self.get(name, key)?;
        value
            .as_int()
            .ok_or_else(|| mismatch(name, key, ValueKind::Int, value))
    }

    pub fn get_float(&self, name: &str, key: &str) -> Result<f64, ConfigError> {
        let value = self.get(name, key)?;
        value
            .as_float()
            .ok_or_else(|| mismatch(name, key, ValueKind::Float, value))
    }

    pub fn get_str(&self, name: &str, key: &str) -> Result<&str, ConfigError> {
        let value = self.get(name, key)?;
        value
            .as_str()
            .ok_or_else(|| mismatch(name, key, ValueKind::Str, value))
    }

    /// Reads a non-negative integer setting.
    pub fn get_u64(&self, name: &str, key: &str) -> Result<u64, ConfigError> {
        let raw = self.get_int(name, key)?;
        u64::try_from(raw).map_err(|_| ConfigError::OutOfRange {
            group: name.to_string(),
            key: key.to_string(),
            reason: format!("{} is negative", raw),
        })
    }

    pub fn get_millis(&self, name: &str, key: &str) -> Result<Duration, ConfigError> {
        self.get_u64(name, key).map(Duration::from_millis)
    }

    pub fn get_secs(&self, name: &str, key: &str) -> Result<Duration, ConfigError> {
        self.get_u64(name, key).map(Duration::from_secs)
    }

    /// Names of all registered groups, in sorted order.
    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// The effective settings of one group, sorted by key.
    pub fn entries(&self, name: &str) -> Result<Vec<SettingView<'_>>, ConfigError> {
        let group = self
            .groups
            .get(name)
            .ok_or_else(|| ConfigError::UnknownGroup(name.to_string()))?;
        Ok(group
            .iter()
            .map(|(key, entry)| SettingView {
                key,
                value: entry.effective(),
                overridden: entry.current.is_some(),
            })
            .collect())
    }

    /// Ends the startup phase. The registry is read-only from here on.
    pub fn freeze(self) -> Arc<SettingsRegistry> {
        Arc::new(self)
    }
}

fn mismatch(
    group: &str,
    key: &str,
    expected: ValueKind,
    found: &Value,
) -> ConfigError {
    ConfigError::TypeMismatch {
        group: group.to_string(),
        key: key.to_string(),
        expected,
        found: found.kind(),
    }
}
