//! Contains common, primitive types shared by every part of the gateway.
//!
//! This module defines the key types used to identify subscriptions and I/O
//! handles, the dynamically-typed [`Value`] carried by settings and message
//! payloads, the frozen [`Payload`] mapping, and the hierarchical [`Topic`].

use crate::error::BusError;
use serde::{Serialize, Serializer};
use slotmap::new_key_type;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// The character separating the segments of a [`Topic`].
pub const TOPIC_DELIMITER: char = '.';

new_key_type! {
    /// Uniquely and safely identifies a subscription on the message bus.
    ///
    /// Keys are never reused, so an unsubscribe with a stale id is a no-op
    /// rather than removing somebody else's subscription.
    pub struct SubscriptionId;

    /// Identifies an I/O handle registered with the dispatcher.
    pub struct HandleId;
}

/// A dynamically-typed value, used for settings and message payload fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
}

/// The type of a [`Value`], without its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Bool,
    Int,
    Float,
    Str,
    Bytes,
    List,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Str => "str",
            ValueKind::Bytes => "bytes",
            ValueKind::List => "list",
        };
        f.write_str(name)
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Str(_) => ValueKind::Str,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::List(_) => ValueKind::List,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the value as a float. Integers are widened.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => f.write_str(s),
            Value::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::Int(v.into())
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Int(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

/// The body of a bus message: an open mapping of field name to [`Value`].
///
/// A payload is shared between all subscribers of a publish. Once it has been
/// cloned, [`Payload::with`] copies the map before inserting, so nobody holding
/// an earlier clone ever sees it change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload(Arc<BTreeMap<String, Value>>);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns this payload with `key` set to `value`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        Arc::make_mut(&mut self.0).insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Value)> for Payload {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

impl From<BTreeMap<String, Value>> for Payload {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(Arc::new(map))
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.as_ref().serialize(serializer)
    }
}

/// An immutable, hierarchical message identifier such as `xbee.sample.analog`.
///
/// Segments are separated by [`TOPIC_DELIMITER`], may not be empty and may not
/// contain whitespace. Cloning is cheap.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(Arc<str>);

impl Topic {
    pub fn new(topic: &str) -> Result<Self, BusError> {
        if topic.is_empty() {
            return Err(BusError::invalid_topic(topic, "topic is empty"));
        }
        if topic.chars().any(char::is_whitespace) {
            return Err(BusError::invalid_topic(topic, "topic contains whitespace"));
        }
        if topic.split(TOPIC_DELIMITER).any(str::is_empty) {
            return Err(BusError::invalid_topic(topic, "topic has an empty segment"));
        }
        Ok(Self(Arc::from(topic)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(TOPIC_DELIMITER)
    }

    /// Builds the topic `self.segment`.
    pub fn child(&self, segment: &str) -> Result<Topic, BusError> {
        Topic::new(&format!("{}{}{}", self.0, TOPIC_DELIMITER, segment))
    }

    /// True if `self` equals `other` or is one of its ancestors.
    ///
    /// Matching is segment-wise: `a.b` is a prefix of `a.b.c` but not of `a.bc`.
    pub fn is_prefix_of(&self, other: &Topic) -> bool {
        match other.0.strip_prefix(&*self.0) {
            Some("") => true,
            Some(rest) => rest.starts_with(TOPIC_DELIMITER),
            None => false,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Topic {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::new(s)
    }
}

impl TryFrom<&str> for Topic {
    type Error = BusError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Topic::new(s)
    }
}

impl TryFrom<String> for Topic {
    type Error = BusError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Topic::new(&s)
    }
}

impl TryFrom<&String> for Topic {
    type Error = BusError;

    fn try_from(s: &String) -> Result<Self, Self::Error> {
        Topic::new(s)
    }
}

impl TryFrom<&Topic> for Topic {
    type Error = BusError;

    fn try_from(t: &Topic) -> Result<Self, Self::Error> {
        Ok(t.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_matching_is_segment_wise() {
        let pattern = Topic::new("a.b").unwrap();
        assert!(pattern.is_prefix_of(&Topic::new("a.b").unwrap()));
        assert!(pattern.is_prefix_of(&Topic::new("a.b.c").unwrap()));
        assert!(!pattern.is_prefix_of(&Topic::new("a.c").unwrap()));
        assert!(!pattern.is_prefix_of(&Topic::new("a.bc").unwrap()));
        assert!(!pattern.is_prefix_of(&Topic::new("a").unwrap()));
    }

    #[test]
    fn malformed_topics_are_rejected() {
        assert!(Topic::new("").is_err());
        assert!(Topic::new("a..b").is_err());
        assert!(Topic::new(".a").is_err());
        assert!(Topic::new("a.").is_err());
        assert!(Topic::new("a b").is_err());
        assert!(Topic::new("xbee.sample.analog.0013A200400A0B0C.ad0").is_ok());
    }

    #[test]
    fn payload_clones_never_observe_later_inserts() {
        let original = Payload::new().with("value", 5);
        let shared = original.clone();
        let extended = original.with("extra", true);

        assert_eq!(shared.len(), 1);
        assert!(!shared.contains_key("extra"));
        assert_eq!(extended.get("extra"), Some(&Value::Bool(true)));
        assert_eq!(extended.get("value"), Some(&Value::Int(5)));
    }

    #[test]
    fn value_kinds_and_widening() {
        assert_eq!(Value::from(3).kind(), ValueKind::Int);
        assert_eq!(Value::from(3).as_float(), Some(3.0));
        assert_eq!(Value::from("x").as_int(), None);
        assert_eq!(ValueKind::Float.to_string(), "float");
    }
}
