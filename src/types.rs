//! Core types for the replica: identifiers, timestamps and documents.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{ReplicaError, Result};

macro_rules! string_ref {
    ($(#[$meta:meta])* $name:ident, $debug:literal) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                $name(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($debug, "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(s)
            }
        }
    };
}

string_ref!(
    /// Globally unique document identifier. Immutable once assigned.
    Ref,
    "Ref"
);

string_ref!(
    /// Reference to a class (or mixin) descriptor in the model domain.
    ClassRef,
    "Class"
);

string_ref!(
    /// Identifier of a transaction.
    TxId,
    "Tx"
);

/// Microseconds since Unix epoch.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

static ID_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Allocate a fresh identifier locally, without a network round-trip.
///
/// Layout (hex-encoded, 24 chars): 6 bytes of millisecond time, 3 bytes of
/// process identity, 3 bytes of a wrapping counter. Ids sort roughly by
/// creation time.
pub fn generate_id() -> Ref {
    let millis = (Timestamp::now().0 / 1000) as u64;
    let process = std::process::id();
    let count = ID_COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut bytes = [0u8; 12];
    bytes[0..6].copy_from_slice(&millis.to_be_bytes()[2..8]);
    bytes[6..9].copy_from_slice(&process.to_be_bytes()[1..4]);
    bytes[9..12].copy_from_slice(&count.to_be_bytes()[1..4]);
    Ref(hex::encode(bytes))
}

/// A document mirrored from the remote database.
///
/// Mixins are kept apart from the document's own attributes, keyed by the
/// mixin class that declares them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Doc {
    #[serde(rename = "_id")]
    pub id: Ref,

    #[serde(rename = "_class")]
    pub class: ClassRef,

    /// Containing space, for documents that live in one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space: Option<Ref>,

    #[serde(default)]
    pub modified_on: Timestamp,

    #[serde(default)]
    pub modified_by: String,

    #[serde(default)]
    pub attributes: Map<String, Value>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mixins: BTreeMap<ClassRef, Map<String, Value>>,
}

impl Doc {
    pub fn new(id: impl Into<Ref>, class: impl Into<ClassRef>) -> Self {
        Self {
            id: id.into(),
            class: class.into(),
            space: None,
            modified_on: Timestamp::default(),
            modified_by: String::new(),
            attributes: Map::new(),
            mixins: BTreeMap::new(),
        }
    }

    pub fn with_space(mut self, space: impl Into<Ref>) -> Self {
        self.space = Some(space.into());
        self
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Read a field, including the `_id`, `_class` and `space` pseudo-fields.
    pub fn get(&self, field: &str) -> Option<Value> {
        match field {
            "_id" => Some(Value::String(self.id.0.clone())),
            "_class" => Some(Value::String(self.class.0.clone())),
            "space" => self.space.as_ref().map(|s| Value::String(s.0.clone())),
            "modifiedOn" => Some(Value::from(self.modified_on.0)),
            "modifiedBy" => Some(Value::String(self.modified_by.clone())),
            _ => self.attributes.get(field).cloned(),
        }
    }

    /// Attribute as a string slice.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.attributes.get(field).and_then(Value::as_str)
    }

    /// Whether the document carries the given mixin.
    pub fn has_mixin(&self, mixin: &ClassRef) -> bool {
        self.mixins.contains_key(mixin)
    }

    /// Deserialize the attributes into a caller-defined struct.
    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.attributes.clone()))
            .map_err(|e| ReplicaError::Deserialization(e.to_string()))
    }

    /// Deserialize one mixin's fields into a caller-defined struct.
    pub fn mixin_typed<T: DeserializeOwned>(&self, mixin: &ClassRef) -> Result<Option<T>> {
        match self.mixins.get(mixin) {
            Some(fields) => serde_json::from_value(Value::Object(fields.clone()))
                .map(Some)
                .map_err(|e| ReplicaError::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }
}
