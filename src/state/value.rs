use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::RwLock;
use thiserror::Error;

/// A typed value held in a consumer's live state store.
///
/// Non-finite floats and a map whose only key is `$bytes` do not survive
/// JSON; see [`StateValue::is_persistable`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// Serialized as `{"$bytes": "<base64>"}`; must stay ahead of `Map`
    Bytes(#[serde(with = "bytes_repr")] Vec<u8>),
    List(Vec<StateValue>),
    Map(BTreeMap<String, StateValue>),
}

const BYTES_MARKER: &str = "$bytes";

mod bytes_repr {
    use super::BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct EncodedBytes {
        #[serde(rename = "$bytes")]
        data: String,
    }

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        EncodedBytes {
            data: BASE64.encode(bytes),
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = EncodedBytes::deserialize(deserializer)?;
        BASE64
            .decode(encoded.data.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// The type a store expects for a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Any,
    Bool,
    Int,
    Float,
    String,
    Bytes,
    List,
    Map,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueType::Any => "any",
            ValueType::Bool => "bool",
            ValueType::Int => "int",
            ValueType::Float => "float",
            ValueType::String => "string",
            ValueType::Bytes => "bytes",
            ValueType::List => "list",
            ValueType::Map => "map",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConversionError {
    #[error("cannot convert {from} to {to}")]
    Incompatible { from: &'static str, to: ValueType },

    #[error("cannot parse {value:?} as {to}: {reason}")]
    Parse {
        value: String,
        to: ValueType,
        reason: String,
    },

    #[error("float {value} is not an integer in range")]
    LossyFloat { value: f64 },

    #[error("store rejected key {key}: {reason}")]
    Rejected { key: String, reason: String },
}

impl StateValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            StateValue::Null => "null",
            StateValue::Bool(_) => "bool",
            StateValue::Int(_) => "int",
            StateValue::Float(_) => "float",
            StateValue::String(_) => "string",
            StateValue::Bytes(_) => "bytes",
            StateValue::List(_) => "list",
            StateValue::Map(_) => "map",
        }
    }

    /// Whether the value reads back unchanged from its JSON form. NaN and
    /// infinities come back as null, and a `{"$bytes": ..}` map as bytes.
    pub fn is_persistable(&self) -> bool {
        match self {
            StateValue::Float(f) => f.is_finite(),
            StateValue::List(items) => items.iter().all(StateValue::is_persistable),
            StateValue::Map(map) => {
                let marker_only = map.len() == 1 && map.contains_key(BYTES_MARKER);
                !marker_only && map.values().all(StateValue::is_persistable)
            }
            _ => true,
        }
    }

    /// The value's own type; `None` for null
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            StateValue::Null => None,
            StateValue::Bool(_) => Some(ValueType::Bool),
            StateValue::Int(_) => Some(ValueType::Int),
            StateValue::Float(_) => Some(ValueType::Float),
            StateValue::String(_) => Some(ValueType::String),
            StateValue::Bytes(_) => Some(ValueType::Bytes),
            StateValue::List(_) => Some(ValueType::List),
            StateValue::Map(_) => Some(ValueType::Map),
        }
    }

    /// Type-directed conversion used when restoring into a store
    pub fn convert_to(&self, target: ValueType) -> Result<StateValue, ConversionError> {
        if target == ValueType::Any || self.value_type() == Some(target) {
            return Ok(self.clone());
        }

        let incompatible = || ConversionError::Incompatible {
            from: self.type_name(),
            to: target,
        };

        match (self, target) {
            (StateValue::Int(i), ValueType::Float) => Ok(StateValue::Float(*i as f64)),
            (StateValue::Float(f), ValueType::Int) => {
                // i64::MAX as f64 rounds up to 2^63, hence the strict bound
                if f.is_finite() && f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64
                {
                    Ok(StateValue::Int(*f as i64))
                } else {
                    Err(ConversionError::LossyFloat { value: *f })
                }
            }
            (StateValue::Bool(b), ValueType::String) => Ok(StateValue::String(b.to_string())),
            (StateValue::Int(i), ValueType::String) => Ok(StateValue::String(i.to_string())),
            (StateValue::Float(f), ValueType::String) => Ok(StateValue::String(f.to_string())),
            (StateValue::String(s), ValueType::Bool) => s
                .trim()
                .parse::<bool>()
                .map(StateValue::Bool)
                .map_err(|e| parse_error(s, target, e)),
            (StateValue::String(s), ValueType::Int) => s
                .trim()
                .parse::<i64>()
                .map(StateValue::Int)
                .map_err(|e| parse_error(s, target, e)),
            (StateValue::String(s), ValueType::Float) => s
                .trim()
                .parse::<f64>()
                .map(StateValue::Float)
                .map_err(|e| parse_error(s, target, e)),
            (StateValue::String(s), ValueType::Bytes) => BASE64
                .decode(s.as_bytes())
                .map(StateValue::Bytes)
                .map_err(|e| parse_error(s, target, e)),
            (StateValue::Bytes(b), ValueType::String) => Ok(StateValue::String(BASE64.encode(b))),
            _ => Err(incompatible()),
        }
    }
}

fn parse_error(value: &str, to: ValueType, err: impl fmt::Display) -> ConversionError {
    ConversionError::Parse {
        value: value.to_string(),
        to,
        reason: err.to_string(),
    }
}

impl From<bool> for StateValue {
    fn from(v: bool) -> Self {
        StateValue::Bool(v)
    }
}

impl From<i64> for StateValue {
    fn from(v: i64) -> Self {
        StateValue::Int(v)
    }
}

impl From<f64> for StateValue {
    fn from(v: f64) -> Self {
        StateValue::Float(v)
    }
}

impl From<&str> for StateValue {
    fn from(v: &str) -> Self {
        StateValue::String(v.to_string())
    }
}

impl From<String> for StateValue {
    fn from(v: String) -> Self {
        StateValue::String(v)
    }
}

impl From<Vec<u8>> for StateValue {
    fn from(v: Vec<u8>) -> Self {
        StateValue::Bytes(v)
    }
}

/// The consumer's live state, as seen by the snapshot service
pub trait StateStore: Send + Sync {
    /// Every current key/value pair
    fn entries(&self) -> BTreeMap<String, StateValue>;

    /// Type a restored value must be converted to before assignment
    fn expected_type(&self, key: &str) -> ValueType;

    fn assign(&self, key: &str, value: StateValue) -> Result<(), ConversionError>;
}

/// In-memory [`StateStore`] with optional per-key declared types
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    values: RwLock<BTreeMap<String, StateValue>>,
    schema: RwLock<BTreeMap<String, ValueType>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the type restored values for `key` must have
    pub fn declare(&self, key: impl Into<String>, value_type: ValueType) {
        let mut schema = self.schema.write().unwrap_or_else(|e| e.into_inner());
        schema.insert(key.into(), value_type);
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<StateValue>) {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<StateValue> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        values.get(key).cloned()
    }

    pub fn clear(&self) {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.clear();
    }

    pub fn len(&self) -> usize {
        self.values.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateStore for MemoryStateStore {
    fn entries(&self) -> BTreeMap<String, StateValue> {
        self.values.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn expected_type(&self, key: &str) -> ValueType {
        let schema = self.schema.read().unwrap_or_else(|e| e.into_inner());
        if let Some(declared) = schema.get(key) {
            return *declared;
        }
        drop(schema);
        self.get(key)
            .and_then(|v| v.value_type())
            .unwrap_or(ValueType::Any)
    }

    fn assign(&self, key: &str, value: StateValue) -> Result<(), ConversionError> {
        self.set(key, value);
        Ok(())
    }
}
