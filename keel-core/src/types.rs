use crate::key::Key;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Maximum byte length of an indexed string or byte value.
pub const MAX_INDEXED_LEN: usize = 1500;

/// Geographic point in degrees
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Latitude within [-90, 90] and longitude within [-180, 180].
    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lng)
    }
}

/// Property value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    Bool(bool),
    String(String),
    Double(f64),
    Bytes(Bytes),
    Timestamp(DateTime<Utc>),
    GeoPoint(GeoPoint),
    Key(Key),
    /// Nested entity
    Entity(Box<Entity>),
    /// Multi-valued property
    Array(Vec<Value>),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn bytes(b: impl Into<Bytes>) -> Self {
        Value::Bytes(b.into())
    }

    pub fn array<I, T>(values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        Value::Array(values.into_iter().map(Into::into).collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_key(&self) -> Option<&Key> {
        match self {
            Value::Key(k) => Some(k),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            Value::Entity(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Human-readable type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int(_) => "int",
            Value::Bool(_) => "bool",
            Value::String(_) => "string",
            Value::Double(_) => "double",
            Value::Bytes(_) => "bytes",
            Value::Timestamp(_) => "timestamp",
            Value::GeoPoint(_) => "geopoint",
            Value::Key(_) => "key",
            Value::Entity(_) => "entity",
            Value::Array(_) => "array",
        }
    }

    /// Position of the value's type in the cross-type sort order.
    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Int(_) => 1,
            Value::Timestamp(_) => 2,
            Value::Bool(_) => 3,
            Value::String(_) | Value::Bytes(_) => 4,
            Value::Double(_) => 5,
            Value::GeoPoint(_) => 6,
            Value::Key(_) => 7,
            Value::Entity(_) => 8,
            Value::Array(_) => 9,
        }
    }

    /// Total order used for sorting and range filters.
    ///
    /// Values of different types order by type: null, integers, timestamps,
    /// booleans, strings and bytes, doubles, geo points, keys, entities.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::String(a), Value::Bytes(b)) => a.as_bytes().cmp(b.as_ref()),
            (Value::Bytes(a), Value::String(b)) => a.as_ref().cmp(b.as_bytes()),
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (Value::GeoPoint(a), Value::GeoPoint(b)) => a
                .lat
                .total_cmp(&b.lat)
                .then_with(|| a.lng.total_cmp(&b.lng)),
            (Value::Key(a), Value::Key(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.compare(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl From<GeoPoint> for Value {
    fn from(v: GeoPoint) -> Self {
        Value::GeoPoint(v)
    }
}

impl From<Key> for Value {
    fn from(v: Key) -> Self {
        Value::Key(v)
    }
}

impl From<&Key> for Value {
    fn from(v: &Key) -> Self {
        Value::Key(v.clone())
    }
}

impl From<Entity> for Value {
    fn from(v: Entity) -> Self {
        Value::Entity(Box::new(v))
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::array(v)
    }
}

/// Named value with its index flag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub value: Value,
    /// Whether the value participates in indexes (and is subject to the
    /// indexed length limit)
    pub indexed: bool,
}

impl Property {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            indexed: true,
        }
    }

    pub fn unindexed(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            indexed: false,
        }
    }
}

/// Entity - an optional key plus an ordered property list
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Entity {
    pub key: Option<Key>,
    pub properties: Vec<Property>,
}

impl Entity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(key: Key) -> Self {
        Self {
            key: Some(key),
            properties: Vec::new(),
        }
    }

    /// Append an indexed property
    pub fn set(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.push(Property::new(name, value));
        self
    }

    /// Append a non-indexed property
    pub fn set_unindexed(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.push(Property::unindexed(name, value));
        self
    }

    pub fn push(&mut self, property: Property) {
        self.properties.push(property);
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.property(name).map(|p| &p.value)
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Copy containing only the named properties, in the given order.
    pub fn project(&self, names: &[String]) -> Entity {
        Entity {
            key: self.key.clone(),
            properties: names
                .iter()
                .filter_map(|n| self.property(n).cloned())
                .collect(),
        }
    }
}
