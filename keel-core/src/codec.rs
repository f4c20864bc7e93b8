/// Entity codec
///
/// Maps application records to entities and back. A record type implements
/// [`Record`] once, writing its fields through a [`PropertyWriter`] and reading
/// them back through a [`PropertyReader`]; individual field types convert
/// through [`FieldValue`].
///
/// Decoding is tolerant of extra properties: a property that no field asked
/// for is remembered and reported as [`Error::FieldMismatch`] after the record
/// has loaded every field it could.

use crate::error::FieldMismatch;
use crate::types::{Entity, GeoPoint, Property, Value, MAX_INDEXED_LEN};
use crate::{Error, Key, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// Maximum depth of nested and flattened records.
pub const MAX_NESTING_DEPTH: usize = 20;

/// A type that can be stored as an entity.
pub trait Record {
    /// Write this record's fields.
    fn save(&self, w: &mut PropertyWriter) -> Result<()>;

    /// Read fields back. Fields without a matching property are left as they
    /// are.
    fn load(&mut self, r: &mut PropertyReader<'_>) -> Result<()>;
}

/// A field type with a property value representation.
pub trait FieldValue: Sized {
    fn to_value(&self) -> Result<Value>;

    /// Convert a stored value, returning a reason on type mismatch.
    fn from_value(value: &Value) -> std::result::Result<Self, String>;

    /// Whether `omit_empty` should drop the field.
    fn is_empty_value(&self) -> bool;
}

/// Per-field storage options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FieldOptions {
    pub noindex: bool,
    pub omit_empty: bool,
}

impl FieldOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclude the value from indexes (lifts the indexed length limit).
    pub fn noindex(mut self) -> Self {
        self.noindex = true;
        self
    }

    /// Skip the property when the value is empty (zero, empty string, `None`).
    pub fn omit_empty(mut self) -> Self {
        self.omit_empty = true;
        self
    }
}

/// Encode a record into an entity carrying `key`.
pub fn encode<R: Record + ?Sized>(key: Option<&Key>, record: &R) -> Result<Entity> {
    let mut w = PropertyWriter::new();
    record.save(&mut w)?;
    Ok(Entity {
        key: key.cloned(),
        properties: w.properties,
    })
}

/// Decode an entity into `record`.
///
/// On success every property was consumed. `Err(Error::FieldMismatch)` means
/// the record is loaded but at least one property had no field; any other
/// error means decoding stopped at the failing field.
pub fn decode<R: Record + ?Sized>(entity: &Entity, record: &mut R) -> Result<()> {
    let mut r = PropertyReader::new(entity);
    record.load(&mut r)?;
    r.finish(std::any::type_name::<R>())
}

/// Check the indexed length limit for a value stored under `name`.
///
/// Nested entity values are checked against their own properties' flags; an
/// unindexed outer property unindexes everything inside it.
pub fn check_indexed_len(name: &str, value: &Value, indexed: bool) -> Result<()> {
    match value {
        Value::String(s) if indexed && s.len() > MAX_INDEXED_LEN => Err(Error::PropertyTooLong {
            name: name.to_string(),
            len: s.len(),
            limit: MAX_INDEXED_LEN,
        }),
        Value::Bytes(b) if indexed && b.len() > MAX_INDEXED_LEN => Err(Error::PropertyTooLong {
            name: name.to_string(),
            len: b.len(),
            limit: MAX_INDEXED_LEN,
        }),
        Value::Array(values) => values
            .iter()
            .try_for_each(|v| check_indexed_len(name, v, indexed)),
        Value::Entity(entity) => entity.properties.iter().try_for_each(|p| {
            check_indexed_len(&format!("{}.{}", name, p.name), &p.value, indexed && p.indexed)
        }),
        _ => Ok(()),
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Collects properties while a record saves itself.
pub struct PropertyWriter {
    properties: Vec<Property>,
    names: HashSet<String>,
    prefix: String,
    depth: usize,
}

impl PropertyWriter {
    fn new() -> Self {
        Self {
            properties: Vec::new(),
            names: HashSet::new(),
            prefix: String::new(),
            depth: 0,
        }
    }

    /// Write an indexed field.
    pub fn field<T: FieldValue>(&mut self, name: &str, value: &T) -> Result<()> {
        self.field_with(name, value, FieldOptions::new())
    }

    /// Write a non-indexed field.
    pub fn field_noindex<T: FieldValue>(&mut self, name: &str, value: &T) -> Result<()> {
        self.field_with(name, value, FieldOptions::new().noindex())
    }

    pub fn field_with<T: FieldValue>(&mut self, name: &str, value: &T, opts: FieldOptions) -> Result<()> {
        if opts.omit_empty && value.is_empty_value() {
            return Ok(());
        }
        let v = value.to_value()?;
        self.push(name, v, !opts.noindex)
    }

    /// Store `record` as a nested entity value.
    pub fn nested<R: Record>(&mut self, name: &str, record: &R) -> Result<()> {
        self.nested_with(name, record, FieldOptions::new())
    }

    pub fn nested_with<R: Record>(&mut self, name: &str, record: &R, opts: FieldOptions) -> Result<()> {
        let entity = self.encode_nested(record)?;
        if opts.omit_empty && entity.is_empty() {
            return Ok(());
        }
        self.push(name, Value::Entity(Box::new(entity)), !opts.noindex)
    }

    /// Store a sequence of records as a multi-valued property of entities.
    pub fn nested_list<R: Record>(&mut self, name: &str, records: &[R]) -> Result<()> {
        self.nested_list_with(name, records, FieldOptions::new())
    }

    pub fn nested_list_with<R: Record>(&mut self, name: &str, records: &[R], opts: FieldOptions) -> Result<()> {
        if opts.omit_empty && records.is_empty() {
            return Ok(());
        }
        let values = records
            .iter()
            .map(|r| self.encode_nested(r).map(|e| Value::Entity(Box::new(e))))
            .collect::<Result<Vec<_>>>()?;
        self.push(name, Value::Array(values), !opts.noindex)
    }

    /// Store the fields of `record` inline as `name.Field` properties.
    pub fn flatten<R: Record>(&mut self, name: &str, record: &R) -> Result<()> {
        self.enter()?;
        let prefix = format!("{}{}.", self.prefix, name);
        let saved = std::mem::replace(&mut self.prefix, prefix);
        let result = record.save(self);
        self.prefix = saved;
        self.depth -= 1;
        result
    }

    /// Write a prepared property as-is (name gets the current prefix).
    pub fn property(&mut self, property: Property) -> Result<()> {
        self.push(&property.name, property.value, property.indexed)
    }

    fn encode_nested<R: Record>(&mut self, record: &R) -> Result<Entity> {
        self.enter()?;
        let mut inner = PropertyWriter::new();
        inner.depth = self.depth;
        let result = record.save(&mut inner);
        self.depth -= 1;
        result?;
        Ok(Entity {
            key: None,
            properties: inner.properties,
        })
    }

    fn enter(&mut self) -> Result<()> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(Error::Encode(format!(
                "records nested more than {} levels deep",
                MAX_NESTING_DEPTH
            )));
        }
        self.depth += 1;
        Ok(())
    }

    fn push(&mut self, name: &str, value: Value, indexed: bool) -> Result<()> {
        if name.is_empty() {
            return Err(Error::Encode("empty property name".to_string()));
        }
        let full = format!("{}{}", self.prefix, name);
        if !self.names.insert(full.clone()) {
            return Err(Error::Encode(format!("duplicate property {:?}", full)));
        }
        check_indexed_len(&full, &value, indexed)?;
        self.properties.push(Property {
            name: full,
            value,
            indexed,
        });
        Ok(())
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Hands entity properties to a record while it loads itself.
pub struct PropertyReader<'a> {
    entity: &'a Entity,
    consumed: Vec<bool>,
    prefix: String,
    /// Mismatches found inside nested entities
    nested_mismatches: Vec<FieldMismatch>,
}

impl<'a> PropertyReader<'a> {
    fn new(entity: &'a Entity) -> Self {
        Self {
            entity,
            consumed: vec![false; entity.properties.len()],
            prefix: String::new(),
            nested_mismatches: Vec::new(),
        }
    }

    /// Key of the entity being decoded, for records that keep their own key.
    pub fn key(&self) -> Option<&'a Key> {
        self.entity.key.as_ref()
    }

    /// Read a field. A missing property leaves `out` unchanged.
    pub fn field<T: FieldValue>(&mut self, name: &str, out: &mut T) -> Result<()> {
        let full = format!("{}{}", self.prefix, name);
        if let Some(value) = self.take(&full) {
            *out = T::from_value(&value).map_err(|reason| Error::Decode { field: full, reason })?;
        }
        Ok(())
    }

    /// Read a nested entity value into `out`.
    pub fn nested<R: Record>(&mut self, name: &str, out: &mut R) -> Result<()> {
        let full = format!("{}{}", self.prefix, name);
        match self.take(&full) {
            None | Some(Value::Null) => Ok(()),
            Some(Value::Entity(entity)) => self.load_nested(&full, &entity, out),
            Some(other) => Err(Error::Decode {
                field: full,
                reason: format!("expected entity, found {}", other.type_name()),
            }),
        }
    }

    /// Read a multi-valued property of entities, replacing `out`.
    pub fn nested_list<R: Record + Default>(&mut self, name: &str, out: &mut Vec<R>) -> Result<()> {
        let full = format!("{}{}", self.prefix, name);
        let values = match self.take(&full) {
            None => return Ok(()),
            Some(Value::Null) => Vec::new(),
            Some(Value::Array(values)) => values,
            Some(single @ Value::Entity(_)) => vec![single],
            Some(other) => {
                return Err(Error::Decode {
                    field: full,
                    reason: format!("expected entities, found {}", other.type_name()),
                })
            }
        };
        let mut records = Vec::with_capacity(values.len());
        for value in values {
            let entity = match value {
                Value::Entity(entity) => entity,
                other => {
                    return Err(Error::Decode {
                        field: full,
                        reason: format!("expected entity element, found {}", other.type_name()),
                    })
                }
            };
            let mut record = R::default();
            self.load_nested(&full, &entity, &mut record)?;
            records.push(record);
        }
        *out = records;
        Ok(())
    }

    /// Read `name.Field` properties into the fields of `out`.
    pub fn flatten<R: Record>(&mut self, name: &str, out: &mut R) -> Result<()> {
        let prefix = format!("{}{}.", self.prefix, name);
        let saved = std::mem::replace(&mut self.prefix, prefix);
        let result = out.load(self);
        self.prefix = saved;
        result
    }

    /// Take every remaining property (used by raw property lists).
    pub fn take_all(&mut self) -> Vec<Property> {
        let mut out = Vec::new();
        for (i, p) in self.entity.properties.iter().enumerate() {
            if !self.consumed[i] {
                self.consumed[i] = true;
                out.push(p.clone());
            }
        }
        out
    }

    fn load_nested<R: Record>(&mut self, name: &str, entity: &Entity, out: &mut R) -> Result<()> {
        let mut inner = PropertyReader::new(entity);
        out.load(&mut inner)?;
        let key = self.entity.key.clone();
        for mut m in inner.mismatches(std::any::type_name::<R>()) {
            m.property = format!("{}.{}", name, m.property);
            m.key = key.clone();
            self.nested_mismatches.push(m);
        }
        Ok(())
    }

    /// Marks all properties called `name` consumed and returns their value;
    /// repeated names combine into one multi-valued value.
    fn take(&mut self, name: &str) -> Option<Value> {
        let mut found = Vec::new();
        for (i, p) in self.entity.properties.iter().enumerate() {
            if p.name == name {
                self.consumed[i] = true;
                found.push(p.value.clone());
            }
        }
        match found.len() {
            0 => None,
            1 => found.pop(),
            _ => Some(Value::Array(
                found
                    .into_iter()
                    .flat_map(|v| match v {
                        Value::Array(inner) => inner,
                        other => vec![other],
                    })
                    .collect(),
            )),
        }
    }

    fn mismatches(self, record: &'static str) -> Vec<FieldMismatch> {
        let mut out = self.nested_mismatches;
        for (i, p) in self.entity.properties.iter().enumerate() {
            if !self.consumed[i] {
                out.push(FieldMismatch {
                    record,
                    property: p.name.clone(),
                    reason: "no such struct field".to_string(),
                    key: self.entity.key.clone(),
                });
            }
        }
        out
    }

    fn finish(self, record: &'static str) -> Result<()> {
        match self.mismatches(record).into_iter().next() {
            Some(m) => Err(Error::FieldMismatch(m)),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Field values
// ============================================================================

fn type_mismatch(expected: &str, found: &Value) -> String {
    match found {
        Value::Array(_) => format!("multi-valued property cannot be loaded into a {} field", expected),
        other => format!("cannot load {} into a {} field", other.type_name(), expected),
    }
}

macro_rules! int_field_value {
    ($($t:ty),*) => {$(
        impl FieldValue for $t {
            fn to_value(&self) -> Result<Value> {
                Ok(Value::Int(*self as i64))
            }

            fn from_value(value: &Value) -> std::result::Result<Self, String> {
                match value {
                    Value::Int(i) => <$t>::try_from(*i)
                        .map_err(|_| format!("value {} overflows {}", i, stringify!($t))),
                    Value::Null => Ok(0),
                    other => Err(type_mismatch(stringify!($t), other)),
                }
            }

            fn is_empty_value(&self) -> bool {
                *self == 0
            }
        }
    )*};
}

int_field_value!(i64, i32, i16, i8, u32, u16, u8);

impl FieldValue for bool {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Bool(*self))
    }

    fn from_value(value: &Value) -> std::result::Result<Self, String> {
        match value {
            Value::Bool(b) => Ok(*b),
            Value::Null => Ok(false),
            other => Err(type_mismatch("bool", other)),
        }
    }

    fn is_empty_value(&self) -> bool {
        !*self
    }
}

impl FieldValue for f64 {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Double(*self))
    }

    fn from_value(value: &Value) -> std::result::Result<Self, String> {
        match value {
            Value::Double(d) => Ok(*d),
            Value::Null => Ok(0.0),
            other => Err(type_mismatch("f64", other)),
        }
    }

    fn is_empty_value(&self) -> bool {
        *self == 0.0
    }
}

impl FieldValue for f32 {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Double(*self as f64))
    }

    fn from_value(value: &Value) -> std::result::Result<Self, String> {
        match value {
            Value::Double(d) if d.is_finite() && d.abs() > f32::MAX as f64 => {
                Err(format!("value {} overflows f32", d))
            }
            Value::Double(d) => Ok(*d as f32),
            Value::Null => Ok(0.0),
            other => Err(type_mismatch("f32", other)),
        }
    }

    fn is_empty_value(&self) -> bool {
        *self == 0.0
    }
}

impl FieldValue for String {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::String(self.clone()))
    }

    fn from_value(value: &Value) -> std::result::Result<Self, String> {
        match value {
            Value::String(s) => Ok(s.clone()),
            Value::Null => Ok(String::new()),
            other => Err(type_mismatch("string", other)),
        }
    }

    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

impl FieldValue for Bytes {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Bytes(self.clone()))
    }

    fn from_value(value: &Value) -> std::result::Result<Self, String> {
        match value {
            Value::Bytes(b) => Ok(b.clone()),
            Value::Null => Ok(Bytes::new()),
            other => Err(type_mismatch("bytes", other)),
        }
    }

    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

impl FieldValue for DateTime<Utc> {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Timestamp(*self))
    }

    fn from_value(value: &Value) -> std::result::Result<Self, String> {
        match value {
            Value::Timestamp(t) => Ok(*t),
            Value::Null => Ok(DateTime::<Utc>::UNIX_EPOCH),
            other => Err(type_mismatch("timestamp", other)),
        }
    }

    fn is_empty_value(&self) -> bool {
        *self == DateTime::<Utc>::UNIX_EPOCH
    }
}

impl FieldValue for GeoPoint {
    fn to_value(&self) -> Result<Value> {
        if !self.is_valid() {
            return Err(Error::Encode(format!("invalid geo point {:?}", self)));
        }
        Ok(Value::GeoPoint(*self))
    }

    fn from_value(value: &Value) -> std::result::Result<Self, String> {
        match value {
            Value::GeoPoint(g) => Ok(*g),
            Value::Null => Ok(GeoPoint::default()),
            other => Err(type_mismatch("geopoint", other)),
        }
    }

    fn is_empty_value(&self) -> bool {
        self.lat == 0.0 && self.lng == 0.0
    }
}

impl FieldValue for Key {
    fn to_value(&self) -> Result<Value> {
        self.validate()?;
        Ok(Value::Key(self.clone()))
    }

    fn from_value(value: &Value) -> std::result::Result<Self, String> {
        match value {
            Value::Key(k) => Ok(k.clone()),
            other => Err(type_mismatch("key", other)),
        }
    }

    fn is_empty_value(&self) -> bool {
        false
    }
}

/// Any value, stored as-is.
impl FieldValue for Value {
    fn to_value(&self) -> Result<Value> {
        Ok(self.clone())
    }

    fn from_value(value: &Value) -> std::result::Result<Self, String> {
        Ok(value.clone())
    }

    fn is_empty_value(&self) -> bool {
        self.is_null()
    }
}

/// `None` is stored as an explicit null.
impl<T: FieldValue> FieldValue for Option<T> {
    fn to_value(&self) -> Result<Value> {
        match self {
            Some(v) => v.to_value(),
            None => Ok(Value::Null),
        }
    }

    fn from_value(value: &Value) -> std::result::Result<Self, String> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }

    fn is_empty_value(&self) -> bool {
        self.is_none()
    }
}

/// Sequences are stored as one multi-valued property.
impl<T: FieldValue> FieldValue for Vec<T> {
    fn to_value(&self) -> Result<Value> {
        let values = self.iter().map(|v| v.to_value()).collect::<Result<Vec<_>>>()?;
        if values.iter().any(|v| matches!(v, Value::Array(_))) {
            return Err(Error::Encode("nested sequences cannot be stored".to_string()));
        }
        Ok(Value::Array(values))
    }

    fn from_value(value: &Value) -> std::result::Result<Self, String> {
        match value {
            Value::Array(values) => values.iter().map(T::from_value).collect(),
            Value::Null => Ok(Vec::new()),
            single => Ok(vec![T::from_value(single)?]),
        }
    }

    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

// ============================================================================
// Raw property lists
// ============================================================================

/// An entity is its own record: properties pass through unchanged.
impl Record for Entity {
    fn save(&self, w: &mut PropertyWriter) -> Result<()> {
        for p in &self.properties {
            w.property(p.clone())?;
        }
        Ok(())
    }

    fn load(&mut self, r: &mut PropertyReader<'_>) -> Result<()> {
        self.key = r.key().cloned();
        self.properties = r.take_all();
        Ok(())
    }
}
