/// Query specification
///
/// A [`Query`] is an immutable value: every builder method returns a modified
/// copy, so a base query can be shared and refined freely. Builder mistakes
/// (an unparseable filter string, an unknown operator) do not fail at the call
/// site; the first one is kept and reported by [`Query::validate`], which the
/// client runs before sending anything.

use crate::key::KEY_PROPERTY;
use crate::transport::TransactionId;
use crate::types::Value;
use crate::{Error, Key, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Filter comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    Equal,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    NotEqual,
    In,
    NotIn,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Equal => "=",
            Operator::LessThan => "<",
            Operator::LessThanOrEqual => "<=",
            Operator::GreaterThan => ">",
            Operator::GreaterThanOrEqual => ">=",
            Operator::NotEqual => "!=",
            Operator::In => "in",
            Operator::NotIn => "not-in",
        }
    }

    /// Operators whose operand is a list of values.
    pub fn takes_list(&self) -> bool {
        matches!(self, Operator::In | Operator::NotIn)
    }
}

impl FromStr for Operator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "=" | "==" => Ok(Operator::Equal),
            "<" => Ok(Operator::LessThan),
            "<=" => Ok(Operator::LessThanOrEqual),
            ">" => Ok(Operator::GreaterThan),
            ">=" => Ok(Operator::GreaterThanOrEqual),
            "!=" => Ok(Operator::NotEqual),
            "in" => Ok(Operator::In),
            "not-in" | "not in" => Ok(Operator::NotIn),
            other => Err(Error::InvalidQuery(format!("invalid operator {:?}", other))),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Property filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: Operator,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Ascending,
    Descending,
}

/// Sort order on one property
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Order {
    pub field: String,
    pub direction: Direction,
}

impl Order {
    pub fn is_key_ascending(&self) -> bool {
        self.field == KEY_PROPERTY && self.direction == Direction::Ascending
    }
}

/// Opaque position in a query's results.
///
/// Only meaningful to the query that produced it. The printable form is
/// URL-safe base64 without padding.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Cursor(Bytes);

impl Cursor {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Cursor(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&URL_SAFE_NO_PAD.encode(&self.0))
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cursor({})", self)
    }
}

impl FromStr for Cursor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim_end_matches('=');
        URL_SAFE_NO_PAD
            .decode(trimmed)
            .map(|b| Cursor(Bytes::from(b)))
            .map_err(|e| Error::InvalidQuery(format!("invalid cursor {:?}: {}", s, e)))
    }
}

/// Query specification
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Entity kind (empty for a kindless query)
    pub kind: String,
    /// Namespace override; `None` uses the client's namespace
    pub namespace: Option<String>,
    pub ancestor: Option<Key>,
    pub filters: Vec<Filter>,
    pub projection: Vec<String>,
    pub distinct: bool,
    pub distinct_on: Vec<String>,
    pub orders: Vec<Order>,
    /// Maximum rows, negative for unlimited
    pub limit: i32,
    pub offset: i32,
    pub start: Option<Cursor>,
    pub end: Option<Cursor>,
    pub eventual: bool,
    pub keys_only: bool,
    pub transaction: Option<TransactionId>,
    err: Option<String>,
}

impl Query {
    /// Query over entities of `kind`.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: None,
            ancestor: None,
            filters: Vec::new(),
            projection: Vec::new(),
            distinct: false,
            distinct_on: Vec::new(),
            orders: Vec::new(),
            limit: -1,
            offset: 0,
            start: None,
            end: None,
            eventual: false,
            keys_only: false,
            transaction: None,
            err: None,
        }
    }

    /// Query over entities of every kind.
    pub fn kindless() -> Self {
        Self::new("")
    }

    fn with(&self, f: impl FnOnce(&mut Query)) -> Query {
        let mut q = self.clone();
        f(&mut q);
        q
    }

    fn with_err(&self, msg: String) -> Query {
        self.with(|q| {
            if q.err.is_none() {
                q.err = Some(msg);
            }
        })
    }

    pub fn kind(&self, kind: impl Into<String>) -> Query {
        let kind = kind.into();
        self.with(|q| q.kind = kind)
    }

    pub fn namespace(&self, namespace: impl Into<String>) -> Query {
        let namespace = namespace.into();
        self.with(|q| q.namespace = Some(namespace))
    }

    /// Restrict results to descendants of `ancestor` (including itself).
    pub fn ancestor(&self, ancestor: &Key) -> Query {
        let ancestor = ancestor.clone();
        self.with(|q| q.ancestor = Some(ancestor))
    }

    /// Add a filter written as `"Field op"`, e.g. `"Age >="`.
    ///
    /// Accepted operators are `=`, `<`, `<=`, `>`, `>=` and `!=`.
    pub fn filter(&self, filter: &str, value: impl Into<Value>) -> Query {
        match parse_filter(filter) {
            Ok((field, op)) => self.push_filter(field, op, value.into()),
            Err(msg) => self.with_err(msg),
        }
    }

    /// Add a filter with a separate field name and operator string.
    pub fn filter_field(&self, field: &str, op: &str, value: impl Into<Value>) -> Query {
        let field = field.trim();
        if field.is_empty() {
            return self.with_err("empty filter field name".to_string());
        }
        match op.parse::<Operator>() {
            Ok(op) => self.push_filter(field.to_string(), op, value.into()),
            Err(e) => self.with_err(e.to_string()),
        }
    }

    fn push_filter(&self, field: String, op: Operator, value: Value) -> Query {
        self.with(|q| q.filters.push(Filter { field, op, value }))
    }

    /// Return only the named properties.
    pub fn project(&self, fields: &[&str]) -> Query {
        let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
        self.with(|q| q.projection.extend(fields))
    }

    /// Drop duplicate projected rows.
    pub fn distinct(&self) -> Query {
        self.with(|q| q.distinct = true)
    }

    /// Keep one row per distinct combination of `fields`.
    pub fn distinct_on(&self, fields: &[&str]) -> Query {
        let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
        self.with(|q| q.distinct_on.extend(fields))
    }

    /// Sort on a field; a leading `-` sorts descending.
    pub fn order(&self, field: &str) -> Query {
        let field = field.trim();
        let (name, direction) = match field.strip_prefix('-') {
            Some(rest) => (rest.trim(), Direction::Descending),
            None => (field, Direction::Ascending),
        };
        if name.is_empty() {
            return self.with_err("empty order field name".to_string());
        }
        let order = Order {
            field: name.to_string(),
            direction,
        };
        self.with(|q| q.orders.push(order))
    }

    pub fn limit(&self, limit: i32) -> Query {
        self.with(|q| q.limit = limit)
    }

    pub fn offset(&self, offset: i32) -> Query {
        self.with(|q| q.offset = offset)
    }

    /// Resume after `cursor`.
    pub fn start(&self, cursor: Cursor) -> Query {
        self.with(|q| q.start = Some(cursor))
    }

    /// Stop at `cursor`.
    pub fn end(&self, cursor: Cursor) -> Query {
        self.with(|q| q.end = Some(cursor))
    }

    pub fn eventual_consistency(&self) -> Query {
        self.with(|q| q.eventual = true)
    }

    /// Return keys without entity bodies.
    pub fn keys_only(&self) -> Query {
        self.with(|q| q.keys_only = true)
    }

    /// Run inside the given transaction.
    pub fn transaction(&self, txn: &TransactionId) -> Query {
        let txn = txn.clone();
        self.with(|q| q.transaction = Some(txn))
    }

    pub fn is_kindless(&self) -> bool {
        self.kind.is_empty()
    }

    pub fn is_projection(&self) -> bool {
        !self.projection.is_empty()
    }

    /// Check the query before it is sent.
    pub fn validate(&self) -> Result<()> {
        if let Some(err) = &self.err {
            return Err(Error::InvalidQuery(err.clone()));
        }

        if self.is_kindless() {
            if let Some(f) = self.filters.iter().find(|f| f.field != KEY_PROPERTY) {
                return Err(Error::InvalidQuery(format!(
                    "kind is required for filter: {}",
                    f.field
                )));
            }
            if self.orders.iter().any(|o| !o.is_key_ascending()) {
                return Err(Error::InvalidQuery(
                    "kind is required for all orders except __key__ ascending".to_string(),
                ));
            }
        }

        if let Some(ancestor) = &self.ancestor {
            if ancestor.is_incomplete() {
                return Err(Error::InvalidQuery("ancestor key must be complete".to_string()));
            }
        }

        for f in &self.filters {
            if f.op.takes_list() {
                let Value::Array(values) = &f.value else {
                    return Err(Error::InvalidQuery(format!(
                        "operator {} on {} requires a list of values",
                        f.op, f.field
                    )));
                };
                if f.field == KEY_PROPERTY && values.iter().any(|v| v.as_key().is_none()) {
                    return Err(Error::InvalidQuery(format!(
                        "{} filter values must be keys",
                        KEY_PROPERTY
                    )));
                }
            } else if f.field == KEY_PROPERTY && f.value.as_key().is_none() {
                return Err(Error::InvalidQuery(format!(
                    "{} filter value must be a key, got {}",
                    KEY_PROPERTY,
                    f.value.type_name()
                )));
            }
        }

        if self.keys_only && self.is_projection() {
            return Err(Error::InvalidQuery(
                "projection and keys-only are mutually exclusive".to_string(),
            ));
        }

        for (i, p) in self.projection.iter().enumerate() {
            if self.projection[..i].contains(p) {
                return Err(Error::InvalidQuery(format!("duplicate projection field {}", p)));
            }
        }

        if (self.distinct || !self.distinct_on.is_empty()) && !self.is_projection() {
            return Err(Error::InvalidQuery("distinct requires a projection".to_string()));
        }

        if let Some(f) = self.distinct_on.iter().find(|f| !self.projection.contains(f)) {
            return Err(Error::InvalidQuery(format!(
                "distinct-on field {} must be projected",
                f
            )));
        }

        if self.offset < 0 {
            return Err(Error::InvalidQuery("negative query offset".to_string()));
        }

        Ok(())
    }

    /// Fields whose values make a row distinct, empty when rows are not
    /// de-duplicated.
    pub fn distinct_fields(&self) -> &[String] {
        if !self.distinct_on.is_empty() {
            &self.distinct_on
        } else if self.distinct {
            &self.projection
        } else {
            &[]
        }
    }
}

lazy_static! {
    /// `"Field op"` with an optional run of spaces before the operator
    static ref FILTER_RE: Regex = Regex::new(r"^\s*(.*?)\s*(<=|>=|!=|==|=|<|>)\s*$").unwrap();
}

/// Splits `"Field op"` into its parts.
fn parse_filter(filter: &str) -> std::result::Result<(String, Operator), String> {
    let caps = FILTER_RE
        .captures(filter)
        .ok_or_else(|| format!("invalid filter {:?}: missing operator", filter))?;
    let field = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
    if field.is_empty() {
        return Err(format!("invalid filter {:?}: missing field name", filter));
    }
    let op = caps
        .get(2)
        .map(|m| m.as_str())
        .unwrap_or_default()
        .parse::<Operator>()
        .map_err(|e| e.to_string())?;
    Ok((field.to_string(), op))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_is_value_semantic() {
        let base = Query::new("SQChild");
        let filtered = base.filter("I>", 1);
        assert!(base.filters.is_empty());
        assert_eq!(filtered.filters.len(), 1);
        assert_eq!(filtered.filters[0].field, "I");
        assert_eq!(filtered.filters[0].op, Operator::GreaterThan);
    }

    #[test]
    fn test_filter_parsing() {
        let q = Query::new("K")
            .filter("A =", 1)
            .filter("B<=", 2)
            .filter("  C >= ", 3)
            .filter("D!=", 4);
        let ops: Vec<_> = q.filters.iter().map(|f| (f.field.as_str(), f.op)).collect();
        assert_eq!(
            ops,
            vec![
                ("A", Operator::Equal),
                ("B", Operator::LessThanOrEqual),
                ("C", Operator::GreaterThanOrEqual),
                ("D", Operator::NotEqual),
            ]
        );
        assert!(q.validate().is_ok());
    }

    #[test]
    fn test_builder_errors_are_deferred() {
        let q = Query::new("K").filter("NoOperator", 1).limit(3);
        assert_eq!(q.limit, 3);
        assert!(matches!(q.validate(), Err(Error::InvalidQuery(_))));

        let q = Query::new("K").filter_field("A", "~", 1);
        assert!(matches!(q.validate(), Err(Error::InvalidQuery(_))));

        let q = Query::new("K").filter(">", 1);
        assert!(q.validate().is_err());

        let q = Query::new("K").order("-");
        assert!(q.validate().is_err());
    }

    #[test]
    fn test_order_parsing() {
        let q = Query::new("K").order("-I").order("J");
        assert_eq!(q.orders[0].direction, Direction::Descending);
        assert_eq!(q.orders[0].field, "I");
        assert_eq!(q.orders[1].direction, Direction::Ascending);
    }

    #[test]
    fn test_kindless_restrictions() {
        let parent = Key::name_key("Tweedle", "tweedle", None);
        let ok = Query::kindless()
            .ancestor(&parent)
            .filter("__key__ >", Key::name_key("Tweedle", "a", None))
            .order("__key__");
        assert!(ok.validate().is_ok());

        match Query::kindless().filter("I =", 1).validate() {
            Err(Error::InvalidQuery(msg)) => assert_eq!(msg, "kind is required for filter: I"),
            other => panic!("unexpected {:?}", other),
        }
        match Query::kindless().order("-__key__").validate() {
            Err(Error::InvalidQuery(msg)) => {
                assert_eq!(msg, "kind is required for all orders except __key__ ascending")
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(Query::kindless().order("I").validate().is_err());
    }

    #[test]
    fn test_key_filter_requires_key() {
        assert!(Query::new("K").filter("__key__ =", 5).validate().is_err());
        let keys = Value::array(vec![Key::id_key("K", 1, None), Key::id_key("K", 2, None)]);
        assert!(Query::new("K").filter_field("__key__", "in", keys).validate().is_ok());
    }

    #[test]
    fn test_list_operators_require_arrays() {
        assert!(Query::new("K").filter_field("I", "in", 2).validate().is_err());
        assert!(Query::new("K")
            .filter_field("I", "not-in", vec![1, 3])
            .validate()
            .is_ok());
    }

    #[test]
    fn test_projection_rules() {
        let q = Query::new("K").project(&["J"]);
        assert!(q.distinct().validate().is_ok());
        assert!(q.distinct_on(&["J"]).validate().is_ok());
        assert!(q.distinct_on(&["U"]).validate().is_err());
        assert!(q.keys_only().validate().is_err());
        assert!(Query::new("K").distinct().validate().is_err());
        assert!(Query::new("K").project(&["J", "J"]).validate().is_err());
        assert_eq!(q.distinct().distinct_fields(), &["J".to_string()]);
        assert!(q.distinct_fields().is_empty());
    }

    #[test]
    fn test_limit_and_offset_bounds() {
        assert!(Query::new("K").limit(-1).validate().is_ok());
        assert!(Query::new("K").limit(0).validate().is_ok());
        // every negative limit means unlimited
        assert!(Query::new("K").limit(-2).validate().is_ok());
        assert!(Query::new("K").limit(-5).validate().is_ok());
        assert!(Query::new("K").offset(-1).validate().is_err());
    }

    #[test]
    fn test_incomplete_ancestor() {
        let q = Query::new("K").ancestor(&Key::incomplete("P", None));
        assert!(q.validate().is_err());
    }

    #[test]
    fn test_cursor_text_form() {
        let cursor = Cursor::from_bytes(vec![0xfb, 0xff, 0x00, 0x10]);
        let text = cursor.to_string();
        assert!(!text.contains('+') && !text.contains('/') && !text.contains('='));
        assert_eq!(text.parse::<Cursor>().unwrap(), cursor);
        assert!("not base64!".parse::<Cursor>().is_err());
    }
}
