/// Query evaluation over a snapshot of entities
///
/// Pipeline: match filters, expand projections, sort, drop distinct
/// duplicates, then cut the window between the start and end cursors and
/// hand out one batch of it, honouring offset, limit and page size.

use keel_core::key::KEY_PROPERTY;
use keel_core::query::{Direction, Filter, Operator};
use keel_core::{
    Cursor, Entity, Error, Key, MoreResults, Property, Query, QueryBatch, QueryResult, Result,
    Value,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;

/// Position of a row in a query's result order.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Position {
    order_values: Vec<Value>,
    key: Key,
    /// Index among the projection rows of one entity
    row: usize,
}

impl Position {
    fn encode(&self) -> Result<Cursor> {
        bincode::serialize(self)
            .map(Cursor::from_bytes)
            .map_err(|e| Error::Transport(format!("cursor encoding failed: {}", e)))
    }

    /// An empty cursor is the start of the results.
    fn decode(cursor: &Cursor) -> Result<Option<Position>> {
        if cursor.is_empty() {
            return Ok(None);
        }
        bincode::deserialize(cursor.as_bytes())
            .map(Some)
            .map_err(|e| Error::InvalidArgument(format!("invalid cursor: {}", e)))
    }
}

struct Row {
    pos: Position,
    entity: Entity,
    /// Values of the projected properties, in projection order
    projected: Vec<Value>,
}

/// Indexed values of `field`, with arrays expanded. `None` when the entity
/// has no indexed value for it.
fn field_values(key: &Key, entity: &Entity, field: &str) -> Option<Vec<Value>> {
    if field == KEY_PROPERTY {
        return Some(vec![Value::Key(key.clone())]);
    }
    let mut values = Vec::new();
    for p in entity.properties.iter().filter(|p| p.name == field && p.indexed) {
        match &p.value {
            Value::Array(items) => values.extend(items.iter().cloned()),
            other => values.push(other.clone()),
        }
    }
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

fn matches_filter(key: &Key, entity: &Entity, filter: &Filter) -> bool {
    let Some(values) = field_values(key, entity, &filter.field) else {
        return false;
    };
    let list = filter.value.as_array().unwrap_or_default();
    values.iter().any(|v| {
        let ord = v.compare(&filter.value);
        match filter.op {
            Operator::Equal => ord == Ordering::Equal,
            Operator::NotEqual => ord != Ordering::Equal,
            Operator::LessThan => ord == Ordering::Less,
            Operator::LessThanOrEqual => ord != Ordering::Greater,
            Operator::GreaterThan => ord == Ordering::Greater,
            Operator::GreaterThanOrEqual => ord != Ordering::Less,
            Operator::In => list.iter().any(|t| v.compare(t) == Ordering::Equal),
            Operator::NotIn => !list.iter().any(|t| v.compare(t) == Ordering::Equal),
        }
    })
}

fn compare_positions(a: &Position, b: &Position, query: &Query) -> Ordering {
    for (i, order) in query.orders.iter().enumerate() {
        let ord = a.order_values[i].compare(&b.order_values[i]);
        let ord = match order.direction {
            Direction::Ascending => ord,
            Direction::Descending => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.key.cmp(&b.key).then(a.row.cmp(&b.row))
}

/// Cartesian product of per-field value lists.
fn combinations(lists: &[Vec<Value>]) -> Vec<Vec<Value>> {
    let mut out: Vec<Vec<Value>> = vec![Vec::new()];
    for list in lists {
        out = out
            .into_iter()
            .flat_map(|prefix| {
                list.iter().map(move |v| {
                    let mut next = prefix.clone();
                    next.push(v.clone());
                    next
                })
            })
            .collect();
    }
    out
}

/// Rows produced by one entity, or none if it lacks an order or projection
/// property.
fn rows_for(key: &Key, entity: &Entity, query: &Query) -> Option<Vec<Row>> {
    let mut order_values = Vec::with_capacity(query.orders.len());
    for order in &query.orders {
        let values = field_values(key, entity, &order.field)?;
        let pick = match order.direction {
            Direction::Ascending => values.into_iter().min_by(|a, b| a.compare(b)),
            Direction::Descending => values.into_iter().max_by(|a, b| a.compare(b)),
        };
        order_values.push(pick?);
    }

    if !query.is_projection() {
        let entity = if query.keys_only {
            Entity::with_key(key.clone())
        } else {
            let mut e = entity.clone();
            e.key = Some(key.clone());
            e
        };
        return Some(vec![Row {
            pos: Position {
                order_values,
                key: key.clone(),
                row: 0,
            },
            entity,
            projected: Vec::new(),
        }]);
    }

    let lists = query
        .projection
        .iter()
        .map(|f| field_values(key, entity, f))
        .collect::<Option<Vec<_>>>()?;
    let rows = combinations(&lists)
        .into_iter()
        .enumerate()
        .map(|(row, values)| Row {
            pos: Position {
                order_values: order_values.clone(),
                key: key.clone(),
                row,
            },
            entity: Entity {
                key: Some(key.clone()),
                properties: query
                    .projection
                    .iter()
                    .zip(values.iter())
                    .map(|(name, v)| Property::new(name.clone(), v.clone()))
                    .collect(),
            },
            projected: values,
        })
        .collect();
    Some(rows)
}

/// Every row the query matches, in result order.
fn matching_rows<'a, I>(entities: I, query: &Query, namespace: &str) -> Result<Vec<Row>>
where
    I: IntoIterator<Item = (&'a Key, &'a Entity)>,
{
    let mut rows = Vec::new();
    for (key, entity) in entities {
        if key.namespace() != namespace {
            continue;
        }
        if !query.is_kindless() && key.kind() != query.kind {
            continue;
        }
        if let Some(ancestor) = &query.ancestor {
            if !key.has_ancestor(ancestor) {
                continue;
            }
        }
        if !query.filters.iter().all(|f| matches_filter(key, entity, f)) {
            continue;
        }
        if let Some(entity_rows) = rows_for(key, entity, query) {
            rows.extend(entity_rows);
        }
    }

    rows.sort_by(|a, b| compare_positions(&a.pos, &b.pos, query));

    let distinct = query.distinct_fields();
    if !distinct.is_empty() {
        let indexes: Vec<usize> = distinct
            .iter()
            .filter_map(|f| query.projection.iter().position(|p| p == f))
            .collect();
        let mut seen = HashSet::new();
        let mut kept = Vec::with_capacity(rows.len());
        for row in rows {
            let values: Vec<&Value> = indexes.iter().map(|&i| &row.projected[i]).collect();
            let fingerprint = bincode::serialize(&values)
                .map_err(|e| Error::Transport(format!("distinct fingerprint failed: {}", e)))?;
            if seen.insert(fingerprint) {
                kept.push(row);
            }
        }
        rows = kept;
    }
    Ok(rows)
}

/// Run one batch of `query`.
pub(crate) fn run_batch<'a, I>(
    entities: I,
    query: &Query,
    namespace: &str,
    page_size: usize,
) -> Result<(QueryBatch, Vec<Key>)>
where
    I: IntoIterator<Item = (&'a Key, &'a Entity)>,
{
    query
        .validate()
        .map_err(|e| Error::InvalidArgument(e.to_string()))?;
    let rows = matching_rows(entities, query, namespace)?;
    let matched_keys = rows.iter().map(|r| r.pos.key.clone()).collect();

    let start = query.start.as_ref().map(Position::decode).transpose()?.flatten();
    let end = query.end.as_ref().map(Position::decode).transpose()?.flatten();

    let lo = match &start {
        Some(p) => rows.partition_point(|r| compare_positions(&r.pos, p, query) != Ordering::Greater),
        None => 0,
    };
    let hi = match &end {
        Some(p) => rows.partition_point(|r| compare_positions(&r.pos, p, query) != Ordering::Greater),
        None => rows.len(),
    }
    .max(lo);
    let window = &rows[lo..hi];

    let page_size = page_size.max(1);
    let offset = query.offset.max(0) as usize;
    let skip = offset.min(page_size).min(window.len());
    // rows only come once the whole offset is consumed
    let mut take = if skip < offset {
        0
    } else {
        (page_size - skip).min(window.len() - skip)
    };
    let limit_hit = query.limit >= 0 && skip == offset && (query.limit as usize) <= take;
    if query.limit >= 0 {
        take = take.min(query.limit as usize);
    }

    let skipped_cursor = if skip > 0 {
        Some(window[skip - 1].pos.encode()?)
    } else {
        None
    };

    let mut results = Vec::with_capacity(take);
    for row in &window[skip..skip + take] {
        results.push(QueryResult {
            key: row.pos.key.clone(),
            entity: row.entity.clone(),
            cursor: row.pos.encode()?,
        });
    }

    let examined = skip + take;
    let end_cursor = if examined > 0 {
        window[examined - 1].pos.encode()?
    } else {
        query.start.clone().unwrap_or_default()
    };

    let exhausted = examined == window.len();
    let more_results = if limit_hit {
        MoreResults::MoreResultsAfterLimit
    } else if exhausted && hi < rows.len() {
        MoreResults::MoreResultsAfterCursor
    } else if exhausted {
        MoreResults::NoMoreResults
    } else {
        MoreResults::NotFinished
    };

    let batch = QueryBatch {
        results,
        skipped_results: skip as i32,
        skipped_cursor,
        end_cursor,
        more_results,
    };
    Ok((batch, matched_keys))
}
