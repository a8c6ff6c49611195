//! Filtering, sorting, paging and includes over an in-memory table.
//!
//! Descriptors are plain JSON:
//!
//! - `filter`: object of field path to expected wire value (`null` matches
//!   null). Entries are ANDed.
//! - `sort`: a field path or an array of them; a leading `-` sorts
//!   descending.
//! - `params.include`: association names whose children are returned as
//!   subsets.

use std::cmp::Ordering;
use std::sync::Arc;

use rowsync_core::entity::{get_path, Entity};
use rowsync_core::messages::{QueryRequest, WireValue};
use rowsync_core::metadata::DbSetInfo;
use rowsync_core::types::Value;

use super::store::{MemoryStore, StoreSnapshot};
use crate::service::error::ServiceError;
use crate::service::handler::{IncludedSubset, QueryResult, TotalCount};

struct SortKey {
    path: String,
    descending: bool,
}

/// Runs `request` against the committed rows of `db_set`.
///
/// # Errors
///
/// Returns a protocol error for malformed descriptors or unknown field and
/// association names.
pub fn run_query(
    store: &MemoryStore,
    snapshot: &StoreSnapshot,
    db_set: &DbSetInfo,
    request: &QueryRequest,
) -> Result<QueryResult, ServiceError> {
    let mut rows: Vec<&Arc<dyn Entity>> = match snapshot.table(&db_set.db_set_name) {
        Some(table) => table.values().collect(),
        None => Vec::new(),
    };

    if let Some(filter) = parse_filter(db_set, &request.filter)? {
        let mut kept = Vec::with_capacity(rows.len());
        for entity in rows {
            if matches_filter(store, db_set, &**entity, &filter)? {
                kept.push(entity);
            }
        }
        rows = kept;
    }

    let sort = parse_sort(db_set, &request.sort)?;
    if !sort.is_empty() {
        rows.sort_by(|a, b| compare_entities(&***a, &***b, &sort));
    }

    let total = rows.len() as u64;
    if let Some(size) = request.page_size.filter(|s| *s > 0) {
        let size = size as usize;
        let skip = (request.page_index as usize).saturating_mul(size);
        let take = size.saturating_mul(request.page_count.unwrap_or(1).max(1) as usize);
        rows = rows.into_iter().skip(skip).take(take).collect();
    }

    let mut result = QueryResult::new(rows.iter().map(|e| e.clone_entity()).collect())
        .with_total_count(TotalCount::Known(total));
    for subset in includes(store, snapshot, db_set, &rows, &request.params)? {
        result = result.with_subset(subset);
    }
    Ok(result)
}

// -- Filter ------------------------------------------------------------------

fn parse_filter<'a>(
    db_set: &DbSetInfo,
    filter: &'a serde_json::Value,
) -> Result<Option<Vec<(&'a str, &'a serde_json::Value)>>, ServiceError> {
    match filter {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Object(map) if map.is_empty() => Ok(None),
        serde_json::Value::Object(map) => {
            let mut terms = Vec::with_capacity(map.len());
            for (path, expected) in map {
                if db_set.field_by_path(path).is_none() {
                    return Err(ServiceError::protocol(format!(
                        "filter names unknown field '{path}' of '{}'",
                        db_set.db_set_name
                    )));
                }
                terms.push((path.as_str(), expected));
            }
            Ok(Some(terms))
        }
        other => Err(ServiceError::protocol(format!(
            "filter must be an object, got {other}"
        ))),
    }
}

fn matches_filter(
    store: &MemoryStore,
    db_set: &DbSetInfo,
    entity: &dyn Entity,
    terms: &[(&str, &serde_json::Value)],
) -> Result<bool, ServiceError> {
    for (path, expected) in terms {
        let Some(field) = db_set.field_by_path(path) else {
            return Ok(false);
        };
        let actual = store.serializer().field_value(field, entity)?;
        let matched = match (expected, &actual) {
            (serde_json::Value::Null, WireValue::Null) => true,
            (serde_json::Value::String(s), WireValue::Text(t)) => s == t,
            (serde_json::Value::Number(n), WireValue::Text(t)) => n.to_string() == *t,
            (serde_json::Value::Bool(b), WireValue::Text(t)) => b.to_string() == *t,
            _ => false,
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

// -- Sort --------------------------------------------------------------------

fn parse_sort(db_set: &DbSetInfo, sort: &serde_json::Value) -> Result<Vec<SortKey>, ServiceError> {
    let specs: Vec<&str> = match sort {
        serde_json::Value::Null => Vec::new(),
        serde_json::Value::String(s) => vec![s.as_str()],
        serde_json::Value::Array(items) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .ok_or_else(|| ServiceError::protocol("sort entries must be strings"))
            })
            .collect::<Result<_, _>>()?,
        other => {
            return Err(ServiceError::protocol(format!(
                "sort must be a string or an array, got {other}"
            )))
        }
    };
    specs
        .into_iter()
        .map(|term| {
            let (path, descending) = match term.strip_prefix('-') {
                Some(rest) => (rest, true),
                None => (term, false),
            };
            if db_set.field_by_path(path).is_none() {
                return Err(ServiceError::protocol(format!(
                    "sort names unknown field '{path}' of '{}'",
                    db_set.db_set_name
                )));
            }
            Ok(SortKey {
                path: path.to_string(),
                descending,
            })
        })
        .collect()
}

fn compare_entities(a: &dyn Entity, b: &dyn Entity, keys: &[SortKey]) -> Ordering {
    for key in keys {
        let left = get_path(a, &key.path).unwrap_or(Value::Null);
        let right = get_path(b, &key.path).unwrap_or(Value::Null);
        let ord = compare_values(&left, &right);
        let ord = if key.descending { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Total order over native values. Nulls sort first; values of different
/// variants order by variant name.
#[must_use]
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Decimal(x), Value::Decimal(y)) => x.cmp(y),
        (Value::Float(x), Value::Float(y)) => x.total_cmp(y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::DateTime(x), Value::DateTime(y)) => x.cmp(y),
        (Value::Time(x), Value::Time(y)) => x.cmp(y),
        (Value::Guid(x), Value::Guid(y)) => x.cmp(y),
        (Value::Bytes(x), Value::Bytes(y)) => x.cmp(y),
        _ => a.type_name().cmp(b.type_name()),
    }
}

// -- Includes ----------------------------------------------------------------

fn includes(
    store: &MemoryStore,
    snapshot: &StoreSnapshot,
    db_set: &DbSetInfo,
    parents: &[&Arc<dyn Entity>],
    params: &serde_json::Value,
) -> Result<Vec<IncludedSubset>, ServiceError> {
    let names: Vec<&str> = match params.get("include") {
        None | Some(serde_json::Value::Null) => return Ok(Vec::new()),
        Some(serde_json::Value::String(s)) => vec![s.as_str()],
        Some(serde_json::Value::Array(items)) => items.iter().filter_map(|v| v.as_str()).collect(),
        Some(other) => {
            return Err(ServiceError::protocol(format!(
                "include must be a string or an array, got {other}"
            )))
        }
    };

    let mut subsets = Vec::with_capacity(names.len());
    for name in names {
        let assoc = store
            .metadata()
            .association(name)
            .filter(|a| a.parent_db_set == db_set.db_set_name)
            .ok_or_else(|| {
                ServiceError::protocol(format!(
                    "'{name}' is not an association with parent '{}'",
                    db_set.db_set_name
                ))
            })?;
        let children = snapshot
            .table(&assoc.child_db_set)
            .map(|t| {
                t.values()
                    .filter(|child| {
                        parents.iter().any(|parent| {
                            assoc.field_rels.iter().all(|rel| {
                                let p = get_path(&***parent, &rel.parent_field);
                                p.as_ref().is_some_and(|v| !v.is_null())
                                    && p == get_path(&***child, &rel.child_field)
                            })
                        })
                    })
                    .map(|child| child.clone_entity())
                    .collect()
            })
            .unwrap_or_default();
        subsets.push(IncludedSubset {
            db_set_name: assoc.child_db_set.clone(),
            entities: children,
        });
    }
    Ok(subsets)
}
