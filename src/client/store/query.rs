//! Query language
//!
//! A small Mongo-flavoured subset, enough for the lookups consumers build:
//!
//! ```json
//! { "task": "nuvs" }                              // equality
//! { "user.id": "bob" }                            // sub-field match
//! { "task": { "$regex": ["nuv", "i"] } }          // case-insensitive regex
//! { "$or": [ { "state": "running" }, { "state": "waiting" } ] }
//! { "progress": { "$gte": 0.5, "$lt": 1 } }
//! ```
//!
//! Top-level clauses are AND-ed. Queries are compiled once by
//! [`Query::parse`] and then evaluated against documents.

use std::cmp::Ordering;

use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};

use crate::shared::document::Document;
use crate::shared::error::SyncError;

/// A compiled query
#[derive(Debug, Clone)]
pub enum Query {
    /// Matches every document
    All,
    And(Vec<Query>),
    Or(Vec<Query>),
    Field { path: String, condition: Condition },
}

/// A predicate on the value(s) found at one path
#[derive(Debug, Clone)]
pub enum Condition {
    Eq(Value),
    Ne(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    Regex(Regex),
    Exists(bool),
    Every(Vec<Condition>),
}

impl Query {
    /// Compile a JSON query. `null` and `{}` match everything.
    pub fn parse(value: &Value) -> Result<Self, SyncError> {
        match value {
            Value::Null => Ok(Query::All),
            Value::Object(map) => parse_object(map),
            other => Err(SyncError::query(format!("query must be an object, got {}", other))),
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Query::All => true,
            Query::And(parts) => parts.iter().all(|q| q.matches(doc)),
            Query::Or(parts) => parts.iter().any(|q| q.matches(doc)),
            Query::Field { path, condition } => {
                condition.test(&values_at(doc.fields(), path))
            }
        }
    }

    /// A top-level equality clause usable for an index lookup
    pub fn equality_hint(&self) -> Option<(&str, &Value)> {
        match self {
            Query::Field {
                path,
                condition: Condition::Eq(value),
            } => Some((path.as_str(), value)),
            Query::And(parts) => parts.iter().find_map(Query::equality_hint),
            _ => None,
        }
    }
}

fn parse_object(map: &Map<String, Value>) -> Result<Query, SyncError> {
    let mut clauses = Vec::with_capacity(map.len());
    for (key, value) in map {
        let clause = match key.as_str() {
            "$or" => Query::Or(parse_list(key, value)?),
            "$and" => Query::And(parse_list(key, value)?),
            op if op.starts_with('$') => {
                return Err(SyncError::query(format!("unknown top-level operator {}", op)))
            }
            path => Query::Field {
                path: path.to_string(),
                condition: parse_condition(value)?,
            },
        };
        clauses.push(clause);
    }
    Ok(match clauses.len() {
        0 => Query::All,
        1 => clauses.remove(0),
        _ => Query::And(clauses),
    })
}

fn parse_list(key: &str, value: &Value) -> Result<Vec<Query>, SyncError> {
    value
        .as_array()
        .ok_or_else(|| SyncError::query(format!("{} expects an array", key)))?
        .iter()
        .map(Query::parse)
        .collect()
}

fn parse_condition(value: &Value) -> Result<Condition, SyncError> {
    let operators = match value {
        Value::Object(map) if map.keys().any(|k| k.starts_with('$')) => map,
        other => return Ok(Condition::Eq(other.clone())),
    };

    let options = operators.get("$options").and_then(Value::as_str);
    let mut conditions = Vec::new();
    for (op, arg) in operators {
        let condition = match op.as_str() {
            "$eq" => Condition::Eq(arg.clone()),
            "$ne" => Condition::Ne(arg.clone()),
            "$in" => Condition::In(expect_array(op, arg)?),
            "$nin" => Condition::Nin(expect_array(op, arg)?),
            "$gt" => Condition::Gt(arg.clone()),
            "$gte" => Condition::Gte(arg.clone()),
            "$lt" => Condition::Lt(arg.clone()),
            "$lte" => Condition::Lte(arg.clone()),
            "$exists" => Condition::Exists(arg.as_bool().unwrap_or(true)),
            "$regex" => Condition::Regex(compile_regex(arg, options)?),
            "$options" => continue,
            other => return Err(SyncError::query(format!("unknown operator {}", other))),
        };
        conditions.push(condition);
    }
    Ok(match conditions.len() {
        1 => conditions.remove(0),
        _ => Condition::Every(conditions),
    })
}

fn expect_array(op: &str, arg: &Value) -> Result<Vec<Value>, SyncError> {
    arg.as_array()
        .cloned()
        .ok_or_else(|| SyncError::query(format!("{} expects an array", op)))
}

/// `"pattern"` or `["pattern", "flags"]`, with optional `$options` flags
fn compile_regex(arg: &Value, options: Option<&str>) -> Result<Regex, SyncError> {
    let (pattern, flags) = match arg {
        Value::String(pattern) => (pattern.as_str(), options.unwrap_or("")),
        Value::Array(parts) => {
            let pattern = parts
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| SyncError::query("$regex array needs a pattern string"))?;
            let flags = parts.get(1).and_then(Value::as_str).or(options).unwrap_or("");
            (pattern, flags)
        }
        other => return Err(SyncError::query(format!("$regex expects a string, got {}", other))),
    };

    let mut builder = RegexBuilder::new(pattern);
    for flag in flags.chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            'g' => &mut builder,
            other => return Err(SyncError::query(format!("unsupported regex flag {}", other))),
        };
    }
    builder
        .build()
        .map_err(|e| SyncError::query(format!("invalid regex {}: {}", pattern, e)))
}

impl Condition {
    /// Evaluate against every value resolved at the path
    fn test(&self, found: &[&Value]) -> bool {
        match self {
            Condition::Eq(expected) => any_equal(found, expected),
            Condition::Ne(expected) => !any_equal(found, expected),
            Condition::In(options) => options.iter().any(|o| any_equal(found, o)),
            Condition::Nin(options) => !options.iter().any(|o| any_equal(found, o)),
            Condition::Gt(bound) => any_ordered(found, bound, |o| o == Ordering::Greater),
            Condition::Gte(bound) => any_ordered(found, bound, |o| o != Ordering::Less),
            Condition::Lt(bound) => any_ordered(found, bound, |o| o == Ordering::Less),
            Condition::Lte(bound) => any_ordered(found, bound, |o| o != Ordering::Greater),
            Condition::Regex(regex) => scalars(found).any(|v| v.as_str().is_some_and(|s| regex.is_match(s))),
            Condition::Exists(expected) => !found.is_empty() == *expected,
            Condition::Every(conditions) => conditions.iter().all(|c| c.test(found)),
        }
    }
}

/// Values found at `path`, fanning out across arrays of objects
pub(crate) fn values_at<'a>(fields: &'a Map<String, Value>, path: &str) -> Vec<&'a Value> {
    let parts: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    if let Some((head, rest)) = parts.split_first() {
        if let Some(value) = fields.get(*head) {
            collect(value, rest, &mut out);
        }
    }
    out
}

fn collect<'a>(value: &'a Value, parts: &[&str], out: &mut Vec<&'a Value>) {
    let Some((head, rest)) = parts.split_first() else {
        out.push(value);
        return;
    };
    match value {
        Value::Object(map) => {
            if let Some(next) = map.get(*head) {
                collect(next, rest, out);
            }
        }
        Value::Array(items) => match head.parse::<usize>() {
            Ok(index) => {
                if let Some(next) = items.get(index) {
                    collect(next, rest, out);
                }
            }
            Err(_) => {
                for item in items {
                    collect(item, parts, out);
                }
            }
        },
        _ => {}
    }
}

/// Found values plus the elements of any found arrays
fn scalars<'a>(found: &'a [&'a Value]) -> impl Iterator<Item = &'a Value> + 'a {
    found.iter().flat_map(|v| match v {
        Value::Array(items) => items.iter().collect::<Vec<_>>(),
        other => vec![*other],
    })
}

fn any_equal(found: &[&Value], expected: &Value) -> bool {
    if found.is_empty() {
        return expected.is_null();
    }
    found.iter().any(|v| *v == expected) || scalars(found).any(|v| v == expected)
}

fn any_ordered(found: &[&Value], bound: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    scalars(found).any(|v| compare_same_type(v, bound).is_some_and(&accept))
}

fn compare_same_type(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Total order used for sorting: missing/null < bool < number < string < array < object
pub(crate) fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(Value::Array(_)) => 4,
            Some(Value::Object(_)) => 5,
        }
    }
    match (a, b) {
        (Some(x), Some(y)) => compare_same_type(x, y).unwrap_or_else(|| rank(a).cmp(&rank(b))),
        _ => rank(a).cmp(&rank(b)),
    }
}
