//! The query evaluator.
//!
//! A query is a tree of and/or nodes over leaf criteria, evaluated against
//! the materialized collection state: pick candidates (an index bucket for
//! an equality hit on the hinted path, a full scan otherwise), test the
//! predicate, sort, then apply seek and limit.

use std::cmp::Ordering;

use braid_core::InstanceId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::path::path_value;

/// Comparison operator of a leaf criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Ge,
}

/// One leaf comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Criterion {
    /// Dotted path into the instance.
    pub path: String,
    /// Comparison operator.
    pub op: Operation,
    /// Comparison operand.
    pub value: Value,
}

/// The predicate tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Filter {
    /// Every branch must match.
    And(Vec<Filter>),
    /// At least one branch must match.
    Or(Vec<Filter>),
    /// A leaf comparison.
    Cmp(Criterion),
}

impl Filter {
    /// `path == value`
    pub fn eq(path: impl Into<String>, value: Value) -> Self {
        Filter::cmp(path, Operation::Eq, value)
    }

    /// `path != value`
    pub fn ne(path: impl Into<String>, value: Value) -> Self {
        Filter::cmp(path, Operation::Ne, value)
    }

    /// `path < value`
    pub fn lt(path: impl Into<String>, value: Value) -> Self {
        Filter::cmp(path, Operation::Lt, value)
    }

    /// `path <= value`
    pub fn le(path: impl Into<String>, value: Value) -> Self {
        Filter::cmp(path, Operation::Le, value)
    }

    /// `path > value`
    pub fn gt(path: impl Into<String>, value: Value) -> Self {
        Filter::cmp(path, Operation::Gt, value)
    }

    /// `path >= value`
    pub fn ge(path: impl Into<String>, value: Value) -> Self {
        Filter::cmp(path, Operation::Ge, value)
    }

    /// An arbitrary leaf.
    pub fn cmp(path: impl Into<String>, op: Operation, value: Value) -> Self {
        Filter::Cmp(Criterion {
            path: path.into(),
            op,
            value,
        })
    }

    /// Conjunction of branches.
    pub fn and(branches: Vec<Filter>) -> Self {
        Filter::And(branches)
    }

    /// Disjunction of branches.
    pub fn or(branches: Vec<Filter>) -> Self {
        Filter::Or(branches)
    }

    /// Test an instance against the predicate. A missing path never
    /// matches, whatever the operator.
    pub fn matches(&self, instance: &Value) -> bool {
        match self {
            Filter::And(branches) => branches.iter().all(|branch| branch.matches(instance)),
            Filter::Or(branches) => branches.iter().any(|branch| branch.matches(instance)),
            Filter::Cmp(criterion) => {
                let Some(actual) = path_value(instance, &criterion.path) else {
                    return false;
                };
                let ordering = compare_values(actual, &criterion.value);
                match criterion.op {
                    Operation::Eq => ordering == Ordering::Equal,
                    Operation::Ne => ordering != Ordering::Equal,
                    Operation::Lt => ordering == Ordering::Less,
                    Operation::Le => ordering != Ordering::Greater,
                    Operation::Gt => ordering == Ordering::Greater,
                    Operation::Ge => ordering != Ordering::Less,
                }
            }
        }
    }

    /// The equality operand required on `path` for every possible match,
    /// if there is one. Only criteria on the mandatory (`And`) spine
    /// qualify; an `Or` branch cannot narrow the candidate set.
    pub(crate) fn required_eq(&self, path: &str) -> Option<&Value> {
        match self {
            Filter::And(branches) => branches.iter().find_map(|branch| branch.required_eq(path)),
            Filter::Or(_) => None,
            Filter::Cmp(criterion) => {
                (criterion.op == Operation::Eq && criterion.path == path)
                    .then_some(&criterion.value)
            }
        }
    }
}

/// Sort direction of `order_by`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortDirection {
    /// Smallest first.
    #[default]
    Asc,
    /// Largest first.
    Desc,
}

/// A declarative query against one collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Query {
    /// Predicate; `None` matches everything.
    pub filter: Option<Filter>,
    /// Path to sort the results on.
    pub order_by: Option<String>,
    /// Sort direction.
    pub direction: SortDirection,
    /// Maximum number of results.
    pub limit: Option<usize>,
    /// Drop results whose `_id` is not strictly greater than this.
    pub seek: Option<InstanceId>,
    /// Prefer the index on this path when the predicate pins it with an
    /// equality.
    pub use_index: Option<String>,
}

impl Query {
    /// Match every instance.
    pub fn new() -> Self {
        Query::default()
    }

    /// Restrict to instances matching `filter`.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Sort ascending on a path.
    pub fn order_by(mut self, path: impl Into<String>) -> Self {
        self.order_by = Some(path.into());
        self.direction = SortDirection::Asc;
        self
    }

    /// Sort descending on a path.
    pub fn order_by_desc(mut self, path: impl Into<String>) -> Self {
        self.order_by = Some(path.into());
        self.direction = SortDirection::Desc;
        self
    }

    /// Keep at most `limit` results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skip past the page ending at `id`.
    pub fn seek(mut self, id: InstanceId) -> Self {
        self.seek = Some(id);
        self
    }

    /// Hint the index to scan.
    pub fn use_index(mut self, path: impl Into<String>) -> Self {
        self.use_index = Some(path.into());
        self
    }

    /// Order results after filtering: sort, seek, limit.
    pub(crate) fn finish(&self, mut hits: Vec<(Value, Vec<u8>)>) -> Vec<Vec<u8>> {
        if let Some(order_path) = &self.order_by {
            hits.sort_by(|(a, _), (b, _)| {
                let left = path_value(a, order_path);
                let right = path_value(b, order_path);
                let ordering = match (left, right) {
                    (Some(left), Some(right)) => compare_values(left, right),
                    (None, Some(_)) => Ordering::Less,
                    (Some(_), None) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                };
                match self.direction {
                    SortDirection::Asc => ordering,
                    SortDirection::Desc => ordering.reverse(),
                }
            });
        }
        let mut out: Vec<Vec<u8>> = hits
            .into_iter()
            .filter(|(instance, _)| match self.seek {
                Some(seek) => instance_id_of(instance)
                    .map(|id| id > seek)
                    .unwrap_or(true),
                None => true,
            })
            .map(|(_, bytes)| bytes)
            .collect();
        if let Some(limit) = self.limit {
            out.truncate(limit);
        }
        out
    }
}

/// Total order across JSON values: numbers compare numerically, strings
/// lexicographically, mixed types as strings of their JSON encoding.
pub(crate) fn compare_values(left: &Value, right: &Value) -> Ordering {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            let a = a.as_f64().unwrap_or(f64::NAN);
            let b = b.as_f64().unwrap_or(f64::NAN);
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (a, b) => a.to_string().cmp(&b.to_string()),
    }
}

pub(crate) fn instance_id_of(instance: &Value) -> Option<InstanceId> {
    instance.get("_id")?.as_str()?.parse().ok()
}
