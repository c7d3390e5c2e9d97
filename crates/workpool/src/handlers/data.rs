use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::handler::TaskHandler;
use crate::handlers::{parse_payload, AGGREGATE, FILTER, SORT};

#[derive(Debug, Deserialize)]
struct AggregateRequest {
    values: Vec<f64>,
}

#[derive(Debug, Serialize, PartialEq)]
struct Aggregates {
    count: usize,
    sum: f64,
    mean: Option<f64>,
    min: Option<f64>,
    max: Option<f64>,
    median: Option<f64>,
    std_dev: Option<f64>,
}

impl Aggregates {
    fn compute(mut values: Vec<f64>) -> Self {
        let count = values.len();
        let sum = values.iter().sum::<f64>();
        if count == 0 {
            return Self {
                count,
                sum,
                mean: None,
                min: None,
                max: None,
                median: None,
                std_dev: None,
            };
        }

        values.sort_by(f64::total_cmp);
        let n = count as f64;
        let mean = sum / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let mid = count / 2;
        let median = if count % 2 == 0 {
            (values[mid - 1] + values[mid]) / 2.0
        } else {
            values[mid]
        };

        Self {
            count,
            sum,
            mean: Some(mean),
            min: values.first().copied(),
            max: values.last().copied(),
            median: Some(median),
            std_dev: Some(variance.sqrt()),
        }
    }
}

/// Summary statistics (population standard deviation) over a list of numbers.
pub struct AggregateHandler;

impl TaskHandler for AggregateHandler {
    fn handle(&self, payload: Value) -> anyhow::Result<Value> {
        let request: AggregateRequest = parse_payload(AGGREGATE, payload)?;
        Ok(serde_json::to_value(Aggregates::compute(request.values))?)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
}

#[derive(Debug, Deserialize)]
struct FilterRequest {
    items: Vec<Value>,
    /// Compare this top-level field of each item instead of the item itself
    field: Option<String>,
    op: FilterOp,
    value: Value,
}

pub struct FilterHandler;

impl TaskHandler for FilterHandler {
    fn handle(&self, payload: Value) -> anyhow::Result<Value> {
        let request: FilterRequest = parse_payload(FILTER, payload)?;
        let FilterRequest {
            items,
            field,
            op,
            value,
        } = request;

        let kept = items
            .into_iter()
            .filter(|item| {
                let Some(subject) = select(item, field.as_deref()) else {
                    return false;
                };
                matches_op(subject, op, &value)
            })
            .collect();

        Ok(Value::Array(kept))
    }
}

fn matches_op(subject: &Value, op: FilterOp, value: &Value) -> bool {
    match op {
        FilterOp::Eq => compare(subject, value) == Ordering::Equal,
        FilterOp::Ne => compare(subject, value) != Ordering::Equal,
        // Ordering comparisons only make sense between values of one type
        FilterOp::Gt => same_type(subject, value) && compare(subject, value) == Ordering::Greater,
        FilterOp::Gte => same_type(subject, value) && compare(subject, value) != Ordering::Less,
        FilterOp::Lt => same_type(subject, value) && compare(subject, value) == Ordering::Less,
        FilterOp::Lte => same_type(subject, value) && compare(subject, value) != Ordering::Greater,
        FilterOp::Contains => match (subject, value) {
            (Value::String(s), Value::String(needle)) => s.contains(needle.as_str()),
            (Value::Array(items), needle) => items
                .iter()
                .any(|item| compare(item, needle) == Ordering::Equal),
            _ => false,
        },
    }
}

#[derive(Debug, Deserialize)]
struct SortRequest {
    items: Vec<Value>,
    field: Option<String>,
    #[serde(default)]
    descending: bool,
}

/// Stable sort. Items missing `field` sort first, as if it were null.
pub struct SortHandler;

impl TaskHandler for SortHandler {
    fn handle(&self, payload: Value) -> anyhow::Result<Value> {
        let request: SortRequest = parse_payload(SORT, payload)?;
        let field = request.field.as_deref();
        let mut items = request.items;

        items.sort_by(|a, b| {
            let a = select(a, field).unwrap_or(&Value::Null);
            let b = select(b, field).unwrap_or(&Value::Null);
            let ordering = compare(a, b);
            if request.descending {
                ordering.reverse()
            } else {
                ordering
            }
        });

        Ok(Value::Array(items))
    }
}

fn select<'a>(item: &'a Value, field: Option<&str>) -> Option<&'a Value> {
    match field {
        Some(field) => item.get(field),
        None => Some(item),
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn same_type(a: &Value, b: &Value) -> bool {
    type_rank(a) == type_rank(b)
}

/// Total order over JSON values: by type first, then by value. Numbers compare
/// numerically, so `1` equals `1.0`.
fn compare(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Number(a), Value::Number(b)) => {
            let a = a.as_f64().unwrap_or(f64::NAN);
            let b = b.as_f64().unwrap_or(f64::NAN);
            a.total_cmp(&b)
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Array(a), Value::Array(b)) => a
            .iter()
            .zip(b.iter())
            .map(|(a, b)| compare(a, b))
            .find(|ordering| ordering.is_ne())
            .unwrap_or_else(|| a.len().cmp(&b.len())),
        (Value::Object(_), Value::Object(_)) => {
            if a == b {
                Ordering::Equal
            } else {
                a.to_string().cmp(&b.to_string())
            }
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}
