//! Task-type capabilities
//!
//! One [`TaskCapability`] per data category. They share the upstream client
//! and the small JSON helpers below; everything else (concurrency,
//! checkpointing, output) lives in the Engine.

mod region;
mod series;
mod social;
mod word_graph;

pub use region::RegionDistribution;
pub use series::{SeriesCapability, SeriesKind};
pub use social::{ProfileCapability, ProfileKind};
pub use word_graph::WordGraph;

use crate::crawler::capability::TaskCapability;
use crate::crawler::fetcher::{FetchError, UpstreamClient};
use crate::state::TaskType;
use chrono::NaiveDate;
use serde_json::{json, Value};
use std::sync::Arc;

/// Builds the capability that harvests `task_type`
pub fn capability_for(task_type: TaskType, upstream: Arc<UpstreamClient>) -> Arc<dyn TaskCapability> {
    match task_type {
        TaskType::SearchIndex => Arc::new(SeriesCapability::new(SeriesKind::Search, upstream)),
        TaskType::FeedIndex => Arc::new(SeriesCapability::new(SeriesKind::Feed, upstream)),
        TaskType::WordGraph => Arc::new(WordGraph::new(upstream)),
        TaskType::DemographicAttributes => {
            Arc::new(ProfileCapability::new(ProfileKind::Demographic, upstream))
        }
        TaskType::InterestProfile => {
            Arc::new(ProfileCapability::new(ProfileKind::Interest, upstream))
        }
        TaskType::RegionDistribution => Arc::new(RegionDistribution::new(upstream)),
    }
}

/// Takes the `data` object out of a status-checked response body
pub(crate) fn data_of(mut body: Value) -> Result<Value, FetchError> {
    match body.get_mut("data").map(Value::take) {
        Some(Value::Null) | None => Err(FetchError::Malformed(
            "response has no data object".to_string(),
        )),
        Some(data) => Ok(data),
    }
}

/// Returns `data[field]` as an array or a malformed-response error
pub(crate) fn array_field<'a>(data: &'a Value, field: &str) -> Result<&'a [Value], FetchError> {
    data.get(field)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .ok_or_else(|| FetchError::Malformed(format!("response has no '{}' list", field)))
}

/// Encodes keywords the way the trend endpoints expect: `[[{"name":..,"wordType":1}],..]`
pub(crate) fn word_param(keywords: &[String]) -> String {
    let groups: Vec<Value> = keywords
        .iter()
        .map(|k| json!([{ "name": k, "wordType": 1 }]))
        .collect();
    Value::Array(groups).to_string()
}

/// Reads a keyword out of either a plain string or a `[{"name": ..}]` list
pub(crate) fn first_name(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(entries) => entries
            .first()
            .and_then(|e| e.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

/// Renders a JSON scalar as a CSV cell, using `default` for missing values
pub(crate) fn value_text(value: Option<&Value>, default: &str) -> String {
    match value {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => default.to_string(),
    }
}

pub(crate) fn ymd(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub(crate) fn compact_date(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// Normalizes an upstream period such as `20240101|20240107` to ISO dates
pub(crate) fn format_period(raw: &str) -> String {
    raw.split('|')
        .map(|part| {
            NaiveDate::parse_from_str(part.trim(), "%Y%m%d")
                .map(ymd)
                .unwrap_or_else(|_| part.trim().to_string())
        })
        .collect::<Vec<_>>()
        .join("|")
}

/// Sum and rounded mean of a decoded series
pub(crate) fn summarize(values: &[i64]) -> (i64, i64) {
    let total: i64 = values.iter().sum();
    if values.is_empty() {
        return (0, 0);
    }
    let avg = (total as f64 / values.len() as f64).round() as i64;
    (avg, total)
}
