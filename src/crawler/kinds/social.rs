//! Audience profiles: demographic attributes and interests
//!
//! Both endpoints take a keyword list and answer with the latest period the
//! upstream has, so items carry no date range and are always national.

use super::{array_field, data_of, value_text};
use crate::credential::Lease;
use crate::crawler::capability::{mismatched, DecodedPayload, ItemOutput, RawPayload, TaskCapability};
use crate::crawler::fetcher::{FetchError, UpstreamClient};
use crate::crawler::work::{expand_matrix, WorkItem};
use crate::state::{Region, TaskParameters, TaskType};
use crate::ConfigResult;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use std::sync::Arc;

const DEMOGRAPHIC_PATH: &str = "/api/SocialApi/baseAttributes";
const INTEREST_PATH: &str = "/api/SocialApi/interest";

const DEMOGRAPHIC_COLUMNS: &[&str] = &[
    "keyword",
    "attribute_type",
    "attribute_value",
    "rate",
    "tgi",
    "period",
];
const INTEREST_COLUMNS: &[&str] = &["keyword", "interest", "tgi", "rate", "period"];

/// Attribute groups of the demographic response
const ATTRIBUTE_GROUPS: [&str; 2] = ["gender", "age"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileKind {
    Demographic,
    Interest,
}

pub struct ProfileCapability {
    kind: ProfileKind,
    upstream: Arc<UpstreamClient>,
}

impl ProfileCapability {
    pub fn new(kind: ProfileKind, upstream: Arc<UpstreamClient>) -> Self {
        Self { kind, upstream }
    }

    fn empty_row(&self, keyword: &str, period: &str) -> Vec<String> {
        match self.kind {
            ProfileKind::Demographic => vec![
                keyword.to_string(),
                String::new(),
                String::new(),
                "0".to_string(),
                "0".to_string(),
                period.to_string(),
            ],
            ProfileKind::Interest => vec![
                keyword.to_string(),
                String::new(),
                "0".to_string(),
                "0".to_string(),
                period.to_string(),
            ],
        }
    }

    fn entry_rows(&self, keyword: &str, entry: &Value, period: &str) -> Vec<Vec<String>> {
        let mut rows = Vec::new();
        match self.kind {
            ProfileKind::Demographic => {
                for group in ATTRIBUTE_GROUPS {
                    for attr in entry.get(group).and_then(Value::as_array).into_iter().flatten() {
                        rows.push(vec![
                            keyword.to_string(),
                            group.to_string(),
                            value_text(attr.get("desc"), ""),
                            value_text(attr.get("rate"), "0"),
                            value_text(attr.get("tgi"), ""),
                            period.to_string(),
                        ]);
                    }
                }
            }
            ProfileKind::Interest => {
                for interest in entry.get("interest").and_then(Value::as_array).into_iter().flatten() {
                    rows.push(vec![
                        keyword.to_string(),
                        value_text(interest.get("desc"), ""),
                        value_text(interest.get("tgi"), ""),
                        value_text(interest.get("rate"), "0"),
                        period.to_string(),
                    ]);
                }
            }
        }
        rows
    }
}

fn period_of(data: &Value) -> String {
    let start = value_text(data.get("startDate"), "");
    let end = value_text(data.get("endDate"), "");
    if start.is_empty() && end.is_empty() {
        String::new()
    } else {
        format!("{}|{}", start, end)
    }
}

#[async_trait]
impl TaskCapability for ProfileCapability {
    fn task_type(&self) -> TaskType {
        match self.kind {
            ProfileKind::Demographic => TaskType::DemographicAttributes,
            ProfileKind::Interest => TaskType::InterestProfile,
        }
    }

    fn columns(&self) -> &'static [&'static str] {
        match self.kind {
            ProfileKind::Demographic => DEMOGRAPHIC_COLUMNS,
            ProfileKind::Interest => INTEREST_COLUMNS,
        }
    }

    fn expand(&self, params: &TaskParameters, _today: NaiveDate) -> ConfigResult<Vec<WorkItem>> {
        let p = match (self.kind, params) {
            (ProfileKind::Demographic, TaskParameters::DemographicAttributes(p))
            | (ProfileKind::Interest, TaskParameters::InterestProfile(p)) => p,
            _ => return Err(mismatched(self.task_type(), params)),
        };
        Ok(expand_matrix(&p.keywords, p.batch_size, &[Region::national()], None))
    }

    async fn fetch(&self, item: &WorkItem, lease: &Lease) -> Result<RawPayload, FetchError> {
        let path = match self.kind {
            ProfileKind::Demographic => DEMOGRAPHIC_PATH,
            ProfileKind::Interest => INTEREST_PATH,
        };
        let query: Vec<(&str, String)> = item
            .keywords
            .iter()
            .map(|k| ("wordlist[]", k.clone()))
            .collect();

        let body = self.upstream.get_json(path, &query, lease).await?;
        Ok(RawPayload::plain(data_of(body)?))
    }

    fn series_len(&self, _item: &WorkItem) -> usize {
        0
    }

    fn transform(&self, item: &WorkItem, payload: DecodedPayload) -> Result<ItemOutput, FetchError> {
        let entries = array_field(&payload.data, "result")?;
        let period = period_of(&payload.data);
        let mut output = ItemOutput::default();

        for keyword in &item.keywords {
            let rows = entries
                .iter()
                .find(|e| e.get("word").and_then(Value::as_str) == Some(keyword.as_str()))
                .map(|entry| self.entry_rows(keyword, entry, &period))
                .unwrap_or_default();

            if rows.is_empty() {
                output.rows.push(self.empty_row(keyword, &period));
            } else {
                output.rows.extend(rows);
            }
        }

        Ok(output)
    }

    fn placeholder(&self, item: &WorkItem) -> ItemOutput {
        ItemOutput {
            rows: item.keywords.iter().map(|k| self.empty_row(k, "")).collect(),
            stats: Vec::new(),
        }
    }
}
