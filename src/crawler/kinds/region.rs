//! Regional distribution of search interest

use super::{array_field, data_of, first_name, format_period, value_text, ymd};
use crate::credential::Lease;
use crate::crawler::capability::{mismatched, DecodedPayload, ItemOutput, RawPayload, TaskCapability};
use crate::crawler::fetcher::{FetchError, UpstreamClient};
use crate::crawler::work::{expand_matrix, WorkItem};
use crate::state::{TaskParameters, TaskType};
use crate::ConfigResult;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{Map, Value};
use std::sync::Arc;

const REGION_PATH: &str = "/api/SearchApi/region";

const COLUMNS: &[&str] = &[
    "keyword",
    "query_region_code",
    "query_region",
    "level",
    "code",
    "value",
    "period",
];

/// Breakdown levels in the response, with their output label
const LEVELS: [(&str, &str); 2] = [("prov", "province"), ("city", "city")];

pub struct RegionDistribution {
    upstream: Arc<UpstreamClient>,
}

impl RegionDistribution {
    pub fn new(upstream: Arc<UpstreamClient>) -> Self {
        Self { upstream }
    }

    fn default_period(item: &WorkItem) -> String {
        item.range
            .map(|r| format!("{}|{}", ymd(r.start), ymd(r.end)))
            .unwrap_or_default()
    }

    fn empty_row(item: &WorkItem, keyword: &str) -> Vec<String> {
        vec![
            keyword.to_string(),
            item.region.code.to_string(),
            item.region.name.clone(),
            String::new(),
            String::new(),
            "0".to_string(),
            Self::default_period(item),
        ]
    }
}

/// `(code, value)` pairs of one level, ordered by numeric code
fn level_values(map: &Map<String, Value>) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = map
        .iter()
        .map(|(code, value)| (code.clone(), value_text(Some(value), "0")))
        .collect();
    pairs.sort_by_key(|(code, _)| code.parse::<u64>().unwrap_or(u64::MAX));
    pairs
}

#[async_trait]
impl TaskCapability for RegionDistribution {
    fn task_type(&self) -> TaskType {
        TaskType::RegionDistribution
    }

    fn columns(&self) -> &'static [&'static str] {
        COLUMNS
    }

    fn expand(&self, params: &TaskParameters, today: NaiveDate) -> ConfigResult<Vec<WorkItem>> {
        let TaskParameters::RegionDistribution(p) = params else {
            return Err(mismatched(self.task_type(), params));
        };
        let ranges = p.dates.resolve(today);
        Ok(expand_matrix(&p.keywords, p.batch_size, &p.regions, Some(&ranges)))
    }

    async fn fetch(&self, item: &WorkItem, lease: &Lease) -> Result<RawPayload, FetchError> {
        let mut query = vec![
            ("region", item.region.code.to_string()),
            ("word", item.keywords.join(",")),
        ];
        if let Some(range) = item.range {
            query.push(("startDate", ymd(range.start)));
            query.push(("endDate", ymd(range.end)));
        }

        let body = self.upstream.get_json(REGION_PATH, &query, lease).await?;
        Ok(RawPayload::plain(data_of(body)?))
    }

    fn series_len(&self, _item: &WorkItem) -> usize {
        0
    }

    fn transform(&self, item: &WorkItem, payload: DecodedPayload) -> Result<ItemOutput, FetchError> {
        let entries = array_field(&payload.data, "region")?;
        let mut output = ItemOutput::default();

        for keyword in &item.keywords {
            let entry = entries
                .iter()
                .find(|e| e.get("key").and_then(first_name).as_deref() == Some(keyword.as_str()));
            let Some(entry) = entry else {
                output.rows.push(Self::empty_row(item, keyword));
                continue;
            };

            let period = entry
                .get("period")
                .and_then(Value::as_str)
                .map(format_period)
                .unwrap_or_else(|| Self::default_period(item));

            let before = output.rows.len();
            for (field, level) in LEVELS {
                let Some(map) = entry.get(field).and_then(Value::as_object) else {
                    continue;
                };
                for (code, value) in level_values(map) {
                    output.rows.push(vec![
                        keyword.clone(),
                        item.region.code.to_string(),
                        item.region.name.clone(),
                        level.to_string(),
                        code,
                        value,
                        period.clone(),
                    ]);
                }
            }
            if output.rows.len() == before {
                output.rows.push(Self::empty_row(item, keyword));
            }
        }

        Ok(output)
    }

    fn placeholder(&self, item: &WorkItem) -> ItemOutput {
        ItemOutput {
            rows: item
                .keywords
                .iter()
                .map(|k| Self::empty_row(item, k))
                .collect(),
            stats: Vec::new(),
        }
    }
}
