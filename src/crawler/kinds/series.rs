//! Search and feed index time series
//!
//! Both categories fetch a batch of keywords for one region and date range and
//! return one encrypted series per keyword and device. Rows are one per
//! keyword × point of the range; the stats file carries one row per keyword.

use super::{array_field, data_of, first_name, summarize, value_text, word_param, ymd};
use crate::credential::Lease;
use crate::crawler::capability::{
    mismatched, DecodedPayload, EncryptedSeries, ItemOutput, RawPayload, TaskCapability,
};
use crate::crawler::fetcher::{FetchError, UpstreamClient};
use crate::crawler::work::{expand_matrix, WorkItem};
use crate::state::{DateRange, TaskParameters, TaskType};
use crate::ConfigResult;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use std::sync::Arc;

const SEARCH_PATH: &str = "/api/SearchApi/index";
const FEED_PATH: &str = "/api/FeedSearchApi/getFeedIndex";

/// Devices the search index is split by
const SEARCH_LABELS: [&str; 3] = ["all", "pc", "wise"];
const FEED_LABEL: &str = "value";

const SEARCH_COLUMNS: &[&str] = &["keyword", "region_code", "region", "date", "all", "pc", "wise"];
const SEARCH_STATS_COLUMNS: &[&str] = &[
    "keyword",
    "region_code",
    "region",
    "start_date",
    "end_date",
    "all_avg",
    "all_total",
    "pc_avg",
    "pc_total",
    "wise_avg",
    "wise_total",
];

const FEED_COLUMNS: &[&str] = &[
    "keyword",
    "region_code",
    "region",
    "date",
    "granularity",
    "value",
];
const FEED_STATS_COLUMNS: &[&str] = &[
    "keyword",
    "region_code",
    "region",
    "start_date",
    "end_date",
    "avg",
    "yoy",
    "qoq",
    "total",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesKind {
    Search,
    Feed,
}

pub struct SeriesCapability {
    kind: SeriesKind,
    upstream: Arc<UpstreamClient>,
}

impl SeriesCapability {
    pub fn new(kind: SeriesKind, upstream: Arc<UpstreamClient>) -> Self {
        Self { kind, upstream }
    }

    fn path(&self) -> &'static str {
        match self.kind {
            SeriesKind::Search => SEARCH_PATH,
            SeriesKind::Feed => FEED_PATH,
        }
    }

    fn entries_field(&self) -> &'static str {
        match self.kind {
            SeriesKind::Search => "userIndexes",
            SeriesKind::Feed => "index",
        }
    }

    fn keyword_field(&self) -> &'static str {
        match self.kind {
            SeriesKind::Search => "word",
            SeriesKind::Feed => "key",
        }
    }

    /// Pulls every cipher string out of the response entries
    fn encrypted_series(&self, item: &WorkItem, data: &Value) -> Result<Vec<EncryptedSeries>, FetchError> {
        let entries = array_field(data, self.entries_field())?;
        let mut series = Vec::new();

        for (i, entry) in entries.iter().enumerate() {
            let Some(keyword) = entry
                .get(self.keyword_field())
                .and_then(first_name)
                .or_else(|| item.keywords.get(i).cloned())
            else {
                continue;
            };

            match self.kind {
                SeriesKind::Search => {
                    for label in SEARCH_LABELS {
                        series.push(EncryptedSeries {
                            keyword: keyword.clone(),
                            label: label.to_string(),
                            cipher: cipher_at(entry.get(label).and_then(|s| s.get("data"))),
                        });
                    }
                }
                SeriesKind::Feed => series.push(EncryptedSeries {
                    keyword,
                    label: FEED_LABEL.to_string(),
                    cipher: cipher_at(entry.get("data")),
                }),
            }
        }

        Ok(series)
    }

    fn rows(&self, item: &WorkItem, range: DateRange, payload: &DecodedPayload) -> ItemOutput {
        let dates = range.dates();
        let zeros = vec![0i64; dates.len()];
        let mut output = ItemOutput::default();

        for keyword in &item.keywords {
            let head = [
                keyword.clone(),
                item.region.code.to_string(),
                item.region.name.clone(),
            ];

            match self.kind {
                SeriesKind::Search => {
                    let columns: Vec<&[i64]> = SEARCH_LABELS
                        .iter()
                        .map(|label| payload.series(keyword, label).unwrap_or(&zeros))
                        .collect();

                    for (i, date) in dates.iter().enumerate() {
                        let mut row = head.to_vec();
                        row.push(ymd(*date));
                        row.extend(columns.iter().map(|c| point(c, i).to_string()));
                        output.rows.push(row);
                    }

                    let mut stats = head.to_vec();
                    stats.extend([ymd(range.start), ymd(range.end)]);
                    for column in &columns {
                        let (avg, total) = summarize(column);
                        stats.extend([avg.to_string(), total.to_string()]);
                    }
                    output.stats.push(stats);
                }
                SeriesKind::Feed => {
                    let values = payload.series(keyword, FEED_LABEL).unwrap_or(&zeros);
                    let granularity = range.granularity().as_str();

                    for (i, date) in dates.iter().enumerate() {
                        let mut row = head.to_vec();
                        row.extend([
                            ymd(*date),
                            granularity.to_string(),
                            point(values, i).to_string(),
                        ]);
                        output.rows.push(row);
                    }

                    let ratio = feed_ratio(&payload.data, keyword);
                    let (computed_avg, total) = summarize(values);
                    let mut stats = head.to_vec();
                    stats.extend([
                        ymd(range.start),
                        ymd(range.end),
                        value_text(ratio.and_then(|r| r.get("avg")), &computed_avg.to_string()),
                        value_text(ratio.and_then(|r| r.get("yoy")), "-"),
                        value_text(ratio.and_then(|r| r.get("qoq")), "-"),
                        total.to_string(),
                    ]);
                    output.stats.push(stats);
                }
            }
        }

        output
    }
}

fn cipher_at(value: Option<&Value>) -> String {
    value.and_then(Value::as_str).unwrap_or("").to_string()
}

fn point(values: &[i64], i: usize) -> i64 {
    values.get(i).copied().unwrap_or(0)
}

/// `generalRatio` of the feed entry for `keyword`, if the response has one
fn feed_ratio<'a>(data: &'a Value, keyword: &str) -> Option<&'a Value> {
    data.get("index")?
        .as_array()?
        .iter()
        .find(|e| e.get("key").and_then(first_name).as_deref() == Some(keyword))?
        .get("generalRatio")
}

fn require_range(item: &WorkItem) -> Result<DateRange, FetchError> {
    item.range
        .ok_or_else(|| FetchError::Malformed("series item has no date range".to_string()))
}

#[async_trait]
impl TaskCapability for SeriesCapability {
    fn task_type(&self) -> TaskType {
        match self.kind {
            SeriesKind::Search => TaskType::SearchIndex,
            SeriesKind::Feed => TaskType::FeedIndex,
        }
    }

    fn columns(&self) -> &'static [&'static str] {
        match self.kind {
            SeriesKind::Search => SEARCH_COLUMNS,
            SeriesKind::Feed => FEED_COLUMNS,
        }
    }

    fn stats_columns(&self) -> &'static [&'static str] {
        match self.kind {
            SeriesKind::Search => SEARCH_STATS_COLUMNS,
            SeriesKind::Feed => FEED_STATS_COLUMNS,
        }
    }

    fn expand(&self, params: &TaskParameters, today: NaiveDate) -> ConfigResult<Vec<WorkItem>> {
        let p = match (self.kind, params) {
            (SeriesKind::Search, TaskParameters::SearchIndex(p))
            | (SeriesKind::Feed, TaskParameters::FeedIndex(p)) => p,
            _ => return Err(mismatched(self.task_type(), params)),
        };
        let ranges = p.dates.resolve(today);
        Ok(expand_matrix(&p.keywords, p.batch_size, &p.regions, Some(&ranges)))
    }

    async fn fetch(&self, item: &WorkItem, lease: &Lease) -> Result<RawPayload, FetchError> {
        let range = require_range(item)?;
        let query = [
            ("area", item.region.code.to_string()),
            ("word", word_param(&item.keywords)),
            ("startDate", ymd(range.start)),
            ("endDate", ymd(range.end)),
        ];

        let data = data_of(self.upstream.get_json(self.path(), &query, lease).await?)?;
        let encrypted = self.encrypted_series(item, &data)?;

        let cipher_key = if encrypted.iter().any(|s| !s.cipher.is_empty()) {
            let uniqid = data
                .get("uniqid")
                .and_then(Value::as_str)
                .ok_or_else(|| FetchError::Malformed("response has no uniqid".to_string()))?;
            self.upstream.fetch_cipher_key(uniqid, lease).await?
        } else {
            None
        };

        Ok(RawPayload {
            data,
            cipher_key,
            encrypted,
        })
    }

    fn series_len(&self, item: &WorkItem) -> usize {
        item.range.map(|r| r.points()).unwrap_or(0)
    }

    fn transform(&self, item: &WorkItem, payload: DecodedPayload) -> Result<ItemOutput, FetchError> {
        let range = require_range(item)?;
        Ok(self.rows(item, range, &payload))
    }

    fn placeholder(&self, item: &WorkItem) -> ItemOutput {
        let empty = DecodedPayload {
            data: Value::Null,
            series: Vec::new(),
        };
        match item.range {
            Some(range) => self.rows(item, range, &empty),
            None => ItemOutput::default(),
        }
    }
}
