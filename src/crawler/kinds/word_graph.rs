//! Related-word graph
//!
//! The graph endpoint answers for one keyword and one week at a time, so the
//! matrix is keyword × week; every item covers a single start-of-week date.

use super::{array_field, compact_date, data_of, format_period, value_text};
use crate::credential::Lease;
use crate::crawler::capability::{mismatched, DecodedPayload, ItemOutput, RawPayload, TaskCapability};
use crate::crawler::fetcher::{FetchError, UpstreamClient};
use crate::crawler::work::WorkItem;
use crate::state::{DateRange, Region, TaskParameters, TaskType};
use crate::ConfigResult;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

const WORD_GRAPH_PATH: &str = "/api/WordGraph/multi";

const COLUMNS: &[&str] = &["keyword", "related_word", "pv", "ratio", "sim", "period"];

pub struct WordGraph {
    upstream: Arc<UpstreamClient>,
}

impl WordGraph {
    pub fn new(upstream: Arc<UpstreamClient>) -> Self {
        Self { upstream }
    }

    fn empty_row(keyword: &str, period: &str) -> Vec<String> {
        vec![
            keyword.to_string(),
            String::new(),
            "0".to_string(),
            "0".to_string(),
            "0".to_string(),
            period.to_string(),
        ]
    }

    fn item_date(item: &WorkItem) -> String {
        item.range.map(|r| compact_date(r.start)).unwrap_or_default()
    }
}

/// Start-of-week dates covering every range, without duplicates
fn week_dates(ranges: &[DateRange]) -> BTreeSet<NaiveDate> {
    let mut dates = BTreeSet::new();
    for range in ranges {
        let mut current = range.start;
        while current <= range.end {
            dates.insert(current);
            current += ChronoDuration::days(7);
        }
    }
    dates
}

#[async_trait]
impl TaskCapability for WordGraph {
    fn task_type(&self) -> TaskType {
        TaskType::WordGraph
    }

    fn columns(&self) -> &'static [&'static str] {
        COLUMNS
    }

    fn expand(&self, params: &TaskParameters, today: NaiveDate) -> ConfigResult<Vec<WorkItem>> {
        let TaskParameters::WordGraph(p) = params else {
            return Err(mismatched(self.task_type(), params));
        };
        let dates = week_dates(&p.dates.resolve(today));

        let mut items = Vec::with_capacity(p.keywords.len() * dates.len());
        for keyword in &p.keywords {
            for date in &dates {
                items.push(WorkItem::new(
                    vec![keyword.clone()],
                    Region::national(),
                    Some(DateRange::single(*date)),
                ));
            }
        }
        Ok(items)
    }

    async fn fetch(&self, item: &WorkItem, lease: &Lease) -> Result<RawPayload, FetchError> {
        let mut query: Vec<(&str, String)> = item
            .keywords
            .iter()
            .map(|k| ("wordlist[]", k.clone()))
            .collect();
        query.push(("datelist", Self::item_date(item)));

        let body = self.upstream.get_json(WORD_GRAPH_PATH, &query, lease).await?;
        Ok(RawPayload::plain(data_of(body)?))
    }

    fn series_len(&self, _item: &WorkItem) -> usize {
        0
    }

    fn transform(&self, item: &WorkItem, payload: DecodedPayload) -> Result<ItemOutput, FetchError> {
        let entries = array_field(&payload.data, "wordlist")?;
        let period = payload
            .data
            .get("period")
            .and_then(Value::as_str)
            .map(format_period)
            .unwrap_or_default();
        let mut output = ItemOutput::default();

        for keyword in &item.keywords {
            let graph = entries
                .iter()
                .find(|e| e.get("keyword").and_then(Value::as_str) == Some(keyword.as_str()))
                .and_then(|e| e.get("wordGraph"))
                .and_then(Value::as_array);

            match graph {
                Some(graph) if !graph.is_empty() => {
                    for node in graph {
                        output.rows.push(vec![
                            keyword.clone(),
                            value_text(node.get("word"), ""),
                            value_text(node.get("pv"), "0"),
                            value_text(node.get("ratio"), "0"),
                            value_text(node.get("sim"), "0"),
                            period.clone(),
                        ]);
                    }
                }
                _ => output.rows.push(Self::empty_row(keyword, &period)),
            }
        }

        Ok(output)
    }

    fn placeholder(&self, item: &WorkItem) -> ItemOutput {
        let date = Self::item_date(item);
        ItemOutput {
            rows: item
                .keywords
                .iter()
                .map(|k| Self::empty_row(k, &date))
                .collect(),
            stats: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{DateSpec, GraphParameters};
    use serde_json::json;

    fn date(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, d).unwrap()
    }

    fn capability() -> WordGraph {
        WordGraph::new(Arc::new(UpstreamClient::new(&Default::default()).unwrap()))
    }

    #[test]
    fn test_expand_one_item_per_keyword_week() {
        let params = TaskParameters::WordGraph(GraphParameters {
            keywords: vec!["a".into(), "b".into()],
            dates: DateSpec::Ranges {
                ranges: vec![
                    DateRange::new(date(1, 1), date(1, 20)),
                    DateRange::new(date(1, 8), date(1, 8)),
                ],
            },
        });

        let items = capability().expand(&params, date(3, 1)).unwrap();
        // 1-01, 1-08, 1-15 for each keyword; the overlapping range adds nothing
        assert_eq!(items.len(), 6);
        assert_eq!(items[1].key_for("a"), "a_0_2024-01-08_2024-01-08");
        assert_eq!(items[3].keywords, vec!["b".to_string()]);
    }

    #[test]
    fn test_transform_rows() {
        let item = WorkItem::new(
            vec!["a".to_string()],
            Region::national(),
            Some(DateRange::single(date(1, 8))),
        );
        let payload = DecodedPayload {
            data: json!({
                "period": "20240108|20240114",
                "wordlist": [{"keyword": "a", "wordGraph": [
                    {"word": "a price", "pv": 1200, "ratio": 5, "sim": 80},
                    {"word": "a review", "pv": 300, "ratio": -2, "sim": 60}
                ]}]
            }),
            series: vec![],
        };

        let output = capability().transform(&item, payload).unwrap();
        assert_eq!(output.rows.len(), 2);
        assert_eq!(
            output.rows[0],
            vec!["a", "a price", "1200", "5", "80", "2024-01-08|2024-01-14"]
        );

        let placeholder = capability().placeholder(&item);
        assert_eq!(placeholder.rows, vec![vec!["a", "", "0", "0", "0", "20240108"]]);
    }

    #[test]
    fn test_empty_graph_keeps_a_row() {
        let item = WorkItem::new(
            vec!["a".to_string()],
            Region::national(),
            Some(DateRange::single(date(1, 8))),
        );
        let payload = DecodedPayload {
            data: json!({"wordlist": [{"keyword": "a", "wordGraph": []}]}),
            series: vec![],
        };
        let output = capability().transform(&item, payload).unwrap();
        assert_eq!(output.rows, vec![vec!["a", "", "0", "0", "0", ""]]);
    }
}
