//! Work matrix
//!
//! A task expands into the cartesian product keyword batch × region × date
//! range. Each keyword in a batch has its own checkpoint key, so progress is
//! tracked per keyword even though a batch is fetched in one request.

use crate::state::{DateRange, Region};
use std::collections::HashSet;

/// Placeholder used in keys of items that have no date range
const LATEST: &str = "latest";

/// One unit of fetch work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub keywords: Vec<String>,
    pub region: Region,
    /// `None` for categories that always return the latest period
    pub range: Option<DateRange>,
}

impl WorkItem {
    pub fn new(keywords: Vec<String>, region: Region, range: Option<DateRange>) -> Self {
        Self {
            keywords,
            region,
            range,
        }
    }

    /// Checkpoint key of one keyword of this item
    pub fn key_for(&self, keyword: &str) -> String {
        match &self.range {
            Some(range) => format!(
                "{}_{}_{}_{}",
                keyword,
                self.region.code,
                range.start.format("%Y-%m-%d"),
                range.end.format("%Y-%m-%d")
            ),
            None => format!("{}_{}_{}_{}", keyword, self.region.code, LATEST, LATEST),
        }
    }

    /// Checkpoint keys of every keyword in the batch
    pub fn keys(&self) -> Vec<String> {
        self.keywords.iter().map(|k| self.key_for(k)).collect()
    }

    pub fn size(&self) -> usize {
        self.keywords.len()
    }
}

/// Builds keyword batches × regions × ranges
///
/// `ranges = None` yields items without a date range.
pub fn expand_matrix(
    keywords: &[String],
    batch_size: usize,
    regions: &[Region],
    ranges: Option<&[DateRange]>,
) -> Vec<WorkItem> {
    let batch_size = batch_size.max(1);
    let mut items = Vec::new();

    for batch in keywords.chunks(batch_size) {
        for region in regions {
            match ranges {
                Some(ranges) => {
                    for range in ranges {
                        items.push(WorkItem::new(batch.to_vec(), region.clone(), Some(*range)));
                    }
                }
                None => items.push(WorkItem::new(batch.to_vec(), region.clone(), None)),
            }
        }
    }

    items
}

/// Number of checkpoint keys the items cover
pub fn count_keys(items: &[WorkItem]) -> u64 {
    items.iter().map(|item| item.size() as u64).sum()
}

/// Every checkpoint key of the matrix
pub fn matrix_keys(items: &[WorkItem]) -> HashSet<String> {
    items.iter().flat_map(|item| item.keys()).collect()
}

/// Drops finished keywords from each batch; batches left empty are skipped
pub fn pending_items(items: Vec<WorkItem>, completed: &HashSet<String>) -> Vec<WorkItem> {
    items
        .into_iter()
        .filter_map(|mut item| {
            let keep: Vec<String> = item
                .keywords
                .iter()
                .filter(|k| !completed.contains(&item.key_for(k)))
                .cloned()
                .collect();
            if keep.is_empty() {
                None
            } else {
                item.keywords = keep;
                Some(item)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn keywords(list: &[&str]) -> Vec<String> {
        list.iter().map(|k| k.to_string()).collect()
    }

    fn range() -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
        )
    }

    #[test]
    fn test_matrix_shape() {
        let regions = vec![Region::national(), Region::new(514, "Beijing")];
        let items = expand_matrix(
            &keywords(&["a", "b", "c", "d", "e", "f", "g"]),
            5,
            &regions,
            Some(&[range()]),
        );

        // 2 batches × 2 regions × 1 range
        assert_eq!(items.len(), 4);
        assert_eq!(items[0].size(), 5);
        assert_eq!(items[2].size(), 2);
        assert_eq!(count_keys(&items), 14);
        assert_eq!(matrix_keys(&items).len(), 14);
    }

    #[test]
    fn test_key_format() {
        let item = WorkItem::new(keywords(&["phone"]), Region::new(514, "Beijing"), Some(range()));
        assert_eq!(item.key_for("phone"), "phone_514_2024-01-01_2024-01-31");

        let latest = WorkItem::new(keywords(&["phone"]), Region::national(), None);
        assert_eq!(latest.keys(), vec!["phone_0_latest_latest".to_string()]);
    }

    #[test]
    fn test_pending_items_shrinks_batches() {
        let items = expand_matrix(
            &keywords(&["a", "b", "c"]),
            2,
            &[Region::national()],
            Some(&[range()]),
        );
        let completed: HashSet<String> = [
            items[0].key_for("a"),
            items[1].key_for("c"),
        ]
        .into_iter()
        .collect();

        let pending = pending_items(items, &completed);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].keywords, keywords(&["b"]));
    }
}
