//! Per-category capability interface
//!
//! The Engine is written once; everything that differs between the six data
//! categories sits behind [`TaskCapability`]: how parameters expand into work
//! items, which endpoint an item is fetched from, and how a decoded response
//! becomes output rows.

use crate::credential::Lease;
use crate::crawler::fetcher::FetchError;
use crate::crawler::work::{count_keys, WorkItem};
use crate::state::{TaskParameters, TaskType};
use crate::ConfigResult;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;

/// One encrypted series inside a fetched payload
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptedSeries {
    pub keyword: String,
    /// Which series of the keyword this is (for example `all`, `pc`, `wise`)
    pub label: String,
    pub cipher: String,
}

/// Response of one fetch, before decryption
#[derive(Debug, Clone, PartialEq)]
pub struct RawPayload {
    /// The `data` object of the response
    pub data: Value,
    pub cipher_key: Option<String>,
    pub encrypted: Vec<EncryptedSeries>,
}

impl RawPayload {
    /// A payload with nothing to decrypt
    pub fn plain(data: Value) -> Self {
        Self {
            data,
            cipher_key: None,
            encrypted: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSeries {
    pub keyword: String,
    pub label: String,
    pub values: Vec<i64>,
}

/// Response of one fetch with every series decrypted
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPayload {
    pub data: Value,
    pub series: Vec<DecodedSeries>,
}

impl DecodedPayload {
    pub fn series(&self, keyword: &str, label: &str) -> Option<&[i64]> {
        self.series
            .iter()
            .find(|s| s.keyword == keyword && s.label == label)
            .map(|s| s.values.as_slice())
    }
}

/// Rows produced for one work item
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemOutput {
    pub rows: Vec<Vec<String>>,
    pub stats: Vec<Vec<String>>,
}

/// Category-specific behavior plugged into the Engine
#[async_trait]
pub trait TaskCapability: Send + Sync {
    fn task_type(&self) -> TaskType;

    /// Header of the data file
    fn columns(&self) -> &'static [&'static str];

    /// Header of the statistics file; empty if the category writes none
    fn stats_columns(&self) -> &'static [&'static str] {
        &[]
    }

    /// Expands validated parameters into the work matrix
    ///
    /// `today` anchors rolling windows, so re-expanding with the same date
    /// reproduces the same matrix.
    fn expand(&self, params: &TaskParameters, today: NaiveDate) -> ConfigResult<Vec<WorkItem>>;

    /// Checkpoint keys covered by the matrix
    fn total_items(&self, items: &[WorkItem]) -> u64 {
        count_keys(items)
    }

    /// Fetches one item with the leased credential
    async fn fetch(&self, item: &WorkItem, lease: &Lease) -> Result<RawPayload, FetchError>;

    /// Number of points every decrypted series of this item must have
    fn series_len(&self, item: &WorkItem) -> usize;

    /// Turns a decoded response into output rows
    fn transform(&self, item: &WorkItem, payload: DecodedPayload)
        -> Result<ItemOutput, FetchError>;

    /// Zero-valued rows written in place of an item that failed
    fn placeholder(&self, item: &WorkItem) -> ItemOutput;
}

/// Rejects parameters of the wrong category
pub(crate) fn mismatched(expected: TaskType, params: &TaskParameters) -> crate::ConfigError {
    crate::ConfigError::InvalidParameters(format!(
        "{} capability received {} parameters",
        expected,
        params.task_type()
    ))
}
