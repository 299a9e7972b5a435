//! Task parameters
//!
//! Requests arrive as loosely shaped JSON ([`RawTaskParameters`]) and are
//! validated once, at task creation, into the [`TaskParameters`] tagged union.
//! Nothing past the scheduler ever sees the raw form.

use crate::config::MAX_KEYWORD_BATCH;
use crate::state::TaskType;
use crate::{ConfigError, ConfigResult};
use chrono::{Datelike, Duration as ChronoDuration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Rolling window used when a request names no dates at all
pub const DEFAULT_DAYS: u32 = 30;

/// Region code the upstream uses for nationwide figures
pub const NATIONAL_REGION_CODE: u32 = 0;

/// Ranges longer than this are served by the upstream at weekly granularity
pub const MAX_DAILY_SPAN_DAYS: i64 = 366;

/// First year the upstream has index data for
pub const EARLIEST_DATA_YEAR: i32 = 2006;

/// Task parameters exactly as submitted by a caller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawTaskParameters {
    #[serde(default)]
    pub keywords: Vec<String>,

    /// Either a `{code: name}` map or a list of codes / `{code, name}` objects
    #[serde(default, alias = "cities")]
    pub regions: Option<RegionSpec>,

    #[serde(default)]
    pub days: Option<u32>,

    #[serde(default)]
    pub date_ranges: Option<Vec<[String; 2]>>,

    #[serde(default)]
    pub year_range: Option<[i32; 2]>,

    #[serde(default)]
    pub resume: bool,

    /// Task whose checkpoint a resumed task continues from
    #[serde(default)]
    pub task_id: Option<String>,

    #[serde(default)]
    pub batch_size: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegionSpec {
    Map(BTreeMap<String, String>),
    List(Vec<RegionEntry>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegionEntry {
    Code(u32),
    Named { code: u32, name: String },
    Text(String),
}

/// A region (province or city) the upstream can slice figures by
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    pub code: u32,
    pub name: String,
}

impl Region {
    pub fn new(code: u32, name: impl Into<String>) -> Self {
        Self {
            code,
            name: name.into(),
        }
    }

    pub fn national() -> Self {
        Self::new(NATIONAL_REGION_CODE, "national")
    }
}

/// Sampling step of a decoded series
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Day,
    Week,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
        }
    }

    pub fn step_days(&self) -> i64 {
        match self {
            Self::Day => 1,
            Self::Week => 7,
        }
    }
}

/// Inclusive calendar date range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn single(day: NaiveDate) -> Self {
        Self::new(day, day)
    }

    /// Number of calendar days covered, both ends included
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn granularity(&self) -> Granularity {
        if self.days() > MAX_DAILY_SPAN_DAYS {
            Granularity::Week
        } else {
            Granularity::Day
        }
    }

    /// Expected number of points in a series covering this range
    pub fn points(&self) -> usize {
        let days = self.days().max(0);
        let step = self.granularity().step_days();
        ((days + step - 1) / step) as usize
    }

    /// Dates of each point in a series covering this range
    pub fn dates(&self) -> Vec<NaiveDate> {
        let step = ChronoDuration::days(self.granularity().step_days());
        let mut dates = Vec::with_capacity(self.points());
        let mut current = self.start;
        while current <= self.end {
            dates.push(current);
            current += step;
        }
        dates
    }
}

/// How the date dimension of the work matrix is derived
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DateSpec {
    /// Rolling window ending today
    Days { days: u32 },
    /// Explicit ranges, used as given
    Ranges { ranges: Vec<DateRange> },
    /// One range per calendar year; the current year ends today
    YearRange { start: i32, end: i32 },
}

impl DateSpec {
    /// Concrete ranges relative to `today`
    pub fn resolve(&self, today: NaiveDate) -> Vec<DateRange> {
        match self {
            Self::Days { days } => {
                let span = i64::from((*days).max(1)) - 1;
                let first = today
                    .checked_sub_signed(ChronoDuration::days(span))
                    .unwrap_or(NaiveDate::MIN);
                vec![DateRange::new(first, today)]
            }
            Self::Ranges { ranges } => ranges.clone(),
            Self::YearRange { start, end } => (*start..=(*end).min(today.year()))
                .filter_map(|year| {
                    let first = NaiveDate::from_ymd_opt(year, 1, 1)?;
                    let last = if year == today.year() {
                        today
                    } else {
                        NaiveDate::from_ymd_opt(year, 12, 31)?
                    };
                    Some(DateRange::new(first, last))
                })
                .collect(),
        }
    }
}

/// Parameters for the time-series and region categories
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesParameters {
    pub keywords: Vec<String>,
    pub regions: Vec<Region>,
    pub dates: DateSpec,
    pub batch_size: usize,
}

/// Parameters for the related-word graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphParameters {
    pub keywords: Vec<String>,
    pub dates: DateSpec,
}

/// Parameters for the audience profile categories
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileParameters {
    pub keywords: Vec<String>,
    pub batch_size: usize,
}

/// Validated parameters, one variant per task type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task_type", content = "parameters", rename_all = "kebab-case")]
pub enum TaskParameters {
    SearchIndex(SeriesParameters),
    FeedIndex(SeriesParameters),
    WordGraph(GraphParameters),
    DemographicAttributes(ProfileParameters),
    InterestProfile(ProfileParameters),
    RegionDistribution(SeriesParameters),
}

impl TaskParameters {
    /// Validates raw request parameters for the given task type
    ///
    /// # Arguments
    ///
    /// * `task_type` - The category the task harvests
    /// * `raw` - Parameters as submitted
    /// * `default_batch` - Keyword batch size used when the request names none
    /// * `today` - Anchor date for year-range checks
    pub fn validate(
        task_type: TaskType,
        raw: &RawTaskParameters,
        default_batch: usize,
        today: NaiveDate,
    ) -> ConfigResult<Self> {
        if raw.resume && raw.task_id.as_deref().map_or(true, |id| id.trim().is_empty()) {
            return Err(ConfigError::InvalidParameters(
                "resume requires the task_id of the task to continue".to_string(),
            ));
        }

        let keywords = normalize_keywords(&raw.keywords)?;
        let batch_size = resolve_batch_size(raw.batch_size, default_batch)?;

        let params = match task_type {
            TaskType::SearchIndex | TaskType::FeedIndex | TaskType::RegionDistribution => {
                let series = SeriesParameters {
                    keywords,
                    regions: resolve_regions(raw.regions.as_ref())?,
                    dates: resolve_date_spec(raw, today)?,
                    batch_size,
                };
                match task_type {
                    TaskType::SearchIndex => Self::SearchIndex(series),
                    TaskType::FeedIndex => Self::FeedIndex(series),
                    _ => Self::RegionDistribution(series),
                }
            }
            TaskType::WordGraph => Self::WordGraph(GraphParameters {
                keywords,
                dates: resolve_date_spec(raw, today)?,
            }),
            TaskType::DemographicAttributes => {
                Self::DemographicAttributes(ProfileParameters {
                    keywords,
                    batch_size,
                })
            }
            TaskType::InterestProfile => Self::InterestProfile(ProfileParameters {
                keywords,
                batch_size,
            }),
        };

        Ok(params)
    }

    pub fn task_type(&self) -> TaskType {
        match self {
            Self::SearchIndex(_) => TaskType::SearchIndex,
            Self::FeedIndex(_) => TaskType::FeedIndex,
            Self::WordGraph(_) => TaskType::WordGraph,
            Self::DemographicAttributes(_) => TaskType::DemographicAttributes,
            Self::InterestProfile(_) => TaskType::InterestProfile,
            Self::RegionDistribution(_) => TaskType::RegionDistribution,
        }
    }

    pub fn keywords(&self) -> &[String] {
        match self {
            Self::SearchIndex(p) | Self::FeedIndex(p) | Self::RegionDistribution(p) => {
                &p.keywords
            }
            Self::WordGraph(p) => &p.keywords,
            Self::DemographicAttributes(p) | Self::InterestProfile(p) => &p.keywords,
        }
    }
}

/// Trims, drops blanks and de-duplicates keywords, keeping first-seen order
fn normalize_keywords(raw: &[String]) -> ConfigResult<Vec<String>> {
    let mut seen = HashSet::new();
    let keywords: Vec<String> = raw
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .filter(|k| seen.insert(k.to_string()))
        .map(str::to_string)
        .collect();

    if keywords.is_empty() {
        return Err(ConfigError::InvalidParameters(
            "at least one non-empty keyword is required".to_string(),
        ));
    }

    Ok(keywords)
}

fn resolve_batch_size(requested: Option<usize>, default_batch: usize) -> ConfigResult<usize> {
    let size = requested.unwrap_or(default_batch);
    if size < 1 || size > MAX_KEYWORD_BATCH {
        return Err(ConfigError::InvalidParameters(format!(
            "batch_size must be between 1 and {}, got {}",
            MAX_KEYWORD_BATCH, size
        )));
    }
    Ok(size)
}

/// Resolves the region dimension; no regions means nationwide only
pub fn resolve_regions(spec: Option<&RegionSpec>) -> ConfigResult<Vec<Region>> {
    let mut regions = Vec::new();

    match spec {
        None => {}
        Some(RegionSpec::Map(map)) => {
            for (code, name) in map {
                regions.push(Region::new(parse_region_code(code)?, name.clone()));
            }
        }
        Some(RegionSpec::List(entries)) => {
            for entry in entries {
                let region = match entry {
                    RegionEntry::Code(code) => Region::new(*code, code.to_string()),
                    RegionEntry::Named { code, name } => Region::new(*code, name.clone()),
                    RegionEntry::Text(text) => {
                        let code = parse_region_code(text)?;
                        Region::new(code, text.trim().to_string())
                    }
                };
                regions.push(region);
            }
        }
    }

    let mut seen = HashSet::new();
    regions.retain(|r| seen.insert(r.code));

    if regions.is_empty() {
        regions.push(Region::national());
    }

    Ok(regions)
}

fn parse_region_code(text: &str) -> ConfigResult<u32> {
    text.trim().parse::<u32>().map_err(|_| {
        ConfigError::InvalidParameters(format!("region code '{}' is not a number", text))
    })
}

fn parse_date(text: &str) -> ConfigResult<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d").map_err(|_| {
        ConfigError::InvalidParameters(format!("date '{}' is not in YYYY-MM-DD form", text))
    })
}

/// Picks exactly one of `days`, `date_ranges`, `year_range`
fn resolve_date_spec(raw: &RawTaskParameters, today: NaiveDate) -> ConfigResult<DateSpec> {
    let provided = [
        raw.days.is_some(),
        raw.date_ranges.is_some(),
        raw.year_range.is_some(),
    ]
    .iter()
    .filter(|p| **p)
    .count();

    if provided > 1 {
        return Err(ConfigError::InvalidParameters(
            "specify only one of days, date_ranges or year_range".to_string(),
        ));
    }

    if let Some(days) = raw.days {
        if days == 0 {
            return Err(ConfigError::InvalidParameters(
                "days must be at least 1".to_string(),
            ));
        }
        let earliest = NaiveDate::from_ymd_opt(EARLIEST_DATA_YEAR, 1, 1).unwrap_or(NaiveDate::MIN);
        let max_days = (today - earliest).num_days() + 1;
        if i64::from(days) > max_days {
            return Err(ConfigError::InvalidParameters(format!(
                "days must be at most {} (index data starts in {})",
                max_days, EARLIEST_DATA_YEAR
            )));
        }
        return Ok(DateSpec::Days { days });
    }

    if let Some(pairs) = &raw.date_ranges {
        if pairs.is_empty() {
            return Err(ConfigError::InvalidParameters(
                "date_ranges cannot be empty".to_string(),
            ));
        }
        let mut ranges = Vec::with_capacity(pairs.len());
        for [start, end] in pairs {
            let range = DateRange::new(parse_date(start)?, parse_date(end)?);
            if range.start > range.end {
                return Err(ConfigError::InvalidParameters(format!(
                    "date range {} .. {} ends before it starts",
                    start, end
                )));
            }
            ranges.push(range);
        }
        return Ok(DateSpec::Ranges { ranges });
    }

    if let Some([start, end]) = raw.year_range {
        if start > end {
            return Err(ConfigError::InvalidParameters(format!(
                "year_range {}..{} ends before it starts",
                start, end
            )));
        }
        if start < EARLIEST_DATA_YEAR {
            return Err(ConfigError::InvalidParameters(format!(
                "year_range cannot start before {}",
                EARLIEST_DATA_YEAR
            )));
        }
        let spec = DateSpec::YearRange { start, end };
        if spec.resolve(today).is_empty() {
            return Err(ConfigError::InvalidParameters(format!(
                "year_range {}..{} lies entirely in the future",
                start, end
            )));
        }
        return Ok(spec);
    }

    Ok(DateSpec::Days { days: DEFAULT_DAYS })
}
