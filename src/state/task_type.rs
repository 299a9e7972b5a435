use serde::{Deserialize, Serialize};
use std::fmt;

/// The six data categories the upstream serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    SearchIndex,
    FeedIndex,
    WordGraph,
    DemographicAttributes,
    InterestProfile,
    RegionDistribution,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SearchIndex => "search-index",
            Self::FeedIndex => "feed-index",
            Self::WordGraph => "word-graph",
            Self::DemographicAttributes => "demographic-attributes",
            Self::InterestProfile => "interest-profile",
            Self::RegionDistribution => "region-distribution",
        }
    }

    /// Name used in output file and directory names
    pub fn file_stem(&self) -> &'static str {
        match self {
            Self::SearchIndex => "search_index",
            Self::FeedIndex => "feed_index",
            Self::WordGraph => "word_graph",
            Self::DemographicAttributes => "demographic_attributes",
            Self::InterestProfile => "interest_profile",
            Self::RegionDistribution => "region_distribution",
        }
    }

    pub fn all() -> [TaskType; 6] {
        [
            Self::SearchIndex,
            Self::FeedIndex,
            Self::WordGraph,
            Self::DemographicAttributes,
            Self::InterestProfile,
            Self::RegionDistribution,
        ]
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().replace('_', "-");
        Self::all()
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| format!("unknown task type '{}'", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_both_separators() {
        assert_eq!("search-index".parse::<TaskType>(), Ok(TaskType::SearchIndex));
        assert_eq!("feed_index".parse::<TaskType>(), Ok(TaskType::FeedIndex));
        assert!("page-rank".parse::<TaskType>().is_err());
    }

    #[test]
    fn test_serde_uses_kebab_case() {
        let json = serde_json::to_string(&TaskType::DemographicAttributes).unwrap();
        assert_eq!(json, "\"demographic-attributes\"");
        let parsed: TaskType = serde_json::from_str("\"region-distribution\"").unwrap();
        assert_eq!(parsed, TaskType::RegionDistribution);
    }
}
