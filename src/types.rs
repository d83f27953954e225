/// Core type definitions for bulk bar processing
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BulkError, Result};

/// OHLCV Bar data structure
///
/// Bars of one series are keyed uniquely by `timestamp`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn new(timestamp: DateTime<Utc>, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Bar {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

/// Bar resolution, ordered finest to coarsest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Minute => "minute",
            Resolution::Hour => "hour",
            Resolution::Day => "day",
            Resolution::Week => "week",
            Resolution::Month => "month",
        }
    }

    pub fn all() -> Vec<Resolution> {
        vec![
            Resolution::Minute,
            Resolution::Hour,
            Resolution::Day,
            Resolution::Week,
            Resolution::Month,
        ]
    }

    /// Resolution this one is built from when aggregating.
    ///
    /// Month is built from Day, never from Week: the last week of a month
    /// usually runs into the next one.
    pub fn aggregation_source(&self) -> Option<Resolution> {
        match self {
            Resolution::Minute => None,
            Resolution::Hour => Some(Resolution::Minute),
            Resolution::Day => Some(Resolution::Hour),
            Resolution::Week => Some(Resolution::Day),
            Resolution::Month => Some(Resolution::Day),
        }
    }

    /// Accepted spellings, canonical token first
    pub fn synonyms(&self) -> &'static [&'static str] {
        match self {
            Resolution::Minute => &["minute", "minutes", "min", "1min", "1m", "m1"],
            Resolution::Hour => &["hour", "hours", "hourly", "h", "1h", "h1", "60m"],
            Resolution::Day => &["day", "days", "daily", "d", "1d", "d1"],
            Resolution::Week => &["week", "weeks", "weekly", "w", "1w", "w1"],
            Resolution::Month => &["month", "months", "monthly", "mo", "mn", "1mo", "mn1"],
        }
    }

    /// Parse a comma separated list such as `"minute,1h,daily"`
    pub fn parse_list(s: &str) -> Result<Vec<Resolution>> {
        let mut out: Vec<Resolution> = s
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(Resolution::from_str)
            .collect::<Result<_>>()?;
        out.sort();
        out.dedup();
        Ok(out)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = BulkError;

    fn from_str(s: &str) -> Result<Self> {
        let token = s.trim().to_ascii_lowercase();
        Resolution::all()
            .into_iter()
            .find(|r| r.synonyms().contains(&token.as_str()))
            .ok_or_else(|| BulkError::InvalidParameter(format!("Unknown resolution: {}", s)))
    }
}

/// Inclusive time range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl DateRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self> {
        if from > to {
            return Err(BulkError::InvalidParameter(format!(
                "Range start {} is after range end {}",
                from, to
            )));
        }
        Ok(DateRange { from, to })
    }

    /// From the Unix epoch to now
    pub fn full() -> DateRange {
        DateRange {
            from: DateTime::<Utc>::UNIX_EPOCH,
            to: Utc::now(),
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.from && ts <= self.to
    }

    /// Smallest range covering every bar, `None` when empty
    pub fn covering(bars: &[Bar]) -> Option<DateRange> {
        let from = bars.iter().map(|b| b.timestamp).min()?;
        let to = bars.iter().map(|b| b.timestamp).max()?;
        Some(DateRange { from, to })
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} .. {}", self.from.format("%Y-%m-%d %H:%M"), self.to.format("%Y-%m-%d %H:%M"))
    }
}

/// Instrument reference as known to a provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Instrument {
    pub ticker: String,
}

impl Instrument {
    pub fn new(ticker: impl Into<String>) -> Self {
        Instrument {
            ticker: ticker.into(),
        }
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.ticker)
    }
}

/// Key of one stored bar series
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub provider: String,
    pub ticker: String,
    pub resolution: Resolution,
}

impl SeriesKey {
    pub fn new(provider: impl Into<String>, ticker: impl Into<String>, resolution: Resolution) -> Self {
        SeriesKey {
            provider: provider.into(),
            ticker: ticker.into(),
            resolution,
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.provider, self.ticker, self.resolution)
    }
}

/// Identity of a work item: value-typed (ticker, resolution)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkItemKey {
    pub ticker: String,
    pub resolution: Resolution,
}

impl fmt::Display for WorkItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.ticker, self.resolution)
    }
}

/// One unit of bulk-operation work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub resolution: Resolution,
    pub instrument: Instrument,
    pub range: Option<DateRange>,
}

impl WorkItem {
    pub fn new(resolution: Resolution, instrument: Instrument, range: Option<DateRange>) -> Self {
        WorkItem {
            resolution,
            instrument,
            range,
        }
    }

    pub fn key(&self) -> WorkItemKey {
        WorkItemKey {
            ticker: self.instrument.ticker.clone(),
            resolution: self.resolution,
        }
    }

    pub fn series(&self, provider: &str) -> SeriesKey {
        SeriesKey::new(provider, self.instrument.ticker.clone(), self.resolution)
    }
}

/// Bulk operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Download,
    Import,
    Export,
    Copy,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Download => "download",
            OperationKind::Import => "import",
            OperationKind::Export => "export",
            OperationKind::Copy => "copy",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_resolution_synonyms() {
        assert_eq!("Daily".parse::<Resolution>().unwrap(), Resolution::Day);
        assert_eq!("1h".parse::<Resolution>().unwrap(), Resolution::Hour);
        assert_eq!("MN1".parse::<Resolution>().unwrap(), Resolution::Month);
        assert_eq!(" w ".parse::<Resolution>().unwrap(), Resolution::Week);
        assert!("fortnight".parse::<Resolution>().is_err());
    }

    #[test]
    fn test_parse_list_sorts_and_dedups() {
        let list = Resolution::parse_list("month, d, minute,daily").unwrap();
        assert_eq!(list, vec![Resolution::Minute, Resolution::Day, Resolution::Month]);
    }

    #[test]
    fn test_month_aggregates_from_day() {
        assert_eq!(Resolution::Month.aggregation_source(), Some(Resolution::Day));
        assert_eq!(Resolution::Week.aggregation_source(), Some(Resolution::Day));
        assert_eq!(Resolution::Minute.aggregation_source(), None);
    }

    #[test]
    fn test_date_range_validation() {
        let a = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        assert!(DateRange::new(b, a).is_err());

        let range = DateRange::new(a, b).unwrap();
        assert!(range.contains(a));
        assert!(range.contains(b));
    }

    #[test]
    fn test_work_item_key_is_value_typed() {
        let r = None;
        let a = WorkItem::new(Resolution::Day, Instrument::new("AAPL"), r);
        let b = WorkItem::new(Resolution::Day, Instrument::new("AAPL".to_string()), r);
        assert_eq!(a.key(), b.key());
    }
}
