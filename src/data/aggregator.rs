/// Bar aggregation from finer to coarser resolutions
use chrono::{DateTime, Datelike, Offset, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::data::BarStore;
use crate::error::{BulkError, Result};
use crate::types::{Bar, DateRange, Resolution, SeriesKey};

/// Calendar bucket a timestamp falls into at a given resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Bucket {
    year: i32,
    period: u32,
    hour: u32,
    minute: u32,
    /// UTC offset in seconds, keeps the repeated hour of a DST fall-back apart
    offset: i32,
}

impl Bucket {
    /// Bucket of `timestamp` at `resolution`, computed in the exchange time zone
    pub fn of(resolution: Resolution, timestamp: DateTime<Utc>, tz: Tz) -> Bucket {
        let local = timestamp.with_timezone(&tz);
        let offset = local.offset().fix().local_minus_utc();

        match resolution {
            Resolution::Minute => Bucket {
                year: local.year(),
                period: local.ordinal(),
                hour: local.hour(),
                minute: local.minute(),
                offset,
            },
            Resolution::Hour => Bucket {
                year: local.year(),
                period: local.ordinal(),
                hour: local.hour(),
                minute: 0,
                offset,
            },
            Resolution::Day => Bucket {
                year: local.year(),
                period: local.ordinal(),
                hour: 0,
                minute: 0,
                offset: 0,
            },
            Resolution::Week => {
                // ISO week, Monday first
                let iso = local.iso_week();
                Bucket {
                    year: iso.year(),
                    period: iso.week(),
                    hour: 0,
                    minute: 0,
                    offset: 0,
                }
            }
            Resolution::Month => Bucket {
                year: local.year(),
                period: local.month(),
                hour: 0,
                minute: 0,
                offset: 0,
            },
        }
    }
}

/// Bar in progress while folding one bucket
#[derive(Debug, Clone)]
struct PartialBar {
    timestamp: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

impl PartialBar {
    fn new(bar: &Bar) -> Self {
        PartialBar {
            timestamp: bar.timestamp,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
        }
    }

    fn update(&mut self, bar: &Bar) {
        self.timestamp = bar.timestamp;
        self.close = bar.close;
        self.high = self.high.max(bar.high);
        self.low = self.low.min(bar.low);
        self.volume += bar.volume;
    }

    /// The emitted bar carries the timestamp of the last bar folded into it
    fn to_bar(&self) -> Bar {
        Bar {
            timestamp: self.timestamp,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}

/// Check that `from` bars may be folded into `to` bars
pub fn check_aggregation(from: Resolution, to: Resolution) -> Result<()> {
    if to.aggregation_source() != Some(from) {
        return Err(BulkError::UnsupportedAggregation { from, to });
    }
    Ok(())
}

/// Fold `from` bars into `to` bars.
///
/// One output bar per non-empty bucket: first open, max high, min low, last
/// close, summed volume, timestamped at the last contributing bar. Week to
/// Month is rejected; months are always built from days.
pub fn aggregate(bars: &[Bar], from: Resolution, to: Resolution, tz: Tz) -> Result<Vec<Bar>> {
    check_aggregation(from, to)?;

    if bars.is_empty() {
        return Ok(Vec::new());
    }

    let ascending = bars.windows(2).all(|w| w[0].timestamp <= w[1].timestamp);
    let sorted;
    let bars = if ascending {
        bars
    } else {
        warn!("Source {} bars not in ascending order, sorting before aggregation", from);
        let mut copy = bars.to_vec();
        copy.sort_by_key(|b| b.timestamp);
        sorted = copy;
        &sorted[..]
    };

    let mut out = Vec::new();
    let mut current: Option<(Bucket, PartialBar)> = None;

    for bar in bars {
        let bucket = Bucket::of(to, bar.timestamp, tz);

        match current.as_mut() {
            Some((open_bucket, partial)) if *open_bucket == bucket => partial.update(bar),
            Some((_, partial)) => {
                out.push(partial.to_bar());
                current = Some((bucket, PartialBar::new(bar)));
            }
            None => current = Some((bucket, PartialBar::new(bar))),
        }
    }

    if let Some((_, partial)) = current {
        out.push(partial.to_bar());
    }

    debug!("Aggregated {} {} bars into {} {} bars", bars.len(), from, out.len(), to);
    Ok(out)
}

/// Outcome of rebuilding one coarse series
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildReport {
    pub source_bars: usize,
    pub purged: usize,
    pub written: usize,
}

/// Rebuild `target` from `source` within `range` (whole series when `None`).
///
/// Target bars in the range are purged before the fresh ones are written, so a
/// bar computed earlier from a partial bucket cannot survive next to its
/// replacement.
pub async fn rebuild(
    store: &dyn BarStore,
    source: &SeriesKey,
    target: &SeriesKey,
    range: Option<&DateRange>,
    tz: Tz,
) -> Result<RebuildReport> {
    check_aggregation(source.resolution, target.resolution)?;

    let source_bars = store.get_bars(source, range).await?;
    let coarse = aggregate(&source_bars, source.resolution, target.resolution, tz)?;

    let purged = store.delete_bars(target, range).await?;
    let written = store.upsert_bars(target, &coarse).await?;

    Ok(RebuildReport {
        source_bars: source_bars.len(),
        purged,
        written,
    })
}
