/// Bar storage keyed by (provider, ticker, resolution, timestamp)
///
/// `MemoryBarStore` keeps everything in memory; `JsonlBarStore` caches series in
/// memory and persists each series as one JSONL file.
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, warn};

use crate::error::{BulkError, Result};
use crate::types::{Bar, DateRange, SeriesKey};

type Series = BTreeMap<DateTime<Utc>, Bar>;

/// Keyed read/write access to stored bars
#[async_trait]
pub trait BarStore: Send + Sync {
    /// Number of bars, optionally restricted to a range
    async fn count(&self, key: &SeriesKey, range: Option<&DateRange>) -> Result<usize>;

    /// Bars in ascending timestamp order, optionally restricted to a range
    async fn get_bars(&self, key: &SeriesKey, range: Option<&DateRange>) -> Result<Vec<Bar>>;

    /// `count` bars starting at position `index` (ascending order)
    async fn get_bars_page(&self, key: &SeriesKey, index: usize, count: usize) -> Result<Vec<Bar>>;

    /// Insert or overwrite by timestamp. Returns number of bars written.
    async fn upsert_bars(&self, key: &SeriesKey, bars: &[Bar]) -> Result<usize>;

    /// Delete bars in range, or the whole series. Returns number deleted.
    async fn delete_bars(&self, key: &SeriesKey, range: Option<&DateRange>) -> Result<usize>;

    /// Most recent stored bar
    async fn last_bar(&self, key: &SeriesKey) -> Result<Option<Bar>> {
        let total = self.count(key, None).await?;
        if total == 0 {
            return Ok(None);
        }
        Ok(self.get_bars_page(key, total - 1, 1).await?.pop())
    }
}

fn select(series: &Series, range: Option<&DateRange>) -> Vec<Bar> {
    match range {
        Some(r) => series.range(r.from..=r.to).map(|(_, b)| *b).collect(),
        None => series.values().copied().collect(),
    }
}

fn count_in(series: &Series, range: Option<&DateRange>) -> usize {
    match range {
        Some(r) => series.range(r.from..=r.to).count(),
        None => series.len(),
    }
}

fn remove_from(series: &mut Series, range: Option<&DateRange>) -> usize {
    match range {
        Some(r) => {
            let doomed: Vec<DateTime<Utc>> = series.range(r.from..=r.to).map(|(ts, _)| *ts).collect();
            for ts in &doomed {
                series.remove(ts);
            }
            doomed.len()
        }
        None => {
            let n = series.len();
            series.clear();
            n
        }
    }
}

/// In-memory bar store
#[derive(Default)]
pub struct MemoryBarStore {
    series: RwLock<HashMap<SeriesKey, Series>>,
}

impl MemoryBarStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BarStore for MemoryBarStore {
    async fn count(&self, key: &SeriesKey, range: Option<&DateRange>) -> Result<usize> {
        let series = self.series.read().await;
        Ok(series.get(key).map(|s| count_in(s, range)).unwrap_or(0))
    }

    async fn get_bars(&self, key: &SeriesKey, range: Option<&DateRange>) -> Result<Vec<Bar>> {
        let series = self.series.read().await;
        Ok(series.get(key).map(|s| select(s, range)).unwrap_or_default())
    }

    async fn get_bars_page(&self, key: &SeriesKey, index: usize, count: usize) -> Result<Vec<Bar>> {
        let series = self.series.read().await;
        Ok(series
            .get(key)
            .map(|s| s.values().skip(index).take(count).copied().collect())
            .unwrap_or_default())
    }

    async fn upsert_bars(&self, key: &SeriesKey, bars: &[Bar]) -> Result<usize> {
        let mut series = self.series.write().await;
        let entry = series.entry(key.clone()).or_default();
        for bar in bars {
            entry.insert(bar.timestamp, *bar);
        }
        Ok(bars.len())
    }

    async fn delete_bars(&self, key: &SeriesKey, range: Option<&DateRange>) -> Result<usize> {
        let mut series = self.series.write().await;
        Ok(series.get_mut(key).map(|s| remove_from(s, range)).unwrap_or(0))
    }
}

/// A series slot: `None` until loaded from disk
type Slot = Arc<RwLock<Option<Series>>>;

/// Disk-backed bar store: one JSONL file per series, cached in memory
///
/// Layout: `{root}/{provider}/{resolution}/{ticker}.jsonl`
///
/// Each series has its own lock, so writers of different series never wait on
/// each other's file I/O.
pub struct JsonlBarStore {
    root: PathBuf,
    cache: RwLock<HashMap<SeriesKey, Slot>>,
}

impl JsonlBarStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        JsonlBarStore {
            root: root.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn series_path(&self, key: &SeriesKey) -> PathBuf {
        self.root
            .join(&key.provider)
            .join(key.resolution.as_str())
            .join(format!("{}.jsonl", key.ticker))
    }

    async fn slot(&self, key: &SeriesKey) -> Slot {
        if let Some(slot) = self.cache.read().await.get(key) {
            return Arc::clone(slot);
        }
        let mut cache = self.cache.write().await;
        Arc::clone(cache.entry(key.clone()).or_default())
    }

    /// Lock one series for writing, loading it from disk on first use
    async fn lock_series(&self, key: &SeriesKey) -> Result<OwnedRwLockWriteGuard<Option<Series>>> {
        let mut guard = self.slot(key).await.write_owned().await;
        if guard.is_none() {
            *guard = Some(self.load_from_disk(key).await?);
        }
        Ok(guard)
    }

    /// Run `read` against one series, loading it on first use
    async fn read_series<T>(&self, key: &SeriesKey, read: impl FnOnce(&Series) -> T) -> Result<T> {
        let slot = self.slot(key).await;
        {
            let guard = slot.read().await;
            if let Some(series) = guard.as_ref() {
                return Ok(read(series));
            }
        }

        let mut guard = self.lock_series(key).await?;
        Ok(read(guard.get_or_insert_with(Series::new)))
    }

    async fn load_from_disk(&self, key: &SeriesKey) -> Result<Series> {
        let path = self.series_path(key);
        let mut series = Series::new();

        if !path.exists() {
            debug!("No existing disk file for {}", key);
            return Ok(series);
        }

        let file = tokio::fs::File::open(&path).await?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        let mut skipped = 0usize;
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Bar>(&line) {
                Ok(bar) => {
                    series.insert(bar.timestamp, bar);
                }
                Err(_) => skipped += 1,
            }
        }

        if skipped > 0 {
            warn!("Skipped {} unreadable lines in {}", skipped, path.display());
        }

        debug!("Loaded {} from disk: {} bars", key, series.len());
        Ok(series)
    }

    /// Append bars to the series file (JSONL format)
    async fn append_to_disk(&self, key: &SeriesKey, bars: &[Bar]) -> Result<()> {
        let path = self.series_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&path).await?;

        let mut buf = String::new();
        for bar in bars {
            buf.push_str(&serde_json::to_string(bar)?);
            buf.push('\n');
        }
        file.write_all(buf.as_bytes()).await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Rewrite the whole series file through a temp file
    async fn rewrite_disk(&self, key: &SeriesKey, series: &Series) -> Result<()> {
        let path = self.series_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_extension("jsonl.tmp");
        let mut buf = String::new();
        for bar in series.values() {
            buf.push_str(&serde_json::to_string(bar)?);
            buf.push('\n');
        }
        tokio::fs::write(&tmp, buf).await?;
        tokio::fs::rename(&tmp, &path).await?;

        Ok(())
    }
}

#[async_trait]
impl BarStore for JsonlBarStore {
    async fn count(&self, key: &SeriesKey, range: Option<&DateRange>) -> Result<usize> {
        self.read_series(key, |s| count_in(s, range)).await
    }

    async fn get_bars(&self, key: &SeriesKey, range: Option<&DateRange>) -> Result<Vec<Bar>> {
        self.read_series(key, |s| select(s, range)).await
    }

    async fn get_bars_page(&self, key: &SeriesKey, index: usize, count: usize) -> Result<Vec<Bar>> {
        self.read_series(key, |s| s.values().skip(index).take(count).copied().collect())
            .await
    }

    async fn upsert_bars(&self, key: &SeriesKey, bars: &[Bar]) -> Result<usize> {
        if bars.is_empty() {
            return Ok(0);
        }

        let mut guard = self.lock_series(key).await?;
        let series = guard.get_or_insert_with(Series::new);

        let mut sorted = bars.to_vec();
        sorted.sort_by_key(|b| b.timestamp);

        // Pure appends go to the end of the file, anything else rewrites it
        let appends_only = match series.keys().next_back() {
            Some(last) => sorted.first().map(|b| b.timestamp > *last).unwrap_or(true),
            None => true,
        };
        let unique_timestamps = sorted.windows(2).all(|w| w[0].timestamp < w[1].timestamp);

        for bar in &sorted {
            series.insert(bar.timestamp, *bar);
        }

        if appends_only && unique_timestamps {
            self.append_to_disk(key, &sorted).await?;
        } else {
            self.rewrite_disk(key, series).await?;
        }

        debug!("Upserted {} bars into {} - total: {}", bars.len(), key, series.len());
        Ok(bars.len())
    }

    async fn delete_bars(&self, key: &SeriesKey, range: Option<&DateRange>) -> Result<usize> {
        let mut guard = self.lock_series(key).await?;
        let series = guard.get_or_insert_with(Series::new);

        let removed = remove_from(series, range);
        if removed > 0 {
            self.rewrite_disk(key, series).await?;
        }
        Ok(removed)
    }
}
