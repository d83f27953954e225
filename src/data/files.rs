/// Bar files: CSV and JSON codecs plus on-disk naming conventions
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::config::{FileFormat, FileLayout};
use crate::error::{BulkError, Result};
use crate::types::{Bar, Resolution};

/// One bar as it appears in a file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BarRecord {
    timestamp: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: f64,
}

impl BarRecord {
    fn from_bar(bar: &Bar) -> Self {
        BarRecord {
            timestamp: bar.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
        }
    }

    fn into_bar(self, tz: Tz) -> Result<Bar> {
        Ok(Bar {
            timestamp: parse_timestamp(&self.timestamp, tz)?,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        })
    }
}

/// Parse RFC 3339, or a naive date/datetime read in the exchange time zone
pub fn parse_timestamp(s: &str, tz: Tz) -> Result<DateTime<Utc>> {
    let s = s.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }

    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M"))
        .or_else(|_| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d").map(|d| d.and_time(NaiveTime::default()))
        })
        .map_err(|_| BulkError::InvalidBarData(format!("Unreadable timestamp: {}", s)))?;

    tz.from_local_datetime(&naive)
        .earliest()
        .map(|ts| ts.with_timezone(&Utc))
        .ok_or_else(|| BulkError::InvalidBarData(format!("Timestamp does not exist in {}: {}", tz, s)))
}

pub fn read_csv<R: Read>(reader: R, tz: Tz) -> Result<Vec<Bar>> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);

    let mut bars = Vec::new();
    for record in rdr.deserialize::<BarRecord>() {
        bars.push(record?.into_bar(tz)?);
    }
    Ok(bars)
}

pub fn read_json<R: Read>(reader: R, tz: Tz) -> Result<Vec<Bar>> {
    let records: Vec<BarRecord> = serde_json::from_reader(reader)?;
    records.into_iter().map(|r| r.into_bar(tz)).collect()
}

/// Read a bar file, picking the codec from its extension
pub fn read_bars(path: &Path, tz: Tz) -> Result<Vec<Bar>> {
    let format = FileFormat::from_path(path).ok_or_else(|| {
        BulkError::InvalidParameter(format!("Unknown bar file type: {}", path.display()))
    })?;

    let file = File::open(path)
        .map_err(|_| BulkError::FileNotFound(path.display().to_string()))?;
    let reader = BufReader::new(file);

    let mut bars = match format {
        FileFormat::Csv => read_csv(reader, tz)?,
        FileFormat::Json => read_json(reader, tz)?,
    };
    bars.sort_by_key(|b| b.timestamp);
    Ok(bars)
}

/// Streaming writer used for paged exports
pub struct BarFileWriter {
    path: PathBuf,
    sink: Sink,
    written: usize,
}

enum Sink {
    Csv(csv::Writer<File>),
    Json(BufWriter<File>),
}

impl BarFileWriter {
    /// Create (truncate) `path`, creating parent directories
    pub fn create(path: &Path, format: FileFormat) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;

        let sink = match format {
            FileFormat::Csv => Sink::Csv(csv::Writer::from_writer(file)),
            FileFormat::Json => {
                let mut w = BufWriter::new(file);
                w.write_all(b"[")?;
                Sink::Json(w)
            }
        };

        Ok(BarFileWriter {
            path: path.to_path_buf(),
            sink,
            written: 0,
        })
    }

    pub fn write_bars(&mut self, bars: &[Bar]) -> Result<()> {
        for bar in bars {
            let record = BarRecord::from_bar(bar);
            match &mut self.sink {
                Sink::Csv(w) => w.serialize(&record)?,
                Sink::Json(w) => {
                    if self.written > 0 {
                        w.write_all(b",")?;
                    }
                    w.write_all(b"\n  ")?;
                    serde_json::to_writer(&mut *w, &record)?;
                }
            }
            self.written += 1;
        }
        Ok(())
    }

    /// Flush and close. Returns number of bars written.
    pub fn finish(self) -> Result<usize> {
        match self.sink {
            Sink::Csv(mut w) => {
                if self.written == 0 {
                    // csv only emits the header with the first record
                    w.write_record(["timestamp", "open", "high", "low", "close", "volume"])?;
                }
                w.flush()?;
            }
            Sink::Json(mut w) => {
                let tail: &[u8] = if self.written > 0 { b"\n]\n" } else { b"]\n" };
                w.write_all(tail)?;
                w.flush()?;
            }
        }
        Ok(self.written)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Where an exported series goes
pub fn export_path(
    dir: &Path,
    ticker: &str,
    resolution: Resolution,
    layout: FileLayout,
    format: FileFormat,
) -> PathBuf {
    match layout {
        FileLayout::Directories => dir
            .join(resolution.as_str())
            .join(format!("{}.{}", ticker, format.extension())),
        FileLayout::Flat => dir.join(format!("{}_{}.{}", ticker, resolution.as_str(), format.extension())),
    }
}

/// Candidate import paths, nested directories before flat names
pub fn import_candidates(dir: &Path, ticker: &str, resolution: Resolution) -> Vec<PathBuf> {
    let extensions = [FileFormat::Csv.extension(), FileFormat::Json.extension()];
    let mut out = Vec::new();

    for token in resolution.synonyms() {
        for ext in extensions {
            out.push(dir.join(token).join(format!("{}.{}", ticker, ext)));
        }
    }
    for token in resolution.synonyms() {
        for ext in extensions {
            out.push(dir.join(format!("{}_{}.{}", ticker, token, ext)));
        }
    }
    out
}

pub fn find_import_file(dir: &Path, ticker: &str, resolution: Resolution) -> Option<PathBuf> {
    import_candidates(dir, ticker, resolution)
        .into_iter()
        .find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn bars(n: usize) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| Bar::new(start + Duration::days(i as i64), 1.0, 2.0, 0.5, 1.5, 10.0 * i as f64))
            .collect()
    }

    #[test]
    fn test_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 13, 30, 0).unwrap();
        assert_eq!(parse_timestamp("2024-05-01T13:30:00Z", Tz::UTC).unwrap(), expected);
        assert_eq!(parse_timestamp("2024-05-01 13:30:00", Tz::UTC).unwrap(), expected);
        assert_eq!(parse_timestamp("2024-05-01T09:30:00-04:00", Tz::UTC).unwrap(), expected);
        assert_eq!(
            parse_timestamp("2024-05-01 09:30:00", chrono_tz::America::New_York).unwrap(),
            expected
        );
        assert_eq!(
            parse_timestamp("2024-05-01", Tz::UTC).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
        );
        assert!(parse_timestamp("yesterday", Tz::UTC).is_err());
    }

    #[test]
    fn test_read_csv_with_loose_header_spacing() {
        let data = "timestamp, open, high, low, close, volume\n2024-05-01, 1, 2, 0.5, 1.5, 100\n";
        let parsed = read_csv(data.as_bytes(), Tz::UTC).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].volume, 100.0);
    }

    #[test]
    fn test_csv_and_json_files_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let data = bars(4);

        for format in [FileFormat::Csv, FileFormat::Json] {
            let path = export_path(dir.path(), "AAPL", Resolution::Day, FileLayout::Flat, format);
            let mut writer = BarFileWriter::create(&path, format).unwrap();
            writer.write_bars(&data[..2]).unwrap();
            writer.write_bars(&data[2..]).unwrap();
            assert_eq!(writer.finish().unwrap(), 4);

            assert_eq!(read_bars(&path, Tz::UTC).unwrap(), data);
        }
    }

    #[test]
    fn test_empty_json_export_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.json");
        BarFileWriter::create(&path, FileFormat::Json).unwrap().finish().unwrap();
        assert!(read_bars(&path, Tz::UTC).unwrap().is_empty());
    }

    #[test]
    fn test_export_paths() {
        let dir = Path::new("/out");
        assert_eq!(
            export_path(dir, "MSFT", Resolution::Week, FileLayout::Directories, FileFormat::Csv),
            PathBuf::from("/out/week/MSFT.csv")
        );
        assert_eq!(
            export_path(dir, "MSFT", Resolution::Month, FileLayout::Flat, FileFormat::Json),
            PathBuf::from("/out/MSFT_month.json")
        );
    }

    #[test]
    fn test_import_finds_synonym_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("daily")).unwrap();
        std::fs::write(dir.path().join("daily").join("IBM.csv"), "timestamp,open,high,low,close,volume\n").unwrap();
        std::fs::write(dir.path().join("IBM_1h.json"), "[]").unwrap();

        assert_eq!(
            find_import_file(dir.path(), "IBM", Resolution::Day).unwrap(),
            dir.path().join("daily").join("IBM.csv")
        );
        assert_eq!(
            find_import_file(dir.path(), "IBM", Resolution::Hour).unwrap(),
            dir.path().join("IBM_1h.json")
        );
        assert!(find_import_file(dir.path(), "IBM", Resolution::Week).is_none());
    }
}
