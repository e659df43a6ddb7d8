//! CSV loading: time column to cyclical month features, WMO code to category.

use std::{f64::consts::PI, fs::File, io::Read, path::Path};

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use csv::{ReaderBuilder, StringRecord};
use ndarray::Array2;
use tracing::{debug, info, warn};

use crate::{
    category::{CodeMapping, NUM_CLASSES},
    error::LoadError,
};

pub const TARGET_COLUMN: &str = "weather_code (wmo code)";
pub const TIME_COLUMNS: [&str; 2] = ["time", "datetime"];

/// Loaded observations ready for scaling.
#[derive(Debug, Clone)]
pub struct Dataset {
    /// Measurement columns in file order, then `month_sin`, `month_cos`.
    pub feature_names: Vec<String>,
    pub features: Array2<f32>,
    /// Category index per row.
    pub labels: Vec<usize>,
    pub mapping: CodeMapping,
    pub num_classes: usize,
    /// Rows skipped for missing or malformed values.
    pub dropped_rows: usize,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn num_features(&self) -> usize {
        self.feature_names.len()
    }
}

/// Cyclical encoding of a month (1..=12) as `(sin, cos)`.
pub fn month_encoding(month: u32) -> (f64, f64) {
    let angle = 2.0 * PI * f64::from(month) / 12.0;
    (angle.sin(), angle.cos())
}

/// Month of an ISO-like timestamp, or `None` if it cannot be parsed.
///
/// Offsets are honoured as written; the month is taken from the local time.
pub fn parse_month(value: &str) -> Option<u32> {
    const OFFSET_FORMATS: [&str; 3] = [
        "%Y-%m-%dT%H:%M:%S%.f%z",
        "%Y-%m-%dT%H:%M%z",
        "%Y-%m-%d %H:%M:%S%.f%z",
    ];
    const NAIVE_FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ];

    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.month());
    }
    for format in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(value, format) {
            return Some(dt.month());
        }
    }
    for format in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Some(dt.month());
        }
    }
    // chrono cannot build a datetime without minutes, so `2024-01-01T00`
    // is split by hand.
    let (date, hour) = value.split_once(['T', ' ']).unwrap_or((value, ""));
    let valid_hour = hour.is_empty()
        || (hour.len() == 2 && hour.parse::<u32>().is_ok_and(|h| h < 24));
    if !valid_hour {
        return None;
    }
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .ok()
        .map(|d| d.month())
}

struct Columns {
    time: usize,
    target: usize,
    measurements: Vec<usize>,
}

fn resolve_columns(headers: &StringRecord) -> Result<Columns, LoadError> {
    let found: Vec<String> = headers.iter().map(str::to_string).collect();
    let position = |name: &str| headers.iter().position(|h| h == name);

    let time = match (position(TIME_COLUMNS[0]), position(TIME_COLUMNS[1])) {
        (Some(_), Some(_)) => return Err(LoadError::AmbiguousTimeColumn),
        (Some(idx), None) | (None, Some(idx)) => idx,
        (None, None) => return Err(LoadError::MissingTimeColumn { found }),
    };
    let target = position(TARGET_COLUMN).ok_or_else(|| LoadError::MissingTargetColumn {
        expected: TARGET_COLUMN,
        found: found.clone(),
    })?;
    let measurements = (0..headers.len())
        .filter(|&idx| idx != time && idx != target)
        .collect();

    Ok(Columns {
        time,
        target,
        measurements,
    })
}

/// One parsed row: measurements + month encoding, and the raw WMO code.
fn parse_row(
    record: &StringRecord,
    columns: &Columns,
    width: usize,
) -> Option<(Vec<f32>, i64)> {
    if record.len() != width || record.iter().any(|cell| cell.trim().is_empty()) {
        return None;
    }

    let month = parse_month(record.get(columns.time)?)?;
    let code = record.get(columns.target)?.trim().parse::<f64>().ok()?;
    if !code.is_finite() || code.fract() != 0.0 {
        return None;
    }

    let mut values = Vec::with_capacity(columns.measurements.len() + 2);
    for &idx in &columns.measurements {
        let value = record.get(idx)?.trim().parse::<f64>().ok()?;
        if !value.is_finite() {
            return None;
        }
        values.push(value as f32);
    }
    let (sin, cos) = month_encoding(month);
    values.push(sin as f32);
    values.push(cos as f32);

    Some((values, code as i64))
}

/// Read a CSV of hourly observations.
pub fn load_dataset(path: &Path) -> Result<Dataset, LoadError> {
    let file = File::open(path).map_err(|e| LoadError::Csv {
        path: path.to_path_buf(),
        source: csv::Error::from(e),
    })?;
    read_csv(file, path)
}

/// Same as [`load_dataset`] for in-memory or streamed input.
pub fn load_dataset_from_reader<R: Read>(input: R) -> Result<Dataset, LoadError> {
    read_csv(input, Path::new("<reader>"))
}

fn read_csv<R: Read>(input: R, origin: &Path) -> Result<Dataset, LoadError> {
    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(input);
    let headers = reader
        .headers()
        .map_err(|source| LoadError::Csv {
            path: origin.to_path_buf(),
            source,
        })?
        .clone();
    read_records(headers, reader.records())
}

fn read_records<I>(headers: StringRecord, records: I) -> Result<Dataset, LoadError>
where
    I: Iterator<Item = Result<StringRecord, csv::Error>>,
{
    let columns = resolve_columns(&headers)?;
    let width = headers.len();

    let mut rows: Vec<f32> = Vec::new();
    let mut codes: Vec<i64> = Vec::new();
    let mut dropped_rows = 0usize;

    for (line, record) in records.enumerate() {
        let parsed = record.ok().and_then(|r| parse_row(&r, &columns, width));
        match parsed {
            Some((values, code)) => {
                rows.extend(values);
                codes.push(code);
            }
            None => {
                debug!(row = line + 1, "dropping row with missing or malformed values");
                dropped_rows += 1;
            }
        }
    }

    if codes.is_empty() {
        return Err(LoadError::NoUsableRows {
            dropped: dropped_rows,
        });
    }
    if dropped_rows > 0 {
        warn!(dropped_rows, "rows dropped during load");
    }

    let mut feature_names: Vec<String> = columns
        .measurements
        .iter()
        .map(|&idx| headers[idx].to_string())
        .collect();
    feature_names.push("month_sin".into());
    feature_names.push("month_cos".into());

    let n_features = feature_names.len();
    let features = Array2::from_shape_vec((codes.len(), n_features), rows)
        .unwrap_or_else(|_| Array2::zeros((0, n_features)));

    let mapping = CodeMapping::from_observed(codes.iter().copied());
    let labels = codes
        .iter()
        .map(|&code| mapping.category(code).index())
        .collect();

    info!(
        rows = codes.len(),
        features = n_features,
        classes = NUM_CLASSES,
        "dataset loaded"
    );

    Ok(Dataset {
        feature_names,
        features,
        labels,
        mapping,
        num_classes: NUM_CLASSES,
        dropped_rows,
    })
}
