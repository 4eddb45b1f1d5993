//! Turns the raw upload table into typed, sorted records.

use std::collections::{BTreeMap, HashSet};

use chrono::NaiveDateTime;
use log::{debug, warn};

use crate::error::ClassifyError;
use crate::models::{Modality, RawTable, SensorUpload, StatusCode, UploadRecord, TIMESTAMP_FORMAT};
use crate::study::StudyConfig;

pub const ID_COLUMN: &str = "id";
pub const SUBJECT_NAME_COLUMN: &str = "subject_name";
pub const MODALITY_COLUMN: &str = "app";
pub const DATE_REGISTERED_COLUMN: &str = "date_registered";
pub const DATE_LEFT_COLUMN: &str = "date_left_study";
pub const TIME_IN_STUDY_COLUMN: &str = "time_in_study";
pub const STATUS_CODE_COLUMN: &str = "status_code";
pub const N_BATCHES_SUFFIX: &str = " n_batches";
pub const LAST_RECEIVED_SUFFIX: &str = " last_time_received";

const FRACTIONAL_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SensorField {
    Batches,
    LastReceived,
}

fn sensor_column(header: &str) -> Option<(&str, SensorField)> {
    if let Some(sensor) = header.strip_suffix(N_BATCHES_SUFFIX) {
        Some((sensor, SensorField::Batches))
    } else {
        header
            .strip_suffix(LAST_RECEIVED_SUFFIX)
            .map(|sensor| (sensor, SensorField::LastReceived))
    }
}

fn is_fixed_column(header: &str) -> bool {
    matches!(
        header,
        ID_COLUMN
            | MODALITY_COLUMN
            | DATE_REGISTERED_COLUMN
            | DATE_LEFT_COLUMN
            | TIME_IN_STUDY_COLUMN
            | STATUS_CODE_COLUMN
    )
}

/// One table row: the typed record plus its display cells, aligned with
/// [`NormalizedTable::columns`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRow {
    pub record: UploadRecord,
    pub cells: Vec<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedTable {
    pub columns: Vec<String>,
    pub rows: Vec<NormalizedRow>,
}

impl NormalizedTable {
    pub fn records(&self) -> impl Iterator<Item = &UploadRecord> {
        self.rows.iter().map(|row| &row.record)
    }
}

struct ColumnLayout {
    id: usize,
    modality: usize,
    date_registered: usize,
    time_in_study: usize,
    date_left: Option<usize>,
    status_code: Option<usize>,
}

impl ColumnLayout {
    fn resolve(headers: &[String]) -> Result<Self, ClassifyError> {
        let position = |name: &str| headers.iter().position(|header| header == name);
        let required = |name: &str| {
            position(name)
                .ok_or_else(|| ClassifyError::shape(format!("missing required column {name:?}")))
        };

        Ok(Self {
            id: required(ID_COLUMN)?,
            modality: required(MODALITY_COLUMN)?,
            date_registered: required(DATE_REGISTERED_COLUMN)?,
            time_in_study: required(TIME_IN_STUDY_COLUMN)?,
            date_left: position(DATE_LEFT_COLUMN),
            status_code: position(STATUS_CODE_COLUMN),
        })
    }
}

/// Validates and normalizes the raw upload table for one study.
///
/// Columns of sensors no enabled modality expects are dropped only when
/// they hold no data in any row; a stray sensor that did upload stays
/// visible. Rows come back sorted by modality, then registration id.
pub fn normalize(raw: &RawTable, config: &StudyConfig) -> Result<NormalizedTable, ClassifyError> {
    let headers: Vec<String> = raw
        .headers
        .iter()
        .map(|header| match header.trim() {
            SUBJECT_NAME_COLUMN => ID_COLUMN.to_string(),
            other => other.to_string(),
        })
        .collect();

    let mut seen = HashSet::new();
    if let Some(duplicate) = headers.iter().find(|header| !seen.insert(header.as_str())) {
        return Err(ClassifyError::shape(format!("duplicate column {duplicate:?}")));
    }
    let layout = ColumnLayout::resolve(&headers)?;

    let mut cells = Vec::with_capacity(raw.rows.len());
    for (index, row) in raw.rows.iter().enumerate() {
        if row.len() != headers.len() {
            return Err(ClassifyError::at_row(
                index,
                format!("expected {} cells, found {}", headers.len(), row.len()),
            ));
        }
        let normalized: Vec<Option<String>> = headers
            .iter()
            .zip(row)
            .map(|(header, cell)| {
                if is_fixed_column(header) || sensor_column(header).is_some() {
                    clear_placeholder(cell)
                } else if cell.is_empty() {
                    None
                } else {
                    Some(cell.clone())
                }
            })
            .collect();
        cells.push(normalized);
    }

    let kept: Vec<usize> = (0..headers.len())
        .filter(|&column| match sensor_column(&headers[column]) {
            Some((sensor, _)) if !config.is_sensor_used(sensor) => {
                cells.iter().any(|row| row[column].is_some())
            }
            _ => true,
        })
        .collect();
    if kept.len() < headers.len() {
        debug!(
            "study {}: dropped {} empty unused sensor columns",
            config.study_id,
            headers.len() - kept.len()
        );
    }

    let mut rows = Vec::with_capacity(cells.len());
    for (index, row) in cells.into_iter().enumerate() {
        let record = parse_record(index, &headers, &kept, &layout, &row)?;
        if !config.has_modality(record.modality) {
            warn!(
                "study {}: registration {} reports for disabled modality {}",
                config.study_id, record.registration_id, record.modality
            );
        }
        let cells = kept.iter().map(|&column| row[column].clone()).collect();
        rows.push(NormalizedRow { record, cells });
    }

    if rows.is_empty() {
        return Err(ClassifyError::EmptyTable);
    }

    rows.sort_by(|a, b| {
        (a.record.modality, &a.record.registration_id, &a.cells).cmp(&(
            b.record.modality,
            &b.record.registration_id,
            &b.cells,
        ))
    });
    debug!("study {}: normalized {} rows", config.study_id, rows.len());

    Ok(NormalizedTable {
        columns: kept.iter().map(|&column| headers[column].clone()).collect(),
        rows,
    })
}

fn clear_placeholder(cell: &str) -> Option<String> {
    let trimmed = cell.trim();
    let placeholder = trimmed.is_empty()
        || trimmed == "0"
        || trimmed == "0.0"
        || trimmed.eq_ignore_ascii_case("none")
        || trimmed.eq_ignore_ascii_case("nan");
    if placeholder {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_record(
    index: usize,
    headers: &[String],
    kept: &[usize],
    layout: &ColumnLayout,
    row: &[Option<String>],
) -> Result<UploadRecord, ClassifyError> {
    let cell = |column: usize| row[column].as_deref();
    let optional = |column: Option<usize>| column.and_then(|column| row[column].as_deref());

    let registration_id = cell(layout.id)
        .ok_or_else(|| ClassifyError::at_row(index, "missing registration id"))?
        .to_string();
    let modality = cell(layout.modality)
        .ok_or_else(|| ClassifyError::at_row(index, "missing modality"))
        .and_then(|value| {
            value.parse::<Modality>().map_err(|_| {
                ClassifyError::at_row(index, format!("unknown modality {value:?}"))
            })
        })?;
    let date_registered = cell(layout.date_registered)
        .ok_or_else(|| ClassifyError::at_row(index, "missing registration date"))
        .and_then(|value| parse_timestamp(index, DATE_REGISTERED_COLUMN, value))?;
    let date_left_study = optional(layout.date_left)
        .map(|value| parse_timestamp(index, DATE_LEFT_COLUMN, value))
        .transpose()?;
    let time_in_study_days = cell(layout.time_in_study)
        .map(|value| parse_days(index, value))
        .transpose()?
        .unwrap_or(0);
    let status_code = optional(layout.status_code)
        .map(|value| parse_status_code(index, value))
        .transpose()?
        .unwrap_or_default();

    if date_left_study.is_some_and(|left| left < date_registered) {
        return Err(ClassifyError::at_row(
            index,
            "date_left_study is before date_registered",
        ));
    }

    let mut sensors: BTreeMap<String, SensorUpload> = BTreeMap::new();
    for &column in kept {
        let Some((sensor, field)) = sensor_column(&headers[column]) else {
            continue;
        };
        let upload = sensors.entry(sensor.to_string()).or_default();
        let Some(value) = cell(column) else {
            continue;
        };
        match field {
            SensorField::Batches => {
                upload.n_batches = Some(parse_count(index, &headers[column], value)?);
            }
            SensorField::LastReceived => {
                upload.last_time_received = Some(parse_timestamp(index, &headers[column], value)?);
            }
        }
    }

    Ok(UploadRecord {
        registration_id,
        modality,
        date_registered,
        date_left_study,
        time_in_study_days,
        status_code,
        sensors,
    })
}

fn parse_timestamp(
    index: usize,
    column: &str,
    value: &str,
) -> Result<NaiveDateTime, ClassifyError> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(value, FRACTIONAL_TIMESTAMP_FORMAT))
        .map_err(|_| ClassifyError::at_row(index, format!("invalid {column} timestamp {value:?}")))
}

/// Reads the day count from a rendered timedelta such as `"10 days 04:12:00"`.
fn parse_days(index: usize, value: &str) -> Result<i64, ClassifyError> {
    value
        .split_whitespace()
        .next()
        .and_then(|days| days.parse::<i64>().ok())
        .filter(|days| *days >= 0)
        .ok_or_else(|| ClassifyError::at_row(index, format!("invalid time_in_study {value:?}")))
}

/// Whole-number cells may have been written as floats by upstream tooling.
fn parse_whole_number(value: &str) -> Option<i64> {
    value.parse::<i64>().ok().or_else(|| {
        value
            .parse::<f64>()
            .ok()
            .filter(|number| number.fract() == 0.0 && number.abs() < i64::MAX as f64)
            .map(|number| number as i64)
    })
}

fn parse_count(index: usize, column: &str, value: &str) -> Result<u64, ClassifyError> {
    parse_whole_number(value)
        .and_then(|count| u64::try_from(count).ok())
        .ok_or_else(|| ClassifyError::at_row(index, format!("invalid {column} {value:?}")))
}

fn parse_status_code(index: usize, value: &str) -> Result<StatusCode, ClassifyError> {
    parse_whole_number(value)
        .and_then(StatusCode::from_code)
        .ok_or_else(|| ClassifyError::at_row(index, format!("invalid status_code {value:?}")))
}
