use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::ClassifyError;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Separator between registration id and modality in recipient lists.
pub const RECIPIENT_SEPARATOR: char = ':';

/// Data-collection mode of a registration. Ordering follows the modality
/// names, which is the order rows are displayed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    /// Ecological momentary assessment (surveys)
    Ema,
    /// Passive sensor monitoring
    Main,
}

impl Modality {
    pub const ALL: [Modality; 2] = [Modality::Ema, Modality::Main];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ema => "ema",
            Self::Main => "main",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Modality {
    type Err = ClassifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "ema" => Ok(Self::Ema),
            "main" => Ok(Self::Main),
            other => Err(ClassifyError::shape(format!("unknown modality {other:?}"))),
        }
    }
}

/// Code assigned upstream by the telemetry pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusCode {
    #[default]
    Nominal,
    LeftVoluntarily,
    AutoRetired,
    Delinquent,
}

impl StatusCode {
    pub const ALL: [StatusCode; 4] = [
        StatusCode::Nominal,
        StatusCode::LeftVoluntarily,
        StatusCode::AutoRetired,
        StatusCode::Delinquent,
    ];

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Nominal),
            1 => Some(Self::LeftVoluntarily),
            2 => Some(Self::AutoRetired),
            3 => Some(Self::Delinquent),
            _ => None,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            Self::Nominal => 0,
            Self::LeftVoluntarily => 1,
            Self::AutoRetired => 2,
            Self::Delinquent => 3,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Nominal => "Everything is fine",
            Self::LeftVoluntarily => "User left study with this QR code",
            Self::AutoRetired => "User reached study duration and left automatically",
            Self::Delinquent => "Missing data",
        }
    }
}

/// Classification of one registration. Exactly one tag applies per row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusTag {
    None,
    StaleData,
    DurationReachedActive,
    DurationReachedLeft,
    LeftEarly,
    MultipleActive,
}

impl StatusTag {
    pub const ALL: [StatusTag; 6] = [
        StatusTag::None,
        StatusTag::StaleData,
        StatusTag::DurationReachedActive,
        StatusTag::DurationReachedLeft,
        StatusTag::LeftEarly,
        StatusTag::MultipleActive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::StaleData => "stale_data",
            Self::DurationReachedActive => "duration_reached_active",
            Self::DurationReachedLeft => "duration_reached_left",
            Self::LeftEarly => "left_early",
            Self::MultipleActive => "multiple_active",
        }
    }
}

impl fmt::Display for StatusTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upload statistics of one sensor for one registration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SensorUpload {
    pub n_batches: Option<u64>,
    pub last_time_received: Option<NaiveDateTime>,
}

/// Cumulative state of one activation code, as reported by telemetry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRecord {
    pub registration_id: String,
    pub modality: Modality,
    pub date_registered: NaiveDateTime,
    pub date_left_study: Option<NaiveDateTime>,
    pub time_in_study_days: i64,
    pub status_code: StatusCode,
    pub sensors: BTreeMap<String, SensorUpload>,
}

impl UploadRecord {
    pub fn subject(&self) -> &str {
        subject_identity(&self.registration_id)
    }

    pub fn is_active(&self) -> bool {
        self.date_left_study.is_none()
    }

    /// Whole days between registration and departure, if the registration left.
    pub fn days_until_left(&self) -> Option<i64> {
        self.date_left_study
            .map(|left| (left - self.date_registered).num_days())
    }
}

/// Strips the trailing `_<activation>` suffix from a registration id.
/// Ids without a numeric suffix are their own subject.
pub fn subject_identity(registration_id: &str) -> &str {
    match registration_id.rsplit_once('_') {
        Some((subject, activation))
            if !subject.is_empty()
                && !activation.is_empty()
                && activation.chars().all(|c| c.is_ascii_digit()) =>
        {
            subject
        }
        _ => registration_id,
    }
}

/// Upload table as it comes out of storage: headers plus untyped cells.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { headers, rows }
    }
}

/// Push notification target: one registration of one modality.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Recipient {
    pub registration_id: String,
    pub modality: Modality,
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.registration_id, RECIPIENT_SEPARATOR, self.modality
        )
    }
}

impl FromStr for Recipient {
    type Err = ClassifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (registration_id, modality) = s
            .rsplit_once(RECIPIENT_SEPARATOR)
            .ok_or_else(|| ClassifyError::shape(format!("recipient {s:?} has no modality")))?;
        if registration_id.is_empty() {
            return Err(ClassifyError::shape(format!("recipient {s:?} has no id")));
        }
        Ok(Self {
            registration_id: registration_id.to_string(),
            modality: modality.parse()?,
        })
    }
}
