//! Study configuration: the stored study document, the sensor catalog and
//! the subject roster derived from it.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::models::{Modality, UploadRecord};

pub const MAIN_SENSORS: &[&str] = &[
    "accelerometer",
    "activity",
    "application_usage",
    "barometer",
    "gravity_sensor",
    "gyroscope",
    "location",
    "magnetic_sensor",
    "rotation_vector",
    "linear_acceleration",
    "active_labeling",
];

pub const EMA_SENSORS: &[&str] = &["ema"];

pub const ACTIVE_LABELING_SENSOR: &str = "active_labeling";

/// Width of the zero-padded subject number.
pub const SUBJECT_NUMBER_WIDTH: usize = 5;

/// QR-code activation slots handed out per subject.
pub const ACTIVATIONS_PER_SUBJECT: u32 = 4;

pub fn catalog(modality: Modality) -> &'static [&'static str] {
    match modality {
        Modality::Main => MAIN_SENSORS,
        Modality::Ema => EMA_SENSORS,
    }
}

pub fn catalog_modality(sensor: &str) -> Option<Modality> {
    Modality::ALL
        .into_iter()
        .find(|modality| catalog(*modality).contains(&sensor))
}

/// The dashboard form stores numbers as strings; older documents use numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumberOrText {
    Number(i64),
    Text(String),
}

impl Default for NumberOrText {
    fn default() -> Self {
        Self::Number(0)
    }
}

impl NumberOrText {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Text(text) => text.trim().parse().ok(),
        }
    }

    fn render(&self) -> String {
        match self {
            Self::Number(value) => value.to_string(),
            Self::Text(text) => text.clone(),
        }
    }
}

/// JSON document kept per study in configuration storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyDocument {
    pub name: String,
    pub duration: NumberOrText,
    #[serde(rename = "number-of-subjects", default)]
    pub number_of_subjects: NumberOrText,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "sensor-list", default)]
    pub sensor_list: Vec<String>,
    #[serde(rename = "enrolled-subjects", default)]
    pub enrolled_subjects: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub survey: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_labeling: Option<i64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StudyDocument {
    pub fn subject_count(&self) -> Result<u32, ConfigError> {
        self.number_of_subjects
            .as_i64()
            .and_then(|value| u32::try_from(value).ok())
            .ok_or_else(|| ConfigError::InvalidNumber {
                field: "number-of-subjects",
                value: self.number_of_subjects.render(),
            })
    }

    pub fn roster(&self) -> Result<Vec<String>, ConfigError> {
        let count = self.subject_count()?;
        Ok((1..=count)
            .map(|number| subject_name(&self.name, number))
            .collect())
    }

    /// Subjects on the roster that never showed up in the upload table.
    pub fn unused_subjects(&self) -> Result<Vec<String>, ConfigError> {
        let enrolled: BTreeSet<&str> = self.enrolled_subjects.iter().map(String::as_str).collect();
        Ok(self
            .roster()?
            .into_iter()
            .filter(|subject| !enrolled.contains(subject.as_str()))
            .collect())
    }

    /// Adds `additional` subjects to the roster and returns the new total.
    pub fn grow_roster(&mut self, additional: u32) -> Result<u32, ConfigError> {
        let total = self
            .subject_count()?
            .checked_add(additional)
            .ok_or_else(|| ConfigError::InvalidNumber {
                field: "number-of-subjects",
                value: format!("{} + {additional}", self.number_of_subjects.render()),
            })?;
        self.number_of_subjects = NumberOrText::Text(total.to_string());
        Ok(total)
    }

    pub fn refresh_enrolled_subjects<'a>(
        &mut self,
        records: impl IntoIterator<Item = &'a UploadRecord>,
    ) -> usize {
        let subjects: BTreeSet<String> = records
            .into_iter()
            .map(|record| record.subject().to_string())
            .collect();
        self.enrolled_subjects = subjects.into_iter().collect();
        self.enrolled_subjects.len()
    }
}

pub fn subject_name(study_id: &str, number: u32) -> String {
    format!("{study_id}_{number:0width$}", width = SUBJECT_NUMBER_WIDTH)
}

pub fn activation_ids(subject: &str) -> Vec<String> {
    (1..=ACTIVATIONS_PER_SUBJECT)
        .map(|activation| format!("{subject}_{activation}"))
        .collect()
}

/// Immutable classifier view of a study.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudyConfig {
    pub study_id: String,
    pub duration_days: i64,
    enabled_sensors: BTreeMap<Modality, BTreeSet<String>>,
}

impl StudyConfig {
    /// Every key of `enabled_sensors` is an enabled modality, possibly with
    /// no sensors at all.
    pub fn new(
        study_id: impl Into<String>,
        duration_days: i64,
        enabled_sensors: BTreeMap<Modality, BTreeSet<String>>,
    ) -> Result<Self, ConfigError> {
        if duration_days <= 0 {
            return Err(ConfigError::InvalidDuration(duration_days.to_string()));
        }
        for (modality, sensors) in &enabled_sensors {
            if let Some(unknown) = sensors
                .iter()
                .find(|sensor| !catalog(*modality).contains(&sensor.as_str()))
            {
                return Err(ConfigError::UnknownSensor(unknown.clone()));
            }
        }
        Ok(Self {
            study_id: study_id.into(),
            duration_days,
            enabled_sensors,
        })
    }

    pub fn modalities(&self) -> impl Iterator<Item = Modality> + '_ {
        self.enabled_sensors.keys().copied()
    }

    pub fn has_modality(&self, modality: Modality) -> bool {
        self.enabled_sensors.contains_key(&modality)
    }

    pub fn sensors_for(&self, modality: Modality) -> impl Iterator<Item = &str> {
        self.enabled_sensors
            .get(&modality)
            .into_iter()
            .flat_map(|sensors| sensors.iter().map(String::as_str))
    }

    /// True if any enabled modality expects uploads from `sensor`.
    pub fn is_sensor_used(&self, sensor: &str) -> bool {
        self.enabled_sensors
            .values()
            .any(|sensors| sensors.contains(sensor))
    }
}

impl TryFrom<&StudyDocument> for StudyConfig {
    type Error = ConfigError;

    fn try_from(document: &StudyDocument) -> Result<Self, Self::Error> {
        if document.name.trim().is_empty() {
            return Err(ConfigError::MissingName);
        }
        let duration_days = document
            .duration
            .as_i64()
            .filter(|days| *days > 0)
            .ok_or_else(|| ConfigError::InvalidDuration(document.duration.render()))?;

        let mut main = BTreeSet::new();
        for sensor in &document.sensor_list {
            match catalog_modality(sensor) {
                Some(Modality::Main) => {
                    main.insert(sensor.clone());
                }
                // The creation form appends "ema"; the survey decides whether it counts.
                Some(Modality::Ema) => {}
                None => return Err(ConfigError::UnknownSensor(sensor.clone())),
            }
        }
        if document.active_labeling.unwrap_or(0) != 0 {
            main.insert(ACTIVE_LABELING_SENSOR.to_string());
        }

        let mut enabled_sensors = BTreeMap::from([(Modality::Main, main)]);
        if document.survey.is_some() {
            enabled_sensors.insert(
                Modality::Ema,
                EMA_SENSORS.iter().map(|sensor| sensor.to_string()).collect(),
            );
        }

        Self::new(document.name.clone(), duration_days, enabled_sensors)
    }
}
