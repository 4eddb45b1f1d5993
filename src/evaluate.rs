use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDateTime;
use log::warn;

use crate::models::{Modality, StatusCode, StatusTag, UploadRecord};
use crate::study::StudyConfig;

/// A sensor is stale once this many whole days passed without an upload.
pub const STALE_AFTER_DAYS: i64 = 2;

/// All activations of one subject within one modality.
#[derive(Debug, Clone)]
pub struct RegistrationGroup<'a> {
    pub subject: &'a str,
    pub modality: Modality,
    pub records: Vec<&'a UploadRecord>,
    /// Position of each record in the sequence it was grouped from.
    pub positions: Vec<usize>,
}

impl RegistrationGroup<'_> {
    pub fn active_count(&self) -> usize {
        self.records.iter().filter(|record| record.is_active()).count()
    }

    pub fn has_multiple_active(&self) -> bool {
        self.active_count() > 1
    }
}

/// Groups records by (modality, subject), keeping the incoming order inside
/// each group.
pub fn group_records<'a>(
    records: impl IntoIterator<Item = &'a UploadRecord>,
) -> Vec<RegistrationGroup<'a>> {
    let mut groups: BTreeMap<(Modality, &'a str), RegistrationGroup<'a>> = BTreeMap::new();
    for (position, record) in records.into_iter().enumerate() {
        let group = groups
            .entry((record.modality, record.subject()))
            .or_insert_with(|| RegistrationGroup {
                subject: record.subject(),
                modality: record.modality,
                records: Vec::new(),
                positions: Vec::new(),
            });
        group.records.push(record);
        group.positions.push(position);
    }
    groups.into_values().collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub registration_id: String,
    pub modality: Modality,
    pub status_tag: StatusTag,
    pub is_active: bool,
    /// Enabled sensors silent for too long, measured up to departure for
    /// registrations that left.
    pub stale_sensors: BTreeSet<String>,
}

pub fn is_stale(last_received: NaiveDateTime, reference_end: NaiveDateTime) -> bool {
    (reference_end - last_received).num_days() >= STALE_AFTER_DAYS
}

pub fn stale_sensors(
    record: &UploadRecord,
    config: &StudyConfig,
    reference_time: NaiveDateTime,
) -> BTreeSet<String> {
    let reference_end = record.date_left_study.unwrap_or(reference_time);
    config
        .sensors_for(record.modality)
        .filter(|sensor| {
            let last_received = record
                .sensors
                .get(*sensor)
                .and_then(|upload| upload.last_time_received)
                .unwrap_or(record.date_registered);
            is_stale(last_received, reference_end)
        })
        .map(str::to_string)
        .collect()
}

/// Picks the single tag for a record. Duplicate live activations win over
/// everything; active rows then check duration before staleness.
pub fn status_tag(
    record: &UploadRecord,
    stale_sensors: &BTreeSet<String>,
    multiple_active: bool,
    config: &StudyConfig,
) -> StatusTag {
    match record.days_until_left() {
        None if multiple_active => StatusTag::MultipleActive,
        None if record.time_in_study_days > config.duration_days => {
            StatusTag::DurationReachedActive
        }
        None if !stale_sensors.is_empty() => StatusTag::StaleData,
        None => StatusTag::None,
        Some(days) if days >= config.duration_days => StatusTag::DurationReachedLeft,
        Some(_) => StatusTag::LeftEarly,
    }
}

pub fn evaluate_group(
    group: &RegistrationGroup<'_>,
    config: &StudyConfig,
    reference_time: NaiveDateTime,
) -> Vec<Evaluation> {
    let multiple_active = group.has_multiple_active();
    if multiple_active {
        warn!(
            "study {}: subject {} has {} active {} registrations",
            config.study_id,
            group.subject,
            group.active_count(),
            group.modality
        );
    }

    group
        .records
        .iter()
        .map(|record| {
            if record.is_active()
                && matches!(
                    record.status_code,
                    StatusCode::LeftVoluntarily | StatusCode::AutoRetired
                )
            {
                warn!(
                    "study {}: registration {} has status code {} but no departure date",
                    config.study_id,
                    record.registration_id,
                    record.status_code.code()
                );
            }
            let stale = stale_sensors(record, config, reference_time);
            Evaluation {
                registration_id: record.registration_id.clone(),
                modality: record.modality,
                status_tag: status_tag(record, &stale, multiple_active, config),
                is_active: record.is_active(),
                stale_sensors: stale,
            }
        })
        .collect()
}

/// Union of stale sensors across one group's evaluations.
pub fn group_stale_sensors(evaluations: &[Evaluation]) -> BTreeSet<&str> {
    evaluations
        .iter()
        .flat_map(|evaluation| evaluation.stale_sensors.iter().map(String::as_str))
        .collect()
}
