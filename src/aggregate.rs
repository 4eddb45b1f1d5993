//! Folds per-registration evaluations into the views the dashboard needs:
//! the annotated table and the recipient sets for notifications.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDateTime;
use log::{debug, info};

use crate::error::ClassifyError;
use crate::evaluate::{evaluate_group, group_records, group_stale_sensors, Evaluation};
use crate::models::{Modality, RawTable, Recipient, StatusTag};
use crate::normalize::{normalize, NormalizedTable};
use crate::study::StudyConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedRow {
    pub subject: String,
    /// First row of its subject in display order; the renderer labels it.
    pub first_of_subject: bool,
    pub evaluation: Evaluation,
    pub cells: Vec<Option<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientSelection {
    AllActive,
    MissingData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudyStatus {
    pub columns: Vec<String>,
    pub rows: Vec<ClassifiedRow>,
    pub active_by_modality: BTreeMap<Modality, BTreeSet<String>>,
    pub stale_by_modality: BTreeMap<Modality, BTreeSet<String>>,
    /// Stale sensors per (modality, subject), for targeting reminders.
    pub stale_sensors_by_subject: BTreeMap<(Modality, String), BTreeSet<String>>,
    /// Subjects holding more than one live activation in a modality.
    pub anomalies: BTreeSet<(Modality, String)>,
    /// Uploaded batches per (modality, sensor) across all registrations.
    pub batch_totals: BTreeMap<(Modality, String), u64>,
}

impl StudyStatus {
    pub fn registrations(
        &self,
        selection: RecipientSelection,
    ) -> &BTreeMap<Modality, BTreeSet<String>> {
        match selection {
            RecipientSelection::AllActive => &self.active_by_modality,
            RecipientSelection::MissingData => &self.stale_by_modality,
        }
    }

    pub fn recipients(&self, selection: RecipientSelection) -> Vec<Recipient> {
        self.registrations(selection)
            .iter()
            .flat_map(|(modality, ids)| {
                ids.iter().map(|id| Recipient {
                    registration_id: id.clone(),
                    modality: *modality,
                })
            })
            .collect()
    }

    /// Live registrations that can be removed by hand. Duplicate activations
    /// are left out until the anomaly is resolved.
    pub fn removal_candidates(&self) -> Vec<Recipient> {
        let mut candidates: Vec<Recipient> = self
            .rows
            .iter()
            .map(|row| &row.evaluation)
            .filter(|evaluation| {
                evaluation.is_active && evaluation.status_tag != StatusTag::MultipleActive
            })
            .map(|evaluation| Recipient {
                registration_id: evaluation.registration_id.clone(),
                modality: evaluation.modality,
            })
            .collect();
        candidates.sort();
        candidates.dedup();
        candidates
    }

    pub fn is_removable(&self, recipient: &Recipient) -> bool {
        self.removal_candidates().contains(recipient)
    }

    pub fn tag_counts(&self) -> BTreeMap<StatusTag, usize> {
        let mut counts = BTreeMap::new();
        for row in &self.rows {
            *counts.entry(row.evaluation.status_tag).or_insert(0) += 1;
        }
        counts
    }
}

/// Classifies every row of a normalized table at `reference_time`.
pub fn aggregate(
    table: &NormalizedTable,
    config: &StudyConfig,
    reference_time: NaiveDateTime,
) -> StudyStatus {
    let mut evaluations: Vec<Option<Evaluation>> = vec![None; table.rows.len()];
    let mut stale_sensors_by_subject = BTreeMap::new();
    let mut anomalies = BTreeSet::new();

    for group in group_records(table.records()) {
        let group_evaluations = evaluate_group(&group, config, reference_time);
        let key = (group.modality, group.subject.to_string());

        let stale: BTreeSet<String> = group_stale_sensors(&group_evaluations)
            .into_iter()
            .map(str::to_string)
            .collect();
        if !stale.is_empty() {
            stale_sensors_by_subject.insert(key.clone(), stale);
        }
        if group.has_multiple_active() {
            anomalies.insert(key);
        }

        for (position, evaluation) in group.positions.iter().zip(group_evaluations) {
            evaluations[*position] = Some(evaluation);
        }
    }

    let mut active_by_modality: BTreeMap<Modality, BTreeSet<String>> = BTreeMap::new();
    let mut stale_by_modality: BTreeMap<Modality, BTreeSet<String>> = BTreeMap::new();
    let mut rows = Vec::with_capacity(table.rows.len());
    let mut previous_subject: Option<&str> = None;

    for (row, evaluation) in table.rows.iter().zip(evaluations) {
        // Every position is filled by exactly one group.
        let Some(evaluation) = evaluation else {
            continue;
        };
        if evaluation.is_active {
            active_by_modality
                .entry(evaluation.modality)
                .or_default()
                .insert(evaluation.registration_id.clone());
        }
        if evaluation.status_tag == StatusTag::StaleData {
            stale_by_modality
                .entry(evaluation.modality)
                .or_default()
                .insert(evaluation.registration_id.clone());
        }

        let subject = row.record.subject();
        rows.push(ClassifiedRow {
            subject: subject.to_string(),
            first_of_subject: previous_subject != Some(subject),
            evaluation,
            cells: row.cells.clone(),
        });
        previous_subject = Some(subject);
    }

    debug!(
        "study {}: {} rows, {} active, {} stale",
        config.study_id,
        rows.len(),
        active_by_modality.values().map(BTreeSet::len).sum::<usize>(),
        stale_by_modality.values().map(BTreeSet::len).sum::<usize>()
    );

    StudyStatus {
        columns: table.columns.clone(),
        rows,
        active_by_modality,
        stale_by_modality,
        stale_sensors_by_subject,
        anomalies,
        batch_totals: batch_totals(table),
    }
}

pub fn batch_totals(table: &NormalizedTable) -> BTreeMap<(Modality, String), u64> {
    let mut totals = BTreeMap::new();
    for record in table.records() {
        for (sensor, upload) in &record.sensors {
            if let Some(batches) = upload.n_batches {
                let total = totals.entry((record.modality, sensor.clone())).or_insert(0u64);
                *total = total.saturating_add(batches);
            }
        }
    }
    totals
}

/// Normalizes and classifies a raw upload table in one step.
pub fn classify(
    raw: &RawTable,
    config: &StudyConfig,
    reference_time: NaiveDateTime,
) -> Result<StudyStatus, ClassifyError> {
    let table = normalize(raw, config)?;
    let status = aggregate(&table, config, reference_time);
    if !status.anomalies.is_empty() {
        info!(
            "study {}: {} subjects with multiple active registrations",
            config.study_id,
            status.anomalies.len()
        );
    }
    Ok(status)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDate};

    use super::*;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 20)
            .and_then(|date| date.and_hms_opt(12, 0, 0))
            .unwrap()
    }

    fn stamp(days_ago: i64) -> String {
        (now() - Duration::days(days_ago))
            .format(crate::models::TIMESTAMP_FORMAT)
            .to_string()
    }

    fn config() -> StudyConfig {
        StudyConfig::new(
            "sleep",
            14,
            BTreeMap::from([
                (Modality::Main, BTreeSet::from(["location".to_string()])),
                (Modality::Ema, BTreeSet::from(["ema".to_string()])),
            ]),
        )
        .unwrap()
    }

    /// `left_after` is days after registration; `None` for active rows.
    fn row(
        id: &str,
        app: &str,
        registered: i64,
        left_after: Option<i64>,
        location: Option<i64>,
        ema: Option<i64>,
    ) -> Vec<String> {
        let left = left_after
            .map(|days| stamp(registered - days))
            .unwrap_or_else(|| "none".to_string());
        let time_in_study = left_after.unwrap_or(registered);
        let received = |days: Option<i64>| days.map(stamp).unwrap_or_else(|| "none".to_string());
        vec![
            id.to_string(),
            app.to_string(),
            stamp(registered),
            left,
            format!("{time_in_study} days 00:00:00"),
            if left_after.is_some() { "1" } else { "0" }.to_string(),
            received(location),
            received(ema),
        ]
    }

    fn table(rows: Vec<Vec<String>>) -> RawTable {
        RawTable::new(
            [
                "subject_name",
                "app",
                "date_registered",
                "date_left_study",
                "time_in_study",
                "status_code",
                "location last_time_received",
                "ema last_time_received",
            ]
            .iter()
            .map(|header| header.to_string())
            .collect(),
            rows,
        )
    }

    fn tag_of(status: &StudyStatus, id: &str, modality: Modality) -> StatusTag {
        status
            .rows
            .iter()
            .find(|row| row.evaluation.registration_id == id && row.evaluation.modality == modality)
            .map(|row| row.evaluation.status_tag)
            .unwrap()
    }

    fn scenario_table() -> RawTable {
        table(vec![
            row("sleep_00001_1", "main", 10, None, Some(1), None),
            row("sleep_00002_1", "main", 10, None, Some(3), None),
            row("sleep_00003_1", "main", 20, None, Some(0), None),
            row("sleep_00004_1", "main", 20, Some(16), Some(9), None),
            row("sleep_00005_1", "main", 20, Some(10), Some(11), None),
            row("sleep_00006_1", "ema", 20, None, None, Some(0)),
            row("sleep_00006_2", "ema", 3, None, None, Some(0)),
        ])
    }

    #[test]
    fn classifies_reference_scenarios() {
        let status = classify(&scenario_table(), &config(), now()).unwrap();

        assert_eq!(tag_of(&status, "sleep_00001_1", Modality::Main), StatusTag::None);
        assert_eq!(tag_of(&status, "sleep_00002_1", Modality::Main), StatusTag::StaleData);
        assert_eq!(
            tag_of(&status, "sleep_00003_1", Modality::Main),
            StatusTag::DurationReachedActive
        );
        assert_eq!(
            tag_of(&status, "sleep_00004_1", Modality::Main),
            StatusTag::DurationReachedLeft
        );
        assert_eq!(tag_of(&status, "sleep_00005_1", Modality::Main), StatusTag::LeftEarly);
        assert_eq!(
            tag_of(&status, "sleep_00006_1", Modality::Ema),
            StatusTag::MultipleActive
        );
        assert_eq!(
            tag_of(&status, "sleep_00006_2", Modality::Ema),
            StatusTag::MultipleActive
        );
    }

    #[test]
    fn builds_recipient_sets_by_modality() {
        let status = classify(&scenario_table(), &config(), now()).unwrap();

        assert_eq!(
            status.stale_by_modality,
            BTreeMap::from([(Modality::Main, BTreeSet::from(["sleep_00002_1".to_string()]))])
        );
        assert_eq!(
            status.active_by_modality[&Modality::Main],
            BTreeSet::from([
                "sleep_00001_1".to_string(),
                "sleep_00002_1".to_string(),
                "sleep_00003_1".to_string(),
            ])
        );
        assert_eq!(status.active_by_modality[&Modality::Ema].len(), 2);

        let missing: Vec<String> = status
            .recipients(RecipientSelection::MissingData)
            .iter()
            .map(Recipient::to_string)
            .collect();
        assert_eq!(missing, vec!["sleep_00002_1:main"]);
    }

    #[test]
    fn stale_is_a_subset_of_active() {
        let status = classify(&scenario_table(), &config(), now() + Duration::days(30)).unwrap();
        for (modality, stale) in &status.stale_by_modality {
            assert!(stale.is_subset(&status.active_by_modality[modality]));
        }
    }

    #[test]
    fn surfaces_anomalies_without_aborting() {
        let status = classify(&scenario_table(), &config(), now()).unwrap();
        assert_eq!(
            status.anomalies,
            BTreeSet::from([(Modality::Ema, "sleep_00006".to_string())])
        );
        assert_eq!(status.rows.len(), 7);
    }

    #[test]
    fn removal_skips_duplicates_and_departed() {
        let status = classify(&scenario_table(), &config(), now()).unwrap();
        let candidates: Vec<String> = status
            .removal_candidates()
            .iter()
            .map(Recipient::to_string)
            .collect();
        assert_eq!(
            candidates,
            vec!["sleep_00001_1:main", "sleep_00002_1:main", "sleep_00003_1:main"]
        );
    }

    #[test]
    fn display_rows_follow_normalized_order() {
        let status = classify(&scenario_table(), &config(), now()).unwrap();
        let order: Vec<(&str, bool)> = status
            .rows
            .iter()
            .map(|row| (row.evaluation.registration_id.as_str(), row.first_of_subject))
            .collect();
        assert_eq!(
            order,
            vec![
                ("sleep_00006_1", true),
                ("sleep_00006_2", false),
                ("sleep_00001_1", true),
                ("sleep_00002_1", true),
                ("sleep_00003_1", true),
                ("sleep_00004_1", true),
                ("sleep_00005_1", true),
            ]
        );
    }

    #[test]
    fn row_order_does_not_change_the_sets() {
        let forward = classify(&scenario_table(), &config(), now()).unwrap();
        let mut shuffled = scenario_table();
        shuffled.rows.rotate_left(3);
        shuffled.rows.swap(0, 5);
        let backward = classify(&shuffled, &config(), now()).unwrap();

        assert_eq!(forward, backward);
    }

    #[test]
    fn classification_is_idempotent() {
        let table = normalize(&scenario_table(), &config()).unwrap();
        assert_eq!(
            aggregate(&table, &config(), now()),
            aggregate(&table, &config(), now())
        );
    }

    #[test]
    fn stale_sensors_are_tracked_per_subject() {
        let status = classify(&scenario_table(), &config(), now()).unwrap();
        assert_eq!(
            status.stale_sensors_by_subject[&(Modality::Main, "sleep_00002".to_string())],
            BTreeSet::from(["location".to_string()])
        );
        // Departed without uploads for days before leaving.
        assert!(status
            .stale_sensors_by_subject
            .contains_key(&(Modality::Main, "sleep_00004".to_string())));
    }

    #[test]
    fn sums_batches_per_sensor() {
        let mut raw = scenario_table();
        raw.headers.push("location n_batches".to_string());
        for (index, row) in raw.rows.iter_mut().enumerate() {
            row.push(if index < 2 { "5" } else { "0" }.to_string());
        }
        let status = classify(&raw, &config(), now()).unwrap();
        assert_eq!(
            status.batch_totals,
            BTreeMap::from([((Modality::Main, "location".to_string()), 10)])
        );
    }

    #[test]
    fn batch_totals_saturate_instead_of_overflowing() {
        let mut raw = scenario_table();
        raw.headers.push("location n_batches".to_string());
        for (index, row) in raw.rows.iter_mut().enumerate() {
            row.push(if index < 3 { "9000000000000000000" } else { "0" }.to_string());
        }
        let status = classify(&raw, &config(), now()).unwrap();
        assert_eq!(
            status.batch_totals[&(Modality::Main, "location".to_string())],
            u64::MAX
        );
    }

    #[test]
    fn removal_check_accepts_recipient_form() {
        let status = classify(&scenario_table(), &config(), now()).unwrap();
        let live: Recipient = "sleep_00001_1:main".parse().unwrap();
        let duplicate: Recipient = "sleep_00006_1:ema".parse().unwrap();
        let departed: Recipient = "sleep_00005_1:main".parse().unwrap();
        assert!(status.is_removable(&live));
        assert!(!status.is_removable(&duplicate));
        assert!(!status.is_removable(&departed));
    }

    #[test]
    fn empty_table_is_not_a_fault() {
        assert_eq!(
            classify(&table(Vec::new()), &config(), now()),
            Err(ClassifyError::EmptyTable)
        );
    }

    #[test]
    fn tag_counts_cover_every_row() {
        let status = classify(&scenario_table(), &config(), now()).unwrap();
        let counts = status.tag_counts();
        assert_eq!(counts.values().sum::<usize>(), status.rows.len());
        assert_eq!(counts[&StatusTag::MultipleActive], 2);
    }
}
