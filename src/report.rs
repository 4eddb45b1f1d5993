use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

use chrono::NaiveDateTime;

use crate::aggregate::{ClassifiedRow, StudyStatus};
use crate::error::ClassifyError;
use crate::models::{Modality, StatusCode, StatusTag, TIMESTAMP_FORMAT};
use crate::normalize::{ID_COLUMN, LAST_RECEIVED_SUFFIX};
use crate::study::{StudyConfig, StudyDocument};

/// Display class of a tag, as used by the dashboard stylesheet.
pub fn color_class(tag: StatusTag) -> &'static str {
    match tag {
        StatusTag::None => "",
        StatusTag::StaleData => "red",
        StatusTag::LeftEarly => "blue",
        StatusTag::DurationReachedActive => "light-green",
        StatusTag::DurationReachedLeft => "dark-green",
        StatusTag::MultipleActive => "orange",
    }
}

pub fn legend_label(tag: StatusTag) -> &'static str {
    match tag {
        StatusTag::None => "Nothing unusual",
        StatusTag::StaleData => "No data sent for 2 days",
        StatusTag::LeftEarly => "Left study too early",
        StatusTag::DurationReachedActive => "Study duration reached, not left",
        StatusTag::DurationReachedLeft => "Study duration reached, left",
        StatusTag::MultipleActive => "Multiple QR codes of one user active",
    }
}

fn escape(cell: &str) -> String {
    cell.replace('|', "\\|")
}

fn write_id_list(
    output: &mut String,
    ids_by_modality: &BTreeMap<Modality, BTreeSet<String>>,
    empty: &str,
) {
    if ids_by_modality.values().all(BTreeSet::is_empty) {
        let _ = writeln!(output, "{empty}");
        return;
    }
    for (modality, ids) in ids_by_modality {
        let listed: Vec<&str> = ids.iter().map(String::as_str).collect();
        let _ = writeln!(output, "- {}: {}", modality, listed.join(", "));
    }
}

fn write_details(output: &mut String, document: &StudyDocument, config: &StudyConfig) {
    let _ = writeln!(output, "## Study Details");
    if !document.description.is_empty() {
        let _ = writeln!(output, "{}", document.description);
        let _ = writeln!(output);
    }
    let _ = writeln!(output, "- Study duration: {} days", config.duration_days);
    match document.subject_count() {
        Ok(total) => {
            let _ = writeln!(output, "- Total number of subjects: {total}");
        }
        Err(err) => {
            let _ = writeln!(output, "- Total number of subjects: unknown ({err})");
        }
    }
    let _ = writeln!(
        output,
        "- Number of enrolled subjects: {}",
        document.enrolled_subjects.len()
    );
    for modality in config.modalities() {
        let sensors: Vec<&str> = config.sensors_for(modality).collect();
        let listed = if sensors.is_empty() {
            "none".to_string()
        } else {
            sensors.join(", ")
        };
        let _ = writeln!(output, "- Sensors ({modality}): {listed}");
    }
}

fn render_row(status: &StudyStatus, row: &ClassifiedRow) -> String {
    let evaluation = &row.evaluation;
    let subject = if row.first_of_subject { row.subject.as_str() } else { "" };
    let mut cells = vec![escape(subject), evaluation.status_tag.to_string()];

    for (column, cell) in status.columns.iter().zip(&row.cells) {
        let value = cell.as_deref().unwrap_or("");
        let stale = column
            .strip_suffix(LAST_RECEIVED_SUFFIX)
            .is_some_and(|sensor| evaluation.stale_sensors.contains(sensor));
        let rendered = if stale {
            format!("**{}**", if value.is_empty() { "-" } else { value })
        } else if column == ID_COLUMN && !color_class(evaluation.status_tag).is_empty() {
            format!("{} ({})", value, color_class(evaluation.status_tag))
        } else {
            value.to_string()
        };
        cells.push(escape(&rendered));
    }

    format!("| {} |", cells.join(" | "))
}

fn write_table(output: &mut String, status: &StudyStatus) {
    let mut header = vec!["user".to_string(), "status".to_string()];
    header.extend(status.columns.iter().map(|column| escape(column)));
    let _ = writeln!(output, "| {} |", header.join(" | "));
    let _ = writeln!(output, "|{}", " --- |".repeat(header.len()));
    for row in &status.rows {
        let _ = writeln!(output, "{}", render_row(status, row));
    }
}

fn write_legends(output: &mut String) {
    let _ = writeln!(output, "## Legend");
    for tag in StatusTag::ALL {
        if tag == StatusTag::None {
            continue;
        }
        let _ = writeln!(
            output,
            "- {} ({}): {}",
            tag,
            color_class(tag),
            legend_label(tag)
        );
    }
    let _ = writeln!(output);
    let _ = writeln!(output, "## Status Codes");
    for code in StatusCode::ALL {
        let label = match code {
            StatusCode::Nominal => "Empty".to_string(),
            other => other.code().to_string(),
        };
        let _ = writeln!(output, "- {label}: {}", code.description());
    }
}

fn write_status_sections(output: &mut String, status: &StudyStatus) {
    let _ = writeln!(output, "## Active Registrations");
    write_id_list(output, &status.active_by_modality, "No active registrations.");

    let _ = writeln!(output);
    let _ = writeln!(output, "## Missing Data");
    write_id_list(output, &status.stale_by_modality, "No registrations with missing data.");
    for ((modality, subject), sensors) in &status.stale_sensors_by_subject {
        let listed: Vec<&str> = sensors.iter().map(String::as_str).collect();
        let _ = writeln!(output, "  - {subject} ({modality}) silent: {}", listed.join(", "));
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Multiple Active Registrations");
    if status.anomalies.is_empty() {
        let _ = writeln!(output, "None.");
    } else {
        for (modality, subject) in &status.anomalies {
            let _ = writeln!(output, "- {subject} ({modality})");
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Uploaded Batches");
    if status.batch_totals.is_empty() {
        let _ = writeln!(output, "No batches uploaded.");
    }
    for ((modality, sensor), batches) in &status.batch_totals {
        let _ = writeln!(output, "- {sensor} ({modality}): {batches}");
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Removable Registrations");
    let candidates = status.removal_candidates();
    if candidates.is_empty() {
        let _ = writeln!(output, "None.");
    } else {
        for candidate in candidates {
            let _ = writeln!(output, "- {candidate}");
        }
    }
}

/// Renders the study page. A classification failure replaces the table with
/// a placeholder instead of failing the whole report.
pub fn build_report(
    document: &StudyDocument,
    config: &StudyConfig,
    reference_time: NaiveDateTime,
    status: Result<&StudyStatus, &ClassifyError>,
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Study {}", config.study_id);
    let _ = writeln!(
        output,
        "Registration status as of {}",
        reference_time.format(TIMESTAMP_FORMAT)
    );
    let _ = writeln!(output);
    write_details(&mut output, document, config);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Registrations");

    match status {
        Ok(status) => {
            write_table(&mut output, status);
            let _ = writeln!(output);
            write_legends(&mut output);
            let _ = writeln!(output);
            write_status_sections(&mut output, status);
        }
        Err(ClassifyError::EmptyTable) => {
            let _ = writeln!(output, "No data available.");
        }
        Err(ClassifyError::InputShape(message)) => {
            let _ = writeln!(output, "Data erroneous: {message}");
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::aggregate::classify;
    use crate::models::RawTable;
    use crate::store::read_document;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 20)
            .and_then(|date| date.and_hms_opt(12, 0, 0))
            .unwrap()
    }

    fn document() -> StudyDocument {
        read_document(
            r#"{"name": "sleep", "duration": "14", "number-of-subjects": "2",
                "description": "Sleep and mood", "sensor-list": ["location"],
                "enrolled-subjects": ["sleep_00001", "sleep_00002"]}"#
                .as_bytes(),
        )
        .unwrap()
    }

    fn raw() -> RawTable {
        let headers = [
            "subject_name",
            "app",
            "date_registered",
            "date_left_study",
            "time_in_study",
            "status_code",
            "location n_batches",
            "location last_time_received",
        ];
        let rows = [
            [
                "sleep_00001_1", "main", "2026-03-10 09:00:00", "none", "10 days", "0", "22",
                "2026-03-15 08:00:00",
            ],
            [
                "sleep_00002_1", "main", "2026-03-10 09:00:00", "none", "10 days", "0", "30",
                "2026-03-20 08:00:00",
            ],
            [
                "sleep_00002_2", "main", "2026-03-01 09:00:00", "2026-03-05 09:00:00", "4 days",
                "1", "4", "2026-03-05 08:00:00",
            ],
        ];
        RawTable::new(
            headers.iter().map(|header| header.to_string()).collect(),
            rows.iter()
                .map(|row| row.iter().map(|cell| cell.to_string()).collect())
                .collect(),
        )
    }

    #[test]
    fn report_lists_table_and_recipients() {
        let document = document();
        let config = StudyConfig::try_from(&document).unwrap();
        let status = classify(&raw(), &config, now()).unwrap();
        let report = build_report(&document, &config, now(), Ok(&status));

        assert!(report.contains("# Study sleep"));
        assert!(report.contains("- Study duration: 14 days"));
        assert!(report.contains("- Number of enrolled subjects: 2"));
        assert!(report.contains(
            "| sleep_00001 | stale_data | sleep_00001_1 (red) | main | 2026-03-10 09:00:00 |  | 10 days |  | 22 | **2026-03-15 08:00:00** |"
        ));
        assert!(report.contains("| sleep_00002 | none | sleep_00002_1 | main |"));
        assert!(report.contains("|  | left_early | sleep_00002_2 (blue) | main |"));
        assert!(report.contains("- main: sleep_00001_1, sleep_00002_1"));
        assert!(report.contains("  - sleep_00001 (main) silent: location"));
        assert!(report.contains("- stale_data (red): No data sent for 2 days"));
        assert!(report.contains("- 3: Missing data"));
        assert!(report.contains("- location (main): 56"));
        assert!(report.contains("- sleep_00001_1:main"));
    }

    #[test]
    fn report_degrades_on_missing_data() {
        let document = document();
        let config = StudyConfig::try_from(&document).unwrap();

        let empty = build_report(&document, &config, now(), Err(&ClassifyError::EmptyTable));
        assert!(empty.contains("No data available."));
        assert!(!empty.contains("## Legend"));

        let broken = ClassifyError::shape("missing required column \"app\"");
        let erroneous = build_report(&document, &config, now(), Err(&broken));
        assert!(erroneous.contains("Data erroneous"));
    }

    #[test]
    fn every_flagged_tag_has_a_color() {
        for tag in StatusTag::ALL {
            assert_eq!(color_class(tag).is_empty(), tag == StatusTag::None);
        }
    }
}
