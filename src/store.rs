use std::fs;
use std::io::Read;
use std::path::PathBuf;

use anyhow::Context;
use log::{debug, info};

use crate::models::RawTable;
use crate::study::StudyDocument;

pub const DEFAULT_CSV_PREFIX: &str = "jutrack_dashboard_";

/// Directory entries under the studies folder that are never studies.
const IGNORED_ENTRIES: &[&str] = &["users", "lost+found"];

/// File-backed storage for study documents and telemetry tables.
#[derive(Debug, Clone)]
pub struct StudyStore {
    pub studies_dir: PathBuf,
    pub storage_dir: PathBuf,
    pub csv_prefix: String,
}

impl StudyStore {
    pub fn new(studies_dir: impl Into<PathBuf>, storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            studies_dir: studies_dir.into(),
            storage_dir: storage_dir.into(),
            csv_prefix: DEFAULT_CSV_PREFIX.to_string(),
        }
    }

    pub fn document_path(&self, study_id: &str) -> PathBuf {
        self.studies_dir
            .join(study_id)
            .join(format!("{study_id}.json"))
    }

    pub fn table_path(&self, study_id: &str) -> PathBuf {
        self.storage_dir
            .join(format!("{}{study_id}.csv", self.csv_prefix))
    }

    pub fn list_studies(&self) -> anyhow::Result<Vec<String>> {
        let entries = fs::read_dir(&self.studies_dir).with_context(|| {
            format!("failed to read studies directory {}", self.studies_dir.display())
        })?;

        let mut studies = Vec::new();
        for entry in entries {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if IGNORED_ENTRIES.contains(&name.as_str()) || !entry.path().is_dir() {
                continue;
            }
            if self.document_path(&name).is_file() {
                studies.push(name);
            }
        }
        studies.sort();
        Ok(studies)
    }

    pub fn load_document(&self, study_id: &str) -> anyhow::Result<StudyDocument> {
        let path = self.document_path(study_id);
        let file = fs::File::open(&path)
            .with_context(|| format!("study {study_id} has no document at {}", path.display()))?;
        read_document(file).with_context(|| format!("invalid study document {}", path.display()))
    }

    pub fn save_document(&self, document: &StudyDocument) -> anyhow::Result<()> {
        let path = self.document_path(&document.name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, render_document(document)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("saved study document {}", path.display());
        Ok(())
    }

    pub fn load_table(&self, study_id: &str) -> anyhow::Result<RawTable> {
        let path = self.table_path(study_id);
        let file = fs::File::open(&path)
            .with_context(|| format!("table file not found: {}", path.display()))?;
        let table = read_raw_table(file)
            .with_context(|| format!("failed to read upload table {}", path.display()))?;
        debug!("loaded {} rows from {}", table.rows.len(), path.display());
        Ok(table)
    }
}

pub fn read_document(reader: impl Read) -> anyhow::Result<StudyDocument> {
    Ok(serde_json::from_reader(reader)?)
}

/// Pretty JSON with four-space indentation, matching the stored documents.
pub fn render_document(document: &StudyDocument) -> anyhow::Result<Vec<u8>> {
    let mut output = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut output, formatter);
    serde::Serialize::serialize(document, &mut serializer)?;
    output.push(b'\n');
    Ok(output)
}

/// Reads an upload table without judging its shape; row widths are checked
/// by the normalizer so they surface as classification errors.
pub fn read_raw_table(reader: impl Read) -> anyhow::Result<RawTable> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(reader);

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(str::to_string)
        .collect();
    let mut rows: Vec<Vec<String>> = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(str::to_string).collect());
    }

    Ok(RawTable::new(headers, rows))
}
