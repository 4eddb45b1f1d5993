use std::path::PathBuf;

use anyhow::Context;
use chrono::{Local, NaiveDateTime};
use clap::{Parser, Subcommand};

mod aggregate;
mod error;
mod evaluate;
mod models;
mod normalize;
mod report;
mod store;
mod study;

use aggregate::{classify, RecipientSelection};
use error::ClassifyError;
use models::{Recipient, TIMESTAMP_FORMAT};
use store::StudyStore;
use study::{activation_ids, StudyConfig, StudyDocument};

#[derive(Parser)]
#[command(name = "registration-status")]
#[command(about = "Registration status tracker for mobile-sensing studies", long_about = None)]
struct Cli {
    /// Directory holding one folder per study with its JSON document
    #[arg(long, env = "STUDIES_DIR", default_value = "/mnt/jutrack_data/studies")]
    studies_dir: PathBuf,
    /// Directory holding the telemetry upload tables
    #[arg(long, env = "STORAGE_DIR", default_value = "/mnt/jutrack_data")]
    storage_dir: PathBuf,
    #[arg(long, default_value = store::DEFAULT_CSV_PREFIX)]
    csv_prefix: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List studies with a study document
    List,
    /// Summarize registration status of a study
    Status {
        #[arg(long)]
        study: String,
        /// Reference time (YYYY-MM-DD HH:MM:SS); defaults to now
        #[arg(long, value_parser = parse_reference_time)]
        at: Option<NaiveDateTime>,
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Generate a markdown status report
    Report {
        #[arg(long)]
        study: String,
        #[arg(long, value_parser = parse_reference_time)]
        at: Option<NaiveDateTime>,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Print push notification recipients, one `id:modality` per line
    Recipients {
        #[arg(long)]
        study: String,
        /// Only registrations with missing data
        #[arg(long)]
        missing_data: bool,
        #[arg(long, value_parser = parse_reference_time)]
        at: Option<NaiveDateTime>,
    },
    /// Check whether a registration (`id:modality`) can be removed
    Removable {
        #[arg(long)]
        study: String,
        registration: Recipient,
        #[arg(long, value_parser = parse_reference_time)]
        at: Option<NaiveDateTime>,
    },
    /// Print the subject roster
    Roster {
        #[arg(long)]
        study: String,
        /// Only subjects that never enrolled
        #[arg(long)]
        unused: bool,
        /// Print every activation id instead of subject names
        #[arg(long)]
        activations: bool,
    },
    /// Add subjects to the roster
    Enroll {
        #[arg(long)]
        study: String,
        #[arg(long)]
        count: u32,
    },
    /// Refresh the enrolled subject list from the upload table
    Refresh {
        #[arg(long)]
        study: String,
    },
}

fn parse_reference_time(value: &str) -> Result<NaiveDateTime, String> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .map_err(|err| format!("expected {TIMESTAMP_FORMAT}: {err}"))
}

fn load_study(
    store: &StudyStore,
    study_id: &str,
) -> anyhow::Result<(StudyDocument, StudyConfig)> {
    let document = store.load_document(study_id)?;
    let config = StudyConfig::try_from(&document)
        .with_context(|| format!("study {study_id} is not configured correctly"))?;
    Ok((document, config))
}

/// Input-shape failures are reported in the dashboard's wording.
fn erroneous_line(message: &str) -> String {
    format!("Data erroneous: {message}")
}

fn exit_erroneous(message: &str) -> ! {
    eprintln!("{}", erroneous_line(message));
    std::process::exit(1);
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut store = StudyStore::new(cli.studies_dir, cli.storage_dir);
    store.csv_prefix = cli.csv_prefix;

    match cli.command {
        Commands::List => {
            let studies = store.list_studies()?;
            if studies.is_empty() {
                println!("No studies found.");
            }
            for study in studies {
                println!("{study}");
            }
        }
        Commands::Status { study, at, json } => {
            let (_, config) = load_study(&store, &study)?;
            let reference_time = at.unwrap_or_else(|| Local::now().naive_local());
            let raw = store.load_table(&study)?;

            let status = match classify(&raw, &config, reference_time) {
                Ok(status) => status,
                Err(ClassifyError::EmptyTable) => {
                    println!("No data available.");
                    return Ok(());
                }
                Err(ClassifyError::InputShape(message)) => exit_erroneous(&message),
            };

            if json {
                let summary = serde_json::json!({
                    "study": study,
                    "reference_time": reference_time.format(TIMESTAMP_FORMAT).to_string(),
                    "tags": status.tag_counts(),
                    "active": status.active_by_modality,
                    "stale": status.stale_by_modality,
                });
                println!("{}", serde_json::to_string_pretty(&summary)?);
                return Ok(());
            }

            println!(
                "Study {} as of {}: {} registrations",
                study,
                reference_time.format(TIMESTAMP_FORMAT),
                status.rows.len()
            );
            for (tag, count) in status.tag_counts() {
                println!("- {} {}", count, report::legend_label(tag));
            }
            for (modality, ids) in &status.stale_by_modality {
                println!("Missing data ({modality}): {}", ids.len());
            }
            for (modality, subject) in &status.anomalies {
                println!("Multiple active registrations: {subject} ({modality})");
            }
        }
        Commands::Report { study, at, out } => {
            let (document, config) = load_study(&store, &study)?;
            let reference_time = at.unwrap_or_else(|| Local::now().naive_local());
            let raw = store.load_table(&study)?;
            let status = classify(&raw, &config, reference_time);
            let report = report::build_report(&document, &config, reference_time, status.as_ref());
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Recipients {
            study,
            missing_data,
            at,
        } => {
            let (_, config) = load_study(&store, &study)?;
            let reference_time = at.unwrap_or_else(|| Local::now().naive_local());
            let raw = store.load_table(&study)?;
            let selection = if missing_data {
                RecipientSelection::MissingData
            } else {
                RecipientSelection::AllActive
            };

            match classify(&raw, &config, reference_time) {
                Ok(status) => {
                    for recipient in status.recipients(selection) {
                        println!("{recipient}");
                    }
                }
                Err(ClassifyError::EmptyTable) => println!("No data available."),
                Err(ClassifyError::InputShape(message)) => exit_erroneous(&message),
            }
        }
        Commands::Removable {
            study,
            registration,
            at,
        } => {
            let (_, config) = load_study(&store, &study)?;
            let reference_time = at.unwrap_or_else(|| Local::now().naive_local());
            let raw = store.load_table(&study)?;

            match classify(&raw, &config, reference_time) {
                Ok(status) if status.is_removable(&registration) => {
                    println!("{registration} can be removed.");
                }
                Ok(_) => {
                    println!("{registration} is not an active registration that can be removed.");
                }
                Err(ClassifyError::EmptyTable) => println!("No data available."),
                Err(ClassifyError::InputShape(message)) => exit_erroneous(&message),
            }
        }
        Commands::Roster {
            study,
            unused,
            activations,
        } => {
            let document = store.load_document(&study)?;
            let subjects = if unused {
                document.unused_subjects()?
            } else {
                document.roster()?
            };
            for subject in subjects {
                if activations {
                    for id in activation_ids(&subject) {
                        println!("{id}");
                    }
                } else {
                    println!("{subject}");
                }
            }
        }
        Commands::Enroll { study, count } => {
            let mut document = store.load_document(&study)?;
            let total = document.grow_roster(count)?;
            store.save_document(&document)?;
            println!("Study {study} now has {total} subjects.");
        }
        Commands::Refresh { study } => {
            let (mut document, config) = load_study(&store, &study)?;
            let raw = store.load_table(&study)?;
            let enrolled = match normalize::normalize(&raw, &config) {
                Ok(table) => document.refresh_enrolled_subjects(table.records()),
                Err(ClassifyError::EmptyTable) => document.refresh_enrolled_subjects([]),
                Err(ClassifyError::InputShape(message)) => exit_erroneous(&message),
            };
            store.save_document(&document)?;
            println!("Study {study} has {enrolled} enrolled subjects.");
        }
    }

    Ok(())
}
