mod db;
mod engine;
mod export;
mod parser;
mod seed;
mod settings;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rusqlite::Connection;
use tracing::{info, warn};

use db::{AnatomySiteRecord, CodeRecord, DiagnosisRecord, TableKind};
use settings::Settings;

#[derive(Parser)]
#[command(
    name = "cancer_stats",
    about = "Count new primary cancers per body site from pathology report exports"
)]
struct Cli {
    /// Code table database (overrides CANCER_STATS_DB_PATH)
    #[arg(long, global = true, value_name = "FILE")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the code tables and load the default codes
    Init,
    /// Classify a report file and print new cases per site
    Process {
        /// Pathology report text export
        file: PathBuf,
        /// Also write the counts as CSV
        #[arg(long, value_name = "FILE")]
        csv: Option<PathBuf>,
    },
    /// Maintain the diagnosis and anatomy code tables
    Codes {
        #[command(subcommand)]
        action: CodesAction,
    },
    /// Show code table sizes
    Stats,
}

#[derive(Subcommand)]
enum CodesAction {
    /// Print every code in a table
    List { kind: TableKind },
    /// Export a table as JSON (stdout unless --out is given)
    Export {
        kind: TableKind,
        #[arg(short, long, value_name = "FILE")]
        out: Option<PathBuf>,
    },
    /// Upsert every code from a JSON export
    Import { kind: TableKind, file: PathBuf },
    /// Remove one code
    Delete { kind: TableKind, id: String },
    /// Add or replace a diagnosis code
    SetDiagnosis {
        id: String,
        #[arg(short, long)]
        description: String,
        /// Mark the diagnosis as not cancer (excluded from counts)
        #[arg(long)]
        not_cancer: bool,
        /// Mark the diagnosis as metastatic (never opens a new case)
        #[arg(long)]
        metastasis: bool,
    },
    /// Add or replace an anatomy code's site label
    SetAnatomy { id: String, label: String },
    /// Add unrecognized diagnosis codes as primary cancer codes
    Adopt {
        #[arg(required = true)]
        codes: Vec<String>,
    },
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let mut settings = Settings::load().context("Failed to load settings")?;
    if let Some(db) = cli.db {
        settings.db_path = db;
    }

    let conn = open_store(&settings.db_path)?;

    match cli.command {
        Commands::Init => {
            let c = db::counts(&conn)?;
            println!(
                "Code tables ready at {:?}: {} diagnosis codes, {} anatomy codes.",
                settings.db_path, c.diagnosis, c.anatomy
            );
        }
        Commands::Process { file, csv } => process_file(&conn, &settings, &file, csv.as_deref())?,
        Commands::Codes { action } => run_codes(&conn, action)?,
        Commands::Stats => {
            let c = db::counts(&conn)?;
            println!("Database:        {:?}", settings.db_path);
            println!("Diagnosis codes: {}", c.diagnosis);
            println!("Anatomy codes:   {}", c.anatomy);
        }
    }

    info!(elapsed_ms = t0.elapsed().as_millis() as u64, "Done");
    Ok(())
}

/// Open the store, creating tables and default codes on first use.
fn open_store(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }
    let conn = db::connect(path)?;
    db::init_schema(&conn)?;
    seed::seed_if_empty(&conn)?;
    Ok(conn)
}

fn process_file(
    conn: &Connection,
    settings: &Settings,
    file: &Path,
    csv_out: Option<&Path>,
) -> Result<()> {
    let bytes = fs::read(file).with_context(|| format!("Failed to read {:?}", file))?;
    let report = parser::parse_report(&parser::decode_report(&bytes), &settings.disclaimer_marker);
    println!(
        "Read {:?}: {} report lines, {} unparseable, {} ignored.",
        file,
        report.triples.len(),
        report.unmatched.len(),
        report.ignored
    );

    for line in &report.unmatched {
        warn!(line = line.line_no, text = %line.text.trim_end(), "Unparseable report line");
    }

    if report.triples.is_empty() {
        println!("No parseable pathology report lines found. Check the file format.");
        return Ok(());
    }

    let tables = db::load_tables(conn)?;
    let result = engine::classify(&report.triples, &tables);

    println!();
    println!("{}", export::render_counts(&result.counts));
    if let Some(section) = export::render_unrecognized(&result) {
        println!("\n{}", section);
    }

    let t = &result.totals;
    println!(
        "\n{} lines classified: {} patients with cancer diagnoses, {} non-cancer lines skipped, {} metastatic diagnoses not counted.",
        t.triples, t.patients, t.non_cancer, t.metastatic_pairs
    );
    if result.has_unrecognized() {
        println!("Done with warnings: some codes are not in the code tables and need review.");
    } else {
        println!("Done: every code was recognized.");
    }

    if let Some(path) = csv_out {
        if result.counts.is_empty() {
            println!("No counts to export; {:?} not written.", path);
        } else {
            let out = fs::File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
            export::write_counts_csv(out, settings.csv_header(), &result.counts)
                .with_context(|| format!("Failed to write {:?}", path))?;
            println!("Wrote {} rows to {:?}", result.counts.len(), path);
        }
    }
    Ok(())
}

fn run_codes(conn: &Connection, action: CodesAction) -> Result<()> {
    match action {
        CodesAction::List { kind } => {
            let records = db::get_all(conn, kind)?;
            if records.is_empty() {
                println!("No {} codes.", kind);
            } else {
                println!("{}", export::render_records(&records));
                println!("\n{} {} codes", records.len(), kind);
            }
        }
        CodesAction::Export { kind, out } => {
            let records = db::get_all(conn, kind)?;
            let json = export::to_json(&records)?;
            match out {
                Some(path) => {
                    fs::write(&path, json).with_context(|| format!("Failed to write {:?}", path))?;
                    println!("Exported {} {} codes to {:?}", records.len(), kind, path);
                }
                None => println!("{}", json),
            }
        }
        CodesAction::Import { kind, file } => {
            let text =
                fs::read_to_string(&file).with_context(|| format!("Failed to read {:?}", file))?;
            let records = export::parse_json(kind, &text)?;
            let n = db::import(conn, &records)?;
            info!(table = %kind, rows = n, "Imported codes");
            println!("Imported {} {} codes from {:?}", n, kind, file);
        }
        CodesAction::Delete { kind, id } => {
            if db::delete(conn, kind, &id)? {
                println!("Deleted {} code {}", kind, id);
            } else {
                println!("No {} code {}; nothing deleted.", kind, id);
            }
        }
        CodesAction::SetDiagnosis {
            id,
            description,
            not_cancer,
            metastasis,
        } => {
            let existed = db::get_diagnosis(conn, &id)?.is_some();
            db::upsert(
                conn,
                &CodeRecord::Diagnosis(DiagnosisRecord {
                    id: id.clone(),
                    description,
                    is_cancer: !not_cancer,
                    is_metastasis: metastasis,
                }),
            )?;
            println!(
                "{} diagnosis code {}",
                if existed { "Updated" } else { "Saved" },
                id.trim()
            );
        }
        CodesAction::SetAnatomy { id, label } => {
            db::upsert(
                conn,
                &CodeRecord::Anatomy(AnatomySiteRecord {
                    id: id.clone(),
                    mapped_label: label.clone(),
                }),
            )?;
            println!("Mapped anatomy code {} to {}", id.trim(), label.trim());
        }
        CodesAction::Adopt { codes } => {
            let outcome = db::adopt_cancer_codes(conn, &codes)?;
            println!(
                "Added {} diagnosis codes as primary cancers ({} already known).",
                outcome.added.len(),
                outcome.already_known.len()
            );
            for code in &outcome.added {
                println!("  {}", code);
            }
        }
    }
    Ok(())
}
