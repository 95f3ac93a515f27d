use rusqlite::Connection;
use tracing::info;

use crate::db::{self, StoreError, TableKind};
use crate::export;

const DIAGNOSIS_SEED: &str = include_str!("../seed/diagnosis_codes.json");
const ANATOMY_SEED: &str = include_str!("../seed/anatomy_codes.json");

/// Rows inserted per table by `seed_if_empty`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub diagnosis: usize,
    pub anatomy: usize,
}

/// Load the default code lists into any table that is still empty.
pub fn seed_if_empty(conn: &Connection) -> Result<SeedReport, StoreError> {
    let existing = db::counts(conn)?;
    let mut report = SeedReport::default();

    if existing.diagnosis == 0 {
        let records = export::parse_json(TableKind::Diagnosis, DIAGNOSIS_SEED)?;
        report.diagnosis = db::import(conn, &records)?;
        info!(rows = report.diagnosis, "Seeded default diagnosis codes");
    }
    if existing.anatomy == 0 {
        let records = export::parse_json(TableKind::Anatomy, ANATOMY_SEED)?;
        report.anatomy = db::import(conn, &records)?;
        info!(rows = report.anatomy, "Seeded default anatomy codes");
    }

    Ok(report)
}
