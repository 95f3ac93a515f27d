use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use itertools::Itertools;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::engine::ReferenceTables;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum TableKind {
    Diagnosis,
    Anatomy,
}

impl TableKind {
    fn table(self) -> &'static str {
        match self {
            TableKind::Diagnosis => "diagnosis_codes",
            TableKind::Anatomy => "anatomy_codes",
        }
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableKind::Diagnosis => f.write_str("diagnosis"),
            TableKind::Anatomy => f.write_str("anatomy"),
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to open code store at {path:?}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to create code tables")]
    Schema(#[source] rusqlite::Error),

    #[error("failed to read {table} codes")]
    Read {
        table: TableKind,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to write {table} code {id:?}")]
    Write {
        table: TableKind,
        id: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to run {table} code transaction")]
    Transaction {
        table: TableKind,
        #[source]
        source: rusqlite::Error,
    },

    #[error("invalid {table} record: {reason}")]
    InvalidRecord { table: TableKind, reason: String },

    #[error("malformed {table} code JSON")]
    Json {
        table: TableKind,
        #[source]
        source: serde_json::Error,
    },
}

// ── Records ──

/// Classification of one diagnosis code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisRecord {
    #[serde(rename = "snomedCode", alias = "id")]
    pub id: String,
    pub description: String,
    pub is_cancer: bool,
    pub is_metastasis: bool,
}

/// Body-site bucket a site code is counted under. Many ids may share a label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnatomySiteRecord {
    #[serde(rename = "snomedCode", alias = "id")]
    pub id: String,
    #[serde(rename = "mappedName")]
    pub mapped_label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum CodeRecord {
    Diagnosis(DiagnosisRecord),
    Anatomy(AnatomySiteRecord),
}

impl CodeRecord {
    pub fn kind(&self) -> TableKind {
        match self {
            CodeRecord::Diagnosis(_) => TableKind::Diagnosis,
            CodeRecord::Anatomy(_) => TableKind::Anatomy,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            CodeRecord::Diagnosis(d) => &d.id,
            CodeRecord::Anatomy(a) => &a.id,
        }
    }

    /// Trim ids and text fields, rejecting records the tables cannot key or display.
    fn normalized(&self) -> Result<CodeRecord, StoreError> {
        let invalid = |reason: &str| StoreError::InvalidRecord {
            table: self.kind(),
            reason: reason.to_string(),
        };
        let id = self.id().trim();
        if id.is_empty() {
            return Err(invalid("code must not be empty"));
        }
        match self {
            CodeRecord::Diagnosis(d) => {
                let description = d.description.trim();
                if description.is_empty() {
                    return Err(invalid(&format!("description for {} must not be empty", id)));
                }
                Ok(CodeRecord::Diagnosis(DiagnosisRecord {
                    id: id.to_string(),
                    description: description.to_string(),
                    is_cancer: d.is_cancer,
                    is_metastasis: d.is_metastasis,
                }))
            }
            CodeRecord::Anatomy(a) => {
                let label = a.mapped_label.trim();
                if label.is_empty() {
                    return Err(invalid(&format!("mapped name for {} must not be empty", id)));
                }
                Ok(CodeRecord::Anatomy(AnatomySiteRecord {
                    id: id.to_string(),
                    mapped_label: label.to_string(),
                }))
            }
        }
    }
}

// ── Connection ──

pub fn connect(path: &Path) -> Result<Connection, StoreError> {
    let open_err = |source| StoreError::Open {
        path: path.to_path_buf(),
        source,
    };
    let conn = Connection::open(path).map_err(open_err)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;").map_err(open_err)?;
    conn.busy_timeout(BUSY_TIMEOUT).map_err(open_err)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS diagnosis_codes (
            snomed_code   TEXT PRIMARY KEY,
            description   TEXT NOT NULL,
            is_cancer     BOOLEAN NOT NULL,
            is_metastasis BOOLEAN NOT NULL,
            updated_at    TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS anatomy_codes (
            snomed_code TEXT PRIMARY KEY,
            mapped_name TEXT NOT NULL,
            updated_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_anatomy_mapped_name ON anatomy_codes(mapped_name);
        ",
    )
    .map_err(StoreError::Schema)
}

// ── Reads ──

pub fn diagnosis_codes(conn: &Connection) -> Result<Vec<DiagnosisRecord>, StoreError> {
    let read_err = |source| StoreError::Read {
        table: TableKind::Diagnosis,
        source,
    };
    let mut stmt = conn
        .prepare(
            "SELECT snomed_code, description, is_cancer, is_metastasis
             FROM diagnosis_codes ORDER BY snomed_code",
        )
        .map_err(read_err)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(DiagnosisRecord {
                id: row.get(0)?,
                description: row.get(1)?,
                is_cancer: row.get(2)?,
                is_metastasis: row.get(3)?,
            })
        })
        .map_err(read_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(read_err)?;
    Ok(rows)
}

pub fn anatomy_codes(conn: &Connection) -> Result<Vec<AnatomySiteRecord>, StoreError> {
    let read_err = |source| StoreError::Read {
        table: TableKind::Anatomy,
        source,
    };
    let mut stmt = conn
        .prepare("SELECT snomed_code, mapped_name FROM anatomy_codes ORDER BY snomed_code")
        .map_err(read_err)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(AnatomySiteRecord {
                id: row.get(0)?,
                mapped_label: row.get(1)?,
            })
        })
        .map_err(read_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(read_err)?;
    Ok(rows)
}

pub fn get_all(conn: &Connection, kind: TableKind) -> Result<Vec<CodeRecord>, StoreError> {
    let records: Vec<CodeRecord> = match kind {
        TableKind::Diagnosis => diagnosis_codes(conn)?
            .into_iter()
            .map(CodeRecord::Diagnosis)
            .collect(),
        TableKind::Anatomy => anatomy_codes(conn)?
            .into_iter()
            .map(CodeRecord::Anatomy)
            .collect(),
    };
    Ok(records)
}

pub fn get_diagnosis(conn: &Connection, id: &str) -> Result<Option<DiagnosisRecord>, StoreError> {
    conn.query_row(
        "SELECT snomed_code, description, is_cancer, is_metastasis
         FROM diagnosis_codes WHERE snomed_code = ?1",
        params![id.trim()],
        |row| {
            Ok(DiagnosisRecord {
                id: row.get(0)?,
                description: row.get(1)?,
                is_cancer: row.get(2)?,
                is_metastasis: row.get(3)?,
            })
        },
    )
    .optional()
    .map_err(|source| StoreError::Read {
        table: TableKind::Diagnosis,
        source,
    })
}

/// Snapshot both tables for one classification run.
pub fn load_tables(conn: &Connection) -> Result<ReferenceTables, StoreError> {
    let diagnoses = diagnosis_codes(conn)?;
    let anatomy = anatomy_codes(conn)?;
    Ok(ReferenceTables::new(diagnoses, anatomy))
}

// ── Writes ──

fn write_record(conn: &Connection, record: &CodeRecord) -> Result<(), StoreError> {
    let result = match record {
        CodeRecord::Diagnosis(d) => conn.execute(
            "INSERT OR REPLACE INTO diagnosis_codes
             (snomed_code, description, is_cancer, is_metastasis, updated_at)
             VALUES (?1, ?2, ?3, ?4, datetime('now'))",
            params![d.id, d.description, d.is_cancer, d.is_metastasis],
        ),
        CodeRecord::Anatomy(a) => conn.execute(
            "INSERT OR REPLACE INTO anatomy_codes (snomed_code, mapped_name, updated_at)
             VALUES (?1, ?2, datetime('now'))",
            params![a.id, a.mapped_label],
        ),
    };
    result.map(|_| ()).map_err(|source| StoreError::Write {
        table: record.kind(),
        id: record.id().to_string(),
        source,
    })
}

/// Insert or fully replace the record with the same code.
pub fn upsert(conn: &Connection, record: &CodeRecord) -> Result<(), StoreError> {
    let record = record.normalized()?;
    write_record(conn, &record)
}

/// Remove a code. Returns false when the code was not in the table.
pub fn delete(conn: &Connection, kind: TableKind, id: &str) -> Result<bool, StoreError> {
    let id = id.trim();
    let sql = format!("DELETE FROM {} WHERE snomed_code = ?1", kind.table());
    let removed = conn
        .execute(&sql, params![id])
        .map_err(|source| StoreError::Write {
            table: kind,
            id: id.to_string(),
            source,
        })?;
    if removed > 0 {
        info!(table = %kind, code = id, "Deleted code");
    }
    Ok(removed > 0)
}

/// Upsert every record in one transaction; nothing is written if any record fails.
pub fn import(conn: &Connection, records: &[CodeRecord]) -> Result<usize, StoreError> {
    let normalized = records
        .iter()
        .map(CodeRecord::normalized)
        .collect::<Result<Vec<_>, _>>()?;
    let Some(kind) = normalized.first().map(CodeRecord::kind) else {
        return Ok(0);
    };

    let tx_err = |source| StoreError::Transaction { table: kind, source };
    let tx = conn.unchecked_transaction().map_err(tx_err)?;
    for record in &normalized {
        write_record(&tx, record)?;
    }
    tx.commit().map_err(tx_err)?;
    Ok(normalized.len())
}

/// Result of `adopt_cancer_codes`, each list in argument order without repeats.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdoptOutcome {
    pub added: Vec<String>,
    pub already_known: Vec<String>,
}

/// Add unknown diagnosis codes as non-metastatic cancer codes with a placeholder
/// description. Codes already in the table are left untouched.
pub fn adopt_cancer_codes(conn: &Connection, codes: &[String]) -> Result<AdoptOutcome, StoreError> {
    let codes: Vec<&str> = codes.iter().map(|c| c.trim()).unique().collect();
    if codes.iter().any(|c| c.is_empty()) {
        return Err(StoreError::InvalidRecord {
            table: TableKind::Diagnosis,
            reason: "code must not be empty".to_string(),
        });
    }

    let tx_err = |source| StoreError::Transaction {
        table: TableKind::Diagnosis,
        source,
    };
    let tx = conn.unchecked_transaction().map_err(tx_err)?;
    let mut outcome = AdoptOutcome::default();
    {
        let mut stmt = tx
            .prepare(
                "INSERT OR IGNORE INTO diagnosis_codes
                 (snomed_code, description, is_cancer, is_metastasis)
                 VALUES (?1, ?2, 1, 0)",
            )
            .map_err(tx_err)?;
        for code in codes {
            let description = format!("New cancer diagnosis code: {}", code);
            let inserted = stmt
                .execute(params![code, description])
                .map_err(|source| StoreError::Write {
                    table: TableKind::Diagnosis,
                    id: code.to_string(),
                    source,
                })?;
            if inserted > 0 {
                outcome.added.push(code.to_string());
            } else {
                outcome.already_known.push(code.to_string());
            }
        }
    }
    tx.commit().map_err(tx_err)?;
    Ok(outcome)
}

// ── Stats ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableCounts {
    pub diagnosis: usize,
    pub anatomy: usize,
}

pub fn counts(conn: &Connection) -> Result<TableCounts, StoreError> {
    let count = |kind: TableKind| -> Result<usize, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", kind.table());
        conn.query_row(&sql, [], |r| r.get(0))
            .map_err(|source| StoreError::Read { table: kind, source })
    };
    Ok(TableCounts {
        diagnosis: count(TableKind::Diagnosis)?,
        anatomy: count(TableKind::Anatomy)?,
    })
}

#[cfg(test)]
pub(crate) fn memory_store() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    init_schema(&conn).unwrap();
    conn
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::OpenFlags;

    fn dx(id: &str, description: &str, is_cancer: bool, is_metastasis: bool) -> CodeRecord {
        CodeRecord::Diagnosis(DiagnosisRecord {
            id: id.to_string(),
            description: description.to_string(),
            is_cancer,
            is_metastasis,
        })
    }

    fn site(id: &str, label: &str) -> CodeRecord {
        CodeRecord::Anatomy(AnatomySiteRecord {
            id: id.to_string(),
            mapped_label: label.to_string(),
        })
    }

    #[test]
    fn schema_is_idempotent() {
        let conn = memory_store();
        init_schema(&conn).unwrap();
        assert_eq!(counts(&conn).unwrap(), TableCounts { diagnosis: 0, anatomy: 0 });
    }

    #[test]
    fn upsert_then_get_all() {
        let conn = memory_store();
        upsert(&conn, &dx("M81403", "Adenocarcinoma", true, false)).unwrap();
        upsert(&conn, &site("84000", "Lung")).unwrap();

        let dxs = get_all(&conn, TableKind::Diagnosis).unwrap();
        assert_eq!(dxs, vec![dx("M81403", "Adenocarcinoma", true, false)]);
        let sites = get_all(&conn, TableKind::Anatomy).unwrap();
        assert_eq!(sites, vec![site("84000", "Lung")]);
    }

    #[test]
    fn upsert_overwrites_whole_record() {
        let conn = memory_store();
        upsert(&conn, &dx("M81406", "Adenocarcinoma", true, false)).unwrap();
        upsert(&conn, &dx("M81406", "Adenocarcinoma, metastatic", true, true)).unwrap();

        let all = diagnosis_codes(&conn).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].description, "Adenocarcinoma, metastatic");
        assert!(all[0].is_metastasis);
    }

    #[test]
    fn upsert_trims_and_validates() {
        let conn = memory_store();
        upsert(&conn, &site(" 84000 ", " Lung ")).unwrap();
        assert_eq!(anatomy_codes(&conn).unwrap()[0].id, "84000");
        assert_eq!(anatomy_codes(&conn).unwrap()[0].mapped_label, "Lung");

        let err = upsert(&conn, &site("  ", "Lung")).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord { table: TableKind::Anatomy, .. }));
        let err = upsert(&conn, &dx("M80000", "", true, false)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord { table: TableKind::Diagnosis, .. }));
        assert_eq!(counts(&conn).unwrap().diagnosis, 0);
    }

    #[test]
    fn delete_reports_whether_code_existed() {
        let conn = memory_store();
        upsert(&conn, &site("84000", "Lung")).unwrap();
        assert!(delete(&conn, TableKind::Anatomy, "84000").unwrap());
        assert!(!delete(&conn, TableKind::Anatomy, "84000").unwrap());
        assert!(anatomy_codes(&conn).unwrap().is_empty());
    }

    #[test]
    fn delete_only_touches_its_table() {
        let conn = memory_store();
        upsert(&conn, &dx("84000", "Odd but legal", true, false)).unwrap();
        upsert(&conn, &site("84000", "Lung")).unwrap();
        assert!(delete(&conn, TableKind::Diagnosis, "84000").unwrap());
        assert_eq!(counts(&conn).unwrap(), TableCounts { diagnosis: 0, anatomy: 1 });
    }

    #[test]
    fn import_is_all_or_nothing() {
        let conn = memory_store();
        let records = vec![site("84000", "Lung"), site("", "Nowhere")];
        assert!(import(&conn, &records).is_err());
        assert_eq!(counts(&conn).unwrap().anatomy, 0);

        let records = vec![site("84000", "Lung"), site("04030", "Breast"), site("04020", "Breast")];
        assert_eq!(import(&conn, &records).unwrap(), 3);
        assert_eq!(counts(&conn).unwrap().anatomy, 3);
    }

    #[test]
    fn import_of_nothing_writes_nothing() {
        let conn = memory_store();
        assert_eq!(import(&conn, &[]).unwrap(), 0);
        assert_eq!(counts(&conn).unwrap(), TableCounts { diagnosis: 0, anatomy: 0 });
    }

    #[test]
    fn import_inside_open_transaction_fails_as_transaction_error() {
        let conn = memory_store();
        conn.execute_batch("BEGIN").unwrap();
        let err = import(&conn, &[site("84000", "Lung")]).unwrap_err();
        assert!(matches!(err, StoreError::Transaction { table: TableKind::Anatomy, .. }));
        assert_eq!(err.to_string(), "failed to run anatomy code transaction");
    }

    #[test]
    fn adopt_skips_known_codes() {
        let conn = memory_store();
        upsert(&conn, &dx("M09450", "Benign adenoma", false, false)).unwrap();
        let outcome = adopt_cancer_codes(
            &conn,
            &["M09450".to_string(), "M99993".to_string(), " M99993 ".to_string()],
        )
        .unwrap();
        assert_eq!(outcome.added, vec!["M99993".to_string()]);
        assert_eq!(outcome.already_known, vec!["M09450".to_string()]);

        let benign = get_diagnosis(&conn, "M09450").unwrap().unwrap();
        assert!(!benign.is_cancer);
        let adopted = get_diagnosis(&conn, "M99993").unwrap().unwrap();
        assert!(adopted.is_cancer);
        assert!(!adopted.is_metastasis);
        assert_eq!(adopted.description, "New cancer diagnosis code: M99993");
    }

    #[test]
    fn adopt_rejects_blank_code_before_writing() {
        let conn = memory_store();
        let err = adopt_cancer_codes(&conn, &["M99993".to_string(), "  ".to_string()]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord { table: TableKind::Diagnosis, .. }));
        assert_eq!(counts(&conn).unwrap().diagnosis, 0);
    }

    #[test]
    fn missing_table_is_a_read_error() {
        let conn = memory_store();
        conn.execute_batch("DROP TABLE anatomy_codes").unwrap();
        let err = get_all(&conn, TableKind::Anatomy).unwrap_err();
        assert!(matches!(err, StoreError::Read { table: TableKind::Anatomy, .. }));
        assert!(matches!(load_tables(&conn), Err(StoreError::Read { .. })));
    }

    #[test]
    fn read_only_store_is_a_write_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("codes.sqlite");
        init_schema(&Connection::open(&path).unwrap()).unwrap();
        let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY).unwrap();
        let err = upsert(&conn, &site("84000", "Lung")).unwrap_err();
        match err {
            StoreError::Write { table, id, .. } => {
                assert_eq!(table, TableKind::Anatomy);
                assert_eq!(id, "84000");
            }
            other => panic!("expected write error, got {:?}", other),
        }
        assert!(matches!(
            delete(&conn, TableKind::Diagnosis, "M81403"),
            Err(StoreError::Write { table: TableKind::Diagnosis, .. })
        ));
    }

    #[test]
    fn load_tables_snapshots_both_tables() {
        let conn = memory_store();
        upsert(&conn, &dx("M81403", "Adenocarcinoma", true, false)).unwrap();
        upsert(&conn, &site("84000", "Lung")).unwrap();
        let tables = load_tables(&conn).unwrap();
        assert!(tables.diagnosis("M81403").is_some());
        assert_eq!(tables.anatomy_label("84000"), Some("Lung"));
    }

    #[test]
    fn writes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("codes.sqlite");
        {
            let conn = connect(&path).unwrap();
            init_schema(&conn).unwrap();
            upsert(&conn, &site("84000", "Lung")).unwrap();
        }
        let conn = connect(&path).unwrap();
        init_schema(&conn).unwrap();
        assert_eq!(anatomy_codes(&conn).unwrap(), vec![AnatomySiteRecord {
            id: "84000".to_string(),
            mapped_label: "Lung".to_string(),
        }]);
    }
}
