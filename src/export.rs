use std::io;

use crate::db::{AnatomySiteRecord, CodeRecord, DiagnosisRecord, StoreError, TableKind};
use crate::engine::{Classification, SiteCount};

// ── Result export ──

/// Write counts as CSV: one header row, then one row per site in the given order.
pub fn write_counts_csv<W: io::Write>(
    writer: W,
    header: (&str, &str),
    counts: &[SiteCount],
) -> Result<(), csv::Error> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record([header.0, header.1])?;
    for c in counts {
        let count = c.count.to_string();
        wtr.write_record([c.label.as_str(), count.as_str()])?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn render_counts(counts: &[SiteCount]) -> String {
    if counts.is_empty() {
        return "No cancer diagnoses matched the code tables.".to_string();
    }
    let width = counts
        .iter()
        .map(|c| c.label.chars().count())
        .max()
        .unwrap_or(0)
        .max("Site".len());

    let mut out = format!("{:<width$} | {:>5}\n", "Site", "Cases", width = width);
    out.push_str(&"-".repeat(width + 8));
    for c in counts {
        out.push_str(&format!("\n{:<width$} | {:>5}", c.label, c.count, width = width));
    }
    let total: usize = counts.iter().map(|c| c.count).sum();
    out.push_str(&format!("\n{}\n{:<width$} | {:>5}", "-".repeat(width + 8), "Total", total, width = width));
    out
}

pub fn render_unrecognized(result: &Classification) -> Option<String> {
    if !result.has_unrecognized() {
        return None;
    }
    let mut out = String::new();
    if !result.unrecognized_diagnosis_codes.is_empty() {
        out.push_str("Unrecognized diagnosis codes (add with `codes adopt` or `codes set-diagnosis`):\n");
        for code in &result.unrecognized_diagnosis_codes {
            out.push_str(&format!("  {}\n", code));
        }
    }
    if !result.unrecognized_anatomy_codes.is_empty() {
        out.push_str("Unmapped anatomy codes (counted under the raw code; map with `codes set-anatomy`):\n");
        for code in &result.unrecognized_anatomy_codes {
            out.push_str(&format!("  {}\n", code));
        }
    }
    Some(out.trim_end().to_string())
}

// ── Code tables ──

pub fn render_records(records: &[CodeRecord]) -> String {
    let mut lines = Vec::with_capacity(records.len());
    for r in records {
        match r {
            CodeRecord::Diagnosis(d) => lines.push(format!(
                "{:<10} | {:<6} | {:<10} | {}",
                d.id,
                if d.is_cancer { "cancer" } else { "-" },
                if d.is_metastasis { "metastatic" } else { "-" },
                d.description
            )),
            CodeRecord::Anatomy(a) => lines.push(format!("{:<10} | {}", a.id, a.mapped_label)),
        }
    }
    lines.join("\n")
}

pub fn to_json(records: &[CodeRecord]) -> serde_json::Result<String> {
    serde_json::to_string_pretty(records)
}

/// Parse an exported table. `id` is accepted in place of `snomedCode`.
pub fn parse_json(kind: TableKind, text: &str) -> Result<Vec<CodeRecord>, StoreError> {
    let json_err = |source| StoreError::Json { table: kind, source };
    let records: Vec<CodeRecord> = match kind {
        TableKind::Diagnosis => serde_json::from_str::<Vec<DiagnosisRecord>>(text)
            .map_err(json_err)?
            .into_iter()
            .map(CodeRecord::Diagnosis)
            .collect(),
        TableKind::Anatomy => serde_json::from_str::<Vec<AnatomySiteRecord>>(text)
            .map_err(json_err)?
            .into_iter()
            .map(CodeRecord::Anatomy)
            .collect(),
    };
    Ok(records)
}
