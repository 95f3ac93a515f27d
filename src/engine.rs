//! New-primary-cancer counting per body site.
//!
//! Each patient contributes at most one case per site label, and only
//! non-metastatic diagnoses open a case. Metastatic diagnoses are collected
//! for the run totals but never counted, even for a patient with no primary
//! on record.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use itertools::Itertools;

use crate::db::{AnatomySiteRecord, DiagnosisRecord};
use crate::parser::RawTriple;

/// In-memory snapshot of both code tables, keyed by code.
#[derive(Debug, Clone, Default)]
pub struct ReferenceTables {
    diagnoses: HashMap<String, DiagnosisRecord>,
    anatomy: HashMap<String, AnatomySiteRecord>,
}

impl ReferenceTables {
    pub fn new(diagnoses: Vec<DiagnosisRecord>, anatomy: Vec<AnatomySiteRecord>) -> Self {
        ReferenceTables {
            diagnoses: diagnoses.into_iter().map(|d| (d.id.clone(), d)).collect(),
            anatomy: anatomy.into_iter().map(|a| (a.id.clone(), a)).collect(),
        }
    }

    pub fn diagnosis(&self, code: &str) -> Option<&DiagnosisRecord> {
        self.diagnoses.get(code)
    }

    pub fn anatomy_label(&self, code: &str) -> Option<&str> {
        self.anatomy.get(code).map(|a| a.mapped_label.as_str())
    }
}

/// A (site label, metastasis) pair for one patient. Equal pairs collapse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct PatientDiagnosis {
    label: String,
    is_metastasis: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteCount {
    pub label: String,
    pub count: usize,
}

/// Bookkeeping for one run. Never affects `counts`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunTotals {
    pub triples: usize,
    pub non_cancer: usize,
    pub patients: usize,
    pub metastatic_pairs: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    /// Sorted by count descending, then label ascending.
    pub counts: Vec<SiteCount>,
    pub unrecognized_diagnosis_codes: BTreeSet<String>,
    pub unrecognized_anatomy_codes: BTreeSet<String>,
    pub totals: RunTotals,
}

impl Classification {
    pub fn has_unrecognized(&self) -> bool {
        !self.unrecognized_diagnosis_codes.is_empty() || !self.unrecognized_anatomy_codes.is_empty()
    }
}

pub fn classify(triples: &[RawTriple], tables: &ReferenceTables) -> Classification {
    let mut result = Classification::default();
    result.totals.triples = triples.len();

    let mut per_patient: BTreeMap<&str, BTreeSet<PatientDiagnosis>> = BTreeMap::new();

    for t in triples {
        let Some(diagnosis) = tables.diagnosis(&t.diagnosis_code) else {
            result
                .unrecognized_diagnosis_codes
                .insert(t.diagnosis_code.clone());
            continue;
        };
        if !diagnosis.is_cancer {
            result.totals.non_cancer += 1;
            continue;
        }

        let label = match tables.anatomy_label(&t.site_code) {
            Some(label) => label.to_string(),
            None => {
                result.unrecognized_anatomy_codes.insert(t.site_code.clone());
                t.site_code.clone()
            }
        };

        per_patient
            .entry(t.patient_id.as_str())
            .or_default()
            .insert(PatientDiagnosis {
                label,
                is_metastasis: diagnosis.is_metastasis,
            });
    }

    result.totals.patients = per_patient.len();

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for diagnoses in per_patient.values() {
        let (primaries, metastases): (Vec<_>, Vec<_>) =
            diagnoses.iter().partition(|d| !d.is_metastasis);

        let mut counted: HashSet<&str> = HashSet::new();
        for d in primaries {
            if counted.insert(d.label.as_str()) {
                *counts.entry(d.label.as_str()).or_default() += 1;
            }
        }
        result.totals.metastatic_pairs += metastases.len();
    }

    result.counts = counts
        .into_iter()
        .map(|(label, count)| SiteCount {
            label: label.to_string(),
            count,
        })
        .sorted_by(|a, b| b.count.cmp(&a.count).then_with(|| a.label.cmp(&b.label)))
        .collect();

    result
}
