use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

// patient id, report id (discarded), site-procedure-diagnosis
static REPORT_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9]+)\s+S[0-9]{4}D-[0-9]{5}\s+([0-9]+)-([A-Z])-([A-Z0-9]+)\s*$").unwrap()
});

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// One diagnosis line of a pathology report export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTriple {
    pub patient_id: String,
    pub site_code: String,
    pub procedure: String,
    pub diagnosis_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    Triple(RawTriple),
    /// Blank line or disclaimer footer.
    Ignored,
    NoMatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmatchedLine {
    pub line_no: usize,
    pub text: String,
}

#[derive(Debug, Default)]
pub struct ParsedReport {
    pub triples: Vec<RawTriple>,
    pub unmatched: Vec<UnmatchedLine>,
    pub ignored: usize,
}

pub fn extract_line(line: &str, disclaimer_marker: &str) -> LineOutcome {
    if line.trim().is_empty() || (!disclaimer_marker.is_empty() && line.contains(disclaimer_marker)) {
        return LineOutcome::Ignored;
    }
    match REPORT_LINE_RE.captures(line) {
        Some(caps) => LineOutcome::Triple(RawTriple {
            patient_id: caps[1].to_string(),
            site_code: caps[2].to_string(),
            procedure: caps[3].to_string(),
            diagnosis_code: caps[4].to_string(),
        }),
        None => LineOutcome::NoMatch,
    }
}

/// Decode a report file. Bytes that are not UTF-8 (e.g. a Big5 footer) become U+FFFD
/// so the surrounding ASCII report lines still parse.
pub fn decode_report(bytes: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes))
}

/// Extract every diagnosis line of a report file. Lines end in LF or CRLF.
pub fn parse_report(text: &str, disclaimer_marker: &str) -> ParsedReport {
    let text = text.strip_prefix('\u{FEFF}').unwrap_or(text);
    let mut report = ParsedReport::default();

    for (i, line) in text.lines().enumerate() {
        match extract_line(line, disclaimer_marker) {
            LineOutcome::Triple(t) => {
                debug!(
                    patient = %t.patient_id,
                    site = %t.site_code,
                    procedure = %t.procedure,
                    diagnosis = %t.diagnosis_code,
                    "Report line"
                );
                report.triples.push(t);
            }
            LineOutcome::Ignored => report.ignored += 1,
            LineOutcome::NoMatch => {
                report.unmatched.push(UnmatchedLine {
                    line_no: i + 1,
                    text: line.to_string(),
                });
            }
        }
    }

    report
}
