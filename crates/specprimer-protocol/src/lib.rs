//! Record layouts shared between the alignment driver, the classifier and the
//! report writers.
//!
//! Everything here is a plain serde contract: the 25-column tabular schema the
//! alignment tool is asked to emit, the classification mode tag, and the row
//! types written to the summary tables.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Output column specifiers, in the order they are requested from `blastn`
/// and therefore the order they appear in every result file.
pub const BLAST_COLUMNS: [(&str, &str); 25] = [
    ("qseqid", "Query Seq-id"),
    ("sseqid", "Subject Seq-id"),
    ("sgi", "Subject GI"),
    ("sacc", "Subject accession"),
    ("stitle", "Subject Title"),
    ("pident", "Percentage of identical matches"),
    ("length", "Alignment length"),
    ("mismatch", "Number of mismatches"),
    ("gapopen", "Number of gap openings"),
    ("qstart", "Start of alignment in query"),
    ("qend", "End of alignment in query"),
    ("sstart", "Start of alignment in subject"),
    ("send", "End of alignment in subject"),
    ("evalue", "Expect value"),
    ("bitscore", "Bit score"),
    ("score", "Raw score"),
    ("qlen", "Query sequence length"),
    ("slen", "Subject sequence length"),
    ("nident", "Number of identical matches"),
    ("positive", "Number of positive-scoring matches"),
    ("gaps", "Total number of gaps"),
    ("ppos", "Percentage of positive-scoring matches"),
    ("qcovs", "Query Coverage Per Subject"),
    ("qcovhsp", "Query Coverage Per HSP"),
    ("staxids", "Subject Taxonomy ID(s)"),
];

/// Value for `blastn -outfmt`.
pub fn blast_outfmt() -> String {
    let mut parts = vec!["6"];
    parts.extend(BLAST_COLUMNS.iter().map(|(spec, _)| *spec));
    parts.join(" ")
}

/// One row of tabular alignment output. Field order mirrors [`BLAST_COLUMNS`]
/// so header-less files deserialize positionally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentHit {
    pub query_id: String,
    pub subject_seq_id: String,
    pub subject_gi: String,
    pub subject_accession: String,
    pub subject_title: String,
    pub percent_identity: f64,
    pub alignment_length: u64,
    pub mismatches: u64,
    pub gap_openings: u64,
    pub query_start: u64,
    pub query_end: u64,
    pub subject_start: u64,
    pub subject_end: u64,
    pub evalue: f64,
    pub bit_score: f64,
    pub raw_score: f64,
    pub query_length: u64,
    pub subject_length: u64,
    pub identical: u64,
    pub positives: u64,
    pub gaps: u64,
    pub percent_positives: f64,
    pub query_coverage: f64,
    pub query_coverage_hsp: f64,
    pub subject_taxids: String,
}

/// Which classification policy a pass applies. The three variants share the
/// input schema and nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationMode {
    QualityControl,
    Conserved,
    Primer,
}

impl ClassificationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QualityControl => "quality_control",
            Self::Conserved => "conserved",
            Self::Primer => "primer",
        }
    }
}

impl fmt::Display for ClassificationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ClassificationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "quality_control" | "qc" => Ok(Self::QualityControl),
            "conserved" => Ok(Self::Conserved),
            "primer" => Ok(Self::Primer),
            other => Err(format!(
                "Unknown classification mode '{other}', expected quality_control, conserved or primer"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcRow {
    #[serde(rename = "Query Seq-id")]
    pub query_id: String,
    #[serde(rename = "Subject GI")]
    pub subject_gi: String,
    #[serde(rename = "Subject accession")]
    pub subject_accession: String,
    #[serde(rename = "Species")]
    pub species: String,
    #[serde(rename = "Target species")]
    pub target_species: String,
    #[serde(rename = "QC status")]
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfftargetRow {
    #[serde(rename = "Query Seq-id")]
    pub query_id: String,
    #[serde(rename = "Species")]
    pub species: String,
    #[serde(rename = "Subject GI")]
    pub subject_gi: String,
    #[serde(rename = "Subject accession")]
    pub subject_accession: String,
    #[serde(rename = "Percentage of identical matches")]
    pub percent_identity: f64,
    #[serde(rename = "Expect value")]
    pub evalue: f64,
    #[serde(rename = "Bit score")]
    pub bit_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimerHitRow {
    #[serde(rename = "Query Seq-id")]
    pub query_id: String,
    #[serde(rename = "Species")]
    pub species: String,
    #[serde(rename = "Subject GI")]
    pub subject_gi: String,
    #[serde(rename = "Subject accession")]
    pub subject_accession: String,
    #[serde(rename = "Start of alignment in subject")]
    pub subject_start: u64,
    #[serde(rename = "End of alignment in subject")]
    pub subject_end: u64,
    #[serde(rename = "Subject sequence length")]
    pub subject_length: u64,
}

/// A sub-range of a query, 1-based inclusive, that is still usable as a
/// primer template next to an unresolved off-target alignment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartialRange {
    pub seq_id: String,
    pub start: u64,
    pub stop: u64,
}

/// A window on a reference sequence, 1-based inclusive, `start <= stop`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CoordinateWindow {
    pub accession: String,
    pub start: u64,
    pub stop: u64,
}

impl CoordinateWindow {
    pub fn new(accession: impl Into<String>, a: u64, b: u64) -> Self {
        Self {
            accession: accession.into(),
            start: a.min(b),
            stop: a.max(b),
        }
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.stop - self.start + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outfmt_lists_all_columns_in_order() {
        let fmt = blast_outfmt();
        assert!(fmt.starts_with("6 qseqid sseqid sgi sacc stitle"));
        assert!(fmt.ends_with("qcovhsp staxids"));
        assert_eq!(fmt.split(' ').count(), 26);
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(
            "quality-control".parse::<ClassificationMode>().unwrap(),
            ClassificationMode::QualityControl
        );
        assert_eq!(
            " Primer ".parse::<ClassificationMode>().unwrap(),
            ClassificationMode::Primer
        );
        assert!("megablast".parse::<ClassificationMode>().is_err());
        let json = serde_json::to_string(&ClassificationMode::Conserved).unwrap();
        assert_eq!(json, "\"conserved\"");
    }

    #[test]
    fn test_window_is_normalized() {
        let w = CoordinateWindow::new("NC_1", 400, 100);
        assert_eq!((w.start, w.stop), (100, 400));
        assert_eq!(w.len(), 301);
    }
}
