use crate::{
    classify::Summary,
    error::{PipelineError, Result},
};
use csv::{ReaderBuilder, WriterBuilder};
use serde::Serialize;
use specprimer_protocol::{OfftargetRow, PartialRange};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
};

pub const OFFTARGET_SUMMARY_FILE: &str = "offtarget_summary.csv";
pub const MOST_COMMON_HITS_FILE: &str = "mostcommonhits.csv";
pub const PARTIAL_SEQS_FILE: &str = "partialseqs.csv";

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| {
                PipelineError::io(format!("Could not create '{}'", parent.display()), e)
            })?;
        }
    }
    Ok(())
}

fn write_rows<T: Serialize>(path: &Path, rows: &[T], header_fallback: &[&str]) -> Result<()> {
    ensure_parent(path)?;
    let mut writer = WriterBuilder::new().has_headers(true).from_path(path)?;
    if rows.is_empty() {
        writer.write_record(header_fallback)?;
    }
    for row in rows {
        writer.serialize(row)?;
    }
    writer
        .flush()
        .map_err(|e| PipelineError::io(format!("Could not flush '{}'", path.display()), e))
}

/// Write whichever summary table the mode produced, with a header line even
/// when there are no rows.
pub fn write_summary(path: &Path, summary: &Summary) -> Result<()> {
    match summary {
        Summary::QualityControl(rows) => write_rows(
            path,
            rows,
            &[
                "Query Seq-id",
                "Subject GI",
                "Subject accession",
                "Species",
                "Target species",
                "QC status",
            ],
        ),
        Summary::Conserved(rows) => write_rows(
            path,
            rows,
            &[
                "Query Seq-id",
                "Species",
                "Subject GI",
                "Subject accession",
                "Percentage of identical matches",
                "Expect value",
                "Bit score",
            ],
        ),
        Summary::Primer(rows) => write_rows(
            path,
            rows,
            &[
                "Query Seq-id",
                "Species",
                "Subject GI",
                "Subject accession",
                "Start of alignment in subject",
                "End of alignment in subject",
                "Subject sequence length",
            ],
        ),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpeciesHitCount {
    pub species: String,
    /// Distinct queries with at least one hit on the species.
    pub queries: usize,
    pub percent_of_queries: f64,
}

/// Off-target species ranked by how many queries they hit. Percentages are
/// rounded to one decimal with ties to even, so 6.25 becomes 6.2.
pub fn most_common_species(rows: &[OfftargetRow]) -> (usize, usize, Vec<SpeciesHitCount>) {
    let total = rows.len();
    let queries: BTreeSet<&str> = rows.iter().map(|r| r.query_id.as_str()).collect();
    let mut per_species: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for row in rows {
        per_species
            .entry(row.species.as_str())
            .or_default()
            .insert(row.query_id.as_str());
    }
    let n_queries = queries.len();
    let mut counts: Vec<SpeciesHitCount> = per_species
        .into_iter()
        .map(|(species, hit_queries)| {
            let count = hit_queries.len();
            let percent = if n_queries == 0 {
                0.0
            } else {
                (1000.0 * count as f64 / n_queries as f64).round_ties_even() / 10.0
            };
            SpeciesHitCount {
                species: species.to_string(),
                queries: count,
                percent_of_queries: percent,
            }
        })
        .collect();
    counts.sort_by(|a, b| b.queries.cmp(&a.queries).then(a.species.cmp(&b.species)));
    (total, n_queries, counts)
}

pub fn write_most_common_hits(path: &Path, rows: &[OfftargetRow]) -> Result<()> {
    ensure_parent(path)?;
    let (total, queries, counts) = most_common_species(rows);
    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;
    writer.write_record(["Total BLAST hits", "Number of queries"])?;
    writer.write_record([total.to_string(), queries.to_string()])?;
    writer.write_record(["Species", "BLAST hits [count]", "BLAST hits [% of queries]"])?;
    for c in counts {
        writer.write_record([
            c.species,
            c.queries.to_string(),
            format!("{:.1}", c.percent_of_queries),
        ])?;
    }
    writer
        .flush()
        .map_err(|e| PipelineError::io(format!("Could not flush '{}'", path.display()), e))
}

/// `id,start,stop` lines, no header.
pub fn write_partial_ranges(path: &Path, ranges: &[PartialRange]) -> Result<()> {
    ensure_parent(path)?;
    let mut writer = WriterBuilder::new().has_headers(false).from_path(path)?;
    for r in ranges {
        writer.serialize((&r.seq_id, r.start, r.stop))?;
    }
    writer
        .flush()
        .map_err(|e| PipelineError::io(format!("Could not flush '{}'", path.display()), e))
}

pub fn read_partial_ranges(path: &Path) -> Result<Vec<PartialRange>> {
    let mut rdr = ReaderBuilder::new().has_headers(false).from_path(path)?;
    let mut ranges = Vec::new();
    for record in rdr.deserialize::<(String, u64, u64)>() {
        let (seq_id, start, stop) = record?;
        ranges.push(PartialRange {
            seq_id,
            start,
            stop,
        });
    }
    Ok(ranges)
}
