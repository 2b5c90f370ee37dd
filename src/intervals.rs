//! Reduction of primer off-target hits to a compact extraction plan.
//!
//! Hits from the forward and the reverse primer of one pair that land on the
//! same subject are expanded by [`OVERHANG`] bases, collapsed per coordinate
//! bin and accession, and finally swept once more so windows that still
//! overlap across a bin boundary are merged.

use crate::error::{PipelineError, Result};
use csv::{ReaderBuilder, WriterBuilder};
use itertools::Itertools;
use log::info;
use specprimer_protocol::{CoordinateWindow, PrimerHitRow};
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    fs,
    path::Path,
};

pub const OVERHANG: u64 = 2000;
pub const EXTRACTION_PLAN_FILE: &str = "primerBLAST_DBIDS.csv";
pub const EXTRACTION_BATCH_SIZE: usize = 25_000;

const FORWARD_SUFFIX: &str = "_F";
const REVERSE_SUFFIX: &str = "_R";

/// `Lb_curva_g1_P0_F` → `Lb_curva_g1_P0`.
pub fn primer_pair_key(query_id: &str) -> &str {
    query_id
        .rsplit_once('_')
        .map(|(head, _)| head)
        .unwrap_or_default()
}

/// Keep hits whose subject was also hit by the other primer of the pair.
pub fn pair_primer_hits(rows: &[PrimerHitRow]) -> Vec<&PrimerHitRow> {
    let keys_with = |suffix: &str| -> HashSet<(&str, &str)> {
        rows.iter()
            .filter(|r| r.query_id.ends_with(suffix))
            .map(|r| (r.subject_accession.as_str(), primer_pair_key(&r.query_id)))
            .collect()
    };
    let forward = keys_with(FORWARD_SUFFIX);
    let reverse = keys_with(REVERSE_SUFFIX);
    rows.iter()
        .filter(|r| {
            let key = (r.subject_accession.as_str(), primer_pair_key(&r.query_id));
            (r.query_id.ends_with(FORWARD_SUFFIX) && reverse.contains(&key))
                || (r.query_id.ends_with(REVERSE_SUFFIX) && forward.contains(&key))
        })
        .collect()
}

/// Window of `overhang` bases on both sides of the hit's first base in
/// subject orientation, clamped to the subject.
pub fn expand_window(row: &PrimerHitRow, overhang: u64) -> CoordinateWindow {
    let centre = if row.subject_start > row.subject_end {
        row.subject_end
    } else {
        row.subject_start
    };
    let start = centre.saturating_sub(overhang).max(1);
    let stop = (centre + overhang).min(row.subject_length.max(1));
    CoordinateWindow::new(row.subject_accession.clone(), start, stop)
}

pub fn bin_width(max_product_size: u64) -> u64 {
    max_product_size + 2 * OVERHANG + 1
}

/// Collapse windows to `(min start, max stop)` per accession within each
/// coordinate bin. A window belongs to the bin holding its start; bins start
/// at 1.
pub fn bin_merge(windows: &[CoordinateWindow], width: u64) -> Vec<CoordinateWindow> {
    let width = width.max(1);
    let mut bins: BTreeMap<(u64, &str), (u64, u64)> = BTreeMap::new();
    for w in windows {
        let bin = w.start.saturating_sub(1) / width;
        bins.entry((bin, w.accession.as_str()))
            .and_modify(|(start, stop)| {
                *start = (*start).min(w.start);
                *stop = (*stop).max(w.stop);
            })
            .or_insert((w.start, w.stop));
    }
    let unique: BTreeSet<CoordinateWindow> = bins
        .into_iter()
        .map(|((_, accession), (start, stop))| CoordinateWindow::new(accession, start, stop))
        .collect();
    unique.into_iter().collect()
}

/// Merge overlapping windows per accession. Output is sorted by accession
/// and start.
pub fn sweep_merge(mut windows: Vec<CoordinateWindow>) -> Vec<CoordinateWindow> {
    windows.sort();
    let mut merged: Vec<CoordinateWindow> = Vec::with_capacity(windows.len());
    for w in windows {
        match merged.last_mut() {
            Some(last) if last.accession == w.accession && w.start <= last.stop => {
                last.stop = last.stop.max(w.stop);
            }
            _ => merged.push(w),
        }
    }
    merged
}

/// Paired hits → expanded windows → bin collapse → sweep merge.
pub fn reduce(rows: &[PrimerHitRow], max_product_size: u64) -> Result<Vec<CoordinateWindow>> {
    let paired = pair_primer_hits(rows);
    let windows: Vec<CoordinateWindow> = paired
        .into_iter()
        .map(|r| expand_window(r, OVERHANG))
        .collect();
    let plan = sweep_merge(bin_merge(&windows, bin_width(max_product_size)));
    if plan.is_empty() {
        return Err(PipelineError::NoCandidates {
            stage: "primer".to_string(),
            message: "Error did not find any sequences for non-target DB. \
                      Please check the species list and/or BLAST database"
                .to_string(),
        });
    }
    info!(
        "Extraction plan: {} windows from {} hits",
        plan.len(),
        windows.len()
    );
    Ok(plan)
}

/// `accession,start,stop` lines, no header.
pub fn write_plan(path: &Path, plan: &[CoordinateWindow]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            PipelineError::io(format!("Could not create '{}'", parent.display()), e)
        })?;
    }
    let mut writer = WriterBuilder::new().has_headers(false).from_path(path)?;
    for w in plan {
        writer.serialize(w)?;
    }
    writer
        .flush()
        .map_err(|e| PipelineError::io(format!("Could not flush '{}'", path.display()), e))
}

pub fn read_plan(path: &Path) -> Result<Vec<CoordinateWindow>> {
    let mut reader = ReaderBuilder::new().has_headers(false).from_path(path)?;
    let mut plan = Vec::new();
    for record in reader.deserialize::<(String, u64, u64)>() {
        let (accession, start, stop) = record?;
        plan.push(CoordinateWindow::new(accession, start, stop));
    }
    Ok(plan)
}

/// One fetch per accession covering every plan window on it.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub accession: String,
    pub start: u64,
    pub stop: u64,
    /// `(start, stop)` of each window, 0-based relative to `start`.
    pub offsets: Vec<(u64, u64)>,
}

impl FetchRequest {
    pub fn window_ids(&self) -> impl Iterator<Item = String> + '_ {
        self.offsets.iter().map(move |(from, to)| {
            format!("{}_{}_{}", self.accession, self.start + from, self.start + to)
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionBatch {
    pub index: usize,
    pub requests: Vec<FetchRequest>,
}

impl ExtractionBatch {
    pub fn file_name(&self) -> String {
        batch_file_name(self.index)
    }

    pub fn window_count(&self) -> usize {
        self.requests.iter().map(|r| r.offsets.len()).sum()
    }
}

pub fn batch_file_name(index: usize) -> String {
    format!("BLASTnontarget{index}.sequences")
}

/// Cut the plan, sorted by accession and start, into batches of at most
/// `batch_size` windows and group each batch per accession.
pub fn plan_batches(plan: &[CoordinateWindow], batch_size: usize) -> Vec<ExtractionBatch> {
    let sorted: Vec<&CoordinateWindow> = plan.iter().sorted().collect();
    sorted
        .chunks(batch_size.max(1))
        .enumerate()
        .map(|(index, chunk)| {
            let requests = chunk
                .iter()
                .chunk_by(|w| w.accession.clone())
                .into_iter()
                .map(|(accession, group)| {
                    let group: Vec<&&CoordinateWindow> = group.collect();
                    let start = group.iter().map(|w| w.start).min().unwrap_or(1);
                    let stop = group.iter().map(|w| w.stop).max().unwrap_or(start);
                    FetchRequest {
                        accession,
                        start,
                        stop,
                        offsets: group
                            .iter()
                            .map(|w| (w.start - start, w.stop - start))
                            .collect(),
                    }
                })
                .collect();
            ExtractionBatch { index, requests }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn primer_hit(query: &str, acc: &str, sstart: u64, send: u64, slen: u64) -> PrimerHitRow {
        PrimerHitRow {
            query_id: query.to_string(),
            species: "Lactobacillus sakei".to_string(),
            subject_gi: "0".to_string(),
            subject_accession: acc.to_string(),
            subject_start: sstart,
            subject_end: send,
            subject_length: slen,
        }
    }

    #[test]
    fn test_primer_pair_key() {
        assert_eq!(primer_pair_key("Lb_curva_g1_P0_F"), "Lb_curva_g1_P0");
        assert_eq!(primer_pair_key("P0_R"), "P0");
        assert_eq!(primer_pair_key("single"), "");
    }

    #[test]
    fn test_pairing_requires_both_primers_on_the_accession() {
        let rows = vec![
            primer_hit("g1_P0_F", "NC_1", 100, 120, 10_000),
            primer_hit("g1_P0_R", "NC_1", 300, 280, 10_000),
            primer_hit("g1_P0_F", "NC_2", 100, 120, 10_000),
            primer_hit("g1_P1_R", "NC_2", 300, 280, 10_000),
        ];
        let paired = pair_primer_hits(&rows);
        assert_eq!(paired.len(), 2);
        assert!(paired.iter().all(|r| r.subject_accession == "NC_1"));
    }

    #[test]
    fn test_expand_window_strand_and_clamp() {
        let fwd = primer_hit("p_F", "NC_1", 5000, 5020, 100_000);
        assert_eq!(expand_window(&fwd, OVERHANG), CoordinateWindow::new("NC_1", 3000, 7000));
        let rev = primer_hit("p_R", "NC_1", 5020, 5000, 100_000);
        assert_eq!(expand_window(&rev, OVERHANG), CoordinateWindow::new("NC_1", 3000, 7000));
        let edge = primer_hit("p_F", "NC_1", 100, 120, 1500);
        assert_eq!(expand_window(&edge, OVERHANG), CoordinateWindow::new("NC_1", 1, 1500));
    }

    #[test]
    fn test_overlapping_windows_in_one_bin_merge() {
        let windows = vec![
            CoordinateWindow::new("NC_1", 100, 300),
            CoordinateWindow::new("NC_1", 250, 400),
        ];
        let merged = sweep_merge(bin_merge(&windows, bin_width(200)));
        assert_eq!(merged, vec![CoordinateWindow::new("NC_1", 100, 400)]);
    }

    #[test]
    fn test_overlap_across_bin_boundary_is_merged() {
        let width = bin_width(200);
        let windows = vec![
            CoordinateWindow::new("NC_1", width - 10, width + 3000),
            CoordinateWindow::new("NC_1", width + 5, width + 4000),
            CoordinateWindow::new("NC_2", width - 10, width + 3000),
        ];
        let binned = bin_merge(&windows, width);
        assert_eq!(binned.len(), 3);
        let merged = sweep_merge(binned);
        assert_eq!(
            merged,
            vec![
                CoordinateWindow::new("NC_1", width - 10, width + 4000),
                CoordinateWindow::new("NC_2", width - 10, width + 3000),
            ]
        );
    }

    #[test]
    fn test_empty_plan_is_no_candidates() {
        let rows = vec![primer_hit("g1_P0_F", "NC_1", 100, 120, 10_000)];
        let err = reduce(&rows, 200).unwrap_err();
        assert!(matches!(err, PipelineError::NoCandidates { .. }));
    }

    #[test]
    fn test_plan_file_and_batches() {
        let td = tempdir().unwrap();
        let path = td.path().join(EXTRACTION_PLAN_FILE);
        let plan = vec![
            CoordinateWindow::new("NC_2", 10, 20),
            CoordinateWindow::new("NC_1", 5000, 9000),
            CoordinateWindow::new("NC_1", 1, 4000),
        ];
        write_plan(&path, &plan).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "NC_2,10,20\nNC_1,5000,9000\nNC_1,1,4000\n"
        );
        assert_eq!(read_plan(&path).unwrap(), plan);

        let batches = plan_batches(&plan, 2);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].file_name(), "BLASTnontarget0.sequences");
        assert_eq!(
            batches[0].requests,
            vec![FetchRequest {
                accession: "NC_1".to_string(),
                start: 1,
                stop: 9000,
                offsets: vec![(0, 3999), (4999, 8999)],
            }]
        );
        let ids: Vec<String> = batches[0].requests[0].window_ids().collect();
        assert_eq!(ids, vec!["NC_1_1_4000", "NC_1_5000_9000"]);
        assert_eq!(batches[1].window_count(), 1);
    }
}
