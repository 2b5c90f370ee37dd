//! Splits a sequence set into balanced work units before alignment.
//!
//! Sequences are dealt out longest first, round-robin, so each partition ends
//! up with a similar residue total and therefore a similar alignment runtime.

use crate::error::{PipelineError, Result};
use bio::io::fasta;
use log::{debug, info};
use std::{
    cmp::Reverse,
    fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, PartialEq)]
pub struct Partition<T> {
    pub index: usize,
    pub items: Vec<T>,
}

/// Deal `items` into `ceil(n / max_part_size)` partitions.
///
/// Items are stably sorted by `len` descending, then assigned round-robin to
/// the next partition index that still has room; full indices are skipped.
/// Empty partitions are not returned. A `max_part_size` of zero is treated
/// as one.
pub fn plan<T, F>(mut items: Vec<T>, max_part_size: usize, len: F) -> Vec<Partition<T>>
where
    F: Fn(&T) -> usize,
{
    let max_part_size = max_part_size.max(1);
    if items.is_empty() {
        return vec![];
    }
    let groups = items.len().div_ceil(max_part_size);
    items.sort_by_key(|item| Reverse(len(item)));

    let mut partitions: Vec<Partition<T>> = (0..groups)
        .map(|index| Partition {
            index,
            items: Vec::with_capacity(max_part_size),
        })
        .collect();
    let mut key = 0;
    for item in items {
        while partitions[key].items.len() >= max_part_size {
            key = (key + 1) % groups;
        }
        partitions[key].items.push(item);
        key = (key + 1) % groups;
    }
    partitions.retain(|p| !p.items.is_empty());
    partitions
}

pub fn partition_file_name(name: &str, index: usize) -> String {
    format!("{name}.part-{index}")
}

/// Partition files `<name>.part-<index>` in `dir`, ordered by index.
pub fn list_partition_files(dir: &Path, name: &str) -> Result<Vec<(usize, PathBuf)>> {
    let prefix = format!("{name}.part-");
    let entries = fs::read_dir(dir).map_err(|e| {
        PipelineError::io(format!("Could not list partitions in '{}'", dir.display()), e)
    })?;
    let mut files: Vec<(usize, PathBuf)> = entries
        .flatten()
        .filter_map(|entry| {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let index = file_name.strip_prefix(&prefix)?.parse::<usize>().ok()?;
            Some((index, entry.path()))
        })
        .collect();
    files.sort();
    Ok(files)
}

pub fn read_fasta_records(path: &Path) -> Result<Vec<fasta::Record>> {
    let reader = fasta::Reader::from_file(path).map_err(|e| {
        PipelineError::InvalidInput(format!("Could not open FASTA '{}': {e}", path.display()))
    })?;
    reader
        .records()
        .map(|record| {
            record.map_err(|e| {
                PipelineError::io(format!("Could not read FASTA '{}'", path.display()), e)
            })
        })
        .collect()
}

pub fn write_fasta_records(path: &Path, records: &[fasta::Record]) -> Result<()> {
    let mut writer = fasta::Writer::to_file(path).map_err(|e| {
        PipelineError::io(format!("Could not create FASTA '{}'", path.display()), e)
    })?;
    for record in records {
        writer.write_record(record).map_err(|e| {
            PipelineError::io(format!("Could not write FASTA '{}'", path.display()), e)
        })?;
    }
    writer
        .flush()
        .map_err(|e| PipelineError::io(format!("Could not flush FASTA '{}'", path.display()), e))
}

/// Plan partitions for `records` and write one FASTA per partition into
/// `dir`. Partition files left over from a previous, larger plan are removed.
pub fn write_partitions(
    dir: &Path,
    name: &str,
    records: Vec<fasta::Record>,
    max_part_size: usize,
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir).map_err(|e| {
        PipelineError::io(format!("Could not create '{}'", dir.display()), e)
    })?;
    let total = records.len();
    let partitions = plan(records, max_part_size, |r| r.seq().len());

    let mut written = Vec::with_capacity(partitions.len());
    for partition in &partitions {
        let path = dir.join(partition_file_name(name, partition.index));
        write_fasta_records(&path, &partition.items)?;
        debug!(
            "Partition {} holds {} sequences",
            partition.index,
            partition.items.len()
        );
        written.push(path);
    }
    for (index, path) in list_partition_files(dir, name)? {
        if !partitions.iter().any(|p| p.index == index) {
            fs::remove_file(&path).map_err(|e| {
                PipelineError::io(format!("Could not remove '{}'", path.display()), e)
            })?;
        }
    }
    info!(
        "Prepared {} BLAST input file(s) for {total} sequences",
        written.len()
    );
    Ok(written)
}
