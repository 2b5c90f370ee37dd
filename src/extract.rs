//! Sequence extraction for the non-target screening database.

use crate::{
    cache::{InProgressFile, is_nonempty_file},
    error::{PipelineError, Result},
    intervals::{ExtractionBatch, FetchRequest},
    tools::{BLASTDBCMD_ENV_BIN, blastdbcmd_executable, check_status, run_tool},
};
use bio::io::fasta;
use log::{debug, info};
use rayon::prelude::*;
use serde::Serialize;
use std::{
    collections::HashMap,
    fs::{self, File},
    io::{BufRead, BufReader, BufWriter},
    path::{Path, PathBuf},
    sync::Mutex,
};

/// One fetched region: the header description and the bases of
/// `start..=stop` in the request's coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedSequence {
    pub description: Option<String>,
    pub seq: Vec<u8>,
}

/// Anything that can hand out a 1-based inclusive slice of a reference
/// sequence by accession.
pub trait SequenceSource: Sync {
    fn fetch(&self, accession: &str, start: u64, stop: u64) -> Result<FetchedSequence>;
}

/// `blastdbcmd -db <db> -entry <accession> -range <start>-<stop>`.
#[derive(Debug, Clone)]
pub struct BlastDbCmd {
    database: String,
    executable: String,
}

impl BlastDbCmd {
    pub fn new(database: &str) -> Self {
        Self {
            database: database.to_string(),
            executable: blastdbcmd_executable(),
        }
    }
}

impl SequenceSource for BlastDbCmd {
    fn fetch(&self, accession: &str, start: u64, stop: u64) -> Result<FetchedSequence> {
        let args = vec![
            "-db".to_string(),
            self.database.clone(),
            "-entry".to_string(),
            accession.to_string(),
            "-range".to_string(),
            format!("{start}-{stop}"),
        ];
        let output = run_tool(&self.executable, &args, BLASTDBCMD_ENV_BIN)?;
        check_status(
            &self.executable,
            &output,
            "DB extraction",
            Path::new(accession),
        )?;
        let mut records = fasta::Reader::new(output.stdout.as_slice()).records();
        let record = records
            .next()
            .ok_or_else(|| PipelineError::BlastDb {
                path: self.database.clone(),
                reason: format!("blastdbcmd returned no sequence for '{accession}'"),
            })?
            .map_err(|e| {
                PipelineError::io(
                    format!("Could not parse blastdbcmd output for '{accession}'"),
                    e,
                )
            })?;
        Ok(FetchedSequence {
            description: record.desc().map(str::to_string),
            seq: record.seq().to_vec(),
        })
    }
}

/// One samtools `.fai` row.
#[derive(Debug, Serialize)]
struct FaiRow {
    name: String,
    len: u64,
    offset: u64,
    line_bases: u64,
    line_bytes: u64,
}

/// A local FASTA file read through a samtools-style `.fai` index. The index
/// is (re)built when missing or older than the FASTA. Accessions are matched
/// against record ids with or without their version suffix.
#[derive(Debug)]
pub struct IndexedFasta {
    fasta_path: PathBuf,
    lengths: HashMap<String, u64>,
    unversioned: HashMap<String, String>,
    reader: Mutex<fasta::IndexedReader<File>>,
}

impl IndexedFasta {
    pub fn open(fasta_path: &Path) -> Result<Self> {
        let index_path = index_path_for(fasta_path);
        if !index_is_current(fasta_path, &index_path) {
            info!("Indexing {}", fasta_path.display());
            write_fai(fasta_path, &index_path)?;
        }
        let index = fasta::Index::from_file(&index_path).map_err(|e| {
            PipelineError::InvalidInput(format!(
                "Could not load FASTA index '{}': {e}",
                index_path.display()
            ))
        })?;
        let lengths: HashMap<String, u64> = index
            .sequences()
            .into_iter()
            .map(|s| (s.name, s.len))
            .collect();
        let unversioned = lengths
            .keys()
            .filter_map(|name| {
                name.split_once('.')
                    .map(|(acc, _)| (acc.to_string(), name.clone()))
            })
            .collect();
        let file = File::open(fasta_path).map_err(|e| {
            PipelineError::io(format!("Could not open FASTA '{}'", fasta_path.display()), e)
        })?;
        Ok(Self {
            fasta_path: fasta_path.to_path_buf(),
            lengths,
            unversioned,
            reader: Mutex::new(fasta::IndexedReader::with_index(file, index)),
        })
    }

    fn resolve(&self, accession: &str) -> Option<(&str, u64)> {
        self.lengths
            .get_key_value(accession)
            .or_else(|| {
                self.unversioned
                    .get(accession)
                    .and_then(|name| self.lengths.get_key_value(name))
            })
            .map(|(name, len)| (name.as_str(), *len))
    }
}

impl SequenceSource for IndexedFasta {
    fn fetch(&self, accession: &str, start: u64, stop: u64) -> Result<FetchedSequence> {
        let (name, length) = self.resolve(accession).ok_or_else(|| {
            PipelineError::InvalidInput(format!(
                "'{accession}' is not in '{}'",
                self.fasta_path.display()
            ))
        })?;
        let start = start.max(1);
        let stop = stop.min(length);
        if start > stop {
            return Err(PipelineError::InvalidInput(format!(
                "Range {start}-{stop} is outside '{accession}' (length {length})"
            )));
        }
        let read_err = |e| {
            PipelineError::io(
                format!("Could not read '{name}' from '{}'", self.fasta_path.display()),
                e,
            )
        };
        let mut reader = self.reader.lock().map_err(|_| {
            PipelineError::InvalidInput(format!(
                "Reader for '{}' was poisoned by a failed fetch",
                self.fasta_path.display()
            ))
        })?;
        let mut seq = Vec::with_capacity((stop - start + 1) as usize);
        reader.fetch(name, start - 1, stop).map_err(read_err)?;
        reader.read(&mut seq).map_err(read_err)?;
        Ok(FetchedSequence {
            description: None,
            seq,
        })
    }
}

fn index_path_for(fasta_path: &Path) -> PathBuf {
    let mut name = fasta_path.as_os_str().to_os_string();
    name.push(".fai");
    PathBuf::from(name)
}

fn index_is_current(fasta_path: &Path, index_path: &Path) -> bool {
    let modified = |p: &Path| fs::metadata(p).and_then(|m| m.modified()).ok();
    if !is_nonempty_file(index_path) {
        return false;
    }
    match (modified(fasta_path), modified(index_path)) {
        (Some(fasta), Some(index)) => index >= fasta,
        _ => false,
    }
}

fn malformed(path: &Path, reason: impl Into<String>) -> PipelineError {
    PipelineError::InvalidInput(format!("FASTA '{}' {}", path.display(), reason.into()))
}

/// Scan a FASTA file into `.fai` rows. All sequence lines of a record share
/// one width except the last; a blank or short line ends the record's data.
fn scan_fai_rows(fasta_path: &Path) -> Result<Vec<FaiRow>> {
    let io_err =
        |e| PipelineError::io(format!("Could not read FASTA '{}'", fasta_path.display()), e);
    let mut reader = BufReader::new(File::open(fasta_path).map_err(io_err)?);
    let mut rows: Vec<FaiRow> = Vec::new();
    let mut line = Vec::new();
    let mut pos = 0u64;
    let mut ended = false;
    loop {
        line.clear();
        let bytes = reader.read_until(b'\n', &mut line).map_err(io_err)? as u64;
        if bytes == 0 {
            break;
        }
        let content = line.trim_ascii_end();
        if let Some(header) = content.strip_prefix(b">") {
            let name = String::from_utf8_lossy(header)
                .split_whitespace()
                .next()
                .map(str::to_string)
                .ok_or_else(|| malformed(fasta_path, "has a header without an id"))?;
            rows.push(FaiRow {
                name,
                len: 0,
                offset: 0,
                line_bases: 0,
                line_bytes: 0,
            });
            ended = false;
        } else if content.is_empty() {
            ended = !rows.is_empty();
        } else {
            let bases = content.len() as u64;
            let Some(row) = rows.last_mut() else {
                return Err(malformed(fasta_path, "has sequence data before the first header"));
            };
            if ended {
                return Err(malformed(
                    fasta_path,
                    format!("record '{}' continues after a blank or short line", row.name),
                ));
            }
            if row.line_bases == 0 {
                row.offset = pos;
                row.line_bases = bases;
                row.line_bytes = bytes;
            } else if bases > row.line_bases {
                return Err(malformed(
                    fasta_path,
                    format!("record '{}' has inconsistent line lengths", row.name),
                ));
            }
            ended = bases < row.line_bases || bytes != row.line_bytes;
            row.len += bases;
        }
        pos += bytes;
    }
    if let Some(empty) = rows.iter().find(|r| r.len == 0) {
        return Err(malformed(fasta_path, format!("has empty record '{}'", empty.name)));
    }
    if rows.is_empty() {
        return Err(malformed(fasta_path, "does not contain any records"));
    }
    Ok(rows)
}

fn write_fai(fasta_path: &Path, index_path: &Path) -> Result<()> {
    let rows = scan_fai_rows(fasta_path)?;
    let guard = InProgressFile::begin(index_path)?;
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_path(guard.path())?;
    for row in &rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    drop(writer);
    guard.commit()?;
    debug!("Indexed {} records in {}", rows.len(), fasta_path.display());
    Ok(())
}

/// Slice every window of `request` out of the single fetched sequence.
fn window_records(request: &FetchRequest, fetched: &FetchedSequence) -> Vec<fasta::Record> {
    let len = fetched.seq.len() as u64;
    request
        .offsets
        .iter()
        .zip(request.window_ids())
        .filter_map(|((from, to), id)| {
            if *from >= len {
                return None;
            }
            let to = (*to).min(len - 1);
            Some(fasta::Record::with_attrs(
                &id,
                fetched.description.as_deref(),
                &fetched.seq[*from as usize..=to as usize],
            ))
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractionSummary {
    pub written: usize,
    pub skipped: usize,
    pub sequences: usize,
}

/// Write one `BLASTnontarget<n>.sequences` file per batch into `dir`.
/// Batches whose file already exists are skipped; fetches inside a batch run
/// in parallel.
pub fn extract_batches<S: SequenceSource + ?Sized>(
    batches: &[ExtractionBatch],
    dir: &Path,
    source: &S,
) -> Result<ExtractionSummary> {
    fs::create_dir_all(dir)
        .map_err(|e| PipelineError::io(format!("Could not create '{}'", dir.display()), e))?;
    let mut summary = ExtractionSummary::default();
    for batch in batches {
        let final_path = dir.join(batch.file_name());
        if is_nonempty_file(&final_path) {
            info!("Skip writing {}", batch.file_name());
            summary.skipped += 1;
            continue;
        }
        info!(
            "Start writing {} ({} windows, {} fetches)",
            batch.file_name(),
            batch.window_count(),
            batch.requests.len()
        );
        let guard = InProgressFile::begin(&final_path)?;
        let fetched: Vec<FetchedSequence> = batch
            .requests
            .par_iter()
            .map(|r| source.fetch(&r.accession, r.start, r.stop))
            .collect::<Result<Vec<_>>>()?;

        let file = File::create(guard.path()).map_err(|e| {
            PipelineError::io(format!("Could not create '{}'", guard.path().display()), e)
        })?;
        let mut writer = fasta::Writer::new(BufWriter::new(file));
        for (request, sequence) in batch.requests.iter().zip(&fetched) {
            for record in window_records(request, sequence) {
                writer.write_record(&record)?;
                summary.sequences += 1;
            }
        }
        writer.flush()?;
        drop(writer);
        guard.commit()?;
        info!("Finished writing {}", batch.file_name());
        summary.written += 1;
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intervals::plan_batches;
    use specprimer_protocol::CoordinateWindow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn write_fasta(dir: &Path) -> PathBuf {
        let path = dir.join("nontarget.fa");
        fs::write(
            &path,
            ">NC_000001.2 Lactobacillus sakei chromosome\nACGTACGTAC\nGGGGCCCCTT\nAAA\n\
             >NC_000002.1 Lactobacillus graminis\nTTTTTTTT\n",
        )
        .unwrap();
        path
    }

    #[test]
    fn test_indexed_fasta_fetch_across_lines() {
        let td = tempdir().unwrap();
        let fasta = write_fasta(td.path());
        let source = IndexedFasta::open(&fasta).unwrap();
        assert!(index_path_for(&fasta).exists());
        let got = source.fetch("NC_000001", 9, 12).unwrap();
        assert_eq!(got.seq, b"ACGG");
        let got = source.fetch("NC_000001.2", 20, 99).unwrap();
        assert_eq!(got.seq, b"TAAA");
        assert!(source.fetch("NC_999", 1, 2).is_err());
    }

    #[test]
    fn test_index_rejects_inconsistent_lines() {
        let td = tempdir().unwrap();
        let fasta = td.path().join("bad.fa");
        fs::write(&fasta, ">a\nAC\nACGT\n").unwrap();
        assert!(IndexedFasta::open(&fasta).is_err());
        assert!(!index_path_for(&fasta).exists());
    }

    #[test]
    fn test_blank_line_inside_record_is_rejected() {
        let td = tempdir().unwrap();
        let fasta = td.path().join("gap.fa");
        fs::write(&fasta, ">NC_1\nACGT\nTTTT\n\nGACC\n").unwrap();
        let err = IndexedFasta::open(&fasta).unwrap_err().to_string();
        assert!(err.contains("'NC_1' continues after a blank"), "{err}");
        assert!(!index_path_for(&fasta).exists());
    }

    #[test]
    fn test_trailing_blank_lines_between_records() {
        let td = tempdir().unwrap();
        let fasta = td.path().join("spaced.fa");
        fs::write(&fasta, ">NC_1\nACGT\nTT\n\n>NC_2\nGGCC\n\n").unwrap();
        let source = IndexedFasta::open(&fasta).unwrap();
        assert_eq!(source.fetch("NC_1", 4, 6).unwrap().seq, b"TTT");
        assert_eq!(source.fetch("NC_2", 1, 4).unwrap().seq, b"GGCC");
    }

    #[test]
    fn test_stale_index_is_rebuilt() {
        let td = tempdir().unwrap();
        let fasta = td.path().join("genome.fa");
        fs::write(&fasta, ">NC_1\nAAAA\nCC\n").unwrap();
        assert_eq!(IndexedFasta::open(&fasta).unwrap().fetch("NC_1", 1, 6).unwrap().seq, b"AAAACC");

        let index = index_path_for(&fasta);
        File::options()
            .write(true)
            .open(&index)
            .unwrap()
            .set_modified(std::time::SystemTime::now() - std::time::Duration::from_secs(3600))
            .unwrap();
        fs::write(&fasta, ">NC_1\nGGGGGG\nTTTTTT\nA\n").unwrap();

        let source = IndexedFasta::open(&fasta).unwrap();
        assert_eq!(source.fetch("NC_1", 5, 13).unwrap().seq, b"GGTTTTTTA");
        assert!(fs::read_to_string(&index).unwrap().starts_with("NC_1\t13\t6\t6\t7"));
    }

    struct CountingSource<'a> {
        inner: &'a IndexedFasta,
        calls: AtomicUsize,
    }

    impl SequenceSource for CountingSource<'_> {
        fn fetch(&self, accession: &str, start: u64, stop: u64) -> Result<FetchedSequence> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.fetch(accession, start, stop)
        }
    }

    #[test]
    fn test_extract_batches_slices_one_fetch_per_accession() {
        let td = tempdir().unwrap();
        let fasta = write_fasta(td.path());
        let indexed = IndexedFasta::open(&fasta).unwrap();
        let source = CountingSource {
            inner: &indexed,
            calls: AtomicUsize::new(0),
        };
        let plan = vec![
            CoordinateWindow::new("NC_000001", 1, 4),
            CoordinateWindow::new("NC_000001", 11, 14),
            CoordinateWindow::new("NC_000002", 2, 3),
        ];
        let batches = plan_batches(&plan, 25_000);
        let out_dir = td.path().join("primer_QC");
        let summary = extract_batches(&batches, &out_dir, &source).unwrap();
        assert_eq!(summary.written, 1);
        assert_eq!(summary.sequences, 3);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        let text = fs::read_to_string(out_dir.join("BLASTnontarget0.sequences")).unwrap();
        assert_eq!(
            text,
            ">NC_000001_1_4\nACGT\n>NC_000001_11_14\nGGGG\n>NC_000002_2_3\nTT\n"
        );

        let again = extract_batches(&batches, &out_dir, &source).unwrap();
        assert_eq!(again.skipped, 1);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    struct FailingSource;

    impl SequenceSource for FailingSource {
        fn fetch(&self, accession: &str, _start: u64, _stop: u64) -> Result<FetchedSequence> {
            Err(PipelineError::InvalidInput(format!("no {accession}")))
        }
    }

    #[test]
    fn test_failed_batch_leaves_no_file() {
        let td = tempdir().unwrap();
        let batches = plan_batches(&[CoordinateWindow::new("NC_1", 1, 10)], 10);
        assert!(extract_batches(&batches, td.path(), &FailingSource).is_err());
        assert!(!td.path().join("BLASTnontarget0.sequences").exists());
        assert!(!td.path().join("BLASTnontarget0.sequences.part").exists());
    }
}
