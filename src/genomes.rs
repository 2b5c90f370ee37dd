use crate::{
    cache::InProgressFile,
    error::{PipelineError, Result, RunErrors},
};
use flate2::read::GzDecoder;
use log::{info, warn};
use reqwest::blocking::get;
use std::{
    fs::{self, File},
    io::{BufWriter, Read, Write},
    path::{Path, PathBuf},
};

pub const GENOMIC_LINKS_FILE: &str = "genomic_links.txt";
pub const DOWNLOAD_TRIES: usize = 3;

/// `GCF_000008065.1_ASM806v1_genomic.fna.gz` → `GCF_000008065.1`, or
/// `GCF_000008065` without the version.
pub fn accession_from_file_name(file_name: &str, with_version: bool) -> String {
    let accession = file_name.split('_').take(2).collect::<Vec<_>>().join("_");
    if with_version {
        accession
    } else {
        accession
            .split_once('.')
            .map(|(acc, _)| acc.to_string())
            .unwrap_or(accession)
    }
}

/// Last path segment of a URL or local path.
pub fn file_name_of(source: &str) -> &str {
    source
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(source)
}

/// A genome is skipped when any file in `genomic_dir` already starts with
/// its unversioned accession.
pub fn download_is_required(genomic_dir: &Path, file_name: &str) -> bool {
    let accession = accession_from_file_name(file_name, false);
    let Ok(entries) = fs::read_dir(genomic_dir) else {
        return true;
    };
    !entries.flatten().any(|entry| {
        entry
            .file_name()
            .to_string_lossy()
            .starts_with(accession.as_str())
    })
}

pub fn read_links(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path).map_err(|e| {
        PipelineError::io(format!("Could not read genome links '{}'", path.display()), e)
    })?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

fn is_http_source(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

fn is_gzip_source(source: &str) -> bool {
    source.to_ascii_lowercase().ends_with(".gz")
}

fn open_source_reader(source: &str) -> Result<Box<dyn Read>> {
    if is_http_source(source) {
        let response = get(source)
            .and_then(|r| r.error_for_status())
            .map_err(|e| PipelineError::InvalidInput(format!("Could not fetch '{source}': {e}")))?;
        return Ok(Box::new(response));
    }
    let path = source.strip_prefix("file://").unwrap_or(source);
    let file = File::open(path)
        .map_err(|e| PipelineError::io(format!("Could not open source file '{path}'"), e))?;
    Ok(Box::new(file))
}

/// Copy `source` (URL or path, gzip-decompressed when it ends in `.gz`) to
/// `destination`. The file only appears under its final name once complete.
pub fn materialize_source(source: &str, destination: &Path) -> Result<u64> {
    let guard = InProgressFile::begin(destination)?;
    let reader = open_source_reader(source)?;
    let file = File::create(guard.path()).map_err(|e| {
        PipelineError::io(format!("Could not create '{}'", guard.path().display()), e)
    })?;
    let mut writer = BufWriter::new(file);
    let copied = if is_gzip_source(source) {
        std::io::copy(&mut GzDecoder::new(reader), &mut writer)
            .map_err(|e| PipelineError::io(format!("Could not decompress '{source}'"), e))?
    } else {
        let mut reader = reader;
        std::io::copy(&mut reader, &mut writer)
            .map_err(|e| PipelineError::io(format!("Could not copy '{source}'"), e))?
    };
    writer.flush().map_err(|e| {
        PipelineError::io(format!("Could not flush '{}'", guard.path().display()), e)
    })?;
    drop(writer);
    guard.commit()?;
    Ok(copied)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenomeFetchReport {
    pub downloaded: Vec<PathBuf>,
    pub skipped: usize,
    pub failed: usize,
}

/// Materialize every link into `genomic_dir`, skipping genomes that are
/// already present. A link that still fails after [`DOWNLOAD_TRIES`]
/// attempts is recorded in `errors` and the rest carry on.
pub fn fetch_genomes(
    links: &[String],
    genomic_dir: &Path,
    target: &str,
    errors: &mut RunErrors,
) -> Result<GenomeFetchReport> {
    fs::create_dir_all(genomic_dir).map_err(|e| {
        PipelineError::io(format!("Could not create '{}'", genomic_dir.display()), e)
    })?;
    let mut report = GenomeFetchReport::default();
    for source in links {
        let file_name = file_name_of(source);
        if !download_is_required(genomic_dir, file_name) {
            report.skipped += 1;
            continue;
        }
        let destination = genomic_dir.join(file_name.strip_suffix(".gz").unwrap_or(file_name));
        let mut last_error = None;
        for attempt in 1..=DOWNLOAD_TRIES {
            info!("Download...{file_name}");
            match materialize_source(source, &destination) {
                Ok(bytes) => {
                    info!("Wrote {} ({bytes} bytes)", destination.display());
                    last_error = None;
                    break;
                }
                Err(e) => {
                    warn!("Retry download...{file_name} ({attempt}/{DOWNLOAD_TRIES}): {e}");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            None => report.downloaded.push(destination),
            Some(e) => {
                let msg = format!(
                    "> Unable to download '{file_name}'. Please check the internet \
                     connection and the NCBI FTP server status ({e})"
                );
                log::error!("{msg}");
                errors.record(target, msg);
                report.failed += 1;
            }
        }
    }
    Ok(report)
}
