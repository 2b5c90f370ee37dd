//! On-disk result cache for per-partition and per-batch outputs.
//!
//! A present, non-empty output file is always a complete result: writers go
//! through [`InProgressFile`], which writes next to the final name with a
//! `.part` suffix and only renames on [`InProgressFile::commit`]. Dropping an
//! uncommitted guard deletes the partial file, so every early return, error or
//! unwinding path rolls back in one place.

use crate::error::{PipelineError, Result};
use log::{debug, warn};
use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};

const PART_SUFFIX: &str = ".part";

fn part_path_for(final_path: &Path) -> PathBuf {
    let mut tmp_os: OsString = final_path.as_os_str().to_os_string();
    tmp_os.push(PART_SUFFIX);
    PathBuf::from(tmp_os)
}

/// `true` when `path` exists and holds at least one byte.
pub fn is_nonempty_file(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

#[derive(Debug)]
pub struct InProgressFile {
    final_path: PathBuf,
    part_path: PathBuf,
    committed: bool,
}

impl InProgressFile {
    pub fn begin(final_path: &Path) -> Result<Self> {
        if let Some(parent) = final_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    PipelineError::io(
                        format!("Could not create output directory '{}'", parent.display()),
                        e,
                    )
                })?;
            }
        }
        let part_path = part_path_for(final_path);
        if part_path.exists() {
            fs::remove_file(&part_path).map_err(|e| {
                PipelineError::io(
                    format!("Could not remove stale '{}'", part_path.display()),
                    e,
                )
            })?;
        }
        Ok(Self {
            final_path: final_path.to_path_buf(),
            part_path,
            committed: false,
        })
    }

    /// Where the writer should put its bytes.
    pub fn path(&self) -> &Path {
        &self.part_path
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    pub fn commit(mut self) -> Result<PathBuf> {
        if !self.part_path.exists() {
            return Err(PipelineError::MalformedResult {
                path: self.final_path.display().to_string(),
                reason: "the writer did not produce any output".to_string(),
            });
        }
        fs::rename(&self.part_path, &self.final_path).map_err(|e| {
            PipelineError::io(
                format!("Could not finalize '{}'", self.final_path.display()),
                e,
            )
        })?;
        self.committed = true;
        Ok(self.final_path.clone())
    }
}

impl Drop for InProgressFile {
    fn drop(&mut self) {
        if self.committed || !self.part_path.exists() {
            return;
        }
        match fs::remove_file(&self.part_path) {
            Ok(()) => warn!("Rolled back partial output '{}'", self.part_path.display()),
            Err(e) => warn!(
                "Could not remove partial output '{}': {e}",
                self.part_path.display()
            ),
        }
    }
}

/// Alignment results keyed by partition index:
/// `<dir>/<name>_<index>_results.csv`.
#[derive(Debug, Clone)]
pub struct ResultCache {
    dir: PathBuf,
    name: String,
}

impl ResultCache {
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            name: name.to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn result_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}_{index}_results.csv", self.name))
    }

    pub fn has(&self, index: usize) -> bool {
        is_nonempty_file(&self.result_path(index))
    }

    /// Start writing the result for `index`; see [`InProgressFile::commit`].
    pub fn begin(&self, index: usize) -> Result<InProgressFile> {
        InProgressFile::begin(&self.result_path(index))
    }

    pub fn invalidate(&self, index: usize) -> Result<bool> {
        remove_if_exists(&self.result_path(index))
    }

    /// Remove `.part` leftovers from a run that was killed outright.
    pub fn sweep_stale(&self) -> Result<usize> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(0),
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.ends_with(PART_SUFFIX) {
                remove_if_exists(&entry.path())?;
                debug!("Removed stale partial output '{file_name}'");
                removed += 1;
            }
        }
        Ok(removed)
    }
}

pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(PipelineError::io(
            format!("Could not remove '{}'", path.display()),
            e,
        )),
    }
}

/// Every `*results.csv` in `dir`, ordered by the partition index embedded in
/// the file name and then by name.
pub fn list_result_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| {
        PipelineError::io(format!("Could not list results in '{}'", dir.display()), e)
    })?;
    let mut files: Vec<(Option<usize>, String, PathBuf)> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with("results.csv") {
                return None;
            }
            let index = name
                .trim_end_matches("_results.csv")
                .rsplit('_')
                .next()
                .and_then(|s| s.parse::<usize>().ok());
            Some((index, name, entry.path()))
        })
        .collect();
    files.sort();
    Ok(files.into_iter().map(|(_, _, path)| path).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_commit_moves_into_place() {
        let td = tempdir().unwrap();
        let cache = ResultCache::new(td.path(), "conserved");
        assert!(!cache.has(0));
        let guard = cache.begin(0).unwrap();
        fs::write(guard.path(), "q1\ts1\n").unwrap();
        assert!(!cache.has(0));
        guard.commit().unwrap();
        assert!(cache.has(0));
        assert!(!part_path_for(&cache.result_path(0)).exists());
    }

    #[test]
    fn test_drop_without_commit_rolls_back() {
        let td = tempdir().unwrap();
        let cache = ResultCache::new(td.path(), "conserved");
        let part = {
            let guard = cache.begin(3).unwrap();
            fs::write(guard.path(), "truncated").unwrap();
            guard.path().to_path_buf()
        };
        assert!(!part.exists());
        assert!(!cache.result_path(3).exists());
    }

    #[test]
    fn test_empty_result_is_not_cached() {
        let td = tempdir().unwrap();
        let cache = ResultCache::new(td.path(), "primer");
        fs::write(cache.result_path(1), "").unwrap();
        assert!(!cache.has(1));
        assert!(cache.invalidate(1).unwrap());
        assert!(!cache.invalidate(1).unwrap());
    }

    #[test]
    fn test_sweep_and_listing() {
        let td = tempdir().unwrap();
        let cache = ResultCache::new(td.path(), "conserved");
        for i in [10, 2, 0] {
            fs::write(cache.result_path(i), "x").unwrap();
        }
        fs::write(td.path().join("conserved_5_results.csv.part"), "x").unwrap();
        assert_eq!(cache.sweep_stale().unwrap(), 1);
        let files = list_result_files(td.path()).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "conserved_0_results.csv",
                "conserved_2_results.csv",
                "conserved_10_results.csv"
            ]
        );
    }
}
