use crate::{
    cache::ResultCache,
    error::Result,
    logging::format_duration,
    partition::list_partition_files,
    tools::{BLASTN_ENV_BIN, blastn_executable, check_status, run_tool},
};
use log::{debug, info};
use specprimer_protocol::{ClassificationMode, blast_outfmt};
use std::{
    path::{Path, PathBuf},
    thread,
    time::Instant,
};

/// Fixed `blastn` settings per classification mode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlastParameters {
    pub task: &'static str,
    pub max_target_seqs: Option<u32>,
    pub max_hsps: Option<u32>,
    pub evalue: Option<f64>,
}

impl BlastParameters {
    pub fn for_mode(mode: ClassificationMode) -> Self {
        match mode {
            ClassificationMode::QualityControl => Self {
                task: "megablast",
                max_target_seqs: Some(5),
                max_hsps: Some(1),
                evalue: None,
            },
            ClassificationMode::Conserved => Self {
                task: "dc-megablast",
                max_target_seqs: Some(2000),
                max_hsps: Some(1),
                evalue: None,
            },
            ClassificationMode::Primer => Self {
                task: "blastn-short",
                max_target_seqs: None,
                max_hsps: None,
                evalue: Some(500.0),
            },
        }
    }

    pub fn to_args(
        &self,
        query: &Path,
        output: &Path,
        database: &str,
        threads: usize,
    ) -> Vec<String> {
        let mut args = vec![
            "-task".to_string(),
            self.task.to_string(),
            "-num_threads".to_string(),
            threads.to_string(),
            "-query".to_string(),
            query.display().to_string(),
        ];
        if let Some(n) = self.max_target_seqs {
            args.extend(["-max_target_seqs".to_string(), n.to_string()]);
        }
        if let Some(n) = self.max_hsps {
            args.extend(["-max_hsps".to_string(), n.to_string()]);
        }
        if let Some(evalue) = self.evalue {
            args.extend(["-evalue".to_string(), evalue.to_string()]);
        }
        args.extend([
            "-out".to_string(),
            output.display().to_string(),
            "-outfmt".to_string(),
            blast_outfmt(),
            "-db".to_string(),
            database.to_string(),
        ]);
        args
    }
}

/// Produces the tabular result for one query file at `output`.
pub trait AlignmentRunner {
    fn align(&self, mode: ClassificationMode, query: &Path, output: &Path) -> Result<()>;
}

/// Runs the external `blastn`.
#[derive(Debug, Clone)]
pub struct BlastnRunner {
    executable: String,
    database: String,
    threads: usize,
}

impl BlastnRunner {
    pub fn new(database: &str) -> Self {
        Self {
            executable: blastn_executable(),
            database: database.to_string(),
            threads: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }
}

impl AlignmentRunner for BlastnRunner {
    fn align(&self, mode: ClassificationMode, query: &Path, output: &Path) -> Result<()> {
        let args =
            BlastParameters::for_mode(mode).to_args(query, output, &self.database, self.threads);
        debug!("{} {}", self.executable, args.join(" "));
        let out = run_tool(&self.executable, &args, BLASTN_ENV_BIN)?;
        check_status(&self.executable, &out, "BLAST search", output)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverReport {
    pub aligned: Vec<usize>,
    pub skipped: Vec<usize>,
}

/// Aligns every `<name>.part-<i>` in a directory, reusing cached results.
pub struct AlignmentDriver<'a, R: AlignmentRunner + ?Sized> {
    runner: &'a R,
    dir: PathBuf,
    name: String,
}

impl<'a, R: AlignmentRunner + ?Sized> AlignmentDriver<'a, R> {
    pub fn new(runner: &'a R, dir: &Path, name: &str) -> Self {
        Self {
            runner,
            dir: dir.to_path_buf(),
            name: name.to_string(),
        }
    }

    pub fn cache(&self) -> ResultCache {
        ResultCache::new(&self.dir, &self.name)
    }

    /// Quality control always re-aligns; the other modes keep any non-empty
    /// result. Output is renamed into place only after the runner returned
    /// successfully.
    pub fn run_all(&self, mode: ClassificationMode) -> Result<DriverReport> {
        let cache = self.cache();
        let stale = cache.sweep_stale()?;
        if stale > 0 {
            info!("Removed {stale} partial result file(s) from an earlier run");
        }
        let started = Instant::now();
        let mut report = DriverReport::default();
        for (index, query) in list_partition_files(&self.dir, &self.name)? {
            if mode != ClassificationMode::QualityControl && cache.has(index) {
                info!("> Skip Blast step for {}", query.display());
                report.skipped.push(index);
                continue;
            }
            let guard = cache.begin(index)?;
            self.runner.align(mode, &query, guard.path())?;
            guard.commit()?;
            report.aligned.push(index);
        }
        info!(
            "> Blast duration: {} ({} aligned, {} cached)",
            format_duration(started.elapsed()),
            report.aligned.len(),
            report.skipped.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::PipelineError, partition::partition_file_name};
    use std::{cell::RefCell, fs};
    use tempfile::tempdir;

    #[test]
    fn test_parameters_by_mode() {
        let args = BlastParameters::for_mode(ClassificationMode::Conserved).to_args(
            Path::new("q.part-0"),
            Path::new("conserved_0_results.csv"),
            "nt",
            8,
        );
        let joined = args.join(" ");
        assert!(joined.starts_with("-task dc-megablast -num_threads 8 -query q.part-0"));
        assert!(joined.contains("-max_target_seqs 2000 -max_hsps 1"));
        assert!(joined.ends_with("-db nt"));

        let primer = BlastParameters::for_mode(ClassificationMode::Primer);
        assert_eq!(primer.task, "blastn-short");
        assert_eq!(primer.evalue, Some(500.0));
        assert_eq!(primer.max_target_seqs, None);
        let qc = BlastParameters::for_mode(ClassificationMode::QualityControl);
        assert_eq!((qc.task, qc.max_target_seqs), ("megablast", Some(5)));
    }

    struct FixtureRunner {
        calls: RefCell<Vec<PathBuf>>,
        fail_on: Option<usize>,
    }

    impl AlignmentRunner for FixtureRunner {
        fn align(&self, _mode: ClassificationMode, query: &Path, output: &Path) -> Result<()> {
            self.calls.borrow_mut().push(query.to_path_buf());
            fs::write(output, "partial\t")?;
            if self.fail_on == Some(self.calls.borrow().len() - 1) {
                return Err(PipelineError::Interrupted {
                    operation: "BLAST search".to_string(),
                    path: output.display().to_string(),
                });
            }
            fs::write(output, "q\ts\n")?;
            Ok(())
        }
    }

    fn setup(parts: usize) -> tempfile::TempDir {
        let td = tempdir().unwrap();
        for i in 0..parts {
            fs::write(td.path().join(partition_file_name("conserved", i)), ">a\nACGT\n").unwrap();
        }
        td
    }

    #[test]
    fn test_cached_results_are_skipped_except_for_qc() {
        let td = setup(2);
        let runner = FixtureRunner {
            calls: RefCell::new(vec![]),
            fail_on: None,
        };
        let driver = AlignmentDriver::new(&runner, td.path(), "conserved");
        let report = driver.run_all(ClassificationMode::Conserved).unwrap();
        assert_eq!(report.aligned, vec![0, 1]);
        let report = driver.run_all(ClassificationMode::Conserved).unwrap();
        assert_eq!(report.skipped, vec![0, 1]);
        let report = driver.run_all(ClassificationMode::QualityControl).unwrap();
        assert_eq!(report.aligned, vec![0, 1]);
        assert_eq!(runner.calls.borrow().len(), 4);
    }

    #[test]
    fn test_interrupted_alignment_leaves_no_result() {
        let td = setup(3);
        let runner = FixtureRunner {
            calls: RefCell::new(vec![]),
            fail_on: Some(1),
        };
        let driver = AlignmentDriver::new(&runner, td.path(), "conserved");
        let err = driver.run_all(ClassificationMode::Conserved).unwrap_err();
        assert!(matches!(err, PipelineError::Interrupted { .. }));
        let cache = driver.cache();
        assert!(cache.has(0));
        assert!(!cache.has(1));
        assert!(!cache.result_path(1).exists());
        assert!(!td.path().join("conserved_1_results.csv.part").exists());
    }
}
