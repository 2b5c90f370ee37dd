use serde::{Deserialize, Serialize};
use std::{fs, io, path::Path};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Empty or structurally invalid alignment output.
    #[error("A problem with the BLAST results file '{path}' was detected: {reason}")]
    MalformedResult { path: String, reason: String },

    /// The reference database was built without identifiers or titles.
    #[error("{reason} (results file '{path}')")]
    BlastDb { path: String, reason: String },

    #[error("{stage}: {message}")]
    NoCandidates { stage: String, message: String },

    #[error("{operation} was interrupted; removed partial output '{path}'")]
    Interrupted { operation: String, path: String },

    #[error("Could not find executable '{executable}'. Install it or set {env_var}")]
    ToolNotFound { executable: String, env_var: String },

    #[error("{executable} failed (status={status:?}): {stderr}")]
    ToolFailed {
        executable: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    InvalidInput(String),
}

impl PipelineError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Validation failures abort the whole run; everything else is left to
    /// the caller.
    pub fn is_file_level(&self) -> bool {
        matches!(self, Self::MalformedResult { .. } | Self::BlastDb { .. })
    }
}

impl From<io::Error> for PipelineError {
    fn from(err: io::Error) -> Self {
        Self::io("I/O error", err)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunErrorEntry {
    pub target: String,
    pub message: String,
}

/// Run-level error log. Stages append to it; the orchestrator decides when to
/// persist it.
#[derive(Debug, Clone, Default)]
pub struct RunErrors {
    entries: Vec<RunErrorEntry>,
}

impl RunErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, target: &str, message: impl Into<String>) {
        self.entries.push(RunErrorEntry {
            target: target.to_string(),
            message: message.into(),
        });
    }

    pub fn entries(&self) -> &[RunErrorEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                PipelineError::io(format!("Could not create '{}'", parent.display()), e)
            })?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        for entry in &self.entries {
            writer.serialize(entry)?;
        }
        writer.flush().map_err(|e| {
            PipelineError::io(format!("Could not flush '{}'", path.display()), e)
        })?;
        Ok(())
    }
}

/// Stage outcome handed back to the orchestrator instead of raising.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Completed,
    NoCandidates,
}

impl StageStatus {
    pub fn code(&self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::NoCandidates => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_error_messages() {
        let err = PipelineError::BlastDb {
            path: "x_0_results.csv".to_string(),
            reason: "Problem with custom DB".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Problem with custom DB"));
        assert!(msg.contains("x_0_results.csv"));
        assert!(err.is_file_level());
        let err = PipelineError::NoCandidates {
            stage: "primer".to_string(),
            message: "nothing".to_string(),
        };
        assert!(!err.is_file_level());
    }

    #[test]
    fn test_run_errors_write_csv() {
        let td = tempdir().unwrap();
        let mut errors = RunErrors::new();
        assert!(errors.is_empty());
        errors.record("Bacillus_subtilis", "No conserved sequences");
        errors.record("Bacillus_subtilis", "second");
        assert_eq!(errors.len(), 2);
        let path = td.path().join("logs").join("errors.csv");
        errors.write_csv(&path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("target,message\n"));
        assert!(text.contains("Bacillus_subtilis,No conserved sequences"));
        assert_eq!(StageStatus::NoCandidates.code(), 1);
    }
}
