use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_MIN_PRODUCT_SIZE: u64 = 70;
pub const DEFAULT_MAX_PRODUCT_SIZE: u64 = 200;
pub const DEFAULT_EVALUE: f64 = 500.0;
pub const DEFAULT_MAX_PART_SIZE: usize = 1000;

/// Settings for one target species run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Target species, words joined by underscores (`Bacillus_subtilis`).
    pub target: String,
    /// Synonyms and other species that count as on-target.
    pub exception: Vec<String>,
    /// Species allowed to appear as non-target hits; empty means "all".
    pub nontargetlist: Vec<String>,
    pub nolist: bool,
    pub evalue: f64,
    pub nuc_identity: f64,
    pub minsize: u64,
    pub maxsize: u64,
    pub probe: bool,
    pub virus: bool,
    /// Custom BLAST database; `nt` when unset.
    pub customdb: Option<String>,
    pub maxpartsize: usize,
    /// Root under which the per-target directory lives.
    pub path: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            exception: vec![],
            nontargetlist: vec![],
            nolist: false,
            evalue: DEFAULT_EVALUE,
            nuc_identity: 0.0,
            minsize: DEFAULT_MIN_PRODUCT_SIZE,
            maxsize: DEFAULT_MAX_PRODUCT_SIZE,
            probe: false,
            virus: false,
            customdb: None,
            maxpartsize: DEFAULT_MAX_PART_SIZE,
            path: ".".to_string(),
        }
    }
}

impl RunConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            PipelineError::io(format!("Could not read run config '{}'", path.display()), e)
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            PipelineError::InvalidInput(format!(
                "Could not parse run config '{}': {e}",
                path.display()
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.target.trim().is_empty() {
            return Err(PipelineError::InvalidInput(
                "Run config has no target species".to_string(),
            ));
        }
        if self.minsize > self.maxsize {
            return Err(PipelineError::InvalidInput(format!(
                "Minimum product size ({}) is greater than maximum product size ({})",
                self.minsize, self.maxsize
            )));
        }
        if self.maxpartsize == 0 {
            return Err(PipelineError::InvalidInput(
                "maxpartsize must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn database(&self) -> &str {
        self.customdb.as_deref().unwrap_or("nt")
    }

    /// The allowlist only applies when one was given and it was not disabled.
    pub fn uses_nontarget_list(&self) -> bool {
        !self.nolist && !self.nontargetlist.is_empty()
    }

    pub fn paths(&self) -> RunPaths {
        RunPaths::new(Path::new(&self.path), &self.target)
    }
}

/// Directory layout of one target run.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub target_dir: PathBuf,
}

impl RunPaths {
    pub fn new(base: &Path, target: &str) -> Self {
        Self {
            target_dir: base.join(target),
        }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.target_dir.join("config")
    }

    pub fn genomic_dir(&self) -> PathBuf {
        self.target_dir.join("genomic_fna")
    }

    pub fn genomedata_dir(&self) -> PathBuf {
        self.target_dir.join("genomedata")
    }

    pub fn qc_dir(&self) -> PathBuf {
        self.genomedata_dir().join("rRNA_QC")
    }

    pub fn blast_dir(&self) -> PathBuf {
        self.target_dir.join("blast")
    }

    pub fn primer_dir(&self) -> PathBuf {
        self.target_dir.join("primerdesign")
    }

    pub fn primer_qc_dir(&self) -> PathBuf {
        self.primer_dir().join("primer_QC")
    }

    pub fn primerblast_dir(&self) -> PathBuf {
        self.primer_qc_dir().join("primerblast")
    }

    pub fn denylist_path(&self) -> PathBuf {
        self.config_dir().join("no_blast.gi")
    }

    pub fn errors_path(&self) -> PathBuf {
        self.target_dir.join("errors.csv")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_from_json_file_applies_defaults() {
        let td = tempdir().unwrap();
        let path = td.path().join("config.json");
        fs::write(
            &path,
            r#"{"target": "Lactobacillus_curvatus", "exception": ["Lactobacillus_graminis"], "probe": true}"#,
        )
        .unwrap();
        let config = RunConfig::from_json_file(&path).unwrap();
        assert_eq!(config.target, "Lactobacillus_curvatus");
        assert_eq!(config.minsize, 70);
        assert_eq!(config.maxsize, 200);
        assert_eq!(config.evalue, 500.0);
        assert!(config.probe);
        assert_eq!(config.database(), "nt");
        assert!(!config.uses_nontarget_list());
    }

    #[test]
    fn test_validate_rejects_inverted_sizes() {
        let config = RunConfig {
            target: "X_y".to_string(),
            minsize: 300,
            maxsize: 200,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = RunConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_paths_layout() {
        let config = RunConfig {
            target: "Bacillus_subtilis".to_string(),
            path: "/data".to_string(),
            ..Default::default()
        };
        let paths = config.paths();
        assert_eq!(paths.blast_dir(), PathBuf::from("/data/Bacillus_subtilis/blast"));
        assert_eq!(
            paths.primerblast_dir(),
            PathBuf::from("/data/Bacillus_subtilis/primerdesign/primer_QC/primerblast")
        );
        assert_eq!(
            paths.denylist_path(),
            PathBuf::from("/data/Bacillus_subtilis/config/no_blast.gi")
        );
    }
}
