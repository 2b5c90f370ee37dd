//! Change detection for the primer3 request.
//!
//! The signature of a primer3 input is the set of its distinct
//! `SEQUENCE_ID=` and `PRIMER_PICK_INTERNAL_OLIGO=` lines. It is stored next
//! to the alignment results; when a later run produces a different set, the
//! whole primer-design directory is thrown away so nothing downstream is
//! reused against stale templates.

use crate::{
    error::{PipelineError, Result},
    primer3::{PICK_INTERNAL_OLIGO_TAG, SEQUENCE_ID_TAG},
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

pub const STATE_FILE: &str = ".primer3_state.json";

pub type RequestSignature = BTreeSet<String>;

pub fn signature_of(primer3_input: &str) -> RequestSignature {
    primer3_input
        .lines()
        .filter(|l| l.starts_with(SEQUENCE_ID_TAG) || l.starts_with(PICK_INTERNAL_OLIGO_TAG))
        .map(str::to_string)
        .collect()
}

fn digest_of(signature: &RequestSignature) -> String {
    let mut hasher = Sha1::new();
    for line in signature {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredState {
    digest: String,
    signature: Vec<String>,
}

/// What [`PipelineState::reconcile`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    FirstRun,
    Unchanged,
    Invalidated,
}

#[derive(Debug, Clone)]
pub struct PipelineState {
    path: PathBuf,
    stored: Option<RequestSignature>,
}

impl PipelineState {
    /// Load the stored signature at `path`. A missing file means no baseline;
    /// an unreadable one is treated the same way, with a warning.
    pub fn load(path: &Path) -> Result<Self> {
        let stored = match fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str::<StoredState>(&text) {
                Ok(state) => {
                    let signature: RequestSignature = state.signature.into_iter().collect();
                    if digest_of(&signature) == state.digest {
                        Some(signature)
                    } else {
                        warn!("Ignoring corrupt primer3 state '{}'", path.display());
                        None
                    }
                }
                Err(e) => {
                    warn!("Ignoring unreadable primer3 state '{}': {e}", path.display());
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(PipelineError::io(
                    format!("Could not read '{}'", path.display()),
                    e,
                ));
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            stored,
        })
    }

    pub fn stored(&self) -> Option<&RequestSignature> {
        self.stored.as_ref()
    }

    /// `true` when a baseline exists and differs from `signature`.
    pub fn should_invalidate(&self, signature: &RequestSignature) -> bool {
        match &self.stored {
            Some(stored) => stored.symmetric_difference(signature).next().is_some(),
            None => false,
        }
    }

    fn persist(&mut self, signature: &RequestSignature) -> Result<()> {
        let state = StoredState {
            digest: digest_of(signature),
            signature: signature.iter().cloned().collect(),
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                PipelineError::io(format!("Could not create '{}'", parent.display()), e)
            })?;
        }
        let text = serde_json::to_string_pretty(&state)?;
        fs::write(&self.path, text).map_err(|e| {
            PipelineError::io(format!("Could not write '{}'", self.path.display()), e)
        })?;
        self.stored = Some(signature.clone());
        Ok(())
    }

    /// Compare `signature` with the baseline. On a difference `primer_dir` is
    /// deleted and recreated empty; either way the new signature becomes the
    /// baseline.
    pub fn reconcile(
        &mut self,
        signature: &RequestSignature,
        primer_dir: &Path,
    ) -> Result<Reconciliation> {
        if self.stored.is_none() {
            self.persist(signature)?;
            return Ok(Reconciliation::FirstRun);
        }
        if !self.should_invalidate(signature) {
            return Ok(Reconciliation::Unchanged);
        }
        info!(
            "primer3 input changed; clearing '{}'",
            primer_dir.display()
        );
        if primer_dir.exists() {
            fs::remove_dir_all(primer_dir).map_err(|e| {
                PipelineError::io(format!("Could not remove '{}'", primer_dir.display()), e)
            })?;
        }
        fs::create_dir_all(primer_dir).map_err(|e| {
            PipelineError::io(format!("Could not create '{}'", primer_dir.display()), e)
        })?;
        self.persist(signature)?;
        Ok(Reconciliation::Invalidated)
    }
}
