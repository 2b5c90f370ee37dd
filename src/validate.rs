use crate::{
    cache::remove_if_exists,
    error::{PipelineError, Result, RunErrors},
};
use log::{error, info, warn};
use specprimer_protocol::AlignmentHit;
use std::path::Path;

/// `sseqid` of databases built without `makeblastdb -parse_seqids`.
pub const ORDINAL_ID_PLACEHOLDER: &str = "gnl|BL_ORD_ID|";
/// `stitle` of database entries without a definition line.
pub const MISSING_TITLE_SENTINEL: &str = "No definition line";

fn first_problem(hits: &[AlignmentHit], source: &str) -> Option<PipelineError> {
    if hits.is_empty() {
        return Some(PipelineError::MalformedResult {
            path: source.to_string(),
            reason: "the file contains no rows. Please check if the file was removed and start the run again"
                .to_string(),
        });
    }
    if hits
        .iter()
        .any(|h| h.subject_seq_id.contains(ORDINAL_ID_PLACEHOLDER))
    {
        return Some(PipelineError::BlastDb {
            path: source.to_string(),
            reason: "Problem with custom DB, Please use the '-parse_seqids' option for the makeblastdb command"
                .to_string(),
        });
    }
    if hits
        .iter()
        .any(|h| h.subject_title.contains(MISSING_TITLE_SENTINEL))
    {
        return Some(PipelineError::BlastDb {
            path: source.to_string(),
            reason: "No definition line in Subject Title. Data is missing in the custom BLAST DB; \
                     each entry needs at least a unique sequence identifier and the species name \
                     (expected format: >seqid species name optional description)"
                .to_string(),
        });
    }
    None
}

/// Check one parsed result file before it enters classification.
///
/// On failure the problem is logged, recorded against `target`, and the file
/// is deleted so the next run regenerates it.
pub fn validate(
    hits: &[AlignmentHit],
    path: &Path,
    target: &str,
    errors: &mut RunErrors,
) -> Result<()> {
    let source = path.display().to_string();
    match first_problem(hits, &source) {
        Some(problem) => Err(reject(problem, path, target, errors)),
        None => Ok(()),
    }
}

/// Record `problem` against `target`, delete `path`, and hand the error back
/// for the caller to propagate.
pub fn reject(
    problem: PipelineError,
    path: &Path,
    target: &str,
    errors: &mut RunErrors,
) -> PipelineError {
    error!("> {problem}");
    errors.record(target, problem.to_string());
    match remove_if_exists(path) {
        Ok(true) => info!("removed {}", path.display()),
        Ok(false) => {}
        Err(e) => warn!("{e}"),
    }
    problem
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hits::fixtures::hit;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_valid_file_is_untouched() {
        let td = tempdir().unwrap();
        let path = td.path().join("conserved_0_results.csv");
        fs::write(&path, "x").unwrap();
        let mut errors = RunErrors::new();
        let hits = vec![hit("q", "NC_1", "Bacillus subtilis 168")];
        validate(&hits, &path, "Bacillus_subtilis", &mut errors).unwrap();
        assert!(path.exists());
        assert!(errors.is_empty());
    }

    #[test]
    fn test_empty_results_are_malformed() {
        let td = tempdir().unwrap();
        let path = td.path().join("conserved_0_results.csv");
        fs::write(&path, "").unwrap();
        let mut errors = RunErrors::new();
        let err = validate(&[], &path, "Bacillus_subtilis", &mut errors).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedResult { .. }));
        assert!(!path.exists());
        assert_eq!(errors.entries()[0].target, "Bacillus_subtilis");
    }

    #[test]
    fn test_placeholder_ids_checked_before_titles() {
        let td = tempdir().unwrap();
        let path = td.path().join("primer_1_results.csv");
        fs::write(&path, "x").unwrap();
        let mut bad_id = hit("q", "1", "No definition line");
        bad_id.subject_seq_id = "gnl|BL_ORD_ID|17".to_string();
        let mut errors = RunErrors::new();
        let err = validate(&[bad_id], &path, "t", &mut errors).unwrap_err();
        assert!(err.to_string().contains("-parse_seqids"));
        assert!(!path.exists());
    }

    #[test]
    fn test_missing_titles() {
        let td = tempdir().unwrap();
        let path = td.path().join("primer_2_results.csv");
        fs::write(&path, "x").unwrap();
        let hits = vec![
            hit("q", "NC_1", "Bacillus subtilis 168"),
            hit("q", "NC_2", "No definition line"),
        ];
        let mut errors = RunErrors::new();
        let err = validate(&hits, &path, "t", &mut errors).unwrap_err();
        assert!(matches!(err, PipelineError::BlastDb { .. }));
        assert!(err.to_string().contains("No definition line"));
        assert_eq!(errors.len(), 1);
    }
}
