//! Stage orchestration for one target run.
//!
//! Each stage reads every result file of its directory, classifies the hits,
//! and writes its reports. File-level validation failures abort with an
//! error; a stage that finds nothing usable records the fact and returns
//! [`StageStatus::NoCandidates`] so the caller can decide how to go on.

use crate::{
    blast::{AlignmentDriver, AlignmentRunner, DriverReport},
    cache::{list_result_files, remove_if_exists},
    classify::{Classification, ClassifierContext, Summary, classify},
    config::{RunConfig, RunPaths},
    error::{PipelineError, Result, RunErrors, StageStatus},
    extract::{ExtractionSummary, SequenceSource, extract_batches},
    hits::read_hits_file,
    intervals::{
        EXTRACTION_BATCH_SIZE, EXTRACTION_PLAN_FILE, plan_batches, read_plan, reduce, write_plan,
    },
    logging::format_duration,
    partition::{read_fasta_records, write_partitions},
    primer3::{
        PRIMER3_INPUT_FILE, ProductSettings, build_requests, render_requests, write_if_changed,
    },
    reports::{
        MOST_COMMON_HITS_FILE, OFFTARGET_SUMMARY_FILE, PARTIAL_SEQS_FILE, write_most_common_hits,
        write_partial_ranges, write_summary,
    },
    species::{ExcludedIdentifierSet, NontargetAllowlist, SpeciesExceptionSet},
    state::{PipelineState, Reconciliation, STATE_FILE, signature_of},
    validate::{reject, validate},
};
use bio::io::fasta;
use log::{error, info, warn};
use specprimer_protocol::{ClassificationMode, CoordinateWindow};
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    time::Instant,
};

pub const CONSERVED_SEQS_FILE: &str = "conserved_seqs.fas";

/// Run-wide inputs, loaded once and read-only afterwards.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub config: RunConfig,
    pub paths: RunPaths,
    pub exceptions: SpeciesExceptionSet,
    pub excluded: ExcludedIdentifierSet,
    pub allowlist: Option<NontargetAllowlist>,
}

impl RunContext {
    pub fn load(config: RunConfig) -> Result<Self> {
        config.validate()?;
        let paths = config.paths();
        let exceptions = SpeciesExceptionSet::new(&config.target, &config.exception);
        let excluded = ExcludedIdentifierSet::load(&paths.denylist_path())?;
        if !excluded.is_empty() {
            info!("Excluded GI(s)/accession(s): {}", excluded.len());
        }
        let allowlist = if config.uses_nontarget_list() {
            NontargetAllowlist::new(&config.nontargetlist)?
        } else {
            None
        };
        Ok(Self {
            config,
            paths,
            exceptions,
            excluded,
            allowlist,
        })
    }

    pub fn target(&self) -> &str {
        &self.config.target
    }

    pub fn classifier(&self) -> ClassifierContext<'_> {
        ClassifierContext {
            exceptions: &self.exceptions,
            excluded: &self.excluded,
            allowlist: self.allowlist.as_ref(),
            virus: self.config.virus,
            min_identity: self.config.nuc_identity,
            max_evalue: self.config.evalue,
            min_product_size: self.config.minsize,
        }
    }

    fn product_settings(&self) -> ProductSettings {
        ProductSettings {
            min_product_size: self.config.minsize,
            max_product_size: self.config.maxsize,
            probe: self.config.probe,
        }
    }
}

/// Partition `records` into `dir` and align every partition.
pub fn align_sequences<R: AlignmentRunner + ?Sized>(
    ctx: &RunContext,
    runner: &R,
    dir: &Path,
    name: &str,
    records: Vec<fasta::Record>,
    mode: ClassificationMode,
) -> Result<DriverReport> {
    write_partitions(dir, name, records, ctx.config.maxpartsize)?;
    AlignmentDriver::new(runner, dir, name).run_all(mode)
}

/// Validate and classify every `*results.csv` in `dir`.
pub fn parse_results(
    ctx: &RunContext,
    dir: &Path,
    mode: ClassificationMode,
    errors: &mut RunErrors,
) -> Result<Classification> {
    let files = list_result_files(dir)?;
    let classifier = ctx.classifier();
    let mut merged = Classification::empty(mode);
    info!("open BLAST result files");
    for (i, path) in files.iter().enumerate() {
        info!("{}/{}", i + 1, files.len());
        let hits = match read_hits_file(path) {
            Ok(hits) => hits,
            Err(e) if e.is_file_level() => return Err(reject(e, path, ctx.target(), errors)),
            Err(e) => return Err(e),
        };
        validate(&hits, path, ctx.target(), errors)?;
        merged.merge(classify(hits, mode, &classifier))?;
    }
    if !merged.unlisted_species.is_empty() {
        warn!(
            "Off-target species not on the non-target list: {}",
            merged.unlisted_species.iter().cloned().collect::<Vec<_>>().join(", ")
        );
    }
    Ok(merged)
}

fn no_candidates(
    stage: &str,
    message: &str,
    target: &str,
    errors: &mut RunErrors,
) -> StageStatus {
    let err = PipelineError::NoCandidates {
        stage: stage.to_string(),
        message: message.to_string(),
    };
    error!("{err}");
    errors.record(target, message);
    StageStatus::NoCandidates
}

/// Quality control of the reference gene alignments in `qc_dir`; writes
/// `<dir name>_report.csv`.
pub fn run_quality_control_stage(
    ctx: &RunContext,
    qc_dir: &Path,
    errors: &mut RunErrors,
) -> Result<StageStatus> {
    let result = parse_results(ctx, qc_dir, ClassificationMode::QualityControl, errors)?;
    if result.summary.is_empty() {
        return Ok(no_candidates(
            "quality_control",
            "> No Quality Control results found",
            ctx.target(),
            errors,
        ));
    }
    let dir_name = qc_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "QC".to_string());
    let report = qc_dir.join(format!("{dir_name}_report.csv"));
    write_summary(&report, &result.summary)?;
    info!("Wrote {}", report.display());
    Ok(StageStatus::Completed)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConservedOutcome {
    pub status: StageStatus,
    pub specific_sequences: usize,
    pub primer3_input: PathBuf,
    pub primer3_rewritten: bool,
    pub reconciliation: Reconciliation,
}

/// Classify the conserved-sequence alignments, write the off-target reports
/// and (re)build the primer3 input.
pub fn run_conserved_stage(ctx: &RunContext, errors: &mut RunErrors) -> Result<ConservedOutcome> {
    let started = Instant::now();
    let blast_dir = ctx.paths.blast_dir();
    let result = parse_results(ctx, &blast_dir, ClassificationMode::Conserved, errors)?;
    let Summary::Conserved(rows) = &result.summary else {
        return Err(PipelineError::InvalidInput(
            "conserved stage produced a different summary".to_string(),
        ));
    };

    write_summary(&blast_dir.join(OFFTARGET_SUMMARY_FILE), &result.summary)?;
    write_most_common_hits(&blast_dir.join(MOST_COMMON_HITS_FILE), rows)?;
    let partial_path = blast_dir.join(PARTIAL_SEQS_FILE);
    if result.partial_ranges.is_empty() {
        remove_if_exists(&partial_path)?;
    } else {
        write_partial_ranges(&partial_path, &result.partial_ranges)?;
    }

    let conserved = read_fasta_records(&blast_dir.join(CONSERVED_SEQS_FILE))?;
    let offtarget_ids: BTreeSet<String> = result.summary.query_ids();
    let requests = build_requests(
        &conserved,
        &offtarget_ids,
        &result.partial_ranges,
        ctx.product_settings(),
    );
    let specific_sequences = conserved
        .iter()
        .filter(|r| !offtarget_ids.contains(r.id()))
        .count();
    let text = render_requests(&requests);

    let primer_dir = ctx.paths.primer_dir();
    let mut state = PipelineState::load(&blast_dir.join(STATE_FILE))?;
    let reconciliation = state.reconcile(&signature_of(&text), &primer_dir)?;
    if reconciliation == Reconciliation::Invalidated {
        info!("Due to changed settings primer design and quality control will start from scratch");
    }
    let primer3_input = primer_dir.join(PRIMER3_INPUT_FILE);
    let primer3_rewritten = write_if_changed(&primer3_input, &text)?;

    info!("species specific conserved sequences: {specific_sequences}");
    info!("> Blast parser time: {}", format_duration(started.elapsed()));

    let status = if specific_sequences == 0 {
        no_candidates(
            "conserved",
            "> No conserved sequences without non-target match found",
            ctx.target(),
            errors,
        )
    } else {
        StageStatus::Completed
    };
    Ok(ConservedOutcome {
        status,
        specific_sequences,
        primer3_input,
        primer3_rewritten,
        reconciliation,
    })
}

/// Write the run's error log when anything was recorded, on success and on
/// failure alike, then hand `outcome` back. A stage error is reported over a
/// failed log write.
pub fn persist_errors<T>(ctx: &RunContext, errors: &RunErrors, outcome: Result<T>) -> Result<T> {
    if errors.is_empty() {
        return outcome;
    }
    let path = ctx.paths.errors_path();
    match (errors.write_csv(&path), outcome) {
        (Ok(()), outcome) => outcome,
        (Err(write_err), Ok(_)) => Err(write_err),
        (Err(write_err), Err(stage_err)) => {
            warn!("Could not write error log '{}': {write_err}", path.display());
            Err(stage_err)
        }
    }
}

/// Default working directory of the alignments for `mode`.
pub fn stage_dir(paths: &RunPaths, mode: ClassificationMode) -> PathBuf {
    match mode {
        ClassificationMode::QualityControl => paths.qc_dir(),
        ClassificationMode::Conserved => paths.blast_dir(),
        ClassificationMode::Primer => paths.primerblast_dir(),
    }
}

/// Reduce the primer off-target hits to the extraction plan, reusing a plan
/// written by an earlier run.
pub fn plan_extraction(
    ctx: &RunContext,
    errors: &mut RunErrors,
) -> Result<(StageStatus, Vec<CoordinateWindow>)> {
    let plan_path = ctx.paths.primer_qc_dir().join(EXTRACTION_PLAN_FILE);
    if plan_path.exists() {
        info!("Reusing extraction plan {}", plan_path.display());
        return Ok((StageStatus::Completed, read_plan(&plan_path)?));
    }
    let result = parse_results(
        ctx,
        &ctx.paths.primerblast_dir(),
        ClassificationMode::Primer,
        errors,
    )?;
    let Summary::Primer(rows) = &result.summary else {
        return Err(PipelineError::InvalidInput(
            "primer stage produced a different summary".to_string(),
        ));
    };
    match reduce(rows, ctx.config.maxsize) {
        Ok(plan) => {
            write_plan(&plan_path, &plan)?;
            info!("Found {} sequences for the non-target DB", plan.len());
            Ok((StageStatus::Completed, plan))
        }
        Err(PipelineError::NoCandidates { stage, message }) => {
            let status = no_candidates(&stage, &message, ctx.target(), errors);
            Ok((status, vec![]))
        }
        Err(e) => Err(e),
    }
}

/// Write the windows of `plan` into batch files under the primer QC
/// directory.
pub fn extract_plan<S: SequenceSource + ?Sized>(
    ctx: &RunContext,
    plan: &[CoordinateWindow],
    source: &S,
) -> Result<ExtractionSummary> {
    let batches = plan_batches(plan, EXTRACTION_BATCH_SIZE);
    extract_batches(&batches, &ctx.paths.primer_qc_dir(), source)
}

/// Reduce primer off-target hits to an extraction plan and write the
/// non-target sequences batch by batch.
pub fn run_primer_stage<S: SequenceSource + ?Sized>(
    ctx: &RunContext,
    source: &S,
    errors: &mut RunErrors,
) -> Result<(StageStatus, ExtractionSummary)> {
    let started = Instant::now();
    let (status, plan) = plan_extraction(ctx, errors)?;
    if status != StageStatus::Completed {
        return Ok((status, ExtractionSummary::default()));
    }
    let summary = extract_plan(ctx, &plan, source)?;
    info!(
        "> Primer blast parser time: {}",
        format_duration(started.elapsed())
    );
    Ok((StageStatus::Completed, summary))
}
