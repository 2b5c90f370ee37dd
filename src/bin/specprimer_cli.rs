use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use log::info;
use specprimer::{
    about,
    blast::{AlignmentDriver, BlastnRunner},
    config::RunConfig,
    error::{PipelineError, RunErrors, StageStatus},
    extract::{BlastDbCmd, IndexedFasta, SequenceSource},
    genomes::{GENOMIC_LINKS_FILE, fetch_genomes, read_links},
    logging::init_logger,
    partition::{read_fasta_records, write_partitions},
    pipeline::{
        RunContext, extract_plan, persist_errors, plan_extraction, run_conserved_stage,
        run_quality_control_stage, stage_dir,
    },
    species::install_denylist,
    tools::{BLASTDBCMD_ENV_BIN, BLASTN_ENV_BIN, set_tool_override},
};
use specprimer_protocol::ClassificationMode;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "specprimer_cli", disable_version_flag = true)]
struct Cli {
    /// Print version and build information
    #[arg(short = 'V', long)]
    version: bool,

    /// Log progress at info level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// blastn executable to use instead of the PATH lookup
    #[arg(long, global = true)]
    blastn_bin: Option<String>,

    /// blastdbcmd executable to use instead of the PATH lookup
    #[arg(long, global = true)]
    blastdbcmd_bin: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Split a FASTA file into partitions for alignment
    Partition {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        mode: ClassificationMode,
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        dir: Option<PathBuf>,
        #[arg(long)]
        name: Option<String>,
    },
    /// Align every partition with blastn, reusing cached results
    Blast {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        mode: ClassificationMode,
        #[arg(long)]
        dir: Option<PathBuf>,
        #[arg(long)]
        name: Option<String>,
    },
    /// Classify the alignment results of a quality control or conserved pass
    Parse {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        mode: ClassificationMode,
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Reduce primer off-target hits to the extraction plan
    Reduce {
        #[arg(long)]
        config: PathBuf,
    },
    /// Extract the planned non-target windows from a database or FASTA file
    Extract {
        #[arg(long)]
        config: PathBuf,
        /// Local FASTA file to read from instead of the BLAST database
        #[arg(long)]
        fasta: Option<PathBuf>,
    },
    /// Download or copy the genomes listed in the run's link file
    FetchGenomes {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        links: Option<PathBuf>,
    },
    /// Merge a denylist of GIs/accessions into the run's config directory
    InstallDenylist {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        source: PathBuf,
    },
}

fn main() {
    match run() {
        Ok(status) => std::process::exit(status.code()),
        Err(e) => {
            eprintln!("{e:#}");
            std::process::exit(1);
        }
    }
}

fn load_context(path: &Path) -> Result<RunContext> {
    let config = RunConfig::from_json_file(path)?;
    Ok(RunContext::load(config)?)
}

fn run() -> Result<StageStatus> {
    let cli = Cli::parse();
    if cli.version {
        println!("{}", about::version_cli_text());
        return Ok(StageStatus::Completed);
    }
    init_logger(cli.verbose);
    if let Some(bin) = &cli.blastn_bin {
        set_tool_override(BLASTN_ENV_BIN, bin);
    }
    if let Some(bin) = &cli.blastdbcmd_bin {
        set_tool_override(BLASTDBCMD_ENV_BIN, bin);
    }
    let Some(command) = cli.command else {
        bail!("Missing command, see --help");
    };

    let mut errors = RunErrors::new();
    match command {
        Command::Partition {
            config,
            mode,
            input,
            dir,
            name,
        } => {
            let ctx = load_context(&config)?;
            let dir = dir.unwrap_or_else(|| stage_dir(&ctx.paths, mode));
            let name = name.unwrap_or_else(|| mode.as_str().to_string());
            let records = read_fasta_records(&input)?;
            let written = write_partitions(&dir, &name, records, ctx.config.maxpartsize)?;
            println!("Wrote {} partition(s) to '{}'", written.len(), dir.display());
            Ok(StageStatus::Completed)
        }
        Command::Blast {
            config,
            mode,
            dir,
            name,
        } => {
            let ctx = load_context(&config)?;
            let dir = dir.unwrap_or_else(|| stage_dir(&ctx.paths, mode));
            let name = name.unwrap_or_else(|| mode.as_str().to_string());
            let runner = BlastnRunner::new(ctx.config.database());
            let report = AlignmentDriver::new(&runner, &dir, &name).run_all(mode)?;
            println!(
                "Aligned {} partition(s), {} cached",
                report.aligned.len(),
                report.skipped.len()
            );
            Ok(StageStatus::Completed)
        }
        Command::Parse { config, mode, dir } => {
            let ctx = load_context(&config)?;
            let outcome = match mode {
                ClassificationMode::QualityControl => {
                    let dir = dir.unwrap_or_else(|| stage_dir(&ctx.paths, mode));
                    run_quality_control_stage(&ctx, &dir, &mut errors)
                }
                ClassificationMode::Conserved => {
                    run_conserved_stage(&ctx, &mut errors).map(|outcome| {
                        info!(
                            "primer3 input '{}' ({:?})",
                            outcome.primer3_input.display(),
                            outcome.reconciliation
                        );
                        outcome.status
                    })
                }
                ClassificationMode::Primer => bail!("Primer results are parsed by 'reduce'"),
            };
            Ok(persist_errors(&ctx, &errors, outcome)?)
        }
        Command::Reduce { config } => {
            let ctx = load_context(&config)?;
            let outcome = plan_extraction(&ctx, &mut errors).map(|(status, plan)| {
                println!("Extraction plan holds {} window(s)", plan.len());
                status
            });
            Ok(persist_errors(&ctx, &errors, outcome)?)
        }
        Command::Extract { config, fasta } => {
            let ctx = load_context(&config)?;
            let outcome = extract(&ctx, fasta.as_deref(), &mut errors);
            Ok(persist_errors(&ctx, &errors, outcome)?)
        }
        Command::FetchGenomes { config, links } => {
            let ctx = load_context(&config)?;
            let links_path =
                links.unwrap_or_else(|| ctx.paths.config_dir().join(GENOMIC_LINKS_FILE));
            let links = read_links(&links_path)?;
            let genomic_dir = ctx.paths.genomic_dir();
            let outcome =
                fetch_genomes(&links, &genomic_dir, ctx.target(), &mut errors).map(|report| {
                    println!(
                        "Downloaded {}, skipped {}, failed {}",
                        report.downloaded.len(),
                        report.skipped,
                        report.failed
                    );
                    StageStatus::Completed
                });
            Ok(persist_errors(&ctx, &errors, outcome)?)
        }
        Command::InstallDenylist { config, source } => {
            let config = RunConfig::from_json_file(&config)?;
            let destination = config.paths().denylist_path();
            let count = install_denylist(&source, &destination)?;
            println!("Installed {count} identifier(s) into '{}'", destination.display());
            Ok(StageStatus::Completed)
        }
    }
}

fn extract(
    ctx: &RunContext,
    fasta: Option<&Path>,
    errors: &mut RunErrors,
) -> Result<StageStatus, PipelineError> {
    let (status, plan) = plan_extraction(ctx, errors)?;
    if status != StageStatus::Completed {
        return Ok(status);
    }
    let source: Box<dyn SequenceSource> = match fasta {
        Some(path) => Box::new(IndexedFasta::open(path)?),
        None => Box::new(BlastDbCmd::new(ctx.config.database())),
    };
    let summary = extract_plan(ctx, &plan, source.as_ref())?;
    println!(
        "Wrote {} batch file(s), {} reused, {} sequences",
        summary.written, summary.skipped, summary.sequences
    );
    Ok(StageStatus::Completed)
}
