//! ParamLab CLI : run and inspect offline optimization jobs from the terminal.
//!
//! Commands:
//! - `run`: start a job from a TOML spec and stream progress until it ends
//! - `status`: show the latest job for each pipeline kind
//! - `results`: print the ranked results and artifacts of a past run
//! - `abort`: ask the active job of a pipeline kind to stop cooperatively
//! - `guard scan`: scan a source tree for live-trading references
//! - `seed`: write deterministic synthetic candles into the CSV store
//! - `clean`: purge finished job records and their artifacts by age

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration as StdDuration;

use anyhow::{bail, Context, Result};
use chrono::{Duration, Local, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use clap::{Parser, Subcommand};

use paramlab_core::guard::{scan_crate_sources, DEFAULT_FORBIDDEN};
use paramlab_core::{RunId, Timeframe};
use paramlab_runner::{
    seed_synthetic, ArtifactStore, CsvCandleStore, JobOutcome, JobRegistry, JobSpec, JobStatus,
    OptimizationJobQueue, PipelineKind, StatusReport,
};

#[derive(Parser)]
#[command(name = "paramlab", about = "Offline strategy optimization lab", version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a job from a TOML spec and stream progress until it ends.
    Run {
        /// Path to the job spec (TOML).
        spec: PathBuf,
        /// Directory holding the CSV candle store.
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        /// Lab state directory (job records and artifacts).
        #[arg(long, default_value = "lab")]
        lab_dir: PathBuf,
    },
    /// Show the latest job for each pipeline kind.
    Status {
        /// Limit the listing to one pipeline kind.
        #[arg(long)]
        kind: Option<PipelineKind>,
        #[arg(long, default_value = "lab")]
        lab_dir: PathBuf,
    },
    /// Print the ranked results and artifacts of a past run.
    Results {
        /// Run id to inspect.
        #[arg(long, conflicts_with = "kind")]
        run: Option<String>,
        /// Use the latest run of this pipeline kind instead of an id.
        #[arg(long)]
        kind: Option<PipelineKind>,
        /// How many ranked combinations to print.
        #[arg(long, default_value_t = 10)]
        top: usize,
        #[arg(long, default_value = "lab")]
        lab_dir: PathBuf,
    },
    /// Request a cooperative abort of the active job of a pipeline kind.
    Abort {
        kind: PipelineKind,
        #[arg(long, default_value = "lab")]
        lab_dir: PathBuf,
    },
    /// Isolation guard utilities.
    Guard {
        #[command(subcommand)]
        action: GuardAction,
    },
    /// Seed deterministic synthetic candles into the CSV store.
    Seed {
        /// Symbols to generate, e.g. BTCUSDT ETHUSDT.
        #[arg(required = true)]
        symbols: Vec<String>,
        /// Candle timeframe.
        #[arg(long, default_value = "H1")]
        timeframe: Timeframe,
        /// First candle open date (YYYY-MM-DD); defaults to one year back.
        #[arg(long)]
        start: Option<String>,
        /// Candles per symbol.
        #[arg(long, default_value_t = 5000)]
        bars: usize,
        /// Generator seed; the same seed yields the same series.
        #[arg(long, default_value_t = 42)]
        seed: u64,
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
    },
    /// Delete finished job records (and their artifacts) older than a cutoff.
    Clean {
        /// Age threshold in days.
        #[arg(long, default_value_t = 30)]
        older_than_days: i64,
        /// Actually delete; without this flag the command only lists.
        #[arg(long)]
        confirm: bool,
        #[arg(long, default_value = "lab")]
        lab_dir: PathBuf,
    },
}

#[derive(Subcommand)]
enum GuardAction {
    /// Scan a crate tree for forbidden live-trading references.
    Scan {
        /// Root of the tree to scan.
        #[arg(default_value = ".")]
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        match cli.verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
        .to_string()
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run {
            spec,
            data_dir,
            lab_dir,
        } => run_job(&spec, data_dir, lab_dir),
        Commands::Status { kind, lab_dir } => run_status(kind, &lab_dir),
        Commands::Results {
            run,
            kind,
            top,
            lab_dir,
        } => run_results(run, kind, top, &lab_dir),
        Commands::Abort { kind, lab_dir } => run_abort(kind, &lab_dir),
        Commands::Guard { action } => match action {
            GuardAction::Scan { path } => run_scan(&path),
        },
        Commands::Seed {
            symbols,
            timeframe,
            start,
            bars,
            seed,
            data_dir,
        } => run_seed(&symbols, timeframe, start.as_deref(), bars, seed, &data_dir),
        Commands::Clean {
            older_than_days,
            confirm,
            lab_dir,
        } => run_clean(older_than_days, confirm, &lab_dir),
    }
}

// ─── Run ────────────────────────────────────────────────────────────────────

fn run_job(spec_path: &Path, data_dir: PathBuf, lab_dir: PathBuf) -> Result<()> {
    let text = std::fs::read_to_string(spec_path)
        .with_context(|| format!("reading spec {}", spec_path.display()))?;
    let spec = JobSpec::from_toml_str(&text)
        .with_context(|| format!("parsing spec {}", spec_path.display()))?;
    let kind = spec.kind;

    let store = Arc::new(CsvCandleStore::new(data_dir));
    let queue = OptimizationJobQueue::new(store, lab_dir)?;

    let run_id = queue.start(spec)?;
    println!("Started {kind} run {run_id}");
    println!();

    let mut last_phase = String::new();
    let mut last_percent = -1.0_f64;
    loop {
        let report = queue.status(kind);
        let progress = &report.progress;
        tracing::debug!(
            done = progress.combinations_done,
            total = progress.combinations_total,
            "poll"
        );
        // Print on phase changes and every five points of progress.
        if progress.phase != last_phase || progress.percent - last_percent >= 5.0 {
            println!(
                "{:>5.1}%  {:<12} {}",
                progress.percent, progress.phase, progress.message
            );
            last_phase = progress.phase.clone();
            last_percent = progress.percent;
        }
        if report.status.is_terminal() {
            println!();
            return finish_run(&queue, report);
        }
        thread::sleep(StdDuration::from_millis(250));
    }
}

fn finish_run(queue: &OptimizationJobQueue, report: StatusReport) -> Result<()> {
    match report.status {
        JobStatus::Completed => {
            let Some(run_id) = report.run_id else {
                bail!("terminal report carried no run id");
            };
            let outcome = queue.results(&run_id)?;
            println!("Run {run_id} completed.");
            println!();
            print_outcome(&outcome, queue.artifacts(), 10);
            Ok(())
        }
        JobStatus::Aborted => {
            println!("Job aborted before completion.");
            process::exit(1);
        }
        _ => {
            match report.error {
                Some(error) => println!("Job failed ({:?}): {}", error.kind, error.message),
                None => println!("Job failed with no recorded error."),
            }
            process::exit(1);
        }
    }
}

// ─── Status ─────────────────────────────────────────────────────────────────

fn run_status(kind: Option<PipelineKind>, lab_dir: &Path) -> Result<()> {
    let registry = JobRegistry::new(lab_dir.join("jobs"))?;
    let kinds: Vec<PipelineKind> = match kind {
        Some(kind) => vec![kind],
        None => PipelineKind::ALL.to_vec(),
    };

    println!(
        "{:<13} {:<10} {:<41} {:>8}  {}",
        "Pipeline", "Status", "Run", "Progress", "Finished"
    );
    println!("{}", "-".repeat(86));
    for kind in kinds {
        match registry.latest(kind)? {
            Some(record) => {
                let when = match record.finished_at {
                    Some(at) => at.format("%Y-%m-%d %H:%M:%S").to_string(),
                    None => record.progress.phase.clone(),
                };
                println!(
                    "{:<13} {:<10} {:<41} {:>7.0}%  {}",
                    kind.label(),
                    record.status.label(),
                    record.run_id,
                    record.progress.percent,
                    when,
                );
            }
            None => println!(
                "{:<13} {:<10} {:<41} {:>8}  {}",
                kind.label(),
                "IDLE",
                "-",
                "-",
                "-"
            ),
        }
    }
    Ok(())
}

// ─── Results ────────────────────────────────────────────────────────────────

fn run_results(
    run: Option<String>,
    kind: Option<PipelineKind>,
    top: usize,
    lab_dir: &Path,
) -> Result<()> {
    let registry = JobRegistry::new(lab_dir.join("jobs"))?;
    let record = match (run, kind) {
        (Some(id), _) => registry.load(&RunId(id))?,
        (None, Some(kind)) => match registry.latest(kind)? {
            Some(record) => record,
            None => bail!("no {kind} run on record"),
        },
        (None, None) => bail!("pass --run <id> or --kind <pipeline>"),
    };

    let Some(outcome) = record.outcome.as_ref() else {
        bail!(
            "run {} is {}; no results recorded",
            record.run_id,
            record.status
        );
    };

    let artifacts = ArtifactStore::new(lab_dir.join("artifacts"))?;
    println!("=== {} ===", record.run_id);
    println!("Pipeline:   {}", record.kind);
    println!("Status:     {}", record.status);
    println!("Started:    {}", record.started_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(at) = record.finished_at {
        println!("Finished:   {}", at.format("%Y-%m-%d %H:%M:%S"));
    }
    println!();
    print_outcome(outcome, &artifacts, top);
    Ok(())
}

fn print_outcome(outcome: &JobOutcome, artifacts: &ArtifactStore, top: usize) {
    println!(
        "Evaluated:  {} combination(s), {} failed",
        outcome.evaluated, outcome.failed
    );
    if outcome.lookahead_violations > 0 {
        println!(
            "Violations: {} unclosed higher-timeframe read(s)",
            outcome.lookahead_violations
        );
    }
    println!();

    if outcome.top_n.is_empty() {
        println!("No ranked combinations recorded.");
    } else {
        println!(
            "{:<5} {:>9} {:>8} {:>9} {:>8} {:>7}  {}",
            "Rank", "Score", "Sharpe", "Return%", "MaxDD%", "Trades", "Parameters"
        );
        println!("{}", "-".repeat(78));
        for (rank, result) in outcome.top_n.iter().take(top).enumerate() {
            println!(
                "{:<5} {:>9.3} {:>8.2} {:>9.1} {:>8.1} {:>7}  {}",
                rank + 1,
                result.score,
                result.metrics.sharpe,
                result.metrics.total_return * 100.0,
                result.metrics.max_drawdown * 100.0,
                result.metrics.trade_count,
                result.params.label(),
            );
        }
    }
    println!();

    println!("Artifacts:");
    for reference in &outcome.artifacts {
        match artifacts.resolve(&reference.reference) {
            Ok((_, kind, path)) => println!("  {:<12} {}", kind.label(), path.display()),
            Err(_) => println!(
                "  {:<12} {} (missing)",
                reference.kind.label(),
                reference.reference
            ),
        }
    }
}

// ─── Abort ──────────────────────────────────────────────────────────────────

fn run_abort(kind: PipelineKind, lab_dir: &Path) -> Result<()> {
    let registry = JobRegistry::new(lab_dir.join("jobs"))?;
    match registry.latest(kind)? {
        Some(record) if record.status.is_active() => {
            registry.request_abort(&record.run_id)?;
            println!("Abort requested for {}.", record.run_id);
            println!("The worker stops at its next batch checkpoint.");
        }
        Some(record) => println!("Latest {kind} job is already {}.", record.status),
        None => println!("No {kind} job on record."),
    }
    Ok(())
}

// ─── Guard ──────────────────────────────────────────────────────────────────

fn run_scan(path: &Path) -> Result<()> {
    let report = scan_crate_sources(path, DEFAULT_FORBIDDEN)?;
    println!(
        "Scanned {} file(s) under {}",
        report.files_scanned,
        path.display()
    );
    if report.is_clean() {
        println!("No live-trading references found.");
        return Ok(());
    }
    println!("{} forbidden reference(s):", report.findings.len());
    for finding in &report.findings {
        println!(
            "  {}:{}  {}  [{}]",
            finding.file.display(),
            finding.line,
            finding.text,
            finding.needle
        );
    }
    process::exit(1);
}

// ─── Seed ───────────────────────────────────────────────────────────────────

fn run_seed(
    symbols: &[String],
    timeframe: Timeframe,
    start: Option<&str>,
    bars: usize,
    seed: u64,
    data_dir: &Path,
) -> Result<()> {
    let start = parse_start(start)?;
    let store = CsvCandleStore::new(data_dir);
    let written = seed_synthetic(&store, symbols, timeframe, start, bars, seed)?;
    for path in &written {
        println!("Wrote {}", path.display());
    }
    println!(
        "Seeded {} series of {} {} candles from {}.",
        written.len(),
        bars,
        timeframe,
        start.format("%Y-%m-%d"),
    );
    Ok(())
}

// ─── Clean ──────────────────────────────────────────────────────────────────

fn run_clean(older_than_days: i64, confirm: bool, lab_dir: &Path) -> Result<()> {
    let registry = JobRegistry::new(lab_dir.join("jobs"))?;
    let artifacts = ArtifactStore::new(lab_dir.join("artifacts"))?;
    let cutoff = Utc::now().naive_utc() - Duration::days(older_than_days);

    let mut stale = Vec::new();
    for record in registry.load_all()? {
        if record.status.is_active() {
            continue;
        }
        let finished = record.finished_at.unwrap_or(record.heartbeat_at);
        if finished < cutoff {
            stale.push((record.run_id, record.status, finished));
        }
    }

    if stale.is_empty() {
        println!("No finished jobs older than {older_than_days} day(s).");
        return Ok(());
    }

    println!(
        "{} job(s) finished before {}:",
        stale.len(),
        cutoff.format("%Y-%m-%d %H:%M")
    );
    for (run_id, status, finished) in &stale {
        println!(
            "  {:<10} {}  ({})",
            status.label(),
            run_id,
            finished.format("%Y-%m-%d %H:%M")
        );
    }

    if !confirm {
        println!();
        println!("Dry run only. Pass --confirm to delete these records and their artifacts.");
        return Ok(());
    }

    let removed = registry.purge_finished_before(cutoff)?;
    for (run_id, _, _) in &stale {
        artifacts.purge_run(run_id)?;
    }
    println!("Removed {removed} record(s).");
    Ok(())
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn parse_start(start: Option<&str>) -> Result<NaiveDateTime> {
    let date = match start {
        Some(text) => NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .with_context(|| format!("bad start date {text:?}; expected YYYY-MM-DD"))?,
        None => Local::now().date_naive() - Duration::days(365),
    };
    Ok(date.and_time(NaiveTime::MIN))
}

