use hammer_core::config::HammerConfig;
use hammer_core::fuzzer::{AbortReason, Fuzzer, SessionExit, default_runtime};
use hammer_core::mutator::MutatorKind;
use hammer_core::replay::replay_record;
use hammer_core::store::load_record;

use anyhow::{Context, bail};
use clap::{ArgAction, Args, Parser, Subcommand};
use log::{LevelFilter, info, warn};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Black-box mutation fuzzer for message-driven apps", long_about = None)]
struct Cli {
    /// Session file. Defaults to `hammer.toml` in the working directory.
    #[clap(short, long, value_parser, global = true)]
    config_file: Option<PathBuf>,
    /// More log output (-v debug, -vv trace).
    #[clap(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    /// Only log warnings and errors.
    #[clap(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a fuzzing session.
    Fuzz(FuzzArgs),
    /// Run a recorded crash or timeout once more.
    Replay {
        /// Record file written by a previous session.
        record: PathBuf,
    },
}

#[derive(Args, Debug)]
struct FuzzArgs {
    /// App to fuzz, overriding `session.app`.
    #[clap(long)]
    app: Option<String>,
    #[clap(short, long)]
    iterations: Option<u64>,
    /// Wall-clock budget in seconds.
    #[clap(short, long)]
    duration: Option<u64>,
    #[clap(short, long)]
    workers: Option<usize>,
    /// RNG seed for a reproducible session.
    #[clap(long)]
    seed: Option<u64>,
    /// Directory for interesting-input records.
    #[clap(short, long)]
    out: Option<PathBuf>,
    #[clap(short, long)]
    mutator: Option<MutatorKind>,
}

fn init_logging(verbose: u8, quiet: bool) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if quiet {
        builder.filter_level(LevelFilter::Warn);
    } else if verbose == 1 {
        builder.filter_level(LevelFilter::Debug);
    } else if verbose > 1 {
        builder.filter_level(LevelFilter::Trace);
    }
    builder.init();
}

fn load_config(config_file: Option<&Path>) -> Result<HammerConfig, anyhow::Error> {
    let path = config_file.unwrap_or_else(|| Path::new("hammer.toml"));
    info!("Loading session from {path:?}");
    HammerConfig::load_from_file(path)
        .with_context(|| format!("Could not load session file {}", path.display()))
}

fn apply_overrides(config: &mut HammerConfig, args: FuzzArgs) {
    let session = &mut config.session;
    if let Some(app) = args.app {
        session.app = app;
    }
    if let Some(iterations) = args.iterations {
        session.budget.max_iterations = Some(iterations);
    }
    if let Some(duration) = args.duration {
        session.budget.max_duration_secs = Some(duration);
    }
    if let Some(workers) = args.workers {
        session.workers = workers;
    }
    if let Some(seed) = args.seed {
        session.random_seed = Some(seed);
    }
    if let Some(out) = args.out {
        session.out = out;
    }
    if let Some(mutator) = args.mutator {
        session.mutator = mutator;
    }
}

fn fuzz(mut config: HammerConfig, args: FuzzArgs) -> Result<(), anyhow::Error> {
    apply_overrides(&mut config, args);
    let runtime = default_runtime(&config.session);
    let fuzzer = Fuzzer::from_config(&config, runtime).context("Could not set up session")?;

    let stop = fuzzer.stop_handle();
    ctrlc::set_handler(move || {
        warn!("Interrupted, finishing in-flight iterations");
        stop.stop();
    })
    .context("Could not install Ctrl-C handler")?;

    let report = fuzzer.run();
    println!("{report}");

    match report.exit {
        SessionExit::Aborted(AbortReason::Interrupted) => Ok(()),
        SessionExit::Aborted(reason) => bail!("Session aborted: {reason}"),
        SessionExit::Completed | SessionExit::BudgetExhausted => Ok(()),
    }
}

fn replay(config: HammerConfig, record_path: &Path) -> Result<(), anyhow::Error> {
    let record = load_record(record_path)
        .with_context(|| format!("Could not read record {}", record_path.display()))?;
    let runtime = default_runtime(&config.session);
    let outcome = replay_record(&config, &record, runtime).context("Replay failed")?;

    println!(
        "Recorded {} over {} ({} mutation(s)), replay gave {}",
        record.outcome,
        record.seed_reference,
        record.mutation_chain.len(),
        outcome.verdict.kind
    );
    if let Some(detail) = &outcome.verdict.detail {
        println!("  {detail}");
    }
    if !outcome.reproduced() {
        bail!("Recorded {} did not reproduce", record.outcome);
    }
    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);
    let config = load_config(cli.config_file.as_deref())?;

    match cli.command {
        Command::Fuzz(args) => fuzz(config, args),
        Command::Replay { record } => replay(config, &record),
    }
}
