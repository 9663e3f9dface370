//! Command line interface of the `ingestbench` binary.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use argh::FromArgs;
use indicatif::{ProgressBar, ProgressStyle};
use yansi::Paint;

use crate::cache::DatasetCache;
use crate::config::Config;
use crate::generator::DataGenerator;
use crate::observability;
use crate::report::{CsvReport, MemorySink, print_totals};
use crate::runner::Runner;

/// Time-series ingestion benchmark.
#[derive(Debug, FromArgs)]
struct Args {
    /// path to the YAML configuration file
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,

    #[argh(subcommand)]
    pub command: Command,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    Run(RunCommand),
    Generate(GenerateCommand),
    Version(VersionCommand),
}

/// run the configured benchmark sweep and append results to the CSV reports
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "run")]
struct RunCommand {}

/// generate the datasets of the configured matrix into the dataset cache
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "generate")]
struct GenerateCommand {}

/// print the ingestbench version
#[derive(Default, Debug, FromArgs)]
#[argh(subcommand, name = "version")]
struct VersionCommand {}

/// Bootstrap the runtime and execute the CLI command.
pub fn execute() -> Result<()> {
    let args: Args = argh::from_env();

    // Special switch to just print the version and exit.
    if let Command::Version(_) = args.command {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = Config::load(args.config.as_deref())?;

    // Sentry should be initialized before creating the async runtime.
    let _sentry_guard = observability::init_sentry(&config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("main-rt")
        .enable_all()
        .worker_threads(config.runtime.worker_threads.max(1))
        .build()?;
    let _runtime_guard = runtime.enter();

    observability::init_tracing(&config);
    tracing::debug!(?config);

    runtime.block_on(async move {
        match args.command {
            Command::Run(RunCommand {}) => run(config).await,
            Command::Generate(GenerateCommand {}) => generate(config).await,
            Command::Version(VersionCommand {}) => unreachable!(),
        }
    })
}

async fn run(config: Config) -> Result<()> {
    let cases = config.matrix.cases();
    let targets = config.targets();

    let mut runner = Runner::new(DataGenerator::new(config.generator.seed))
        .with_load_options(config.load.options())
        .with_progress(std::io::stderr().is_terminal());
    if config.cache.enabled {
        runner = runner.with_cache(DatasetCache::new(config.cache.dir.clone()));
    }

    tracing::info!(
        cases = cases.len(),
        backends = targets.len(),
        results = %config.results.dir.display(),
        "starting sweep"
    );

    let mut sinks = (
        CsvReport::new(config.results.dir.clone()),
        MemorySink::new(),
    );
    runner.run(&cases, &targets, &mut sinks).await?;

    print_totals(sinks.1.results());
    Ok(())
}

async fn generate(config: Config) -> Result<()> {
    let generator = DataGenerator::new(config.generator.seed);
    let cache = DatasetCache::new(config.cache.dir.clone());
    let keys: Vec<_> = config.matrix.keys().collect();

    let bar = ProgressBar::new(keys.len() as u64)
        .with_style(ProgressStyle::with_template(
            "{spinner} {msg} [{pos}/{len}] {elapsed}",
        )?)
        .with_message("Generating datasets:");
    bar.enable_steady_tick(Duration::from_millis(100));

    let mut failed = 0;
    for key in &keys {
        let key = *key;
        let generator = generator.clone();
        let cache = cache.clone();
        let outcome =
            tokio::task::spawn_blocking(move || cache.load_or_generate(key, &generator)).await?;

        match outcome {
            Ok(dataset) => tracing::info!(case = %key, records = dataset.len(), "dataset ready"),
            Err(error) => {
                failed += 1;
                tracing::error!(case = %key, error = %error, "failed to generate dataset");
            }
        }
        bar.inc(1);
    }
    bar.finish_and_clear();

    println!();
    println!(
        "{} {} datasets in {} (seed: {})",
        "## CACHE".bold(),
        (keys.len() - failed).bold(),
        cache.dir().display(),
        generator.seed(),
    );

    if failed > 0 {
        anyhow::bail!("{failed} of {} datasets could not be generated", keys.len());
    }
    Ok(())
}
