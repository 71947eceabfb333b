mod harnesses;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use fuzzbridge_core::config::{BridgeConfig, DEFAULT_CONFIG_FILE};
use fuzzbridge_core::status::ERROR_EXIT_CODE;
use fuzzbridge_core::supervisor::PRELOAD_VAR;
use fuzzbridge_core::{
    ArgVector, ChildCommand, Composer, NativeExtension, SanitizerFlavor, TraceReport, driver,
    libfuzzer_is_loaded, run_isolated, trace_callable, trace_harness,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "fuzzbridge")]
#[command(author, version, about = "Drive libFuzzer against uninstrumented harnesses.", long_about = None)]
struct Cli {
    /// TOML configuration; defaults to `fuzzbridge.toml` when present.
    #[arg(short, long = "config", value_name = "PATH", value_parser, global = true)]
    config_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Hand a harness to the engine's mutation loop. Does not return.
    Fuzz {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long)]
        max_total_time: Option<u64>,
        #[arg(long)]
        exact_artifact_path: Option<PathBuf>,
        /// Extra engine flags and corpus directories, passed through untouched.
        #[arg(last = true)]
        engine_args: Vec<String>,
    },
    /// Run a harness once on one input, outside the mutation loop.
    Trace {
        #[command(flatten)]
        target: TargetArgs,
        /// File holding the input; defaults to the empty input.
        #[arg(long, conflicts_with = "data")]
        input: Option<PathBuf>,
        /// Inline input, taken as UTF-8 bytes.
        #[arg(long)]
        data: Option<String>,
    },
    /// Merge sanitizer runtimes with the engine's no-main runtime.
    Compose {
        #[arg(long = "flavor")]
        flavors: Vec<SanitizerFlavor>,
        #[arg(long)]
        out_dir: Option<PathBuf>,
        #[arg(long)]
        cc: Option<PathBuf>,
        #[arg(long)]
        ar: Option<PathBuf>,
    },
    /// Re-run this tool in a child with a merged runtime preloaded.
    Launch {
        /// Merged object to preload; defaults to the composed one for `--flavor`.
        #[arg(long)]
        preload: Option<PathBuf>,
        #[arg(long, default_value = "asan")]
        flavor: SanitizerFlavor,
        /// Outer wall-clock limit for the child, in seconds.
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(last = true, required = true)]
        args: Vec<String>,
    },
    /// Print whether the engine is loaded in this process.
    IsLoaded,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct TargetArgs {
    /// Shared object exporting `LLVMFuzzerTestOneInput`.
    #[arg(long)]
    harness: Option<PathBuf>,
    /// One of the built-in demo harnesses.
    #[arg(long, value_parser = clap::builder::PossibleValuesParser::new(harnesses::NAMES))]
    builtin: Option<String>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Stderr, so our lines interleave with the engine's own output.
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<BridgeConfig, anyhow::Error> {
    match path {
        Some(config_path) => {
            info!(?config_path, "loading configuration");
            BridgeConfig::load_from_file(config_path)
        }
        None => {
            let default_config_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_config_path.exists() {
                info!(?default_config_path, "loading default configuration");
                BridgeConfig::load_from_file(&default_config_path)
            } else {
                debug!("no configuration file found, using built-in defaults");
                Ok(BridgeConfig::default())
            }
        }
    }
}

fn fuzz(
    mut config: BridgeConfig,
    target: TargetArgs,
    max_total_time: Option<u64>,
    exact_artifact_path: Option<PathBuf>,
    engine_args: Vec<String>,
) -> Result<ExitCode, anyhow::Error> {
    if max_total_time.is_some() {
        config.driver.max_total_time = max_total_time;
    }
    if exact_artifact_path.is_some() {
        config.driver.exact_artifact_path = exact_artifact_path;
    }
    config.driver.extra_args.extend(engine_args);
    let args = ArgVector::new(config.driver.to_args())?;
    debug!(args = ?args.as_slice(), "effective engine arguments");

    let code = match (target.harness, target.builtin) {
        (Some(path), _) => {
            let extension = NativeExtension::open(&path)?;
            driver::run_with(&args, extension)
        }
        (None, Some(name)) => {
            let harness = harnesses::lookup(&name)
                .with_context(|| format!("Unknown built-in harness '{name}'"))?;
            driver::run_with(&args, harness)
        }
        (None, None) => bail!("Either --harness or --builtin is required"),
    };
    match code {
        Ok(code) => Ok(ExitCode::from(code as u8)),
        Err(e) => {
            error!(error = %e, "cannot start fuzzing session");
            eprintln!("ERROR: {e}");
            Ok(ExitCode::from(ERROR_EXIT_CODE as u8))
        }
    }
}

fn print_report(report: &TraceReport) {
    println!("verdict: {:?}", report.verdict);
    println!("input md5: {}", report.input_digest);
    println!("new branches: {}", report.new_branches);
    println!("events: {}", report.events.len());
    for event in &report.events {
        println!(
            "  {:?} w{} {:#x} {:#x}",
            event.op,
            event.width.bytes(),
            event.left,
            event.right
        );
    }
}

fn trace(target: TargetArgs, input: Option<PathBuf>, data: Option<String>) -> Result<ExitCode, anyhow::Error> {
    let input = match (input, data) {
        (Some(path), _) => {
            std::fs::read(&path).with_context(|| format!("Failed to read input file {path:?}"))?
        }
        (None, Some(data)) => data.into_bytes(),
        (None, None) => Vec::new(),
    };
    let report = match (target.harness, target.builtin) {
        (Some(path), _) => trace_harness(&path, &input)?,
        (None, Some(name)) => {
            let harness = harnesses::lookup(&name)
                .with_context(|| format!("Unknown built-in harness '{name}'"))?;
            trace_callable(harness, &input)
        }
        (None, None) => bail!("Either --harness or --builtin is required"),
    };
    print_report(&report);
    Ok(ExitCode::SUCCESS)
}

fn compose(
    mut config: BridgeConfig,
    flavors: Vec<SanitizerFlavor>,
    out_dir: Option<PathBuf>,
    cc: Option<PathBuf>,
    ar: Option<PathBuf>,
) -> ExitCode {
    if !flavors.is_empty() {
        config.composer.flavors = flavors;
    }
    if let Some(out_dir) = out_dir {
        config.composer.out_dir = out_dir;
    }
    if let Some(cc) = cc {
        config.composer.cc = cc;
    }
    if let Some(ar) = ar {
        config.composer.ar = ar;
    }
    let composer = Composer::new(config.composer.toolchain(), &config.composer.out_dir);
    match composer.compose_all(&config.composer.flavors) {
        Ok(outputs) => {
            for output in outputs {
                println!("{}", output.display());
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "composing sanitizer runtimes failed");
            eprintln!("ERROR: {e}");
            ExitCode::FAILURE
        }
    }
}

fn launch(
    config: BridgeConfig,
    preload: Option<PathBuf>,
    flavor: SanitizerFlavor,
    timeout: Option<u64>,
    args: Vec<String>,
) -> Result<ExitCode, anyhow::Error> {
    let object = preload.unwrap_or_else(|| config.composer.out_dir.join(flavor.output_name()));
    if !object.is_file() {
        bail!(
            "Merged runtime {object:?} does not exist; run `fuzzbridge compose --flavor {flavor}` first"
        );
    }
    let exe = std::env::current_exe().context("Failed to locate the fuzzbridge executable")?;
    let mut command = ChildCommand::new(exe).args(args).preload(&object).inherit_output();
    if let Some(secs) = timeout {
        command = command.timeout(Duration::from_secs(secs));
    }
    info!(?object, var = PRELOAD_VAR, "launching with merged runtime preloaded");
    let report = run_isolated(&command)?;
    if let Some(signal) = report.signal {
        warn!(signal, "child was killed by a signal");
    }
    info!(status = %report.status(), "child finished");
    let code = match report.exit_code {
        Some(code) => code as u8,
        None => report.status().code() as u8,
    };
    Ok(ExitCode::from(code))
}

fn try_main() -> Result<ExitCode, anyhow::Error> {
    let cli = Cli::parse();
    let config = load_config(cli.config_file.as_ref())?;
    debug!(?config, "effective configuration");

    match cli.command {
        Command::Fuzz {
            target,
            max_total_time,
            exact_artifact_path,
            engine_args,
        } => fuzz(config, target, max_total_time, exact_artifact_path, engine_args),
        Command::Trace { target, input, data } => trace(target, input, data),
        Command::Compose {
            flavors,
            out_dir,
            cc,
            ar,
        } => Ok(compose(config, flavors, out_dir, cc, ar)),
        Command::Launch {
            preload,
            flavor,
            timeout,
            args,
        } => launch(config, preload, flavor, timeout, args),
        Command::IsLoaded => {
            println!("{}", libfuzzer_is_loaded());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn main() -> ExitCode {
    init_tracing();
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            eprintln!("ERROR: {err:#}");
            ExitCode::from(ERROR_EXIT_CODE as u8)
        }
    }
}
