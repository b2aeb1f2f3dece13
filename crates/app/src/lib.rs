use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use cfaraw_core::cfa::{CfaPattern, Colorizer};
use cfaraw_core::config::{config_path, data_dir, DeviceKind, RunConfig};
use cfaraw_core::dataset::PairedDataset;
use cfaraw_core::device::Device;
use cfaraw_core::loader::{load_images, ImageStack, LoadOptions};
use cfaraw_core::crash::{self, CrashHook};
use cfaraw_core::logging::{
    self, FileSink, LogFilters, LogSettings, DEFAULT_LOG_FILTER, LOG_RETENTION_FILES,
};
use cfaraw_core::loss::LossKind;
use cfaraw_core::model::DenoisingAutoencoder;
use cfaraw_core::report::{
    load_model, save_comparison_grid, save_losses, save_model, ArtifactPaths,
};
use cfaraw_core::train::{train, TrainOptions};
use cfaraw_core::validate::{preview, validate};

const CLEAN_EXTENSION: &str = "png";
const TRAIN_SUBDIR: &str = "train";
const VAL_SUBDIR: &str = "val";

#[derive(Parser, Debug)]
#[command(
    name = "cfaraw",
    about = "Train and evaluate an image denoiser on paired clean/noisy datasets"
)]
struct Cli {
    #[arg(long, value_name = "DIR", help = "Clean dataset root (with train/ and val/)")]
    clean: PathBuf,

    #[arg(long, value_name = "DIR", help = "Noisy dataset root (with train/ and val/)")]
    noise: PathBuf,

    #[arg(long, value_name = "DIR", help = "Directory for run artifacts")]
    output: PathBuf,

    #[arg(long, help = "Prefix for artifact file names")]
    name: String,

    #[arg(
        long = "type",
        value_name = "EXT",
        help = "Noisy file type (png, tif, jpg, bmp or npy for raw mosaics)"
    )]
    file_type: String,

    #[arg(long, help = "Train for this many epochs")]
    epochs: Option<usize>,

    #[arg(long, value_name = "PATH", help = "Validate this saved model")]
    model: Option<PathBuf>,

    #[arg(long, value_enum, ignore_case = true, default_value_t = LossArg::L2)]
    loss: LossArg,

    #[arg(long, help = "Random 4-way crop augmentation of training pairs")]
    cfa_augment: bool,

    #[arg(long, help = "Feed raw mosaics as channel 0 of a zero tensor instead of colorizing")]
    cfa_expand: bool,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long, value_name = "PATH", help = "Config file (default: <data-dir>/config.toml)")]
    config: Option<PathBuf>,

    #[arg(long, help = "Seed for weight init, shuffling and crops")]
    seed: Option<u64>,

    #[arg(long, value_enum)]
    device: Option<DeviceArg>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LossArg {
    #[value(name = "L1")]
    L1,
    #[value(name = "L1smooth")]
    L1Smooth,
    #[value(name = "L2")]
    L2,
}

impl From<LossArg> for LossKind {
    fn from(arg: LossArg) -> Self {
        match arg {
            LossArg::L1 => Self::L1,
            LossArg::L1Smooth => Self::L1Smooth,
            LossArg::L2 => Self::L2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum DeviceArg {
    Auto,
    Cpu,
    Accelerator,
}

impl From<DeviceArg> for DeviceKind {
    fn from(arg: DeviceArg) -> Self {
        match arg {
            DeviceArg::Auto => Self::Auto,
            DeviceArg::Cpu => Self::Cpu,
            DeviceArg::Accelerator => Self::Accelerator,
        }
    }
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(&resolved_data_dir);

    run(&cli, &resolved_data_dir)
}

fn run(cli: &Cli, data_dir: &Path) -> Result<()> {
    if cli.epochs.is_none() && cli.model.is_none() {
        info!("Nothing to do: pass --epochs to train and/or --model to validate");
        return Ok(());
    }

    let mut config = load_run_config(cli, data_dir)?;
    apply_cli_overrides(&mut config, cli);
    let seed = *config.training.seed.get_or_insert_with(rand::random);
    let device = config.device.kind.resolve();

    info!(%device, threads = device.threads(), "DEVICE");
    info!(args = ?cli, "Run arguments");
    info!(seed, config = ?config, "Effective configuration");

    fs::create_dir_all(&cli.output).with_context(|| {
        format!("failed to create output directory: {}", cli.output.display())
    })?;
    let paths = ArtifactPaths::new(&cli.output, &cli.name);
    config.save_to_path(&paths.config)?;

    let colorizer: Arc<dyn Colorizer> = Arc::new(
        config
            .loader
            .cfa_pattern
            .parse::<CfaPattern>()
            .context("invalid [loader].cfa_pattern")?,
    );
    let mut rng = StdRng::seed_from_u64(seed);

    if let Some(epochs) = cli.epochs {
        run_training(cli, &config, &paths, epochs, device, &colorizer, &mut rng)?;
    }
    if let Some(model_path) = cli.model.as_deref() {
        run_validation(cli, &config, &paths, model_path, device, &colorizer)?;
    }
    Ok(())
}

fn load_run_config(cli: &Cli, data_dir: &Path) -> Result<RunConfig> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| config_path(data_dir));
    let config = RunConfig::load_from_path(&path)?;
    info!(path = %path.display(), exists = path.exists(), "Loaded run config");
    Ok(config)
}

fn apply_cli_overrides(config: &mut RunConfig, cli: &Cli) {
    if let Some(seed) = cli.seed {
        config.training.seed = Some(seed);
    }
    if let Some(device) = cli.device {
        config.device.kind = device.into();
    }
}

fn load_pair(
    cli: &Cli,
    config: &RunConfig,
    subdir: &str,
    device: Device,
    colorizer: &Arc<dyn Colorizer>,
) -> Result<(ImageStack, ImageStack)> {
    let clean = load_images(
        &cli.clean.join(subdir),
        &LoadOptions::new(CLEAN_EXTENSION).with_device(device),
    )
    .context("failed to load clean dataset")?;

    let noisy_options = LoadOptions {
        extension: cli.file_type.clone(),
        expand: expands_noise(cli, subdir),
        expand_channels: config.loader.expand_channels,
        colorizer: Arc::clone(colorizer),
        device,
    };
    let noisy = load_images(&cli.noise.join(subdir), &noisy_options)
        .context("failed to load noisy dataset")?;

    Ok((clean, noisy))
}

/// `--cfa-expand` only reshapes the training noise; validation always colorizes.
fn expands_noise(cli: &Cli, subdir: &str) -> bool {
    cli.cfa_expand && subdir == TRAIN_SUBDIR
}

fn run_training(
    cli: &Cli,
    config: &RunConfig,
    paths: &ArtifactPaths,
    epochs: usize,
    device: Device,
    colorizer: &Arc<dyn Colorizer>,
    rng: &mut StdRng,
) -> Result<()> {
    let (clean, noisy) = load_pair(cli, config, TRAIN_SUBDIR, device, colorizer)?;
    let dataset = PairedDataset::new(&clean, &noisy)?.with_crop_augment(cli.cfa_augment)?;

    let [channels, _, _] = clean.sample_shape();
    let model = DenoisingAutoencoder::new(channels, config.model.hidden_channels, rng);
    let options = TrainOptions::from_config(epochs, cli.loss.into(), config);

    let started = Instant::now();
    let outcome = train(model, &dataset, &options, device, rng)?;
    info!(
        elapsed = %format_duration(started.elapsed().as_secs_f64()),
        applied_steps = outcome.applied_steps,
        skipped_steps = outcome.skipped_steps,
        final_scale = outcome.final_scale,
        "Training finished"
    );

    save_model(&outcome.model, &paths.model)
}

fn run_validation(
    cli: &Cli,
    config: &RunConfig,
    paths: &ArtifactPaths,
    model_path: &Path,
    device: Device,
    colorizer: &Arc<dyn Colorizer>,
) -> Result<()> {
    let model = load_model(model_path)?;
    let (clean, noisy) = load_pair(cli, config, VAL_SUBDIR, device, colorizer)?;

    let losses = validate(
        &model,
        &clean,
        &noisy,
        config.validation.batch_size,
        device,
    )?;
    save_losses(&losses, &paths.losses)?;

    let samples = preview(
        &model,
        &clean,
        &noisy,
        config.validation.preview_samples,
        device,
    )?;
    save_comparison_grid(&samples, &paths.grid)
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let crash_hook = crash::install_crash_hook(data_dir);
    let filters = LogFilters::resolve(&LogSettings::from_env(verbose, cli_log_filter));
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filters.console, "console"));

    let sink = logging::open_file_sink(data_dir, LOG_RETENTION_FILES);
    let sink_problem = match sink {
        FileSink::Ready { appender, .. } => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(appender)
                .with_filter(parse_env_filter_with_fallback(&filters.file, "file"));
            let installed = tracing_subscriber::registry()
                .with(console_layer)
                .with(file_layer)
                .try_init();
            if let Err(error) = installed {
                eprintln!("Failed to initialize tracing subscriber: {error}. Continuing without structured tracing.");
                return;
            }
            None
        }
        FileSink::Unavailable { dir, reason } => {
            let installed = tracing_subscriber::registry().with(console_layer).try_init();
            if let Err(error) = installed {
                eprintln!("Failed to initialize tracing subscriber: {error}. Continuing without structured tracing.");
                return;
            }
            Some((dir, reason))
        }
    };

    if let Some((dir, reason)) = sink_problem {
        warn!(
            log_dir = ?dir,
            reason = %reason,
            "File logging unavailable; logging to the console only"
        );
    }
    if let CrashHook::Unavailable { dir, reason } = crash_hook {
        warn!(
            crash_dir = ?dir,
            reason = %reason,
            "Crash reports disabled"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    let pid = std::process::id();
    let cfg_path = config_path(data_dir);
    info!(
        pid,
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %cfg_path.display(),
        "Runtime startup metadata"
    );
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}


#[cfg(test)]
mod run_tests {
    use super::*;

    #[test]
    fn nothing_to_do_creates_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = dir.path().join("out");
        let output_arg = output.to_string_lossy().to_string();
        let cli = Cli::try_parse_from([
            "cfaraw", "--clean", "c", "--noise", "n", "--output", output_arg.as_str(), "--name",
            "run", "--type", "png",
        ])
        .expect("parse");

        run(&cli, dir.path()).expect("nothing to do is not an error");
        assert!(!output.exists());
    }

    #[test]
    fn missing_training_data_fails_after_writing_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = dir.path().join("out");
        let output_arg = output.to_string_lossy().to_string();
        let clean_arg = dir.path().join("clean").to_string_lossy().to_string();
        let cli = Cli::try_parse_from([
            "cfaraw",
            "--clean",
            clean_arg.as_str(),
            "--noise",
            clean_arg.as_str(),
            "--output",
            output_arg.as_str(),
            "--name",
            "run",
            "--type",
            "png",
            "--epochs",
            "1",
            "--seed",
            "1",
        ])
        .expect("parse");

        let err = run(&cli, dir.path()).expect_err("empty dataset");
        assert!(format!("{err:#}").contains("no 'png' files"));
        let saved = RunConfig::load_from_path(&output.join("run-config.toml")).expect("config");
        assert_eq!(saved.training.seed, Some(1));
    }
}
