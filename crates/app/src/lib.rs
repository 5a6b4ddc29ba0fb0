use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use tessera_core::codec::RasterImage;
use tessera_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use tessera_core::engine::UpscaleEngine;
use tessera_core::logging::{self, LoggingInitOptions, RedactingMakeWriter, DEFAULT_LOG_FILTER};
use tessera_core::model_cache::{cache_key, FsModelCache, HttpModelFetcher, ModelLoader};
use tessera_core::params::{calc_rendering_params, UpscaleConfig};
use tessera_core::pipeline::UpscaleProgress;
use tessera_core::session::OrtSessionFactory;

#[derive(Parser, Debug)]
#[command(name = "tessera", about = "Tiled neural image super-resolution")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upscale one image file.
    Upscale(UpscaleArgs),
    /// Print the tiling plan for an image size as JSON.
    Plan(PlanArgs),
    /// Print the model cache key for a locator.
    CacheKey {
        locator: String,
    },
}

#[derive(Args, Debug, Default, Clone, PartialEq)]
struct TilingArgs {
    #[arg(long, help = "Model magnification factor")]
    scale: Option<usize>,
    #[arg(long, help = "Output pixels trimmed from each tile edge")]
    offset: Option<usize>,
    #[arg(long = "tile-size", help = "Input tile edge length")]
    tile_size: Option<usize>,
}

impl TilingArgs {
    fn apply(&self, base: UpscaleConfig) -> UpscaleConfig {
        UpscaleConfig {
            scale: self.scale.unwrap_or(base.scale),
            offset: self.offset.unwrap_or(base.offset),
            tile_size: self.tile_size.unwrap_or(base.tile_size),
        }
    }
}

#[derive(Args, Debug)]
struct UpscaleArgs {
    #[arg(help = "Input image")]
    input: PathBuf,
    #[arg(help = "Output image; format follows the extension")]
    output: PathBuf,
    #[arg(short = 'm', long, help = "Model URL, file:// URL or path")]
    model: String,
    #[command(flatten)]
    tiling: TilingArgs,
    #[arg(
        long = "backend",
        value_name = "BACKEND",
        help = "Execution provider in priority order (repeatable: tensorrt, cuda, cpu)"
    )]
    backends: Vec<String>,
}

#[derive(Args, Debug)]
struct PlanArgs {
    #[arg(long)]
    width: usize,
    #[arg(long)]
    height: usize,
    #[command(flatten)]
    tiling: TilingArgs,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(&resolved_data_dir);

    match cli.command {
        Commands::Upscale(args) => run_upscale(args, resolved_data_dir).await,
        Commands::Plan(args) => run_plan(args, &resolved_data_dir),
        Commands::CacheKey { locator } => {
            println!("{}", cache_key(&locator));
            Ok(())
        }
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let plan = logging::compose_logging_init_plan(&init_options);
    let console_env_filter =
        parse_env_filter_with_fallback(&plan.filters.console_filter, "console");
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(RedactingMakeWriter::new(std::io::stderr))
        .with_filter(console_env_filter);

    let fallback = plan
        .file_sink
        .fallback_reason()
        .map(|reason| (plan.file_sink.log_dir().cloned(), reason.to_string()));

    let installed = match plan.file_sink.into_appender() {
        Some(appender) => {
            let file_env_filter =
                parse_env_filter_with_fallback(&plan.filters.file_filter, "file");
            let subscriber = tracing_subscriber::registry().with(console_layer).with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(RedactingMakeWriter::new(appender))
                    .with_filter(file_env_filter),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        None => tracing::subscriber::set_global_default(
            tracing_subscriber::registry().with(console_layer),
        ),
    };

    if let Err(error) = installed {
        eprintln!(
            "Failed to initialize tracing subscriber: {error}. \
             Continuing without structured tracing."
        );
        return;
    }

    if let Some((attempted_log_dir, reason)) = fallback {
        let attempted_log_dir = attempted_log_dir
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<none>".to_string());
        warn!(
            attempted_log_dir = %attempted_log_dir,
            reason = %reason,
            "Persistent file logging unavailable; continuing with console-only logging"
        );
    }
}

fn parse_env_filter_with_fallback(
    filter: &str,
    sink_name: &str,
) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. \
             Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    info!(
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %format!("{e:#}"), "Failed to initialize data directory");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

fn run_plan(args: PlanArgs, data_dir: &Path) -> Result<()> {
    let config = AppConfig::load_from_path(&config_path(data_dir)).unwrap_or_default();
    let upscale = args.tiling.apply(config.upscale);
    let params = calc_rendering_params(args.width, args.height, &upscale, &config.limits)
        .context("invalid tiling configuration")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&params).context("failed to encode plan")?
    );
    Ok(())
}

async fn run_upscale(args: UpscaleArgs, data_dir: PathBuf) -> Result<()> {
    let mut config = load_config(&data_dir);
    if !args.backends.is_empty() {
        config.engine.backends = args.backends.clone();
    }
    let upscale = args.tiling.apply(config.upscale);

    let image = decode_image(&args.input)?;
    info!(
        input = %args.input.display(),
        width = image.width(),
        height = image.height(),
        "Decoded input"
    );

    let cache = FsModelCache::new(config.model_cache_dir(&data_dir));
    let loader = ModelLoader::new(Arc::new(cache), Arc::new(HttpModelFetcher::new()));
    let factory = OrtSessionFactory::new(config.session_config(&data_dir));
    let engine = UpscaleEngine::spawn(Arc::new(factory), loader, config.engine_options())?;

    let outcome = upscale_with_engine(&engine, &args.model, image, upscale).await;
    if let Err(error) = engine.shutdown().await {
        warn!(error = %format!("{error:#}"), "Engine shutdown failed");
    }
    let output = outcome?;

    encode_image(&args.output, &output)?;
    info!(
        output = %args.output.display(),
        width = output.width(),
        height = output.height(),
        "Upscale written"
    );
    Ok(())
}

async fn upscale_with_engine(
    engine: &UpscaleEngine,
    model: &str,
    image: RasterImage,
    config: UpscaleConfig,
) -> Result<RasterImage> {
    let backend = engine.load_model(model).await.context("failed to load model")?;
    info!(%backend, "Model ready");

    let job = engine.upscale(image, config).await?;
    let cancel = job.cancel_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after the current tile");
            cancel.cancel();
        }
    });

    let start = Instant::now();
    let result = job
        .wait(|progress| {
            let line = render_progress(progress, start.elapsed().as_secs_f64());
            eprint!("\r{line}    ");
        })
        .await;
    interrupt.abort();
    eprintln!();

    Ok(result?)
}

fn decode_image(path: &Path) -> Result<RasterImage> {
    let decoded = image::open(path)
        .with_context(|| format!("failed to decode image: {}", path.display()))?
        .to_rgba8();
    let (width, height) = decoded.dimensions();
    RasterImage::new(width as usize, height as usize, decoded.into_raw())
}

fn encode_image(path: &Path, raster: &RasterImage) -> Result<()> {
    let rgba = image::RgbaImage::from_raw(
        raster.width() as u32,
        raster.height() as u32,
        raster.data().to_vec(),
    )
    .context("raster buffer does not match its dimensions")?;

    let dynamic = image::DynamicImage::ImageRgba8(rgba);
    let saved = if format_drops_alpha(path) {
        dynamic.to_rgb8().save(path)
    } else {
        dynamic.save(path)
    };
    saved.with_context(|| format!("failed to write image: {}", path.display()))
}

fn format_drops_alpha(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| matches!(ext.to_ascii_lowercase().as_str(), "jpg" | "jpeg"))
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;

fn render_progress(progress: UpscaleProgress, elapsed: f64) -> String {
    let fraction = if progress.total > 0 {
        (progress.current as f64 / progress.total as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let bar = "█".repeat(filled) + &"░".repeat(PROGRESS_BAR_WIDTH.saturating_sub(filled));

    let rate = if elapsed > 0.0 {
        progress.current as f64 / elapsed
    } else {
        0.0
    };
    let eta = if rate > 0.0 {
        let remaining = progress.total.saturating_sub(progress.current) as f64;
        format!(" | ETA: {}", format_duration(remaining / rate))
    } else {
        String::new()
    };

    format!(
        "[{}] {:3}% | Tile {}/{} | {:.2} tiles/s | Elapsed: {}{}",
        bar,
        progress.percentage,
        progress.current,
        progress.total,
        rate,
        format_duration(elapsed),
        eta,
    )
}
