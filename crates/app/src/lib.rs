use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use tilescale_core::config::{DataDir, RenderConfig};
use tilescale_core::convert::{self, RgbaImage};
use tilescale_core::geometry::{GeometryParams, TileDescriptor, TileGeometry, DEFAULT_BLEND_SIZE};
use tilescale_core::job::{JobReport, Progress, Reporter};
use tilescale_core::logging::{FilterSource, LogFile, DEFAULT_LOG_FILTER};
use tilescale_core::model::{ModelCatalog, ModelSpec};
use tilescale_core::onnx::{InferenceBackend, OnnxRuntime};
use tilescale_core::{
    JobControl, JobController, JobOutcome, LiveParams, RenderParams, RenderServices, TtaLevel,
};

#[derive(Parser)]
#[command(name = "tilescale", about = "Tiled neural image upscaling")]
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

#[derive(Subcommand)]
enum Commands {
    /// Upscale a PNG image.
    Upscale(UpscaleArgs),
    /// Print the tile layout for an image size as JSON.
    Plan(PlanArgs),
}

#[derive(Args)]
struct UpscaleArgs {
    #[arg(help = "Input PNG")]
    input: PathBuf,
    #[arg(short = 'o', long, help = "Output PNG")]
    output: PathBuf,
    #[arg(long, help = "Model as arch or arch.style, e.g. swin_unet.photo")]
    model: Option<String>,
    #[arg(long, allow_negative_numbers = true, help = "Denoise level -1..=3 (-1 disables)")]
    noise: Option<i8>,
    #[arg(long)]
    scale: Option<u32>,
    #[arg(long)]
    tile_size: Option<u32>,
    #[arg(long, value_parser = parse_tta_level, help = "Test-time augmentation: 0, 2 or 4")]
    tta: Option<TtaLevel>,
    #[arg(long, help = "Process tiles in random order")]
    random: bool,
    #[arg(long, value_name = "X,Y", value_parser = parse_focus, help = "Start with the tiles nearest to this output pixel")]
    focus: Option<(f64, f64)>,
    #[arg(long, overrides_with = "no_alpha", help = "Upscale the alpha channel")]
    alpha: bool,
    #[arg(long, overrides_with = "alpha", help = "Composite over the background and drop alpha")]
    no_alpha: bool,
    #[arg(long)]
    antialias: bool,
    #[arg(long, help = "Run the model in linear light")]
    linear: bool,
    #[arg(long, help = "cpu, cuda or tensorrt")]
    backend: Option<String>,
    #[arg(long, help = "Seed for --random")]
    seed: Option<u64>,
}

#[derive(Args)]
struct PlanArgs {
    #[arg(long)]
    width: u32,
    #[arg(long)]
    height: u32,
    #[arg(long)]
    scale: u32,
    #[arg(long)]
    offset: u32,
    #[arg(long)]
    tile_size: u32,
    #[arg(long, default_value_t = DEFAULT_BLEND_SIZE)]
    blend_size: u32,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let data_dir = DataDir::locate(cli.data_dir.as_deref());
    init_logging(&data_dir, cli.verbose, cli.log_filter.as_deref());

    match cli.command {
        Commands::Plan(args) => run_plan(&args),
        Commands::Upscale(args) => {
            tilescale_core::runtime::setup_runtime_libs(&[data_dir.lib_dir()]);
            tilescale_core::runtime::log_runtime_lib_status();
            info!(
                pid = std::process::id(),
                data_dir = %data_dir.root().display(),
                config = %data_dir.config_file().display(),
                "Runtime startup metadata"
            );
            run_upscale(args, &data_dir).await
        }
    }
}

fn init_logging(data_dir: &DataDir, verbose: u8, log_filter: Option<&str>) {
    let rust_log = std::env::var("RUST_LOG").ok();
    let source = FilterSource::select(log_filter, verbose, rust_log.as_deref());
    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&source.console_directives(), "console"));

    let (file, console_only_reason) = match LogFile::open(Some(&data_dir.log_dir())) {
        LogFile::Daily { appender, .. } => {
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(appender)
                .with_filter(parse_env_filter_with_fallback(&source.file_directives(), "file"));
            (Some(layer), None)
        }
        LogFile::ConsoleOnly { reason } => (None, Some(reason)),
    };

    let subscriber = tracing_subscriber::registry().with(console).with(file);
    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to initialize tracing subscriber: {error}. Continuing without structured tracing.");
        return;
    }
    if let Some(reason) = console_only_reason {
        warn!(reason = %reason, "Persistent file logging unavailable; logging to the console only");
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

fn parse_tta_level(s: &str) -> Result<TtaLevel, String> {
    let level: u8 = s
        .trim()
        .parse()
        .map_err(|_| format!("'{s}' is not a number"))?;
    TtaLevel::try_from(level)
}

fn parse_focus(s: &str) -> Result<(f64, f64), String> {
    let (x, y) = s
        .split_once(',')
        .ok_or_else(|| format!("expected X,Y, got '{s}'"))?;
    let parse = |v: &str| {
        v.trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| format!("'{v}' is not a finite number"))
    };
    Ok((parse(x)?, parse(y)?))
}

/// `--alpha`/`--no-alpha` win; otherwise alpha is kept when the config asks
/// for detection and the image has a transparent pixel.
fn resolve_keep_alpha(args: &UpscaleArgs, render: &RenderConfig, image: &RgbaImage) -> bool {
    if args.alpha {
        true
    } else if args.no_alpha {
        false
    } else {
        render.detect_alpha && convert::has_transparency(image)
    }
}

fn build_render_params(
    args: &UpscaleArgs,
    render: &RenderConfig,
    catalog: &ModelCatalog,
    image: &RgbaImage,
) -> Result<(ModelSpec, RenderParams)> {
    let spec = ModelSpec::parse(
        args.model.as_deref().unwrap_or(&render.model),
        args.scale.unwrap_or(render.scale),
        args.noise.unwrap_or(render.noise),
    )?;
    let mut params = catalog.render_params(&spec, args.tile_size.unwrap_or(render.tile_size))?;

    params.keep_alpha = resolve_keep_alpha(args, render, image);
    params.tta_level = args.tta.unwrap_or(render.tta_level);
    params.antialias = args.antialias || render.antialias;
    params.linear_light = args.linear || render.linear_light;
    params.blend_size = render.blend_size;
    params.alpha_threshold = render.alpha_threshold;
    params.background = render.background;
    params.seed = args.seed;

    Ok((spec, params))
}

fn load_png(path: &Path) -> Result<RgbaImage> {
    let decoded = image::open(path)
        .with_context(|| format!("failed to read image: {}", path.display()))?
        .to_rgba8();
    let (width, height) = decoded.dimensions();
    Ok(RgbaImage::new(width, height, decoded.into_raw())?)
}

fn save_png(path: &Path, output: RgbaImage) -> Result<()> {
    let (width, height) = (output.width(), output.height());
    let buffer = image::RgbaImage::from_raw(width, height, output.into_raw())
        .context("output buffer does not match its dimensions")?;
    buffer
        .save_with_format(path, image::ImageFormat::Png)
        .with_context(|| format!("failed to write image: {}", path.display()))
}

async fn run_upscale(args: UpscaleArgs, data_dir: &DataDir) -> Result<()> {
    let config = data_dir.initialize()?;

    let image = load_png(&args.input)?;
    let catalog = ModelCatalog::new(data_dir.resolve(&config.paths.models_dir));
    let (spec, params) = build_render_params(&args, &config.render, &catalog, &image)?;

    for id in [&params.model, params.alpha_model()] {
        if !catalog.is_installed(id) {
            bail!("model {id} is not installed (expected {})", catalog.model_path(id).display());
        }
    }
    if spec.arch.prefers_large_tiles(&spec.style) == Some(true) && params.tile_size < 256 {
        warn!(
            model = %params.model,
            tile_size = params.tile_size,
            "This model works best with tile sizes of 256 or more"
        );
    }

    let backend = args
        .backend
        .as_deref()
        .map(InferenceBackend::from_str_lossy)
        .unwrap_or(config.inference.backend);
    let runtime = Arc::new(
        OnnxRuntime::new(catalog, backend)
            .with_trt_cache_dir(data_dir.resolve(&config.paths.trt_cache_dir)),
    );
    let controller = JobController::new(RenderServices::new(runtime.clone(), runtime));

    let (control, signal) = JobControl::new();
    let control = Arc::new(control);
    {
        let control = control.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!();
                warn!("Interrupted; stopping after the current tile");
                control.stop();
            }
        });
    }

    let live = LiveParams::new(args.random || config.render.tile_random);
    live.set_focus(args.focus);

    info!(
        input = %args.input.display(),
        width = image.width(),
        height = image.height(),
        model = %params.model,
        backend = %backend,
        "Upscaling"
    );
    let outcome = controller
        .start(&image, &params, signal, live, Some(progress_reporter()))
        .await?;
    eprintln!();

    match outcome {
        JobOutcome::Completed(output) => {
            save_png(&args.output, output)?;
            info!(output = %args.output.display(), "Done");
            Ok(())
        }
        JobOutcome::Aborted {
            partial,
            remaining_tiles,
        } => {
            save_png(&args.output, partial)?;
            warn!(
                output = %args.output.display(),
                remaining_tiles,
                "Stopped early; wrote partial image"
            );
            Ok(())
        }
        JobOutcome::Errored { partial, error } => {
            save_png(&args.output, partial)?;
            Err(anyhow::Error::new(error)
                .context(format!("upscale failed; partial image written to {}", args.output.display())))
        }
    }
}

fn run_plan(args: &PlanArgs) -> Result<()> {
    let geometry = TileGeometry::compute(&GeometryParams {
        input_width: args.width,
        input_height: args.height,
        scale: args.scale,
        offset: args.offset,
        tile_size: args.tile_size,
        blend_size: args.blend_size,
    })?;
    let tiles: Vec<TileDescriptor> = geometry.tiles().collect();
    let plan = serde_json::json!({
        "geometry": geometry,
        "tiles": tiles,
    });
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;

fn format_progress(progress: &Progress, elapsed: f64) -> String {
    let fraction = if progress.pixels_total > 0 {
        (progress.pixels_completed as f64 / progress.pixels_total as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
    let bar: String = "█".repeat(filled) + &"░".repeat(empty);

    let eta = if fraction > 0.0 && fraction < 1.0 {
        format!(" | ETA: {}", format_duration(elapsed / fraction * (1.0 - fraction)))
    } else {
        String::new()
    };

    format!(
        "[{}] {:5.1}% | Tile {}/{} | Elapsed: {}{}",
        bar,
        fraction * 100.0,
        progress.tiles_completed,
        progress.tiles_total,
        format_duration(elapsed),
        eta,
    )
}

fn progress_reporter() -> Reporter {
    let start = Instant::now();
    Arc::new(move |report: &JobReport| match report {
        JobReport::Started { progress, .. } | JobReport::TileCompleted { progress, .. } => {
            eprint!("\r{}    ", format_progress(progress, start.elapsed().as_secs_f64()));
        }
        JobReport::Paused => eprint!("\r[paused]"),
        _ => {}
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upscale_args(extra: &[&str]) -> UpscaleArgs {
        let mut argv = vec!["tilescale", "upscale", "in.png", "-o", "out.png"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).expect("cli should parse").command {
            Commands::Upscale(args) => args,
            Commands::Plan(_) => panic!("expected upscale"),
        }
    }

    fn image_with_alpha(alpha: u8) -> RgbaImage {
        RgbaImage::new(2, 1, vec![10, 20, 30, 255, 40, 50, 60, alpha]).unwrap()
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0.0), "00:00:00");
        assert_eq!(format_duration(59.4), "00:00:59");
        assert_eq!(format_duration(3725.0), "01:02:05");
    }

    #[test]
    fn test_format_progress_shows_tiles_and_eta() {
        let progress = Progress {
            tiles_total: 9,
            tiles_completed: 3,
            pixels_total: 1000,
            pixels_completed: 250,
        };
        let line = format_progress(&progress, 10.0);
        assert!(line.contains(" 25.0%"), "{line}");
        assert!(line.contains("Tile 3/9"), "{line}");
        assert!(line.contains("ETA: 00:00:30"), "{line}");

        let done = Progress {
            pixels_completed: 1000,
            tiles_completed: 9,
            ..progress
        };
        assert!(!format_progress(&done, 10.0).contains("ETA"));
    }

    #[test]
    fn test_parse_focus() {
        assert_eq!(parse_focus("10,20.5"), Ok((10.0, 20.5)));
        assert_eq!(parse_focus(" 3 , 4 "), Ok((3.0, 4.0)));
        assert!(parse_focus("10").is_err());
        assert!(parse_focus("a,1").is_err());
        assert!(parse_focus("inf,1").is_err());
    }

    #[test]
    fn test_parse_tta_level() {
        assert_eq!(parse_tta_level("4"), Ok(TtaLevel::Four));
        assert_eq!(parse_tta_level("0"), Ok(TtaLevel::Off));
        assert!(parse_tta_level("3").is_err());
        assert!(parse_tta_level("x").is_err());
    }

    #[test]
    fn test_cli_parses_upscale_flags() {
        let args = upscale_args(&[
            "--model",
            "cunet",
            "--noise",
            "-1",
            "--scale",
            "2",
            "--tta",
            "2",
            "--focus",
            "5,6",
            "--no-alpha",
        ]);
        assert_eq!(args.model.as_deref(), Some("cunet"));
        assert_eq!(args.noise, Some(-1));
        assert_eq!(args.tta, Some(TtaLevel::Two));
        assert_eq!(args.focus, Some((5.0, 6.0)));
        assert!(args.no_alpha && !args.alpha);
    }

    #[test]
    fn test_keep_alpha_resolution() {
        let render = RenderConfig::default();
        let opaque = image_with_alpha(255);
        let transparent = image_with_alpha(0);

        assert!(!resolve_keep_alpha(&upscale_args(&[]), &render, &opaque));
        assert!(resolve_keep_alpha(&upscale_args(&[]), &render, &transparent));
        assert!(resolve_keep_alpha(&upscale_args(&["--alpha"]), &render, &opaque));
        assert!(!resolve_keep_alpha(&upscale_args(&["--no-alpha"]), &render, &transparent));

        let no_detect = RenderConfig {
            detect_alpha: false,
            ..RenderConfig::default()
        };
        assert!(!resolve_keep_alpha(&upscale_args(&[]), &no_detect, &transparent));
    }

    #[test]
    fn test_render_params_merge_cli_over_config() {
        let catalog = ModelCatalog::new("models");
        let render = RenderConfig {
            tta_level: TtaLevel::Two,
            linear_light: true,
            ..RenderConfig::default()
        };
        let args = upscale_args(&["--model", "swin_unet.photo", "--scale", "4", "--tile-size", "100"]);

        let (spec, params) = build_render_params(&args, &render, &catalog, &image_with_alpha(255)).unwrap();
        assert_eq!(spec.scale, 4);
        assert_eq!(params.model.as_str(), "swin_unet/photo/scale4x");
        assert_eq!(params.offset, 32);
        assert_eq!(params.tile_size, 112);
        assert_eq!(params.tta_level, TtaLevel::Two);
        assert!(params.linear_light);
        assert!(!params.keep_alpha);
    }

    #[test]
    fn test_plan_rejects_small_tiles_with_a_message() {
        let cli = Cli::try_parse_from([
            "tilescale", "plan", "--width", "100", "--height", "100", "--scale", "2", "--offset", "8",
            "--tile-size", "10",
        ])
        .expect("cli should parse");
        let Commands::Plan(args) = cli.command else {
            panic!("expected plan");
        };
        let err = run_plan(&args).expect_err("tile size 10 leaves no room for the offset");
        assert!(format!("{err:#}").contains("tile_size 10 is too small"), "{err:#}");
    }

    #[test]
    fn test_render_params_reject_unknown_model() {
        let catalog = ModelCatalog::new("models");
        let args = upscale_args(&["--model", "cunet", "--scale", "4"]);
        assert!(build_render_params(&args, &RenderConfig::default(), &catalog, &image_with_alpha(255)).is_err());
    }
}
