use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;

use w2x_core::chroma::{LinearResampler, Resampler};
use w2x_core::config::{config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig};
use w2x_core::logging::{self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, DEFAULT_LOG_FILTER};
use w2x_core::tiling::{self, DEFAULT_TILE_OVERLAP};
use w2x_core::{
    FilterInstance, FilterOptions, Frame, FrameSource, InferenceBackend, ModelConfig,
    OrtEngineLoader, Plane, VideoFormat, VideoInfo,
};

const SAMPLE_BYTES: usize = std::mem::size_of::<f32>();

#[derive(Parser)]
#[command(name = "w2x", about = "Tiled waifu2x upscaling and denoising for raw planar frames")]
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
    /// Upscale/denoise a file of raw little-endian f32 planar frames.
    Process(ProcessArgs),
    /// Print the tile plan for a geometry.
    Plan(PlanArgs),
    /// Validate filter options and print the resolved configuration.
    Check(CheckArgs),
}

#[derive(Args, Debug, Default, Clone)]
struct FilterArgs {
    #[arg(long, allow_hyphen_values = true, help = "Denoise level -1..=3 (-1 disables)")]
    noise: Option<i64>,
    #[arg(long, help = "Power-of-two upscale factor")]
    scale: Option<i64>,
    #[arg(long = "block-w")]
    block_w: Option<i64>,
    #[arg(long = "block-h")]
    block_h: Option<i64>,
    #[arg(long, help = "Model family index 0..=6")]
    model: Option<i64>,
    #[arg(long, value_parser = parse_backend, help = "cpu, cuda or tensorrt")]
    backend: Option<InferenceBackend>,
    #[arg(long, help = "GPU device id")]
    processor: Option<i64>,
    #[arg(long)]
    tta: bool,
    #[arg(long)]
    batch: Option<i64>,
}

impl FilterArgs {
    /// CLI flags take precedence over `config.toml`.
    fn apply_to(&self, options: &mut FilterOptions) {
        if let Some(noise) = self.noise {
            options.noise = noise;
        }
        if let Some(scale) = self.scale {
            options.scale = scale;
        }
        if let Some(block_w) = self.block_w {
            options.block_w = block_w;
        }
        if self.block_h.is_some() {
            options.block_h = self.block_h;
        }
        if let Some(model) = self.model {
            options.model = model;
        }
        if let Some(backend) = &self.backend {
            options.backend = backend.clone();
        }
        if let Some(processor) = self.processor {
            options.processor = processor;
        }
        if self.tta {
            options.tta = true;
        }
        if let Some(batch) = self.batch {
            options.batch = batch;
        }
    }
}

#[derive(Args, Debug, Clone)]
struct ClipArgs {
    #[arg(long)]
    width: usize,
    #[arg(long)]
    height: usize,
    #[arg(long, value_parser = parse_format, default_value = "rgb")]
    format: VideoFormat,
}

#[derive(Args)]
struct ProcessArgs {
    #[arg(short = 'i', long)]
    input: PathBuf,
    #[arg(short = 'o', long)]
    output: PathBuf,
    #[command(flatten)]
    clip: ClipArgs,
    #[command(flatten)]
    filter: FilterArgs,
    #[arg(long, help = "Frames in flight (defaults to available parallelism)")]
    threads: Option<usize>,
    #[arg(long)]
    models_dir: Option<PathBuf>,
}

#[derive(Args)]
struct PlanArgs {
    #[arg(long)]
    width: usize,
    #[arg(long)]
    height: usize,
    #[command(flatten)]
    filter: FilterArgs,
    #[arg(long, default_value_t = DEFAULT_TILE_OVERLAP)]
    margin: usize,
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct CheckArgs {
    #[command(flatten)]
    filter: FilterArgs,
}

fn parse_backend(value: &str) -> Result<InferenceBackend, String> {
    Ok(InferenceBackend::from_str_lossy(value))
}

fn parse_format(value: &str) -> Result<VideoFormat, String> {
    VideoFormat::from_name(value).ok_or_else(|| {
        format!("unknown format '{value}' (expected gray, rgb, yuv420, yuv422 or yuv444)")
    })
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    w2x_core::runtime::setup_runtime_libs();
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    w2x_core::runtime::log_runtime_lib_status();
    log_startup_metadata(&resolved_data_dir);

    let config = load_app_config(&resolved_data_dir);
    match cli.command {
        Commands::Process(args) => run_process(args, config, &resolved_data_dir).await,
        Commands::Plan(args) => run_plan(args, config),
        Commands::Check(args) => run_check(args, config),
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let panic_hook_plan = logging::install_panic_hook(data_dir);

    let options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let filters = logging::compose_logging_filters(&options);
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filters.console_filter, "console"));

    match logging::build_file_sink_plan(&options) {
        FileSinkPlan::Ready { appender, .. } => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(logging::redacting_make_writer(appender))
                .with_filter(parse_env_filter_with_fallback(&filters.file_filter, "file"));
            let subscriber = tracing_subscriber::registry()
                .with(console_layer)
                .with(file_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}");
            }
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(console_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}");
                return;
            }
            warn!(
                attempted_log_dir = ?attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }

    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = panic_hook_plan
    {
        warn!(
            attempted_crash_dir = ?attempted_crash_dir,
            reason = %reason,
            "Panic crash artifact hook unavailable; continuing without panic artifacts"
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
    info!(
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn load_app_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

fn resolve_options(config: &AppConfig, args: &FilterArgs) -> FilterOptions {
    let mut options = config.filter.clone();
    args.apply_to(&mut options);
    options
}

/// Byte length of one raw frame: every plane stored densely, in order.
fn frame_bytes(format: VideoFormat, width: usize, height: usize) -> usize {
    (0..format.num_planes())
        .map(|p| {
            let (w, h) = format.plane_dimensions(p, width, height);
            w * h * SAMPLE_BYTES
        })
        .sum()
}

/// Frame source over a file of densely packed little-endian f32 planes.
struct RawFrameReader {
    file: Mutex<File>,
    format: VideoFormat,
    width: usize,
    height: usize,
    frame_bytes: usize,
    num_frames: usize,
}

impl RawFrameReader {
    fn open(path: &Path, format: VideoFormat, width: usize, height: usize) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open input: {}", path.display()))?;
        let len = file.metadata()?.len() as usize;
        if !format.fits_subsampling(width, height) {
            bail!("Frame geometry {width}x{height} does not divide into {format} chroma samples");
        }
        let frame_bytes = frame_bytes(format, width, height);
        if frame_bytes == 0 {
            bail!("Frame geometry {width}x{height} is empty");
        }
        if len % frame_bytes != 0 {
            warn!(
                len,
                frame_bytes,
                "Input length is not a whole number of frames; ignoring trailing bytes"
            );
        }
        Ok(Self {
            file: Mutex::new(file),
            format,
            width,
            height,
            frame_bytes,
            num_frames: len / frame_bytes,
        })
    }

    fn info(&self) -> VideoInfo {
        VideoInfo {
            format: self.format,
            width: self.width,
            height: self.height,
            num_frames: self.num_frames,
        }
    }

    fn read_frame(&self, n: usize) -> Result<Frame> {
        if n >= self.num_frames {
            bail!("frame {n} is past the end of the input ({} frames)", self.num_frames);
        }
        let mut bytes = vec![0u8; self.frame_bytes];
        {
            let mut file = self
                .file
                .lock()
                .map_err(|_| anyhow::anyhow!("input file lock poisoned"))?;
            file.seek(SeekFrom::Start((n * self.frame_bytes) as u64))?;
            file.read_exact(&mut bytes)
                .with_context(|| format!("Failed to read frame {n}"))?;
        }

        let mut offset = 0;
        let mut planes = Vec::with_capacity(self.format.num_planes());
        for p in 0..self.format.num_planes() {
            let (w, h) = self.format.plane_dimensions(p, self.width, self.height);
            let len = w * h * SAMPLE_BYTES;
            planes.push(Plane::from_vec(w, h, w, decode_samples(&bytes[offset..offset + len]))?);
            offset += len;
        }
        Ok(Frame::from_planes(self.format, self.width, self.height, planes)?)
    }
}

impl FrameSource for RawFrameReader {
    fn request_frame(&self, n: usize) -> w2x_core::Result<Frame> {
        self.read_frame(n)
            .map_err(|e| w2x_core::Error::geometry(format!("{e:#}")))
    }
}

fn decode_samples(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(SAMPLE_BYTES)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> std::io::Result<()> {
    for plane in frame.planes() {
        for row in plane.rows() {
            for sample in row {
                writer.write_all(&sample.to_le_bytes())?;
            }
        }
    }
    Ok(())
}

async fn run_process(args: ProcessArgs, config: AppConfig, data_dir: &Path) -> Result<()> {
    let options = resolve_options(&config, &args.filter);
    let models_dir = args
        .models_dir
        .clone()
        .unwrap_or_else(|| resolve_relative_to(data_dir, &config.paths.models_dir));

    let reader = Arc::new(RawFrameReader::open(
        &args.input,
        args.clip.format,
        args.clip.width,
        args.clip.height,
    )?);
    let info = reader.info();
    info!(
        input = %args.input.display(),
        format = %info.format,
        width = info.width,
        height = info.height,
        frames = info.num_frames,
        "Opened raw input"
    );

    let resampler: Arc<dyn Resampler> = Arc::new(LinearResampler);
    let loader = OrtEngineLoader::new().with_trt_cache_dir(data_dir.join("trt_cache"));
    let filter = FilterInstance::create(&options, &info, &models_dir, &loader, Some(resampler))
        .map_err(|e| anyhow::anyhow!(e.host_message()))?;
    let filter = Arc::new(filter);

    let threads = args
        .threads
        .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
        .unwrap_or(1)
        .max(1);

    let output = File::create(&args.output)
        .with_context(|| format!("Failed to create output: {}", args.output.display()))?;
    let mut writer = BufWriter::new(output);

    let start = Instant::now();
    let total = info.num_frames;
    let mut in_flight = VecDeque::with_capacity(threads);
    let mut next = 0;
    let mut written = 0;

    while written < total {
        while next < total && in_flight.len() < threads {
            let filter = Arc::clone(&filter);
            let reader = Arc::clone(&reader);
            let n = next;
            in_flight.push_back(tokio::task::spawn_blocking(move || {
                filter.get_frame(n, reader.as_ref())
            }));
            next += 1;
        }

        let Some(handle) = in_flight.pop_front() else {
            break;
        };
        let frame = handle
            .await
            .context("frame worker panicked")?
            .map_err(|e| anyhow::anyhow!("frame {written}: {}", e.host_message()))?;
        write_frame(&mut writer, &frame)
            .with_context(|| format!("Failed to write frame {written}"))?;
        written += 1;
        print_progress(written, total, start.elapsed().as_secs_f64());
    }
    writer.flush()?;

    eprintln!();
    let out_info = filter.output_info();
    info!(
        output = %args.output.display(),
        frames = written,
        width = out_info.width,
        height = out_info.height,
        elapsed = %format_duration(start.elapsed().as_secs_f64()),
        "Processing complete"
    );
    Ok(())
}

fn run_plan(args: PlanArgs, config: AppConfig) -> Result<()> {
    let options = resolve_options(&config, &args.filter);
    let model = ModelConfig::from_options(&options).map_err(|e| anyhow::anyhow!(e.host_message()))?;

    let mut passes = Vec::new();
    let (mut width, mut height) = (args.width, args.height);
    for kind in model.pass_kinds() {
        let factor = kind.factor();
        let tiles = tiling::plan(
            width,
            height,
            model.block_w(),
            model.block_h(),
            factor,
            args.margin,
        )?;
        debug!(%kind, width, height, tiles = tiles.len(), "Planned pass");
        passes.push((kind, width, height, tiles));
        width *= factor;
        height *= factor;
    }

    if args.json {
        let value = serde_json::json!({
            "passes": passes.iter().map(|(kind, w, h, tiles)| serde_json::json!({
                "kind": kind.to_string(),
                "width": w,
                "height": h,
                "tiles": tiles.iter().map(|t| serde_json::json!({
                    "source": [t.source.x, t.source.y, t.source.width, t.source.height],
                    "core": [t.core.x, t.core.y, t.core.width, t.core.height],
                    "destination": [
                        t.destination.x,
                        t.destination.y,
                        t.destination.width,
                        t.destination.height
                    ],
                })).collect::<Vec<_>>(),
            })).collect::<Vec<_>>(),
            "output": [width, height],
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    for (index, (kind, w, h, tiles)) in passes.iter().enumerate() {
        println!("pass {index}: {kind} {w}x{h}, {} tiles", tiles.len());
        for t in tiles {
            println!(
                "  core {}x{}+{}+{} source {}x{}+{}+{} -> {}x{}+{}+{}",
                t.core.width,
                t.core.height,
                t.core.x,
                t.core.y,
                t.source.width,
                t.source.height,
                t.source.x,
                t.source.y,
                t.destination.width,
                t.destination.height,
                t.destination.x,
                t.destination.y
            );
        }
    }
    println!("output: {width}x{height}");
    Ok(())
}

fn run_check(args: CheckArgs, config: AppConfig) -> Result<()> {
    let options = resolve_options(&config, &args.filter);
    if options.is_passthrough() {
        println!("passthrough: frames are returned unchanged");
        return Ok(());
    }
    let model = ModelConfig::from_options(&options).map_err(|e| anyhow::anyhow!(e.host_message()))?;
    let value = serde_json::json!({
        "family": model.family().to_string(),
        "noise": model.noise(),
        "scale": model.scale(),
        "block": [model.block_w(), model.block_h()],
        "batch": model.batch(),
        "tta": model.tta(),
        "backend": model.backend().to_string(),
        "device_id": model.device_id(),
        "passes": model.pass_kinds().iter().map(ToString::to_string).collect::<Vec<_>>(),
        "models": model
            .required_kinds()
            .iter()
            .map(|kind| kind.file_name(model.noise()))
            .collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&value)?);
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

fn compute_fps(done: usize, elapsed: f64) -> f64 {
    if elapsed <= 0.0 {
        return 0.0;
    }
    done as f64 / elapsed
}

fn print_progress(done: usize, total: usize, elapsed: f64) {
    let fraction = if total > 0 {
        (done as f64 / total as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let bar: String = "█".repeat(filled) + &"░".repeat(PROGRESS_BAR_WIDTH.saturating_sub(filled));
    let fps = compute_fps(done, elapsed);
    let eta = if fps > 0.0 {
        format!(" | ETA: {}", format_duration(total.saturating_sub(done) as f64 / fps))
    } else {
        String::new()
    };
    eprint!(
        "\r[{bar}] {:5.1}% | Frame {done}/{total} | {fps:.1} fps | Elapsed: {}{eta}    ",
        fraction * 100.0,
        format_duration(elapsed),
    );
}
