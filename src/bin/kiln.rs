use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::{Parser, Subcommand};

use kiln::{
    BlenderConfig, BlenderEngine, EngineRegistry, PipelineConfig, RenderSettings, Resolution,
    cleanup::CleanupSweeper,
    pipeline::render_video_production,
};

#[derive(Parser, Debug)]
#[command(name = "kiln", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one render job end to end (requires the engine tool and `ffmpeg` on PATH).
    Render(RenderArgs),
    /// Remove frame artifacts older than a retention window.
    Sweep(SweepArgs),
}

#[derive(Parser, Debug)]
struct RenderArgs {
    /// Scene prompt handed to the engine's scene builder.
    #[arg(long)]
    prompt: String,

    #[arg(long, default_value_t = 1920)]
    width: u32,

    #[arg(long, default_value_t = 1080)]
    height: u32,

    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Video duration in seconds.
    #[arg(long, default_value_t = 5.0)]
    duration: f64,

    /// Engine name to render with.
    #[arg(long, default_value = "blender")]
    engine: String,

    /// Root directory for per-job working directories.
    #[arg(long, default_value = "data/jobs")]
    data_root: PathBuf,

    /// Reuse an existing job directory; omitted means a fresh job id.
    #[arg(long)]
    job_id: Option<String>,

    /// Engine executable (blender).
    #[arg(long)]
    executable: Option<PathBuf>,

    /// Python scene-builder script handed to the engine.
    #[arg(long)]
    scene_script: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct SweepArgs {
    /// Directory to sweep.
    #[arg(long)]
    dir: PathBuf,

    /// Retention window in hours; only strictly older files are removed.
    #[arg(long, default_value_t = 24)]
    max_age_hours: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_target(false).init();
    let cli = Cli::parse();
    match cli.cmd {
        Command::Render(args) => cmd_render(args),
        Command::Sweep(args) => cmd_sweep(args),
    }
}

fn cmd_render(args: RenderArgs) -> anyhow::Result<()> {
    let settings = RenderSettings {
        resolution: Resolution::new(args.width, args.height)?,
        fps: args.fps,
        duration_secs: args.duration,
        engine: args.engine,
        extra: Default::default(),
    };

    let mut blender = BlenderConfig::default();
    if let Some(executable) = args.executable {
        blender.executable = executable;
    }
    if let Some(script) = args.scene_script {
        blender.scene_builder_script = script;
    }

    let mut registry = EngineRegistry::new();
    registry.register(Arc::new(BlenderEngine::new(blender)));

    let config = PipelineConfig {
        data_root: args.data_root,
        ..PipelineConfig::default()
    };

    let result = render_video_production(
        args.job_id,
        &args.prompt,
        settings,
        registry,
        config,
        &|percent, message| eprintln!("[{percent:5.1}%] {message}"),
    );

    if !result.success {
        anyhow::bail!(
            "render failed: {}",
            result
                .error_message
                .unwrap_or_else(|| "unknown error".to_string())
        );
    }
    if let Some(video) = &result.video_path {
        eprintln!("wrote {}", video.display());
    }
    Ok(())
}

fn cmd_sweep(args: SweepArgs) -> anyhow::Result<()> {
    let max_age = Duration::from_secs(args.max_age_hours * 3600);
    let stats = CleanupSweeper::sweep(&args.dir, max_age)?;
    eprintln!(
        "removed {} file(s), {} bytes, {} dir(s)",
        stats.files_cleaned, stats.bytes_freed, stats.dirs_removed
    );
    Ok(())
}
