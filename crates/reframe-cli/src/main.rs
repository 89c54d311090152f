//! `reframe`: reframes landscape video into other aspect ratios.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use reframe_media::{check_ffmpeg, check_ffprobe, RenderOutcome, Reframer};
use reframe_models::{AspectRatio, CropPlan};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{build_config, open_cache, parse_resolution, time_range};

#[derive(Parser, Debug)]
#[command(
    name = "reframe",
    version,
    about = "Automatic subject-aware video reframing",
    long_about = "Detects shots and subjects in a video, plans a smooth virtual camera \
                  for each target aspect ratio and renders the reframed outputs with FFmpeg."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyze a video and write its crop plan as JSON
    Analyze {
        #[command(flatten)]
        analysis: AnalysisArgs,

        /// Where to write the crop plan
        #[arg(long, value_name = "PLAN_JSON")]
        plan: PathBuf,
    },

    /// Render outputs from a previously written crop plan
    Render {
        /// Crop plan produced by `analyze`
        #[arg(long, value_name = "PLAN_JSON")]
        plan: PathBuf,

        /// Source video (defaults to the path recorded in the plan)
        #[arg(short, long, value_name = "VIDEO")]
        input: Option<PathBuf>,

        #[command(flatten)]
        output: OutputArgs,

        #[command(flatten)]
        tuning: TuningArgs,
    },

    /// Analyze and render in one go
    Run {
        #[command(flatten)]
        analysis: AnalysisArgs,

        #[command(flatten)]
        output: OutputArgs,

        /// Reuse the crop plan at this path when it matches, write it otherwise
        #[arg(long, value_name = "PLAN_JSON")]
        plan: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct AnalysisArgs {
    /// Source video
    #[arg(value_name = "VIDEO")]
    input: PathBuf,

    /// Target aspect ratio as W:H; repeat for several outputs
    #[arg(short, long = "aspect", value_name = "W:H")]
    aspects: Vec<AspectRatio>,

    /// Start of the analyzed range in seconds
    #[arg(long, requires = "end")]
    start: Option<f64>,

    /// End of the analyzed range in seconds
    #[arg(long, requires = "start")]
    end: Option<f64>,

    /// Directory for the durable shot detection cache
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Number of shot analysis workers
    #[arg(long)]
    workers: Option<usize>,

    #[command(flatten)]
    tuning: TuningArgs,
}

#[derive(Args, Debug)]
struct TuningArgs {
    /// Configuration preset: default, fast, quality or podcast
    #[arg(long, default_value = "default")]
    preset: String,
}

#[derive(Args, Debug)]
struct OutputArgs {
    /// Output prefix; each aspect is written to `<prefix>_<W>x<H>.mp4`
    #[arg(short, long, value_name = "PREFIX")]
    output: PathBuf,

    /// Scale every output to WxH instead of the crop size
    #[arg(long, value_name = "WxH", value_parser = parse_resolution)]
    resolution: Option<(u32, u32)>,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env()
        .add_directive("reframe=info".parse().unwrap())
        .add_directive("ort=warn".parse().unwrap());

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    check_ffprobe().context("ffprobe is required")?;

    match cli.command {
        Command::Analyze { analysis, plan } => {
            let reframer = build_reframer(&analysis, false).await?;
            let range = time_range(analysis.start, analysis.end)?;
            let crop_plan = reframer.analyze(&analysis.input, range).await?;
            crop_plan
                .save(&plan)
                .with_context(|| format!("failed to write crop plan {}", plan.display()))?;
            info!(plan = %plan.display(), shots = crop_plan.shots.len(), "Crop plan written");
            println!("{}", plan.display());
            Ok(())
        }
        Command::Render {
            plan,
            input,
            output,
            tuning,
        } => {
            check_ffmpeg().context("ffmpeg is required")?;
            let crop_plan = CropPlan::load(&plan)
                .with_context(|| format!("failed to read crop plan {}", plan.display()))?;
            let input = input.unwrap_or_else(|| crop_plan.video.path.clone());

            let config = build_config(&tuning.preset, &crop_plan.aspect_ratios, None)?;
            let reframer = Reframer::new(config)?;

            let outcome = reframer
                .render(&input, &crop_plan, &output.output, output.resolution)
                .await?;
            report(outcome)
        }
        Command::Run { analysis, output, plan } => {
            let reframer = build_reframer(&analysis, true).await?;
            let range = time_range(analysis.start, analysis.end)?;
            let (_, outcome) = reframer
                .analyze_and_render(&analysis.input, range, &output.output, output.resolution, plan.as_deref())
                .await?;
            report(outcome)
        }
    }
}

async fn build_reframer(args: &AnalysisArgs, renders: bool) -> anyhow::Result<Reframer> {
    if renders {
        check_ffmpeg().context("ffmpeg is required")?;
    }
    let config = build_config(&args.tuning.preset, &args.aspects, args.workers)?;
    let cache = open_cache(args.cache_dir.as_deref()).await?;
    Ok(Reframer::new(config)?.with_cache(cache))
}

/// Print rendered paths; any failed aspect fails the command.
fn report(outcome: RenderOutcome) -> anyhow::Result<()> {
    for path in outcome.outputs.values() {
        println!("{}", path.display());
    }
    if outcome.is_success() {
        return Ok(());
    }

    for (aspect, e) in &outcome.failures {
        error!(aspect = %aspect, "{}", e);
    }
    let failed: Vec<String> = outcome.failures.keys().map(|a| a.to_string()).collect();
    bail!(
        "{} of {} aspect ratios failed: {}",
        failed.len(),
        failed.len() + outcome.outputs.len(),
        failed.join(", ")
    )
}
