use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand};
use portraitcore::{PredictionParams, PredictionRequest, RunEvent};
use portraitengine::{ensure_weights, ComfyEngine, EngineProcess};
use portraitruntime::{load_template, PortraitRuntime, RuntimeConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "portrait")]
#[command(about = "LivePortrait prediction CLI", long_about = None)]
struct Cli {
    /// Path to a JSON runtime configuration
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Animate a face image with a driving video
    Predict {
        /// Face image to animate
        #[arg(long)]
        face: PathBuf,

        /// Video whose motion drives the face
        #[arg(long)]
        driving: PathBuf,

        #[command(flatten)]
        params: ParamArgs,

        /// Directory the outputs are copied into
        #[arg(short, long, default_value = "outputs")]
        output_dir: PathBuf,

        /// Do not check or download model weights first
        #[arg(long)]
        skip_weights: bool,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a workflow template against the node bindings
    Validate {
        /// Template to check; defaults to the configured one
        #[arg(short, long)]
        template: Option<PathBuf>,
    },

    /// Report missing model weights
    Weights {
        /// Fetch missing files from the configured weights URL
        #[arg(long)]
        download: bool,
    },
}

#[derive(Args)]
struct ParamArgs {
    /// Maximum driving frames to load (0 loads all)
    #[arg(long, default_value_t = 64)]
    frame_load_cap: i64,

    /// Take every nth driving frame
    #[arg(long, default_value_t = 1)]
    select_every_n_frames: i64,

    /// Output image size (64-2048)
    #[arg(long, default_value_t = 512)]
    dsize: i64,

    /// Face scaling factor (1.0-4.0)
    #[arg(long, default_value_t = 2.3)]
    scale: f64,

    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    vx_ratio: f64,

    #[arg(long, default_value_t = -0.125, allow_hyphen_values = true)]
    vy_ratio: f64,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    lip_zero: bool,

    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    eye_retargeting: bool,

    #[arg(long, default_value_t = 1.0)]
    eyes_retargeting_multiplier: f64,

    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    lip_retargeting: bool,

    #[arg(long, default_value_t = 1.0)]
    lip_retargeting_multiplier: f64,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    stitching: bool,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    relative: bool,
}

impl From<ParamArgs> for PredictionParams {
    fn from(args: ParamArgs) -> Self {
        Self {
            frame_load_cap: args.frame_load_cap,
            select_every_n_frames: args.select_every_n_frames,
            dsize: args.dsize,
            scale: args.scale,
            vx_ratio: args.vx_ratio,
            vy_ratio: args.vy_ratio,
            lip_zero: args.lip_zero,
            eye_retargeting: args.eye_retargeting,
            eyes_retargeting_multiplier: args.eyes_retargeting_multiplier,
            lip_retargeting: args.lip_retargeting,
            lip_retargeting_multiplier: args.lip_retargeting_multiplier,
            stitching: args.stitching,
            relative: args.relative,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = RuntimeConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Predict {
            face,
            driving,
            params,
            output_dir,
            skip_weights,
            verbose,
        } => {
            let default_level = if verbose { "debug" } else { "info" };
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
                )
                .init();

            let request = PredictionRequest::new(face, driving, params.into())?;
            predict(config, request, output_dir, skip_weights).await?;
        }

        Commands::Validate { template } => {
            validate(&config, template).await?;
        }

        Commands::Weights { download } => {
            weights(&config, download).await?;
        }
    }

    Ok(())
}

async fn predict(
    config: RuntimeConfig,
    request: PredictionRequest,
    output_dir: PathBuf,
    skip_weights: bool,
) -> Result<()> {
    println!("🚀 Animating {}", request.face_image().display());
    println!("   Driving video: {}", request.driving_video().display());
    println!("   Engine: {}", config.engine_address);
    println!();

    if !skip_weights {
        ensure_weights(
            &portraitruntime::WeightManifest::live_portrait(),
            &config.weights_dir,
            config.weights_url.as_deref(),
        )
        .await?;
    }

    let _engine_process = match &config.engine_launch {
        Some(launch) => Some(EngineProcess::start(launch, &config.engine_address).await?),
        None => None,
    };

    let mut engine = ComfyEngine::new(config.engine_address.clone()).with_poll_interval(config.poll_interval());
    if let Some(launch) = &config.engine_launch {
        engine = engine.with_local_dirs(launch);
    }
    let runtime = PortraitRuntime::new(config, Arc::new(engine));

    // Subscribe to events for real-time output
    let mut events = runtime.subscribe_events();

    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                RunEvent::RunStarted { run_id, .. } => {
                    println!("▶️  Run {} started", run_id);
                }
                RunEvent::StageEntered { stage, .. } => {
                    println!("  ⚡ {}", stage);
                }
                RunEvent::EngineQueued { prompt_id, .. } => {
                    println!("     ℹ️  queued as prompt {}", prompt_id);
                }
                RunEvent::EngineProgress { message, .. } => {
                    println!("     📊 {}", message);
                }
                RunEvent::RunCompleted { duration_ms, .. } => {
                    println!("✨ Run completed in {}ms", duration_ms);
                }
                RunEvent::RunFailed { stage, error, .. } => {
                    println!("💥 Run failed during {}: {}", stage, error);
                }
            }
        }
    });

    let result = runtime.predict(&request).await;

    // Wait for events to finish printing
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    event_task.abort();

    let prediction = result?;
    let outputs = prediction.persist_to(&output_dir).await?;

    println!();
    println!("📤 Outputs:");
    if outputs.is_empty() {
        println!("   (none)");
    }
    for path in &outputs {
        println!("   {}", path.display());
    }

    Ok(())
}

async fn validate(config: &RuntimeConfig, template: Option<PathBuf>) -> Result<()> {
    let path = template.unwrap_or_else(|| config.template_path.clone());
    println!("🔍 Validating template: {}", path.display());

    let graph = load_template(&path, &config.bindings).await?;

    println!("✅ Template is valid:");
    println!("   Nodes: {}", graph.len());
    println!("   Links: {}", graph.links().len());
    println!("   Video loader: {}", config.bindings.video_loader);
    println!("   Animator: {}", config.bindings.animator);
    if let Some(face_loader) = &config.bindings.face_loader {
        println!("   Face loader: {}", face_loader);
    }

    Ok(())
}

async fn weights(config: &RuntimeConfig, download: bool) -> Result<()> {
    let manifest = portraitruntime::WeightManifest::live_portrait();
    println!("📦 Weights in {}", config.weights_dir.display());

    if download {
        let fetched = ensure_weights(&manifest, &config.weights_dir, config.weights_url.as_deref()).await?;
        for name in &fetched {
            println!("  ⬇️  {}", name);
        }
    }

    let missing = manifest.missing(&config.weights_dir);
    for name in manifest.names() {
        let mark = if missing.contains(name) { "❌" } else { "✅" };
        println!("  {} {}", mark, name);
    }

    if !missing.is_empty() {
        anyhow::bail!("{} weight file(s) missing", missing.len());
    }
    Ok(())
}
