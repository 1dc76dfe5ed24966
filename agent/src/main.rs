//! Tandem trace agent
//!
//! Runs one trace through the background controller and writes it as JSON.
//! Device activity comes from plugin profilers given with `--plugin`.

use anyhow::Context;
use clap::Parser;
use color_eyre::eyre::eyre;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tandem_agent::{metrics, process, ProfilerController, RunloopController, TraceConfig};
use tandem_gpu::plugin::load_plugin;
use tandem_gpu::NullBackend;
use tandem_shared::utils::parse_duration;
use tandem_shared::ActivityKind;

#[derive(Parser, Debug)]
#[command(name = "tandem-agent")]
#[command(about = "CPU/GPU trace correlation agent", long_about = None)]
#[command(version)]
struct Args {
    /// Trace configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Trace duration (e.g., "500ms", "30s", "5m")
    #[arg(short, long)]
    duration: Option<String>,

    /// Warmup before collection starts
    #[arg(short, long)]
    warmup: Option<String>,

    /// Output file for the JSON trace
    #[arg(short, long, default_value = "trace.json")]
    output: PathBuf,

    /// Activity kinds to record, comma separated (e.g., "cpu_op,concurrent_kernel")
    #[arg(short, long, value_delimiter = ',')]
    activities: Vec<ActivityKind>,

    /// Plugin profiler shared library to load (repeatable)
    #[arg(short, long)]
    plugin: Vec<PathBuf>,

    /// Print Prometheus metrics when the trace completes
    #[arg(long)]
    print_metrics: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    // Initialize tracing
    init_tracing(args.verbose);

    info!("Starting tandem trace agent");
    info!("Configuration: {:?}", args);

    run(args).await.map_err(|e| eyre!("{:#}", e))
}

/// Initialize tracing/logging
fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn load_config(args: &Args) -> anyhow::Result<TraceConfig> {
    let mut config = match &args.config {
        Some(path) => TraceConfig::from_file(path)?,
        None => TraceConfig::default(),
    };
    config.apply_env_overrides()?;

    if let Some(duration) = &args.duration {
        config.duration = parse_duration(duration).context("Failed to parse duration")?;
    }
    if let Some(warmup) = &args.warmup {
        config.warmup = parse_duration(warmup).context("Failed to parse warmup")?;
    }
    if !args.activities.is_empty() {
        config.activity_kinds = args.activities.iter().copied().collect();
    }
    config.log_file = Some(args.output.clone());

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(&args)?;

    let profiler = Arc::new(RunloopController::new(Box::new(NullBackend), args.plugin.is_empty()));
    for path in &args.plugin {
        let plugin = load_plugin(path).with_context(|| format!("Failed to load plugin {}", path.display()))?;
        profiler.register_child_profiler(Box::new(plugin));
    }
    profiler.add_metadata("hostname", process::host_name());
    profiler.record_current_thread();

    info!(
        "Tracing for {} after {} warmup",
        tandem_shared::utils::format_duration(config.duration),
        tandem_shared::utils::format_duration(config.warmup)
    );

    let controller = ProfilerController::new(profiler.clone());
    controller.schedule_trace(config);

    tokio::select! {
        _ = controller.trace_completed() => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted - stopping trace early");
            profiler.request_stop();
            controller.trace_completed().await;
        }
    }
    controller.shutdown().await;

    info!("Trace written to {}", args.output.display());

    if args.print_metrics {
        print!("{}", metrics::encode_metrics()?);
    }

    Ok(())
}
