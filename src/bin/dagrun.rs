//! dagrun CLI: run a YAML flow manifest and print its status events.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use dagrun::{
    Callback, FlowManifest, HandlerRegistry, LoggingCallback, RetryCallback, TimingCallback,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "dagrun")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Execute a manifest and stream its status events to stdout
    Run {
        manifest: PathBuf,
        /// Override the manifest's concurrency limit
        #[arg(long)]
        max_concurrency: Option<usize>,
        /// Retry failed steps this many times
        #[arg(long, default_value_t = 0)]
        retries: u32,
        /// Delay between retries in milliseconds
        #[arg(long, default_value_t = 0)]
        retry_delay_ms: u64,
        #[arg(long, value_enum, default_value_t = Format::Sse)]
        format: Format,
    },
    /// Validate a manifest and print its execution levels
    Check { manifest: PathBuf },
    /// Print a manifest's dependency graph in Graphviz DOT
    Dot { manifest: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    /// Server-Sent-Events frames
    Sse,
    /// One JSON envelope per line
    Json,
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("dagrun=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match dispatch(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn dispatch(command: Commands) -> anyhow::Result<ExitCode> {
    let registry = HandlerRegistry::with_builtins();
    match command {
        Commands::Run {
            manifest,
            max_concurrency,
            retries,
            retry_delay_ms,
            format,
        } => {
            let mut manifest = load(&manifest)?;
            let mut callbacks: Vec<Arc<dyn Callback>> = vec![
                Arc::new(TimingCallback::new()),
                Arc::new(LoggingCallback::new()),
            ];
            if retries > 0 {
                callbacks.push(Arc::new(
                    RetryCallback::new(retries).with_delay(Duration::from_millis(retry_delay_ms)),
                ));
            }
            if let Some(limit) = max_concurrency {
                let config = manifest.engine_config().with_max_concurrency(limit);
                manifest.config = Some(config);
            }
            run(&manifest, &registry, callbacks, format).await
        }
        Commands::Check { manifest } => {
            let engine = load(&manifest)?.build_engine(&registry, Vec::new())?;
            for (level, ids) in engine.graph().levels().iter().enumerate() {
                println!("level {}: {}", level, ids.join(", "));
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Dot { manifest } => {
            let engine = load(&manifest)?.build_engine(&registry, Vec::new())?;
            print!("{}", engine.graph().to_dot());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load(path: &Path) -> anyhow::Result<FlowManifest> {
    FlowManifest::from_file(path)
        .with_context(|| format!("Failed to load manifest {}", path.display()))
}

async fn run(
    manifest: &FlowManifest,
    registry: &HandlerRegistry,
    callbacks: Vec<Arc<dyn Callback>>,
    format: Format,
) -> anyhow::Result<ExitCode> {
    let engine = Arc::new(manifest.build_engine(registry, callbacks)?);
    let mut stream = engine.stream(manifest.context_bag()?);

    let ctx = stream.context.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctx.cancel("interrupted");
        }
    });

    while let Some(envelope) = stream.events.recv().await {
        match format {
            Format::Sse => print!("{}", envelope.event.to_sse()?),
            Format::Json => println!("{}", serde_json::to_string(&envelope)?),
        }
    }

    let report = stream.handle.await.context("Run task panicked")??;
    tracing::info!(
        status = %report.status,
        blocked = ?report.blocked,
        "Finished in {:.2}s",
        report.context.elapsed().as_secs_f64()
    );
    let failed = report.context.has_errors() || !report.is_completed();
    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
