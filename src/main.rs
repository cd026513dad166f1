// tunetrail - watches now-playing sources and reports the plays that really happened
// Runs one poll loop per configured source until Ctrl-C

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};
use tunetrail::{
    config::{Config, LoggingConfig, SourceConfig},
    sources::{ReplaySource, REPLAY_KIND},
    DiscoveryEngine, EventBus, Heartbeat, Poller, SnapshotSource, SourceEvent,
};

#[derive(Parser)]
#[command(name = "tunetrail")]
#[command(about = "Reconstructs listening sessions from now-playing snapshots and reports real plays")]
struct Args {
    /// Enable developer logging (stderr + debug output)
    #[arg(long)]
    dev: bool,

    /// Config file to use instead of the one in the user config directory
    #[arg(long)]
    config: Option<PathBuf>,

    /// Extra replay file to poll, can be given more than once
    #[arg(long = "replay", value_name = "PATH")]
    replays: Vec<PathBuf>,
}

fn init_logging(logging: &LoggingConfig, dev: bool) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&logging.dir)?;

    // Daily rotating file appender
    let file_appender = tracing_appender::rolling::daily(&logging.dir, "tunetrail.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_target(true)
        .with_level(true)
        .with_ansi(false);
    let stderr_layer = dev.then(|| fmt::layer().with_writer(std::io::stderr));

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer);
    tracing::subscriber::set_global_default(subscriber)?;

    if dev {
        eprintln!("🔧 Dev mode: Debug output enabled to stderr + file");
    }

    Ok(guard)
}

fn open_source(source: &SourceConfig) -> Result<Arc<dyn SnapshotSource>> {
    match source.kind.as_str() {
        REPLAY_KIND => {
            let replay = ReplaySource::open(source.name.clone(), &source.path)
                .with_context(|| format!("opening replay source {}", source.name))?;
            Ok(Arc::new(replay))
        }
        other => anyhow::bail!("source {} has unknown kind '{}'", source.name, other),
    }
}

fn print_event(event: &SourceEvent) {
    match event {
        SourceEvent::Discovered { source, plays } => {
            for play in plays {
                println!("🎧 [{}] {}", source.name, play.describe());
            }
        }
        SourceEvent::PollerStateChanged { source, state } => {
            println!("📡 [{}] {}", source, state);
        }
        SourceEvent::PollRetry {
            source,
            attempt,
            delay_ms,
            error,
        } => {
            println!("⚠️  [{}] retry {} in {}ms: {}", source, attempt, delay_ms, error);
        }
        SourceEvent::PlayerRemoved { source, platform } => {
            debug!("[{}] player {} removed", source, platform);
        }
        SourceEvent::PlayerUpdated { .. } => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load config - falls back to defaults if missing
    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    for (index, path) in args.replays.iter().enumerate() {
        config.sources.push(SourceConfig::replay(format!("replay-{}", index + 1), path));
    }
    config.validate()?;

    let _log_guard = init_logging(&config.logging, args.dev)?;
    info!("🎵 tunetrail starting up with {} sources", config.sources.len());

    if config.sources.is_empty() {
        println!("No sources configured. Add [[sources]] to {:?} or pass --replay <PATH>.", Config::config_path()?);
        return Ok(());
    }

    let events = EventBus::default();
    let mut rx = events.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => print_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("event printer fell behind, {} events skipped", missed);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut pollers = Vec::new();
    let mut background = Vec::new();

    for source_config in &config.sources {
        let source = match open_source(source_config) {
            Ok(source) => source,
            Err(e) => {
                warn!("skipping source: {:#}", e);
                eprintln!("⚠️  {:#}", e);
                continue;
            }
        };

        let span = info_span!("source", name = %source_config.name);
        let engine = DiscoveryEngine::new(
            source.identity(),
            config.discovery_options(source_config),
            events.clone(),
            span.clone(),
        );
        let poller = Poller::new(source, engine, config.polling_options(source_config), span);

        poller.start_polling();
        background.push(poller.spawn_sweeper(Duration::from_secs(config.polling.sweep_interval)));
        pollers.push(poller);
    }

    if pollers.is_empty() {
        anyhow::bail!("none of the configured sources could be opened");
    }

    let heartbeat = Heartbeat::new(
        pollers.clone(),
        Duration::from_secs(config.polling.heartbeat_interval),
        info_span!("heartbeat"),
    );
    background.push(heartbeat.spawn());

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    println!("\nShutting down...");

    for handle in &background {
        handle.abort();
    }
    for poller in &pollers {
        if !poller.stop_polling(true).await {
            warn!("{} did not acknowledge stop", poller.identity());
        }
    }

    for poller in &pollers {
        let engine = poller.engine();
        let engine = engine.lock().await;
        println!("📊 {}: {} plays discovered", poller.identity(), engine.discovered_count());
    }

    printer.abort();
    info!("tunetrail stopped");

    Ok(())
}
