use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use camgate::camera::CameraManager;
use camgate::config::AppConfig;

/// Log level for the node
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// camgate command line arguments
#[derive(Parser, Debug)]
#[command(name = "camgate")]
#[command(version, about = "Multi-camera RTSP to WebRTC distribution node", long_about = None)]
struct CliArgs {
    /// Path to the camera configuration file (JSON)
    #[arg(short = 'c', long, value_name = "FILE", default_value = "/etc/camgate/config.json")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("starting camgate v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::from_file(&args.config)?;
    if config.cameras.is_empty() {
        anyhow::bail!("no cameras configured in {}", args.config.display());
    }
    tracing::info!(
        "{} cameras configured, signaling at {}:{}",
        config.cameras.len(),
        config.signaling.host,
        config.signaling.port
    );

    let manager = Arc::new(CameraManager::new(
        config.signaling.clone(),
        config.webrtc.clone(),
    ));
    for camera in config.cameras {
        tracing::info!("camera {}: {}", camera.name, camera.redacted_url());
        manager.add(camera).await?;
    }

    // serial probe of the whole set; blocks until every camera settles
    manager.initialize_all().await;
    manager.start_all().await?;
    tracing::info!("all cameras running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    manager.stop_all().await;
    tracing::info!("shutdown complete");
    Ok(())
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    let effective = match verbose_count {
        0 => level,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };
    let filter = match effective {
        LogLevel::Error => "camgate=error",
        LogLevel::Warn => "camgate=warn",
        LogLevel::Info => "camgate=info",
        LogLevel::Debug => "camgate=debug",
        LogLevel::Trace => "camgate=trace",
    };

    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
