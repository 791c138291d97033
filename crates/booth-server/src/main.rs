//! Photo booth camera server: live MJPEG preview, snapshots and camera
//! control over HTTP.
//!
//!   GET  /video_feed     → multipart/x-mixed-replace JPEG stream
//!   GET  /snapshot       → image/jpeg (503 until the first frame)
//!   POST /camera/start | /camera/switch | /camera/stop
//!   GET  /camera/status  → JSON session report
//!   GET  /cameras        → JSON list of working USB cameras

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use booth_camera::{CameraConfig, CameraManager};
use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};

mod routes;

/// Parse CLI arguments
#[derive(Parser)]
#[command(version, about)]
struct CliArgs {
    /// Camera configuration (JSON). Defaults apply when the file is missing.
    #[arg(long, default_value = "camera.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve preview and control routes (the default)
    Serve(ServeArgs),
    /// Probe USB cameras and print the ones that work
    Cameras,
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, default_value_t = default_bind())]
    bind: SocketAddr,

    /// Wait for the first viewer or start request instead of opening the
    /// camera on boot
    #[arg(long)]
    lazy: bool,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5000))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = CliArgs::parse();
    let config = CameraConfig::load_or_default(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    let manager = Arc::new(CameraManager::from_config(&config));

    match args.command {
        Some(Command::Cameras) => list_cameras(&manager),
        Some(Command::Serve(serve_args)) => serve(manager, &config, serve_args),
        None => serve(
            manager,
            &config,
            ServeArgs {
                bind: default_bind(),
                lazy: false,
            },
        ),
    }
}

fn list_cameras(manager: &CameraManager) -> Result<()> {
    let found = manager.inventory();
    if found.is_empty() {
        println!("no working USB cameras");
    }
    for descriptor in found {
        println!("{descriptor}");
    }
    manager.shutdown();
    Ok(())
}

fn serve(manager: Arc<CameraManager>, config: &CameraConfig, args: ServeArgs) -> Result<()> {
    // SIGINT / SIGTERM must release the camera before the process goes away
    ctrlc::set_handler({
        let manager = manager.clone();
        move || {
            info!("termination signal, releasing camera");
            manager.shutdown();
            std::process::exit(0);
        }
    })
    .context("Failed to install signal handler")?;

    let request = config.request();
    if !args.lazy {
        if let Err(err) = manager.start(&request) {
            warn!("camera not started on boot: {err}");
        }
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to build tokio runtime")?;
    let result = runtime.block_on(async {
        let listener = tokio::net::TcpListener::bind(args.bind)
            .await
            .with_context(|| format!("Failed to bind {}", args.bind))?;
        info!("serving on http://{}", args.bind);
        axum::serve(listener, routes::router(manager.clone(), request))
            .await
            .context("HTTP server failed")
    });

    if let Err(err) = &result {
        error!("{err:#}");
    }
    manager.shutdown();
    result
}
