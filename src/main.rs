//! Pro Controller MITM bridge.
//!
//! USB controller input -> console output, with combo-driven macro
//! recording and playback. Single binary with embedded web UI.

mod calibration;
mod combo;
mod config;
mod control;
mod engine;
mod input;
mod macros;
mod mux;
mod present;
mod supervisor;
mod usb;
mod web;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use config::Args;
use control::{CommandQueue, StatePublisher};
use engine::Engine;
use macros::MacroStore;
use present::Console;
use supervisor::Supervisor;
use usb::device::ProController;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    info!("=== Pro Controller MITM Bridge ===");
    info!("Macros dir: {}", args.macros_dir.display());
    info!("Web UI port: {}", args.port);
    info!("Output: {:?}", args.output);

    let store = MacroStore::open(&args.macros_dir, args.slot_count())
        .with_context(|| format!("opening macro store at {}", args.macros_dir.display()))?;
    info!("[MACRO] {} macro(s) loaded, {} slot(s)", store.list().len(), store.slot_count());
    let engine = Engine::new(store, &args.engine_config());

    let publisher = Arc::new(StatePublisher::new());
    let commands = Arc::new(CommandQueue::default());

    // Web UI first so it is up while the controller is still missing
    let web_publisher = publisher.clone();
    let web_commands = commands.clone();
    let web_port = args.port;
    tokio::spawn(async move {
        if let Err(e) = web::start_server(web_port, web_publisher, web_commands).await {
            error!("[WEB] Server error: {e}");
        }
    });

    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("[MITM] Could not listen for Ctrl-C: {e}");
            // Dropping the sender would read as a shutdown request
            std::future::pending::<()>().await;
        }
        info!("[MITM] Ctrl-C received");
        let _ = stop.send(true);
    });

    let console = Console::open(args.output).await;
    Supervisor::new(
        ProController,
        console,
        engine,
        commands,
        publisher,
        shutdown,
        args.supervisor_config(),
    )
    .run()
    .await;

    info!("Done.");
    Ok(())
}
