//! ## Supervisor
//!
//! Wires up the registry, the USB hotplug controller, the TCP server and
//! its dispatch task, and tears all of it down on SIGINT/SIGTERM. Grounded
//! on `brickd_linux.py::BrickdLinux`'s start/stop shape and signal wiring,
//! minus the double-fork daemonization (out of scope, see SPEC_FULL §1/§6).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rusb::Context;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::registry::Registry;
use crate::{hotplug, server};

const EVENTS_CHANNEL_CAPACITY: usize = 256;

/// Run the daemon to completion: returns once a shutdown signal has been
/// handled and every task has wound down cleanly.
pub async fn run(config: Config) -> Result<()> {
    let context = Context::new().map_err(Error::Usb)?;
    let registry = Arc::new(Registry::new());
    let stop = Arc::new(AtomicBool::new(false));

    let (events_tx, events_rx) = tokio::sync::mpsc::channel(EVENTS_CHANNEL_CAPACITY);

    let dispatch_task = tokio::spawn(server::run_dispatch(Arc::clone(&registry), events_rx));

    let hotplug_thread = {
        let context = context.clone();
        let registry = Arc::clone(&registry);
        let events_tx = events_tx.clone();
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || hotplug::run(context, registry, events_tx, stop))
    };

    let listener = server::bind(config.listen_addr())
        .await
        .map_err(|source| Error::Bind {
            addr: config.listen_addr(),
            source,
        })?;
    log::info!("listening on {}", config.listen_addr());
    let server_task = tokio::spawn(server::run(listener, Arc::clone(&registry)));

    wait_for_shutdown_signal().await;
    log::info!("shutdown signal received, winding down");

    stop.store(true, Ordering::Relaxed);

    // every client needs to see its devices go away before the tasks that
    // would otherwise deliver that news are torn down.
    for (global_id, uid, name) in registry.all_devices() {
        let frame = Frame::denumerate(uid, &name, global_id);
        for client in registry.all_clients() {
            client.deliver(frame.clone());
        }
    }

    server_task.abort();
    dispatch_task.abort();
    match tokio::task::spawn_blocking(move || hotplug_thread.join()).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => log::warn!("hotplug thread panicked"),
        Err(err) => log::warn!("failed to join hotplug thread: {err}"),
    }

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
