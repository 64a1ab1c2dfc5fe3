//! ## Hotplug controller
//!
//! Watches for bricks being plugged in and unplugged. Hotplug callbacks are
//! treated purely as a wakeup signal — the actual set of present devices is
//! always re-derived by enumerating the bus and diffing against what we
//! already have a worker for, never by trusting the event's own payload.
//!
//! Grounded on `cdf461bf_keepkey-keepkey-bitcoin-only__...usb_manager.rs.rs`'s
//! `spawn_rusb_hotplug_listener` (register + `handle_events` loop) for the
//! libusb wiring, and `usb_notifier.py::notify_added`/`notify_removed` for
//! the add/remove diff semantics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusb::{Context, Hotplug, UsbContext};

use crate::constants::usb::{PRODUCT_ID, VENDOR_ID};
use crate::frame::Frame;
use crate::registry::{Registry, WorkerId};
use crate::usb::worker::Worker;
use crate::usb::{self, DeviceAddr};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Does nothing but log: the event's own payload is never trusted, so
/// arrival/departure is only ever acted on by [`reconcile`]'s own
/// enumerate-and-diff on the next poll tick.
struct WakeupHandler;

impl Hotplug<Context> for WakeupHandler {
    fn device_arrived(&mut self, _device: rusb::Device<Context>) {
        log::debug!("hotplug: arrival event (reconciling on next poll tick)");
    }

    fn device_left(&mut self, _device: rusb::Device<Context>) {
        log::debug!("hotplug: departure event (reconciling on next poll tick)");
    }
}

/// Run the reconciliation loop until `stop` is set. Blocks the calling
/// thread; callers should spawn this on a dedicated `std::thread`.
pub fn run(
    context: Context,
    registry: Arc<Registry>,
    events_tx: tokio::sync::mpsc::Sender<(WorkerId, Frame)>,
    stop: Arc<AtomicBool>,
) {
    let _callback_handle = if rusb::has_hotplug() {
        rusb::HotplugBuilder::new()
            .vendor_id(VENDOR_ID)
            .product_id(PRODUCT_ID)
            .enumerate(true)
            .register(&context, Box::new(WakeupHandler))
            .ok()
    } else {
        log::warn!("libusb hotplug support unavailable; falling back to polling only");
        None
    };

    let active: Mutex<HashMap<DeviceAddr, Worker>> = Mutex::new(HashMap::new());

    while !stop.load(Ordering::Relaxed) {
        if rusb::has_hotplug() {
            let _ = context.handle_events(Some(POLL_INTERVAL));
        } else {
            std::thread::sleep(POLL_INTERVAL);
        }

        reconcile(&context, &registry, &events_tx, &active);
    }

    let mut active = active.lock().unwrap();
    for (_, worker) in active.drain() {
        let worker_id = worker.id();
        worker.shutdown();
        worker.join();
        // the "device gone" broadcasts for a normal shutdown are already sent
        // by the supervisor before it gets here; this just drops the
        // registry's bookkeeping for each worker so it doesn't linger.
        registry.unregister_worker(worker_id);
    }
}

fn reconcile(
    context: &Context,
    registry: &Arc<Registry>,
    events_tx: &tokio::sync::mpsc::Sender<(WorkerId, Frame)>,
    active: &Mutex<HashMap<DeviceAddr, Worker>>,
) {
    let present = match usb::enumerate_bricks(context) {
        Ok(present) => present,
        Err(err) => {
            log::warn!("failed to enumerate bricks: {err}");
            return;
        }
    };

    let mut active = active.lock().unwrap();

    for addr in &present {
        if active.contains_key(addr) {
            continue;
        }
        match Worker::spawn(context, *addr, Arc::clone(registry), events_tx.clone()) {
            Ok(worker) => {
                log::info!("brick attached at bus {} address {}", addr.0, addr.1);
                active.insert(*addr, worker);
            }
            Err(err) => log::warn!("failed to open brick at {:?}: {}", addr, err),
        }
    }

    let gone: Vec<DeviceAddr> = active
        .keys()
        .filter(|addr| !present.contains(addr))
        .copied()
        .collect();

    for addr in gone {
        let Some(worker) = active.remove(&addr) else { continue };
        log::info!("brick detached at bus {} address {}", addr.0, addr.1);
        let worker_id = worker.id();
        worker.shutdown();
        worker.join();

        for (global_id, uid, name) in registry.unregister_worker(worker_id) {
            let frame = Frame::denumerate(uid, &name, global_id);
            if events_tx.blocking_send((worker_id, frame)).is_err() {
                break;
            }
        }
    }
}
