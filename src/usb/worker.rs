//! ## Device worker
//!
//! One worker per physical brick stack: a handful of reader threads, a
//! single writer thread draining a bounded outbound queue, and the routing
//! table that translates between the stack's own local ids and the
//! daemon-global ids clients see.
//!
//! The outbound queue is a `std::sync::mpsc::sync_channel` capped at
//! `NUM_WRITE_TRANSFER`: one writer thread is what guarantees frames hit the
//! wire in the order they were enqueued (§5's ordering guarantee — a pool of
//! writer threads popping off a shared receiver can't promise that, since
//! the thread that pops frame 2 may call `write_bulk` before the thread that
//! popped frame 1 gets scheduled), and the channel's bounded capacity is
//! what gives a bursty producer real backpressure once `NUM_WRITE_TRANSFER`
//! frames are queued and not yet written.
//!
//! Generalizes `init.rs`'s one-shot open/claim sequence into a long-lived
//! pipeline, following `usb_device.py::USBDevice.__init__`'s shape: claim
//! the device, kick off an enumerate request, then keep reading until the
//! device is gone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rusb::{Context, DeviceHandle};

use crate::constants::frame::{ENUMERATE_STACK_ID_OFFSET, GET_STACK_ID_REPLY_OFFSET, HEADER_SIZE};
use crate::constants::usb::{NUM_READ_TRANSFER, NUM_WRITE_TRANSFER, READ_BUFFER_SIZE, TRANSFER_TIMEOUT_MS};
use crate::error::Result;
use crate::frame::Frame;
use crate::registry::{next_worker_id, Registry, WorkerId};
use crate::routing::RoutingTable;

use super::DeviceAddr;

/// A live device worker. Dropping it does not stop its threads; call
/// [`Worker::shutdown`] and [`Worker::join`] for an orderly teardown.
pub struct Worker {
    id: WorkerId,
    addr: DeviceAddr,
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl Worker {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn addr(&self) -> DeviceAddr {
        self.addr
    }

    /// Ask every reader/writer thread to stop at its next wakeup.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Block until every thread has exited.
    pub fn join(self) {
        for thread in self.threads {
            let _ = thread.join();
        }
    }

    /// Open `addr`, claim it, and spin up its reader/writer pool.
    /// `events_tx` is the single channel every worker posts inbound frames
    /// to; the dispatch task on the other end is the only thing allowed to
    /// mutate `registry`'s device records (SPEC_FULL §5).
    pub fn spawn(
        context: &Context,
        addr: DeviceAddr,
        registry: Arc<Registry>,
        events_tx: tokio::sync::mpsc::Sender<(WorkerId, Frame)>,
    ) -> Result<Worker> {
        let (handle, bulk_in, bulk_out) = super::open_brick(context, addr)?;
        let handle = Arc::new(handle);
        let worker_id = next_worker_id();
        let routing = Arc::new(Mutex::new(RoutingTable::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let (out_tx, out_rx) = std::sync::mpsc::sync_channel::<Frame>(NUM_WRITE_TRANSFER);
        registry.register_worker(worker_id, out_tx.clone());

        let mut threads = Vec::with_capacity(NUM_READ_TRANSFER + 1);

        for _ in 0..NUM_READ_TRANSFER {
            let handle = Arc::clone(&handle);
            let routing = Arc::clone(&routing);
            let registry = Arc::clone(&registry);
            let events_tx = events_tx.clone();
            let stop = Arc::clone(&stop);
            threads.push(std::thread::spawn(move || {
                reader_loop(handle, bulk_in, routing, registry, worker_id, events_tx, stop);
            }));
        }

        {
            let handle = Arc::clone(&handle);
            let routing = Arc::clone(&routing);
            let stop = Arc::clone(&stop);
            threads.push(std::thread::spawn(move || {
                writer_loop(handle, bulk_out, routing, out_rx, stop, worker_id);
            }));
        }

        // every stack introduces itself on attach, per usb_device.py
        let _ = out_tx.try_send(Frame::enumerate_request());

        Ok(Worker {
            id: worker_id,
            addr,
            stop,
            threads,
        })
    }
}

fn reader_loop(
    handle: Arc<DeviceHandle<Context>>,
    bulk_in: u8,
    routing: Arc<Mutex<RoutingTable>>,
    registry: Arc<Registry>,
    worker_id: WorkerId,
    events_tx: tokio::sync::mpsc::Sender<(WorkerId, Frame)>,
    stop: Arc<AtomicBool>,
) {
    let timeout = Duration::from_millis(TRANSFER_TIMEOUT_MS);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    while !stop.load(Ordering::Relaxed) {
        match handle.read_bulk(bulk_in, &mut buf, timeout) {
            Ok(n) if n >= HEADER_SIZE => match Frame::parse(&buf[..n]) {
                Ok(frame) => match translate_inbound(frame, &routing, &registry) {
                    Ok(frame) => {
                        if events_tx.blocking_send((worker_id, frame)).is_err() {
                            break;
                        }
                    }
                    Err(err) => log::error!("worker {}: {}", worker_id, err),
                },
                Err(err) => log::warn!("malformed frame from worker {}: {}", worker_id, err),
            },
            Ok(_) => {}
            Err(rusb::Error::Timeout) => continue,
            Err(rusb::Error::NoDevice) => break,
            Err(err) => {
                log::warn!("read error on worker {}: {}", worker_id, err);
                break;
            }
        }
    }
}

fn writer_loop(
    handle: Arc<DeviceHandle<Context>>,
    bulk_out: u8,
    routing: Arc<Mutex<RoutingTable>>,
    rx: std::sync::mpsc::Receiver<Frame>,
    stop: Arc<AtomicBool>,
    worker_id: WorkerId,
) {
    let timeout = Duration::from_millis(TRANSFER_TIMEOUT_MS);

    while !stop.load(Ordering::Relaxed) {
        let mut frame = match rx.recv_timeout(Duration::from_millis(TRANSFER_TIMEOUT_MS)) {
            Ok(frame) => frame,
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        };

        if !frame.is_broadcast() {
            let local_id = routing.lock().unwrap().map_out(frame.stack_id());
            frame.set_stack_id(local_id);
        }

        if let Err(err) = handle.write_bulk(bulk_out, frame.as_bytes(), timeout) {
            log::warn!("write error on worker {}: {}", worker_id, err);
            if matches!(err, rusb::Error::NoDevice) {
                break;
            }
        }
    }
}

/// Apply a worker's routing table to an inbound frame, resolving a global
/// stack-id collision if the local id this frame carries was already
/// claimed (under a different UID) by some other device. Returns
/// `Err(Error::RoutingTableExhausted)` if the frame has to be dropped
/// because every global id is already taken.
fn translate_inbound(
    mut frame: Frame,
    routing: &Mutex<RoutingTable>,
    registry: &Registry,
) -> crate::error::Result<Frame> {
    if frame.is_enumerate_callback() {
        let local_id = frame.enumerate_stack_id();
        let uid = frame.enumerate_uid();

        let mut rt = routing.lock().unwrap();
        let mut global_id = rt.map_in(local_id);
        if registry.uid_of(global_id).is_some_and(|existing| existing != uid) {
            let new_id = registry
                .find_unused_global_id()
                .ok_or(crate::error::Error::RoutingTableExhausted)?;
            rt.rebind(local_id, new_id);
            global_id = new_id;
        }
        drop(rt);

        frame.set_byte(ENUMERATE_STACK_ID_OFFSET, global_id);
        return Ok(frame);
    }

    if frame.is_get_stack_id() {
        let local_id = frame.byte(GET_STACK_ID_REPLY_OFFSET);
        let global_id = routing.lock().unwrap().map_in(local_id);
        frame.set_byte(GET_STACK_ID_REPLY_OFFSET, global_id);
        return Ok(frame);
    }

    if !frame.is_broadcast() {
        let global_id = routing.lock().unwrap().map_in(frame.stack_id());
        frame.set_stack_id(global_id);
    }

    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::frame::{
        ENUMERATE_CALLBACK_LENGTH, ENUMERATE_UID_OFFSET, STACK_ID_BROADCAST, TYPE_ENUMERATE_CALLBACK,
        TYPE_GET_STACK_ID,
    };

    fn enumerate_callback_frame(local_id: u8, uid: [u8; 8]) -> Frame {
        let mut bytes = vec![0u8; ENUMERATE_CALLBACK_LENGTH];
        bytes[0] = STACK_ID_BROADCAST;
        bytes[1] = TYPE_ENUMERATE_CALLBACK;
        bytes[2..4].copy_from_slice(&(ENUMERATE_CALLBACK_LENGTH as u16).to_le_bytes());
        bytes[ENUMERATE_UID_OFFSET..ENUMERATE_UID_OFFSET + 8].copy_from_slice(&uid);
        bytes[ENUMERATE_STACK_ID_OFFSET] = local_id;
        bytes[53] = 1; // present
        Frame::parse(&bytes).unwrap()
    }

    fn get_stack_id_frame(local_id: u8) -> Frame {
        let mut bytes = vec![0u8; GET_STACK_ID_REPLY_OFFSET + 9];
        bytes[0] = STACK_ID_BROADCAST;
        bytes[1] = TYPE_GET_STACK_ID;
        let len = bytes.len() as u16;
        bytes[2..4].copy_from_slice(&len.to_le_bytes());
        bytes[GET_STACK_ID_REPLY_OFFSET] = local_id;
        Frame::parse(&bytes).unwrap()
    }

    #[test]
    fn enumerate_without_collision_keeps_identity_mapping() {
        let routing = Mutex::new(RoutingTable::new());
        let registry = Registry::new();
        let frame = enumerate_callback_frame(1, [9; 8]);

        let out = translate_inbound(frame, &routing, &registry).unwrap();
        assert_eq!(out.enumerate_stack_id(), 1);
    }

    #[test]
    fn enumerate_collision_reassigns_and_rebinds() {
        let routing = Mutex::new(RoutingTable::new());
        let registry = Registry::new();
        registry.insert_device_if_absent(1, 999, [1; 8], "other".into());

        let frame = enumerate_callback_frame(1, [2; 8]);
        let out = translate_inbound(frame, &routing, &registry).unwrap();

        assert_eq!(out.enumerate_stack_id(), 2);
        assert_eq!(routing.lock().unwrap().map_in(1), 2);
    }

    #[test]
    fn get_stack_id_reply_rewritten_via_in_map() {
        let routing = Mutex::new(RoutingTable::new());
        routing.lock().unwrap().rebind(3, 77);
        let registry = Registry::new();

        let frame = get_stack_id_frame(3);
        let out = translate_inbound(frame, &routing, &registry).unwrap();
        assert_eq!(out.byte(GET_STACK_ID_REPLY_OFFSET), 77);
    }

    #[test]
    fn addressed_frame_stack_id_rewritten_via_in_map() {
        let routing = Mutex::new(RoutingTable::new());
        routing.lock().unwrap().rebind(5, 200);
        let registry = Registry::new();

        let frame = Frame::parse(&[5, 10, 4, 0]).unwrap();
        let out = translate_inbound(frame, &routing, &registry).unwrap();
        assert_eq!(out.stack_id(), 200);
    }
}
