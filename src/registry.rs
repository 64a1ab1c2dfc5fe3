//! ## Device registry
//!
//! Process-wide state: which global stack ids exist and who owns them, the
//! live TCP client list, per-device subscriber sets, and the bounded
//! pending-response queues that pair a reply with the client that asked for
//! it.
//!
//! Grounded on `brick_protocol.py`'s module-level `device_dict` /
//! `brick_protocol_list`, rehomed behind an explicit `Arc<Registry>` handle
//! per Design Notes §9 instead of living as ambient module state. Mutated
//! only from TCP-side tasks and the hotplug controller (SPEC_FULL §5); USB
//! workers only read it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use crate::constants::frame::MAX_PENDING_PER_KEY;
use crate::frame::Frame;

/// Identifies one USB device worker, independent of which global stack ids
/// it currently owns.
pub type WorkerId = u64;

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_worker_id() -> WorkerId {
    NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed)
}

pub type ClientId = u64;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// A delivery capability: something a registry entry can hand a frame to
/// without knowing how the client's socket is driven.
#[derive(Clone)]
pub struct ClientHandle {
    id: ClientId,
    tx: tokio::sync::mpsc::Sender<Frame>,
}

impl ClientHandle {
    pub fn new(tx: tokio::sync::mpsc::Sender<Frame>) -> Self {
        ClientHandle {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Hand the frame to the client's write task. A disconnected or
    /// backlogged client silently drops the frame rather than blocking the
    /// deliverer (§4.6: "a stale entry ... is simply discarded").
    pub fn deliver(&self, frame: Frame) {
        if let Err(err) = self.tx.try_send(frame) {
            log::warn!("dropping frame for client {}: {}", self.id, err);
        }
    }
}

impl PartialEq for ClientHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for ClientHandle {}

impl std::hash::Hash for ClientHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// A device as seen by clients: one global stack id.
pub struct DeviceRecord {
    pub worker_id: WorkerId,
    pub uid: [u8; 8],
    pub name: String,
    subscribers: HashSet<ClientId>,
}

struct RegistryInner {
    devices: HashMap<u8, DeviceRecord>,
    worker_senders: HashMap<WorkerId, std::sync::mpsc::SyncSender<Frame>>,
    clients: HashMap<ClientId, ClientHandle>,
}

/// Process-wide registry handle. Cheap to clone (it's `Arc`-free on purpose;
/// callers hold `Arc<Registry>` per Design Notes §9).
pub struct Registry {
    inner: RwLock<RegistryInner>,
    pending: Mutex<HashMap<[u8; 2], VecDeque<ClientHandle>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            inner: RwLock::new(RegistryInner {
                devices: HashMap::new(),
                worker_senders: HashMap::new(),
                clients: HashMap::new(),
            }),
            pending: Mutex::new(HashMap::new()),
        }
    }

    // -- worker lifecycle -------------------------------------------------

    pub fn register_worker(&self, worker_id: WorkerId, sender: std::sync::mpsc::SyncSender<Frame>) {
        self.inner.write().unwrap().worker_senders.insert(worker_id, sender);
    }

    /// Remove a worker and every device record it owned. Returns the
    /// removed records (global id, uid, name) so the caller can synthesize
    /// "device gone" broadcasts.
    pub fn unregister_worker(&self, worker_id: WorkerId) -> Vec<(u8, [u8; 8], String)> {
        let mut inner = self.inner.write().unwrap();
        inner.worker_senders.remove(&worker_id);

        let gone: Vec<u8> = inner
            .devices
            .iter()
            .filter(|(_, record)| record.worker_id == worker_id)
            .map(|(global_id, _)| *global_id)
            .collect();

        let mut removed = Vec::with_capacity(gone.len());
        for global_id in gone {
            if let Some(record) = inner.devices.remove(&global_id) {
                removed.push((global_id, record.uid, record.name));
            }
        }
        removed
    }

    /// Every worker currently registered, deduplicated by worker id — used
    /// to fan a client broadcast out to each physical stack exactly once
    /// (§4.4).
    pub fn worker_senders(&self) -> Vec<std::sync::mpsc::SyncSender<Frame>> {
        self.inner
            .read()
            .unwrap()
            .worker_senders
            .values()
            .cloned()
            .collect()
    }

    pub fn worker_sender(&self, worker_id: WorkerId) -> Option<std::sync::mpsc::SyncSender<Frame>> {
        self.inner.read().unwrap().worker_senders.get(&worker_id).cloned()
    }

    // -- device records ----------------------------------------------------

    pub fn has_device(&self, global_id: u8) -> bool {
        self.inner.read().unwrap().devices.contains_key(&global_id)
    }

    pub fn uid_of(&self, global_id: u8) -> Option<[u8; 8]> {
        self.inner.read().unwrap().devices.get(&global_id).map(|r| r.uid)
    }

    pub fn worker_of(&self, global_id: u8) -> Option<WorkerId> {
        self.inner.read().unwrap().devices.get(&global_id).map(|r| r.worker_id)
    }

    /// The worker that owns `global_id`, if any device is currently
    /// registered under it.
    pub fn worker_sender_for_device(&self, global_id: u8) -> Option<std::sync::mpsc::SyncSender<Frame>> {
        let inner = self.inner.read().unwrap();
        let worker_id = inner.devices.get(&global_id)?.worker_id;
        inner.worker_senders.get(&worker_id).cloned()
    }

    /// Every currently registered device (global id, uid, name). Used by the
    /// supervisor to synthesize "device gone" broadcasts on shutdown, before
    /// any worker is actually torn down.
    pub fn all_devices(&self) -> Vec<(u8, [u8; 8], String)> {
        self.inner
            .read()
            .unwrap()
            .devices
            .iter()
            .map(|(global_id, record)| (*global_id, record.uid, record.name.clone()))
            .collect()
    }

    /// Insert a device record the first time a global id is observed.
    /// Returns `true` if a new record was inserted.
    pub fn insert_device_if_absent(
        &self,
        global_id: u8,
        worker_id: WorkerId,
        uid: [u8; 8],
        name: String,
    ) -> bool {
        let mut inner = self.inner.write().unwrap();
        if inner.devices.contains_key(&global_id) {
            return false;
        }
        inner.devices.insert(
            global_id,
            DeviceRecord {
                worker_id,
                uid,
                name,
                subscribers: HashSet::new(),
            },
        );
        true
    }

    /// Scan `1..=254` for a global id not currently in use. Never returns 0
    /// (reserved for broadcast).
    pub fn find_unused_global_id(&self) -> Option<u8> {
        let inner = self.inner.read().unwrap();
        (1u8..=254).find(|id| !inner.devices.contains_key(id))
    }

    // -- subscriptions ------------------------------------------------------

    /// Add `client` as a subscriber of every device whose UID matches
    /// (§4.4's `type == 255` "get stack id" request handling).
    pub fn subscribe_by_uid(&self, uid: [u8; 8], client: &ClientHandle) {
        let mut inner = self.inner.write().unwrap();
        for record in inner.devices.values_mut() {
            if record.uid == uid {
                record.subscribers.insert(client.id());
            }
        }
    }

    /// Delivery capabilities of every client subscribed to `global_id`.
    pub fn subscribers_of(&self, global_id: u8) -> Vec<ClientHandle> {
        let inner = self.inner.read().unwrap();
        let Some(record) = inner.devices.get(&global_id) else {
            return Vec::new();
        };
        record
            .subscribers
            .iter()
            .filter_map(|id| inner.clients.get(id).cloned())
            .collect()
    }

    // -- clients --------------------------------------------------------------

    pub fn add_client(&self, client: ClientHandle) {
        self.inner.write().unwrap().clients.insert(client.id(), client);
    }

    pub fn all_clients(&self) -> Vec<ClientHandle> {
        self.inner.read().unwrap().clients.values().cloned().collect()
    }

    /// Remove a disconnected client from the client list, every device's
    /// subscriber set, and every pending-response queue (§4.6, best-effort).
    pub fn remove_client(&self, client_id: ClientId) {
        let mut inner = self.inner.write().unwrap();
        inner.clients.remove(&client_id);
        for record in inner.devices.values_mut() {
            record.subscribers.remove(&client_id);
        }
        drop(inner);

        let mut pending = self.pending.lock().unwrap();
        for queue in pending.values_mut() {
            queue.retain(|c| c.id() != client_id);
        }
    }

    // -- pending responses ------------------------------------------------

    /// Register `client` against `request_key` before the request frame is
    /// enqueued for the device (§4.5's ordering guarantee). Returns
    /// `Err(Error::PendingResponseOverflow)` if the per-key cap is already
    /// reached, in which case the new registration is dropped and existing
    /// entries are left alone (DESIGN.md's resolution of the §3/§4.5
    /// wording conflict).
    pub fn push_pending(&self, request_key: [u8; 2], client: ClientHandle) -> crate::error::Result<()> {
        let mut pending = self.pending.lock().unwrap();
        let queue = pending.entry(request_key).or_default();
        if queue.len() >= MAX_PENDING_PER_KEY {
            return Err(crate::error::Error::PendingResponseOverflow);
        }
        queue.push_back(client);
        Ok(())
    }

    /// Pop the oldest client registered for `request_key`, if any.
    pub fn pop_pending(&self, request_key: [u8; 2]) -> Option<ClientHandle> {
        let mut pending = self.pending.lock().unwrap();
        let queue = pending.get_mut(&request_key)?;
        let client = queue.pop_front();
        if queue.is_empty() {
            pending.remove(&request_key);
        }
        client
    }
}
