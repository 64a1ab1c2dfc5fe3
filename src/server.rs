//! ## TCP server
//!
//! One task per connection plus a single dispatch task that is the only
//! consumer of the worker-to-event-loop channel and therefore the only
//! writer of device records (SPEC_FULL §5). Grounded on the
//! per-session-task-plus-shared-dispatch shape of
//! `10c62234_Tonksthebear-trybotster__cli-src-broker-mod.rs.rs`; the
//! client-facing protocol semantics follow `brick_protocol.py::BrickProtocol`.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::frame::Frame;
use crate::reassembler::Reassembler;
use crate::registry::{ClientHandle, Registry, WorkerId};

const CLIENT_OUTBOX_CAPACITY: usize = 64;
const READ_BUF_SIZE: usize = 4096;

/// Run the TCP listener until `addr`'s socket errors out or the process is
/// asked to shut down. Each accepted connection gets its own task.
pub async fn run(listener: TcpListener, registry: Arc<Registry>) -> std::io::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            log::info!("client connected: {peer}");
            handle_connection(socket, registry).await;
            log::info!("client disconnected: {peer}");
        });
    }
}

pub async fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

async fn handle_connection(socket: TcpStream, registry: Arc<Registry>) {
    let (mut reader, mut writer) = socket.into_split();
    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(CLIENT_OUTBOX_CAPACITY);
    let client = ClientHandle::new(out_tx);
    registry.add_client(client.clone());

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if writer.write_all(frame.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut reassembler = Reassembler::new();
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                log::warn!("read error from client {}: {}", client.id(), err);
                break;
            }
        };

        match reassembler.feed(&buf[..n]) {
            Ok(frames) => {
                for frame in frames {
                    route_client_frame(&registry, &client, frame);
                }
            }
            Err(err) => {
                log::warn!("malformed stream from client {}: {}", client.id(), err);
                break;
            }
        }
    }

    registry.remove_client(client.id());
    writer_task.abort();
}

/// Route one frame read from a client socket: broadcasts fan out to every
/// worker (registering a UID subscription first for get-stack-id requests),
/// direct frames are paired with a pending-response registration before
/// being handed to the owning worker (§4.5's "register before enqueue"
/// ordering).
fn route_client_frame(registry: &Registry, client: &ClientHandle, frame: Frame) {
    if frame.is_broadcast() {
        if frame.is_get_stack_id() {
            registry.subscribe_by_uid(frame.request_uid(), client);
        }
        for sender in registry.worker_senders() {
            let _ = sender.send(frame.clone());
        }
        return;
    }

    if let Err(err) = registry.push_pending(frame.request_key(), client.clone()) {
        log::warn!("{err}");
    }
    match registry.worker_sender_for_device(frame.stack_id()) {
        Some(sender) => {
            let _ = sender.send(frame);
        }
        None => log::warn!("no worker owns stack id {}", frame.stack_id()),
    }
}

/// The single dispatch task: the only thing on the TCP side of the daemon
/// allowed to insert device records, since USB workers only ever read the
/// registry (SPEC_FULL §4.2, §5).
pub async fn run_dispatch(registry: Arc<Registry>, mut events_rx: mpsc::Receiver<(WorkerId, Frame)>) {
    while let Some((worker_id, frame)) = events_rx.recv().await {
        if frame.is_enumerate_callback() {
            if frame.enumerate_is_present() {
                registry.insert_device_if_absent(
                    frame.enumerate_stack_id(),
                    worker_id,
                    frame.enumerate_uid(),
                    frame.enumerate_name(),
                );
            }
            broadcast(&registry, &frame);
            continue;
        }

        if frame.is_broadcast() {
            broadcast(&registry, &frame);
            continue;
        }

        if let Some(client) = registry.pop_pending(frame.request_key()) {
            client.deliver(frame.clone());
        }
        for subscriber in registry.subscribers_of(frame.stack_id()) {
            subscriber.deliver(frame.clone());
        }
    }
}

fn broadcast(registry: &Registry, frame: &Frame) {
    for client in registry.all_clients() {
        client.deliver(frame.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> (ClientHandle, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(8);
        (ClientHandle::new(tx), rx)
    }

    #[tokio::test]
    async fn direct_frame_registers_pending_and_forwards_to_worker() {
        let registry = Registry::new();
        let (worker_tx, worker_rx) = std::sync::mpsc::sync_channel::<Frame>(8);
        registry.register_worker(1, worker_tx);
        registry.insert_device_if_absent(5, 1, [1; 8], "brick".into());

        let (client, _rx) = test_client();
        let frame = Frame::parse(&[5, 7, 4, 0]).unwrap();
        route_client_frame(&registry, &client, frame.clone());

        assert_eq!(worker_rx.recv().unwrap(), frame);
        let pending = registry.pop_pending([5, 7]).unwrap();
        assert_eq!(pending.id(), client.id());
    }

    #[tokio::test]
    async fn broadcast_get_stack_id_subscribes_before_fanout() {
        let registry = Registry::new();
        let (worker_tx, worker_rx) = std::sync::mpsc::sync_channel::<Frame>(8);
        registry.register_worker(1, worker_tx);
        registry.insert_device_if_absent(9, 1, [4; 8], "brick".into());

        let (client, _rx) = test_client();
        let mut bytes = vec![0u8, crate::constants::frame::TYPE_GET_STACK_ID, 12, 0];
        bytes.extend_from_slice(&[4; 8]);
        let frame = Frame::parse(&bytes).unwrap();

        route_client_frame(&registry, &client, frame.clone());

        assert_eq!(worker_rx.recv().unwrap(), frame);
        assert_eq!(registry.subscribers_of(9).len(), 1);
    }

    #[tokio::test]
    async fn dispatch_inserts_device_once_and_broadcasts_enumerate_callback() {
        let registry = Arc::new(Registry::new());
        let (events_tx, events_rx) = mpsc::channel(8);
        let dispatch = tokio::spawn(run_dispatch(Arc::clone(&registry), events_rx));

        let (client, mut client_rx) = test_client();
        registry.add_client(client);

        let frame = Frame::denumerate([7; 8], "Master Brick", 3); // reuse layout, just flip the flag
        let mut bytes = frame.as_bytes().to_vec();
        bytes[crate::constants::frame::ENUMERATE_IS_PRESENT_OFFSET] = 1;
        let present_frame = Frame::parse(&bytes).unwrap();

        events_tx.send((1, present_frame)).await.unwrap();

        let delivered = client_rx.recv().await.unwrap();
        assert!(delivered.is_enumerate_callback());
        assert!(registry.has_device(3));

        drop(events_tx);
        dispatch.await.unwrap();
    }

    #[tokio::test]
    async fn dispatch_pairs_response_with_registered_client() {
        let registry = Arc::new(Registry::new());
        let (events_tx, events_rx) = mpsc::channel(8);
        let dispatch = tokio::spawn(run_dispatch(Arc::clone(&registry), events_rx));

        let (client, mut client_rx) = test_client();
        registry.push_pending([5, 10], client).unwrap();

        let reply = Frame::parse(&[5, 10, 4, 0]).unwrap();
        events_tx.send((1, reply.clone())).await.unwrap();

        let delivered = client_rx.recv().await.unwrap();
        assert_eq!(delivered, reply);

        drop(events_tx);
        dispatch.await.unwrap();
    }
}
