//! Connection management for the delegate mesh.
//!
//! Policy: the delegate with the smaller index dials the one with the
//! larger index, which accepts and identifies the dialer by source
//! address.  Quiet channels get heartbeats every 20 s; a channel silent
//! past the message age limit is torn down and redialed on a 5 s back-off.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conclave_primitives::prelude::*;
use conclave_wire::{ConsensusMessage, MessageType};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tracing::*;

use crate::channel::{read_frame, write_frame};
use crate::{MessageDispatch, NetError};

/// Outbound queue depth per peer.
const SEND_QUEUE_DEPTH: usize = 1024;

/// Whether the local delegate is the dialing side for a peer.
pub fn should_dial(local: DelegateId, remote: DelegateId) -> bool {
    local < remote
}

struct PeerHandle {
    tx: mpsc::Sender<Vec<u8>>,
    last_recv_ms: Arc<AtomicU64>,
    close: Arc<Notify>,
}

pub struct NetIoManager {
    local_id: DelegateId,
    epoch_number: u32,
    addresses: HashMap<DelegateId, SocketAddr>,
    dispatch: Arc<dyn MessageDispatch>,
    peers: Mutex<HashMap<DelegateId, PeerHandle>>,
    heartbeat_enabled: bool,
    /// Marked at epoch end; frames are dropped after the drain window.
    epoch_over: AtomicBool,
    stopped: AtomicBool,
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl NetIoManager {
    pub fn new(
        local_id: DelegateId,
        epoch_number: u32,
        addresses: HashMap<DelegateId, SocketAddr>,
        dispatch: Arc<dyn MessageDispatch>,
        heartbeat_enabled: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_id,
            epoch_number,
            addresses,
            dispatch,
            peers: Mutex::new(HashMap::new()),
            heartbeat_enabled,
            epoch_over: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn epoch_number(&self) -> u32 {
        self.epoch_number
    }

    pub fn connected_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Marks the channel set as retired; frames stop flowing.
    pub fn mark_epoch_over(&self) {
        self.epoch_over.store(true, Ordering::Release);
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let peers = self.peers.lock();
        for handle in peers.values() {
            handle.close.notify_waiters();
        }
    }

    /// Spawns the listener, the dialers for higher-indexed peers, and the
    /// heartbeat loop.
    pub async fn start(self: &Arc<Self>, listen_port: u16) -> Result<(), NetError> {
        let listener = TcpListener::bind(("0.0.0.0", listen_port)).await?;
        info!(port = listen_port, "delegate mesh listening");

        let this = self.clone();
        tokio::spawn(async move {
            this.accept_loop(listener).await;
        });

        for (&remote, &addr) in &self.addresses {
            if remote != self.local_id && should_dial(self.local_id, remote) {
                let this = self.clone();
                tokio::spawn(async move {
                    this.dial_loop(remote, addr).await;
                });
            }
        }

        if self.heartbeat_enabled {
            let this = self.clone();
            tokio::spawn(async move {
                this.heartbeat_loop().await;
            });
        }

        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            if self.stopped.load(Ordering::Acquire) {
                return;
            }
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    match self.identify(peer_addr.ip()) {
                        Some(remote) if !should_dial(self.local_id, remote) => {
                            debug!(%remote, %peer_addr, "accepted peer channel");
                            let this = self.clone();
                            tokio::spawn(async move {
                                this.run_connection(remote, stream).await;
                            });
                        }
                        Some(remote) => {
                            warn!(%remote, "peer dialed against policy, dropping");
                        }
                        None => {
                            warn!(%peer_addr, "connection from unknown address");
                        }
                    }
                }
                Err(e) => {
                    warn!(err = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        }
    }

    fn identify(&self, ip: IpAddr) -> Option<DelegateId> {
        self.addresses
            .iter()
            .find(|(_, addr)| addr.ip() == ip)
            .map(|(&id, _)| id)
    }

    async fn dial_loop(self: Arc<Self>, remote: DelegateId, addr: SocketAddr) {
        loop {
            if self.stopped.load(Ordering::Acquire) || self.epoch_over.load(Ordering::Acquire) {
                return;
            }
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    debug!(%remote, %addr, "dialed peer channel");
                    self.clone().run_connection(remote, stream).await;
                    info!(%remote, "peer channel ended, redialing");
                }
                Err(e) => {
                    debug!(%remote, err = %e, "dial failed");
                }
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    /// Services one live connection until error, close or shutdown.
    async fn run_connection(self: Arc<Self>, remote: DelegateId, stream: TcpStream) {
        let (mut read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(SEND_QUEUE_DEPTH);
        let last_recv_ms = Arc::new(AtomicU64::new(now_ms()));
        let close = Arc::new(Notify::new());

        self.peers.lock().insert(
            remote,
            PeerHandle {
                tx,
                last_recv_ms: last_recv_ms.clone(),
                close: close.clone(),
            },
        );

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if write_frame(&mut write_half, &frame).await.is_err() {
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                result = read_frame(&mut read_half) => {
                    match result {
                        Ok((prequel, msg)) => {
                            last_recv_ms.store(now_ms(), Ordering::Release);
                            if self.epoch_over.load(Ordering::Acquire) {
                                // Retired channel: drain silently.
                                continue;
                            }
                            if prequel.message_type == MessageType::HeartBeat {
                                continue;
                            }
                            self.dispatch.on_message(remote, prequel.consensus_kind, msg);
                        }
                        Err(e) => {
                            debug!(%remote, err = %e, "read failed, closing channel");
                            break;
                        }
                    }
                }
                _ = close.notified() => {
                    debug!(%remote, "channel close requested");
                    break;
                }
            }
        }

        writer.abort();
        self.peers.lock().remove(&remote);
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            ticker.tick().await;
            if self.stopped.load(Ordering::Acquire) {
                return;
            }

            let now = now_ms();
            let age_limit = MESSAGE_AGE_LIMIT.as_millis() as u64;
            let quiet_after = HEARTBEAT_INTERVAL.as_millis() as u64;
            let heartbeat =
                ConsensusMessage::HeartBeat.encode_frame(ConsensusKind::Request);

            let mut stale = Vec::new();
            {
                let peers = self.peers.lock();
                for (&remote, handle) in peers.iter() {
                    let age = now.saturating_sub(handle.last_recv_ms.load(Ordering::Acquire));
                    if age > age_limit {
                        warn!(%remote, age_ms = age, "peer silent past age limit, reconnecting");
                        stale.push(remote);
                    } else if age > quiet_after {
                        let _ = handle.tx.try_send(heartbeat.clone());
                    }
                }
                for remote in &stale {
                    if let Some(handle) = peers.get(remote) {
                        handle.close.notify_waiters();
                    }
                }
            }
        }
    }

    /// Queues a frame to one peer; silently dropped when the channel is
    /// down or retired.
    pub fn send_to(&self, remote: DelegateId, frame: Vec<u8>) {
        if self.epoch_over.load(Ordering::Acquire) {
            return;
        }
        let peers = self.peers.lock();
        if let Some(handle) = peers.get(&remote) {
            if handle.tx.try_send(frame).is_err() {
                warn!(%remote, "send queue full, dropping frame");
            }
        } else {
            trace!(%remote, "no channel, dropping frame");
        }
    }

    /// Queues a frame to every connected peer.
    pub fn broadcast(&self, frame: Vec<u8>) {
        if self.epoch_over.load(Ordering::Acquire) {
            return;
        }
        let peers = self.peers.lock();
        for (remote, handle) in peers.iter() {
            if handle.tx.try_send(frame.clone()).is_err() {
                warn!(%remote, "send queue full, dropping broadcast");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_dial_policy() {
        assert!(should_dial(0, 1));
        assert!(should_dial(3, 31));
        assert!(!should_dial(5, 5));
        assert!(!should_dial(7, 2));
    }

    struct CountingDispatch(std::sync::atomic::AtomicUsize);

    impl MessageDispatch for CountingDispatch {
        fn on_message(
            &self,
            _remote: DelegateId,
            _kind: ConsensusKind,
            _msg: ConsensusMessage,
        ) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_mesh_exchange_over_loopback() {
        let dispatch = Arc::new(CountingDispatch(std::sync::atomic::AtomicUsize::new(0)));

        // Two delegates on loopback; 0 dials 1.
        let port = 42113u16;
        let mut addresses = HashMap::new();
        addresses.insert(0u8, SocketAddr::from(([127, 0, 0, 1], 1)));
        addresses.insert(1u8, SocketAddr::from(([127, 0, 0, 1], port)));

        let acceptor = NetIoManager::new(
            1,
            0,
            addresses.clone(),
            dispatch.clone(),
            false,
        );
        acceptor.start(port).await.unwrap();

        let dialer = NetIoManager::new(0, 0, addresses, dispatch.clone(), false);
        // The dialer's own listener sits on an unused port.
        dialer.start(port + 1).await.unwrap();

        // Wait for the channel to come up, then push a frame through.
        for _ in 0..50 {
            if dialer.connected_count() > 0 && acceptor.connected_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        dialer.send_to(1, ConsensusMessage::TipRequest.encode_frame(ConsensusKind::Request));

        for _ in 0..50 {
            if dispatch.0.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(dispatch.0.load(Ordering::SeqCst), 1);

        dialer.stop();
        acceptor.stop();
    }
}
