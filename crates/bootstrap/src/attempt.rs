//! One bootstrap attempt: build a session pool, exchange tips, and drain
//! the pull queue in parallel until local state catches up.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conclave_persistence::BlockCache;
use conclave_primitives::prelude::*;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::*;

use crate::client::BootstrapClient;
use crate::puller::Puller;
use crate::server::BootstrapServer;
use crate::BootstrapError;

/// Overall fail-safe on one attempt.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(600);

pub struct BootstrapAttempt {
    peers: Vec<SocketAddr>,
    max_connected: usize,
    cache: Arc<BlockCache>,
    /// Local tip view, served by the same store the cache applies into.
    local: Arc<BootstrapServer>,

    idle: Mutex<Vec<BootstrapClient>>,
    idle_notify: Notify,
    stopped: AtomicBool,
    total_blocks: AtomicU64,
}

impl BootstrapAttempt {
    pub fn new(
        peers: Vec<SocketAddr>,
        max_connected: usize,
        cache: Arc<BlockCache>,
        local: Arc<BootstrapServer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            peers,
            max_connected,
            cache,
            local,
            idle: Mutex::new(Vec::new()),
            idle_notify: Notify::new(),
            stopped: AtomicBool::new(false),
            total_blocks: AtomicU64::new(0),
        })
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.idle_notify.notify_waiters();
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks.load(Ordering::Acquire)
    }

    fn pool_connection(&self, client: BootstrapClient) {
        self.idle.lock().push(client);
        self.idle_notify.notify_one();
    }

    /// Takes an idle session, waiting until one frees up.
    async fn connection(&self) -> Result<BootstrapClient, BootstrapError> {
        loop {
            if self.stopped.load(Ordering::Acquire) {
                return Err(BootstrapError::Stopped);
            }
            if let Some(client) = self.idle.lock().pop() {
                return Ok(client);
            }
            self.idle_notify.notified().await;
        }
    }

    async fn populate_connections(&self) -> Result<(), BootstrapError> {
        let mut connected = 0usize;
        for &peer in self.peers.iter().take(self.max_connected) {
            match BootstrapClient::connect(peer).await {
                Ok(client) => {
                    connected += 1;
                    self.pool_connection(client);
                }
                Err(e) => {
                    debug!(%peer, err = %e, "bootstrap connect failed");
                }
            }
        }
        if connected == 0 {
            return Err(BootstrapError::NoPeers);
        }
        info!(connected, "bootstrap sessions established");
        Ok(())
    }

    /// Runs the attempt to completion or failure.
    pub async fn run(self: Arc<Self>) -> Result<(), BootstrapError> {
        match tokio::time::timeout(ATTEMPT_TIMEOUT, self.clone().run_inner()).await {
            Ok(result) => result,
            Err(_) => {
                warn!("bootstrap attempt hit fail-safe timeout");
                self.stop();
                Err(BootstrapError::PullTimeout)
            }
        }
    }

    async fn run_inner(self: Arc<Self>) -> Result<(), BootstrapError> {
        self.populate_connections().await?;

        // Tip phase on one idle session.
        let mut client = self.connection().await?;
        let remote_tips = tokio::time::timeout(BOOTSTRAP_PULL_TIMEOUT, client.request_tips())
            .await
            .map_err(|_| BootstrapError::PullTimeout)??;
        self.pool_connection(client);

        let local_tips = self.local.local_tips()?;
        let puller = Arc::new(Puller::new());
        puller.plan(&local_tips, &remote_tips);

        if puller.all_done() {
            info!("already at peer tips, nothing to pull");
            return Ok(());
        }

        // Pull phase: hand each unit to an idle session.
        let mut workers = Vec::new();
        while !puller.all_done() {
            if self.stopped.load(Ordering::Acquire) {
                return Err(BootstrapError::Stopped);
            }
            let Some(pull) = puller.take() else {
                // In-flight pulls may still requeue units; yield briefly.
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            };

            let client = self.connection().await?;
            let this = self.clone();
            let puller_ref = puller.clone();
            workers.push(tokio::spawn(async move {
                this.run_pull(client, pull, puller_ref).await;
            }));
        }

        for worker in workers {
            let _ = worker.await;
        }

        info!(blocks = self.total_blocks(), "bootstrap attempt finished");
        Ok(())
    }

    async fn run_pull(
        self: &Arc<Self>,
        mut client: BootstrapClient,
        pull: crate::puller::PendingPull,
        puller: Arc<Puller>,
    ) {
        let result = tokio::time::timeout(
            BOOTSTRAP_PULL_TIMEOUT,
            client.pull(pull.msg, &self.cache),
        )
        .await;

        match result {
            Ok(Ok(received)) => {
                self.total_blocks
                    .fetch_add(received as u64, Ordering::AcqRel);
                puller.complete();
                self.pool_connection(client);
            }
            Ok(Err(e)) => {
                // The session is suspect; drop it and retry elsewhere.
                debug!(peer = %client.peer(), err = %e, "pull failed, requeueing");
                puller.requeue(pull);
            }
            Err(_) => {
                debug!(peer = %client.peer(), "pull timed out, requeueing");
                puller.requeue(pull);
            }
        }
    }
}
