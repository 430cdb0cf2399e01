//! Serving side of bootstrap: answers tip requests and streams pulled
//! ranges from the store.

use std::sync::Arc;

use conclave_db::LedgerDb;
use conclave_netio::channel::{read_frame, write_frame};
use conclave_primitives::prelude::*;
use conclave_state::block::Block;
use conclave_state::tips::TipSet;
use conclave_wire::{ConsensusMessage, PullRequestMsg, PullResponseMsg};
use tokio::net::{TcpListener, TcpStream};
use tracing::*;

use crate::BootstrapError;

pub struct BootstrapServer {
    db: Arc<LedgerDb>,
}

impl BootstrapServer {
    pub fn new(db: Arc<LedgerDb>) -> Arc<Self> {
        Arc::new(Self { db })
    }

    /// Accept loop; one task per session.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "bootstrap peer connected");
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.session(stream).await {
                            debug!(%peer, err = %e, "bootstrap session ended");
                        }
                    });
                }
                Err(e) => {
                    warn!(err = %e, "bootstrap accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                }
            }
        }
    }

    async fn session(&self, mut stream: TcpStream) -> Result<(), BootstrapError> {
        loop {
            let (_, msg) = read_frame(&mut stream).await?;
            match msg {
                ConsensusMessage::TipRequest => {
                    let tips = self.local_tips()?;
                    let frame =
                        ConsensusMessage::TipResponse(tips).encode_frame(ConsensusKind::Request);
                    write_frame(&mut stream, &frame).await?;
                }
                ConsensusMessage::PullRequest(request) => {
                    self.serve_pull(&mut stream, request).await?;
                }
                _ => return Err(BootstrapError::UnexpectedMessage),
            }
        }
    }

    /// The local chain heads.
    pub fn local_tips(&self) -> Result<TipSet, BootstrapError> {
        let mut txn = self.db.begin();
        let mut tips = TipSet::default();

        tips.eb_tip = txn.eb_tip_get()?.unwrap_or_default();
        tips.mb_tip = txn.mb_tip_get()?.unwrap_or_default();
        for delegate in 0..NUM_DELEGATES {
            tips.rb_tips[delegate] = txn
                .rb_tip_get(delegate as DelegateId)?
                .unwrap_or_default();
        }
        if let Some(eb) = txn.epoch_block_get(&tips.eb_tip)? {
            tips.epoch_number = eb.epoch_number();
        }
        Ok(tips)
    }

    /// Walks the requested chain backwards from `to` until `from` (or the
    /// chain start), then streams the blocks oldest-first and terminates
    /// with an empty response.
    async fn serve_pull(
        &self,
        stream: &mut TcpStream,
        request: PullRequestMsg,
    ) -> Result<(), BootstrapError> {
        let blocks = self.collect_range(&request)?;
        trace!(kind = %request.kind, count = blocks.len(), "serving pull");

        for block in blocks {
            let frame = ConsensusMessage::PullResponse(PullResponseMsg { block: Some(block) })
                .encode_frame(request.kind);
            write_frame(stream, &frame).await?;
        }
        let end = ConsensusMessage::PullResponse(PullResponseMsg { block: None })
            .encode_frame(request.kind);
        write_frame(stream, &end).await?;
        Ok(())
    }

    fn collect_range(&self, request: &PullRequestMsg) -> Result<Vec<Block>, BootstrapError> {
        let mut txn = self.db.begin();
        let mut blocks = Vec::new();
        let mut cursor = request.to;

        while !cursor.is_zero() && cursor != request.from {
            let block = match request.kind {
                ConsensusKind::Request => {
                    txn.request_block_get(&cursor)?.map(|b| {
                        cursor = b.prefix.previous;
                        Block::Request(b)
                    })
                }
                ConsensusKind::MicroBlock => {
                    txn.micro_block_get(&cursor)?.map(|b| {
                        cursor = b.prefix.previous;
                        Block::Micro(b)
                    })
                }
                ConsensusKind::Epoch => {
                    txn.epoch_block_get(&cursor)?.map(|b| {
                        cursor = b.prefix.previous;
                        Block::Epoch(b)
                    })
                }
            };
            match block {
                Some(block) => blocks.push(block),
                None => break,
            }
        }

        blocks.reverse();
        Ok(blocks)
    }
}
