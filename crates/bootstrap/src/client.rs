//! One bootstrap session to a peer.

use std::net::SocketAddr;
use std::sync::Arc;

use conclave_netio::channel::{read_frame, write_frame};
use conclave_persistence::BlockCache;
use conclave_primitives::prelude::*;
use conclave_state::tips::TipSet;
use conclave_wire::{ConsensusMessage, PullRequestMsg};
use tokio::net::TcpStream;
use tracing::*;

use crate::BootstrapError;

pub struct BootstrapClient {
    peer: SocketAddr,
    stream: TcpStream,
}

impl BootstrapClient {
    pub async fn connect(peer: SocketAddr) -> Result<Self, BootstrapError> {
        let stream = TcpStream::connect(peer).await?;
        debug!(%peer, "bootstrap session open");
        Ok(Self { peer, stream })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Tip exchange: ask the peer for its chain heads.
    pub async fn request_tips(&mut self) -> Result<TipSet, BootstrapError> {
        let frame = ConsensusMessage::TipRequest.encode_frame(ConsensusKind::Request);
        write_frame(&mut self.stream, &frame).await?;

        let (_, msg) = read_frame(&mut self.stream).await?;
        match msg {
            ConsensusMessage::TipResponse(tips) => Ok(tips),
            _ => Err(BootstrapError::UnexpectedMessage),
        }
    }

    /// Streams one pull through the block cache, which drives validation
    /// and application.  Returns the number of blocks received.
    pub async fn pull(
        &mut self,
        request: PullRequestMsg,
        cache: &Arc<BlockCache>,
    ) -> Result<usize, BootstrapError> {
        let frame = ConsensusMessage::PullRequest(request).encode_frame(request.kind);
        write_frame(&mut self.stream, &frame).await?;

        let mut received = 0usize;
        loop {
            let (_, msg) = read_frame(&mut self.stream).await?;
            match msg {
                ConsensusMessage::PullResponse(resp) => match resp.block {
                    Some(block) => {
                        received += 1;
                        if !cache.add(block) {
                            // Signature-invalid history from this peer.
                            return Err(BootstrapError::UnexpectedMessage);
                        }
                    }
                    None => break,
                },
                _ => return Err(BootstrapError::UnexpectedMessage),
            }
        }

        trace!(peer = %self.peer, received, "pull complete");
        Ok(received)
    }
}
