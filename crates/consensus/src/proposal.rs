//! Abstraction over the three sealed block types a round can drive.

use conclave_primitives::prelude::*;
use conclave_state::block::{AggSignature, Block, EpochBlock, MicroBlock, RequestBlock};

pub trait Proposal: Clone + Send + Sync + 'static {
    const KIND: ConsensusKind;

    fn digest(&self) -> Buf32;
    fn epoch_number(&self) -> u32;
    fn primary_delegate(&self) -> DelegateId;

    /// Installs the quorum aggregate, sealing the block.
    fn seal(&mut self, agg: AggSignature);

    fn into_block(self) -> Block;

    /// The inverse of [`Self::into_block`]; `None` on a kind mismatch.
    fn from_block(block: Block) -> Option<Self>;

    /// Splits a failed proposal into re-proposal batches of slot indexes.
    /// Non-batch chains re-propose nothing.  An empty cut yields one empty
    /// batch so sequencing is never blocked.
    fn recut(&self, batches: &[Vec<usize>]) -> Vec<Self>;
}

impl Proposal for RequestBlock {
    const KIND: ConsensusKind = ConsensusKind::Request;

    fn digest(&self) -> Buf32 {
        ContentDigest::digest(self)
    }

    fn epoch_number(&self) -> u32 {
        self.prefix.epoch_number
    }

    fn primary_delegate(&self) -> DelegateId {
        self.prefix.primary_delegate
    }

    fn seal(&mut self, agg: AggSignature) {
        self.signature = agg;
    }

    fn into_block(self) -> Block {
        Block::Request(self)
    }

    fn from_block(block: Block) -> Option<Self> {
        match block {
            Block::Request(rb) => Some(rb),
            _ => None,
        }
    }

    fn recut(&self, batches: &[Vec<usize>]) -> Vec<Self> {
        let mut out = Vec::new();
        for indexes in batches {
            let mut sub = self.clone();
            sub.signature = AggSignature::default();
            sub.requests = indexes
                .iter()
                .filter_map(|i| self.requests.get(*i).cloned())
                .collect();
            out.push(sub);
        }
        if out.is_empty() {
            let mut empty = self.clone();
            empty.signature = AggSignature::default();
            empty.requests.clear();
            out.push(empty);
        }
        out
    }
}

impl Proposal for MicroBlock {
    const KIND: ConsensusKind = ConsensusKind::MicroBlock;

    fn digest(&self) -> Buf32 {
        ContentDigest::digest(self)
    }

    fn epoch_number(&self) -> u32 {
        self.prefix.epoch_number
    }

    fn primary_delegate(&self) -> DelegateId {
        self.prefix.primary_delegate
    }

    fn seal(&mut self, agg: AggSignature) {
        self.signature = agg;
    }

    fn into_block(self) -> Block {
        Block::Micro(self)
    }

    fn from_block(block: Block) -> Option<Self> {
        match block {
            Block::Micro(mb) => Some(mb),
            _ => None,
        }
    }

    fn recut(&self, _batches: &[Vec<usize>]) -> Vec<Self> {
        Vec::new()
    }
}

impl Proposal for EpochBlock {
    const KIND: ConsensusKind = ConsensusKind::Epoch;

    fn digest(&self) -> Buf32 {
        ContentDigest::digest(self)
    }

    fn epoch_number(&self) -> u32 {
        self.prefix.epoch_number
    }

    fn primary_delegate(&self) -> DelegateId {
        self.prefix.primary_delegate
    }

    fn seal(&mut self, agg: AggSignature) {
        self.signature = agg;
    }

    fn into_block(self) -> Block {
        Block::Epoch(self)
    }

    fn from_block(block: Block) -> Option<Self> {
        match block {
            Block::Epoch(eb) => Some(eb),
            _ => None,
        }
    }

    fn recut(&self, _batches: &[Vec<usize>]) -> Vec<Self> {
        Vec::new()
    }
}
