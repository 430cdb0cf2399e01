//! Protocol constants and tunable consensus parameters.

use std::time::Duration;

use crate::amount::Amount;

/// Size of the delegate committee.  Fixed for the lifetime of the network;
/// there is no in-epoch reconfiguration.
pub const NUM_DELEGATES: usize = 32;

/// Low bits of a hash that pick the designated primary for an account chain.
pub const DELEGATE_ID_MASK_BITS: u32 = 5;

/// Maximum number of requests batched into one request block.
pub const CONSENSUS_BATCH_SIZE: usize = 1500;

/// Epochs a send-source reservation stays in force.
pub const RESERVATION_PERIOD: u32 = 2;

/// Epochs un-staked funds spend thawing before they become spendable.
pub const THAWING_PERIOD: u32 = 42;

/// Percent weight given to unlocked proxied stake in voting power.
pub const DILUTION_FACTOR: u128 = 25;

/// Minimum fee on any user transaction, in raw units.
pub const MIN_TRANSACTION_FEE: Amount = Amount(10_000_000_000_000_000_000_000);

/// Delegate index aliases.
pub type DelegateId = u8;

/// The broadcast sentinel used in p2p consensus headers.
pub const BROADCAST_DELEGATE_ID: DelegateId = 0xff;

/// Consensus round timeout on the primary.
pub const PRIMARY_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout of the recall state entered when a round expires.
pub const RECALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Interval between heartbeats on a quiet peer channel.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Silence on a peer channel after which it reconnects.
pub const MESSAGE_AGE_LIMIT: Duration = Duration::from_secs(100);

/// Back-off between reconnect attempts to a delegate peer.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Interval between micro block proposals.
pub const MICROBLOCK_PROPOSAL_TIME: Duration = Duration::from_secs(600);

/// Micro blocks per epoch; the last one closes the epoch.
pub const MICROBLOCKS_PER_EPOCH: u32 = 12;

/// Allowance for clock drift between delegates.
pub const CLOCK_DRIFT: Duration = Duration::from_secs(20);

/// Per-request timeout on a bootstrap pull.
pub const BOOTSTRAP_PULL_TIMEOUT: Duration = Duration::from_secs(60);

/// Which of the three interleaved chains a message or round belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u8)]
pub enum ConsensusKind {
    Request = 0,
    MicroBlock = 1,
    Epoch = 2,
}

impl ConsensusKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Request),
            1 => Some(Self::MicroBlock),
            2 => Some(Self::Epoch),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::MicroBlock => "micro",
            Self::Epoch => "epoch",
        }
    }
}

impl std::fmt::Display for ConsensusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Run parameters that don't strictly have to be pre-agreed across the
/// network, with network-wide defaults.
#[derive(Clone, Debug)]
pub struct ConsensusParams {
    batch_size: usize,
    primary_timeout: Duration,
    recall_timeout: Duration,
    min_transaction_fee: Amount,
    enable_epoch_transition: bool,
}

impl ConsensusParams {
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn primary_timeout(&self) -> Duration {
        self.primary_timeout
    }

    pub fn recall_timeout(&self) -> Duration {
        self.recall_timeout
    }

    pub fn min_transaction_fee(&self) -> Amount {
        self.min_transaction_fee
    }

    pub fn enable_epoch_transition(&self) -> bool {
        self.enable_epoch_transition
    }

    pub fn set_enable_epoch_transition(&mut self, v: bool) {
        self.enable_epoch_transition = v;
    }
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self {
            batch_size: CONSENSUS_BATCH_SIZE,
            primary_timeout: PRIMARY_TIMEOUT,
            recall_timeout: RECALL_TIMEOUT,
            min_transaction_fee: MIN_TRANSACTION_FEE,
            enable_epoch_transition: true,
        }
    }
}

/// Unix time in milliseconds, the timestamp unit used on all blocks.
pub fn unix_time_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time: before epoch")
        .as_millis() as u64
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_kind_tags_stable() {
        for k in [
            ConsensusKind::Request,
            ConsensusKind::MicroBlock,
            ConsensusKind::Epoch,
        ] {
            assert_eq!(ConsensusKind::from_u8(k as u8), Some(k));
        }
        assert_eq!(ConsensusKind::from_u8(3), None);
    }
}
