//! Typed consensus, bootstrap and gossip messages.

use conclave_primitives::prelude::*;
use conclave_state::block::{AggSignature, Block};
use conclave_state::tips::TipSet;
use num_enum::TryFromPrimitive;

use crate::prequel::{MessageType, Prequel};
use crate::WireProtocolError;

/// Why a backup refused a pre-prepare.
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum RejectionReason {
    Void = 0,
    ContainsInvalidRequest = 1,
    NewEpoch = 2,
    ClockDrift = 3,
    BadSignature = 4,
    InvalidPreviousHash = 5,
    WrongSequenceNumber = 6,
    InvalidEpoch = 7,
}

/// A proposal entering a round, carrying the primary's own signature share.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PrePrepareMsg {
    pub block: Block,
    pub signature: Buf96,
}

/// A backup's vote on a pre-prepare.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PrepareMsg {
    /// Digest of the pre-prepare being voted on.
    pub previous: Buf32,
    pub signature: Buf96,
}

/// The primary's proof that prepare quorum was reached.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PostPrepareMsg {
    pub previous: Buf32,
    pub agg: AggSignature,
}

/// A backup's vote on a post-prepare.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CommitMsg {
    /// Digest of the post-prepare being voted on.
    pub previous: Buf32,
    pub signature: Buf96,
}

/// The primary's proof that commit quorum was reached; seals the round.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PostCommitMsg {
    pub previous: Buf32,
    pub agg: AggSignature,
}

/// A backup's refusal, with per-slot bits for batch rejections.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RejectionMsg {
    pub previous: Buf32,
    pub reason: RejectionReason,
    /// Bit per request slot; set means rejected.  Empty for non-batch
    /// reasons.
    pub rejection_map: Vec<bool>,
    pub signature: Buf96,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct KeyAdvertisementMsg {
    pub bls_key: Buf48,
}

/// Everything that can follow a prequel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConsensusMessage {
    PrePrepare(PrePrepareMsg),
    Prepare(PrepareMsg),
    PostPrepare(PostPrepareMsg),
    Commit(CommitMsg),
    PostCommit(PostCommitMsg),
    Rejection(RejectionMsg),
    KeyAdvertisement(KeyAdvertisementMsg),
    HeartBeat,
    TipRequest,
    TipResponse(TipSet),
    PullRequest(PullRequestMsg),
    PullResponse(PullResponseMsg),
    PostCommittedBlock(Block),
}

/// Half-open pull of one chain's history.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PullRequestMsg {
    pub kind: ConsensusKind,
    pub delegate: DelegateId,
    /// Hash already held locally; zero pulls from the chain start.
    pub from: Buf32,
    /// Target tip, inclusive.
    pub to: Buf32,
}

/// One unit of a pull stream; `None` terminates the stream.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PullResponseMsg {
    pub block: Option<Block>,
}

impl ConsensusMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::PrePrepare(_) => MessageType::PrePrepare,
            Self::Prepare(_) => MessageType::Prepare,
            Self::PostPrepare(_) => MessageType::PostPrepare,
            Self::Commit(_) => MessageType::Commit,
            Self::PostCommit(_) => MessageType::PostCommit,
            Self::Rejection(_) => MessageType::Rejection,
            Self::KeyAdvertisement(_) => MessageType::KeyAdvertisement,
            Self::HeartBeat => MessageType::HeartBeat,
            Self::TipRequest => MessageType::TipRequest,
            Self::TipResponse(_) => MessageType::TipResponse,
            Self::PullRequest(_) => MessageType::PullRequest,
            Self::PullResponse(_) => MessageType::PullResponse,
            Self::PostCommittedBlock(_) => MessageType::PostCommittedBlock,
        }
    }

    fn encode_payload(&self, w: &mut WireWriter) {
        match self {
            Self::PrePrepare(m) => {
                m.block.encode(w);
                w.put_buf96(&m.signature);
            }
            Self::Prepare(m) => {
                w.put_buf32(&m.previous);
                w.put_buf96(&m.signature);
            }
            Self::PostPrepare(m) => {
                w.put_buf32(&m.previous);
                w.put_u32(m.agg.map);
                w.put_buf96(&m.agg.sig);
            }
            Self::Commit(m) => {
                w.put_buf32(&m.previous);
                w.put_buf96(&m.signature);
            }
            Self::PostCommit(m) => {
                w.put_buf32(&m.previous);
                w.put_u32(m.agg.map);
                w.put_buf96(&m.agg.sig);
            }
            Self::Rejection(m) => {
                w.put_buf32(&m.previous);
                w.put_u8(m.reason as u8);
                w.put_u16(m.rejection_map.len() as u16);
                let mut byte = 0u8;
                for (i, bit) in m.rejection_map.iter().enumerate() {
                    if *bit {
                        byte |= 1 << (i % 8);
                    }
                    if i % 8 == 7 {
                        w.put_u8(byte);
                        byte = 0;
                    }
                }
                if m.rejection_map.len() % 8 != 0 {
                    w.put_u8(byte);
                }
                w.put_buf96(&m.signature);
            }
            Self::KeyAdvertisement(m) => {
                w.put_bytes(m.bls_key.as_slice());
            }
            Self::HeartBeat | Self::TipRequest => {}
            Self::TipResponse(tips) => tips.encode(w),
            Self::PullRequest(m) => {
                w.put_u8(m.kind as u8);
                w.put_u8(m.delegate);
                w.put_buf32(&m.from);
                w.put_buf32(&m.to);
            }
            Self::PullResponse(m) => match &m.block {
                Some(block) => {
                    w.put_u8(1);
                    block.encode(w);
                }
                None => w.put_u8(0),
            },
            Self::PostCommittedBlock(block) => block.encode(w),
        }
    }

    fn decode_payload(
        message_type: MessageType,
        r: &mut WireReader<'_>,
    ) -> Result<Self, CodecError> {
        let msg = match message_type {
            MessageType::PrePrepare => {
                let block = Block::decode(r)?;
                Self::PrePrepare(PrePrepareMsg {
                    block,
                    signature: r.get_buf96()?,
                })
            }
            MessageType::Prepare => Self::Prepare(PrepareMsg {
                previous: r.get_buf32()?,
                signature: r.get_buf96()?,
            }),
            MessageType::PostPrepare => Self::PostPrepare(PostPrepareMsg {
                previous: r.get_buf32()?,
                agg: AggSignature::new(r.get_u32()?, r.get_buf96()?),
            }),
            MessageType::Commit => Self::Commit(CommitMsg {
                previous: r.get_buf32()?,
                signature: r.get_buf96()?,
            }),
            MessageType::PostCommit => Self::PostCommit(PostCommitMsg {
                previous: r.get_buf32()?,
                agg: AggSignature::new(r.get_u32()?, r.get_buf96()?),
            }),
            MessageType::Rejection => {
                let previous = r.get_buf32()?;
                let tag = r.get_u8()?;
                let reason = RejectionReason::try_from(tag)
                    .map_err(|_| CodecError::UnknownTag("rejection reason", tag))?;
                let len = r.get_u16()? as usize;
                if len > CONSENSUS_BATCH_SIZE {
                    return Err(CodecError::LengthOutOfBounds(
                        "rejection map",
                        len,
                        CONSENSUS_BATCH_SIZE,
                    ));
                }
                let bytes = r.take(len.div_ceil(8))?;
                let mut rejection_map = Vec::with_capacity(len);
                for i in 0..len {
                    rejection_map.push(bytes[i / 8] & (1 << (i % 8)) != 0);
                }
                Self::Rejection(RejectionMsg {
                    previous,
                    reason,
                    rejection_map,
                    signature: r.get_buf96()?,
                })
            }
            MessageType::KeyAdvertisement => Self::KeyAdvertisement(KeyAdvertisementMsg {
                bls_key: Buf48::try_from(r.take(48)?).expect("wire: 48 bytes"),
            }),
            MessageType::HeartBeat => Self::HeartBeat,
            MessageType::TipRequest => Self::TipRequest,
            MessageType::TipResponse => Self::TipResponse(TipSet::decode(r)?),
            MessageType::PullRequest => {
                let tag = r.get_u8()?;
                let kind = ConsensusKind::from_u8(tag)
                    .ok_or(CodecError::UnknownTag("consensus kind", tag))?;
                Self::PullRequest(PullRequestMsg {
                    kind,
                    delegate: r.get_u8()?,
                    from: r.get_buf32()?,
                    to: r.get_buf32()?,
                })
            }
            MessageType::PullResponse => {
                let present = r.get_u8()? != 0;
                let block = if present { Some(Block::decode(r)?) } else { None };
                Self::PullResponse(PullResponseMsg { block })
            }
            MessageType::PostCommittedBlock => Self::PostCommittedBlock(Block::decode(r)?),
        };
        Ok(msg)
    }

    /// Frames the message: prequel followed by the payload.
    pub fn encode_frame(&self, kind: ConsensusKind) -> Vec<u8> {
        let mut w = WireWriter::new();
        self.encode_payload(&mut w);
        let payload = w.into_bytes();

        let prequel = Prequel::new(self.message_type(), kind, payload.len() as u32);
        let mut out = Vec::with_capacity(crate::prequel::PREQUEL_SIZE + payload.len());
        out.extend_from_slice(&prequel.encode());
        out.extend_from_slice(&payload);
        out
    }

    /// Decodes the payload following an already-parsed prequel.
    pub fn decode_frame(prequel: &Prequel, payload: &[u8]) -> Result<Self, WireProtocolError> {
        if payload.len() != prequel.payload_size as usize {
            return Err(WireProtocolError::PayloadSizeMismatch {
                declared: prequel.payload_size,
                actual: payload.len(),
            });
        }
        let mut r = WireReader::new(payload);
        let msg = Self::decode_payload(prequel.message_type, &mut r)?;
        r.finish()?;
        Ok(msg)
    }
}

#[cfg(test)]
mod test {
    use conclave_state::block::RequestBlock;

    use super::*;

    fn frame_roundtrip(msg: ConsensusMessage, kind: ConsensusKind) {
        let bytes = msg.encode_frame(kind);
        let prequel =
            Prequel::decode(bytes[..crate::prequel::PREQUEL_SIZE].try_into().unwrap()).unwrap();
        assert_eq!(prequel.consensus_kind, kind);
        let back =
            ConsensusMessage::decode_frame(&prequel, &bytes[crate::prequel::PREQUEL_SIZE..])
                .unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_round_messages_roundtrip() {
        let digest = Buf32::new([3; 32]);
        frame_roundtrip(
            ConsensusMessage::Prepare(PrepareMsg {
                previous: digest,
                signature: Buf96::new([1; 96]),
            }),
            ConsensusKind::Request,
        );
        frame_roundtrip(
            ConsensusMessage::PostPrepare(PostPrepareMsg {
                previous: digest,
                agg: AggSignature::new(0b1011, Buf96::new([2; 96])),
            }),
            ConsensusKind::MicroBlock,
        );
        frame_roundtrip(ConsensusMessage::HeartBeat, ConsensusKind::Request);
    }

    #[test]
    fn test_rejection_map_roundtrip() {
        let mut map = vec![false; 11];
        map[0] = true;
        map[9] = true;
        frame_roundtrip(
            ConsensusMessage::Rejection(RejectionMsg {
                previous: Buf32::new([4; 32]),
                reason: RejectionReason::ContainsInvalidRequest,
                rejection_map: map,
                signature: Buf96::new([5; 96]),
            }),
            ConsensusKind::Request,
        );
    }

    #[test]
    fn test_pre_prepare_roundtrip() {
        let mut rb = RequestBlock::default();
        rb.prefix.primary_delegate = 2;
        frame_roundtrip(
            ConsensusMessage::PrePrepare(PrePrepareMsg {
                block: Block::Request(rb),
                signature: Buf96::new([6; 96]),
            }),
            ConsensusKind::Request,
        );
    }

    #[test]
    fn test_pull_stream_end() {
        frame_roundtrip(
            ConsensusMessage::PullResponse(PullResponseMsg { block: None }),
            ConsensusKind::Request,
        );
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let msg = ConsensusMessage::TipRequest;
        let bytes = msg.encode_frame(ConsensusKind::Epoch);
        let prequel =
            Prequel::decode(bytes[..crate::prequel::PREQUEL_SIZE].try_into().unwrap()).unwrap();
        let res = ConsensusMessage::decode_frame(&prequel, &[0u8]);
        assert!(matches!(
            res,
            Err(WireProtocolError::PayloadSizeMismatch { .. })
        ));
    }
}
