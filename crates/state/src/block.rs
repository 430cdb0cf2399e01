//! The three sealed block types and their shared aggregate-signature
//! envelope.
//!
//! All three serialize as the common prefix `{type, primary_delegate,
//! epoch_number, sequence, previous, timestamp}` followed by a type-specific
//! body and the `{bitmap, signature}` aggregate envelope.  Round-trips are
//! bit-exact; the content digest covers everything before the envelope.

use arbitrary::Arbitrary;
use borsh::{BorshDeserialize, BorshSerialize};
use conclave_primitives::prelude::*;
use serde::{Deserialize, Serialize};

use crate::request::Request;

/// Wire tag of a sealed block.
pub const BLOCK_TAG_REQUEST: u8 = 0;
pub const BLOCK_TAG_MICRO: u8 = 1;
pub const BLOCK_TAG_EPOCH: u8 = 2;

/// Aggregate BLS signature with the bitmap of contributing committee
/// members.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    Arbitrary,
    BorshDeserialize,
    BorshSerialize,
    Deserialize,
    Serialize,
)]
pub struct AggSignature {
    pub map: u32,
    pub sig: Buf96,
}

impl AggSignature {
    pub fn new(map: u32, sig: Buf96) -> Self {
        Self { map, sig }
    }

    pub fn popcount(&self) -> u32 {
        self.map.count_ones()
    }

    pub fn contains(&self, delegate: DelegateId) -> bool {
        (delegate as usize) < NUM_DELEGATES && self.map & (1u32 << delegate) != 0
    }

    fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.map);
        w.put_buf96(&self.sig);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            map: r.get_u32()?,
            sig: r.get_buf96()?,
        })
    }
}

/// The common prefix fields shared by all three block types.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    Arbitrary,
    BorshDeserialize,
    BorshSerialize,
    Deserialize,
    Serialize,
)]
pub struct BlockPrefix {
    pub primary_delegate: DelegateId,
    pub epoch_number: u32,
    pub sequence: u32,
    pub previous: Buf32,
    pub timestamp: u64,
}

impl BlockPrefix {
    fn encode(&self, tag: u8, w: &mut WireWriter) {
        w.put_u8(tag);
        w.put_u8(self.primary_delegate);
        w.put_u32(self.epoch_number);
        w.put_u32(self.sequence);
        w.put_buf32(&self.previous);
        w.put_u64(self.timestamp);
    }

    fn decode(expected_tag: u8, r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let tag = r.get_u8()?;
        if tag != expected_tag {
            return Err(CodecError::UnknownTag("block", tag));
        }
        Ok(Self {
            primary_delegate: r.get_u8()?,
            epoch_number: r.get_u32()?,
            sequence: r.get_u32()?,
            previous: r.get_buf32()?,
            timestamp: r.get_u64()?,
        })
    }
}

/// A batch of user requests sealed by one delegate.
#[derive(
    Clone, Debug, Default, Eq, PartialEq, Arbitrary, BorshDeserialize, BorshSerialize, Deserialize, Serialize,
)]
pub struct RequestBlock {
    pub prefix: BlockPrefix,
    pub requests: Vec<Request>,
    pub signature: AggSignature,
    /// Back-patched hash of the successor on this delegate chain.
    pub next: Buf32,
}

impl RequestBlock {
    pub fn delegate(&self) -> DelegateId {
        self.prefix.primary_delegate
    }

    pub fn epoch_number(&self) -> u32 {
        self.prefix.epoch_number
    }

    pub fn sequence(&self) -> u32 {
        self.prefix.sequence
    }

    pub fn request_count(&self) -> usize {
        self.requests.len()
    }
}

impl WireEncode for RequestBlock {
    fn encode(&self, w: &mut WireWriter) {
        self.prefix.encode(BLOCK_TAG_REQUEST, w);
        w.put_u16(self.requests.len() as u16);
        for req in &self.requests {
            req.encode(w);
        }
        self.signature.encode(w);
        w.put_buf32(&self.next);
    }
}

impl WireDecode for RequestBlock {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let prefix = BlockPrefix::decode(BLOCK_TAG_REQUEST, r)?;
        let count = r.get_u16()? as usize;
        if count > CONSENSUS_BATCH_SIZE {
            return Err(CodecError::LengthOutOfBounds(
                "batch",
                count,
                CONSENSUS_BATCH_SIZE,
            ));
        }
        let mut requests = Vec::with_capacity(count);
        for _ in 0..count {
            requests.push(Request::decode(r)?);
        }
        Ok(Self {
            prefix,
            requests,
            signature: AggSignature::decode(r)?,
            next: r.get_buf32()?,
        })
    }
}

impl ContentDigest for RequestBlock {
    fn write_digest(&self, stream: &mut HashStream) {
        let mut w = WireWriter::new();
        self.prefix.encode(BLOCK_TAG_REQUEST, &mut w);
        w.put_u16(self.requests.len() as u16);
        stream.write(&w.into_bytes());
        for req in &self.requests {
            stream.write_buf(&req.digest());
        }
    }
}

/// A cross-linking block fixing every delegate's request-chain tip.
#[derive(
    Clone, Debug, Eq, PartialEq, Arbitrary, BorshDeserialize, BorshSerialize, Deserialize, Serialize,
)]
pub struct MicroBlock {
    pub prefix: BlockPrefix,
    pub last_micro_block: bool,
    pub tips: [Buf32; NUM_DELEGATES],
    pub signature: AggSignature,
    pub next: Buf32,
}

impl Default for MicroBlock {
    fn default() -> Self {
        Self {
            prefix: BlockPrefix::default(),
            last_micro_block: false,
            tips: [Buf32::zero(); NUM_DELEGATES],
            signature: AggSignature::default(),
            next: Buf32::zero(),
        }
    }
}

impl MicroBlock {
    pub fn epoch_number(&self) -> u32 {
        self.prefix.epoch_number
    }

    pub fn sequence(&self) -> u32 {
        self.prefix.sequence
    }
}

impl WireEncode for MicroBlock {
    fn encode(&self, w: &mut WireWriter) {
        self.prefix.encode(BLOCK_TAG_MICRO, w);
        w.put_u8(self.last_micro_block as u8);
        for tip in &self.tips {
            w.put_buf32(tip);
        }
        self.signature.encode(w);
        w.put_buf32(&self.next);
    }
}

impl WireDecode for MicroBlock {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let prefix = BlockPrefix::decode(BLOCK_TAG_MICRO, r)?;
        let last_micro_block = r.get_u8()? != 0;
        let mut tips = [Buf32::zero(); NUM_DELEGATES];
        for tip in tips.iter_mut() {
            *tip = r.get_buf32()?;
        }
        Ok(Self {
            prefix,
            last_micro_block,
            tips,
            signature: AggSignature::decode(r)?,
            next: r.get_buf32()?,
        })
    }
}

impl ContentDigest for MicroBlock {
    fn write_digest(&self, stream: &mut HashStream) {
        let mut w = WireWriter::new();
        self.prefix.encode(BLOCK_TAG_MICRO, &mut w);
        w.put_u8(self.last_micro_block as u8);
        for tip in &self.tips {
            w.put_buf32(tip);
        }
        stream.write(&w.into_bytes());
    }
}

/// One elected committee member as recorded in an epoch block.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Arbitrary,
    BorshDeserialize,
    BorshSerialize,
    Deserialize,
    Serialize,
)]
pub struct DelegateEntry {
    pub account: Buf32,
    pub bls_key: Buf48,
    pub vote: Amount,
    pub stake: Amount,
    pub starting_term: u8,
}

impl Default for DelegateEntry {
    fn default() -> Self {
        Self {
            account: Buf32::zero(),
            bls_key: Buf48::zero(),
            vote: Amount::ZERO,
            stake: Amount::ZERO,
            starting_term: 0,
        }
    }
}

/// The terminal block of an epoch, sealing the next committee.
#[derive(
    Clone, Debug, Eq, PartialEq, Arbitrary, BorshDeserialize, BorshSerialize, Deserialize, Serialize,
)]
pub struct EpochBlock {
    pub prefix: BlockPrefix,
    pub micro_block_tip: Buf32,
    pub delegates: [DelegateEntry; NUM_DELEGATES],
    pub signature: AggSignature,
    pub next: Buf32,
}

impl Default for EpochBlock {
    fn default() -> Self {
        Self {
            prefix: BlockPrefix::default(),
            micro_block_tip: Buf32::zero(),
            delegates: [DelegateEntry::default(); NUM_DELEGATES],
            signature: AggSignature::default(),
            next: Buf32::zero(),
        }
    }
}

impl EpochBlock {
    pub fn epoch_number(&self) -> u32 {
        self.prefix.epoch_number
    }

    /// Sums committee vote and stake weight, the totals quorum is computed
    /// against.
    pub fn weight_totals(&self) -> (u128, u128) {
        let mut vote = 0u128;
        let mut stake = 0u128;
        for d in &self.delegates {
            vote += d.vote.raw();
            stake += d.stake.raw();
        }
        (vote, stake)
    }
}

impl WireEncode for EpochBlock {
    fn encode(&self, w: &mut WireWriter) {
        self.prefix.encode(BLOCK_TAG_EPOCH, w);
        w.put_buf32(&self.micro_block_tip);
        for d in &self.delegates {
            w.put_buf32(&d.account);
            w.put_bytes(d.bls_key.as_slice());
            w.put_amount(d.vote);
            w.put_amount(d.stake);
            w.put_u8(d.starting_term);
        }
        self.signature.encode(w);
        w.put_buf32(&self.next);
    }
}

impl WireDecode for EpochBlock {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let prefix = BlockPrefix::decode(BLOCK_TAG_EPOCH, r)?;
        let micro_block_tip = r.get_buf32()?;
        let mut delegates = [DelegateEntry::default(); NUM_DELEGATES];
        for d in delegates.iter_mut() {
            d.account = r.get_buf32()?;
            d.bls_key = Buf48::try_from(r.take(48)?).expect("wire: 48 bytes");
            d.vote = r.get_amount()?;
            d.stake = r.get_amount()?;
            d.starting_term = r.get_u8()?;
        }
        Ok(Self {
            prefix,
            micro_block_tip,
            delegates,
            signature: AggSignature::decode(r)?,
            next: r.get_buf32()?,
        })
    }
}

impl ContentDigest for EpochBlock {
    fn write_digest(&self, stream: &mut HashStream) {
        let mut w = WireWriter::new();
        self.prefix.encode(BLOCK_TAG_EPOCH, &mut w);
        w.put_buf32(&self.micro_block_tip);
        for d in &self.delegates {
            w.put_buf32(&d.account);
            w.put_bytes(d.bls_key.as_slice());
            w.put_amount(d.vote);
            w.put_amount(d.stake);
            w.put_u8(d.starting_term);
        }
        stream.write(&w.into_bytes());
    }
}

/// Any of the three sealed block types, as gossiped post-commit.
#[derive(
    Clone, Debug, Eq, PartialEq, Arbitrary, BorshDeserialize, BorshSerialize, Deserialize, Serialize,
)]
pub enum Block {
    Request(RequestBlock),
    Micro(MicroBlock),
    Epoch(EpochBlock),
}

impl Block {
    pub fn kind(&self) -> ConsensusKind {
        match self {
            Self::Request(_) => ConsensusKind::Request,
            Self::Micro(_) => ConsensusKind::MicroBlock,
            Self::Epoch(_) => ConsensusKind::Epoch,
        }
    }

    pub fn epoch_number(&self) -> u32 {
        match self {
            Self::Request(b) => b.epoch_number(),
            Self::Micro(b) => b.epoch_number(),
            Self::Epoch(b) => b.epoch_number(),
        }
    }

    pub fn digest(&self) -> Buf32 {
        match self {
            Self::Request(b) => b.digest(),
            Self::Micro(b) => b.digest(),
            Self::Epoch(b) => b.digest(),
        }
    }
}

impl WireEncode for Block {
    fn encode(&self, w: &mut WireWriter) {
        match self {
            Self::Request(b) => b.encode(w),
            Self::Micro(b) => b.encode(w),
            Self::Epoch(b) => b.encode(w),
        }
    }
}

impl WireDecode for Block {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        // The tag byte stays in place; each block decoder re-checks it.
        match r.peek_u8()? {
            BLOCK_TAG_REQUEST => Ok(Self::Request(RequestBlock::decode(r)?)),
            BLOCK_TAG_MICRO => Ok(Self::Micro(MicroBlock::decode(r)?)),
            BLOCK_TAG_EPOCH => Ok(Self::Epoch(EpochBlock::decode(r)?)),
            other => Err(CodecError::UnknownTag("block", other)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::request::RequestPayload;

    fn sample_rb() -> RequestBlock {
        let mut rb = RequestBlock::default();
        rb.prefix.primary_delegate = 5;
        rb.prefix.epoch_number = 3;
        rb.prefix.sequence = 8;
        rb.prefix.previous = Buf32::new([1; 32]);
        rb.prefix.timestamp = 123_456;
        rb.requests.push(Request::new(
            Buf32::new([2; 32]),
            Buf32::zero(),
            Amount::new(10),
            0,
            RequestPayload::Send {
                to: Buf32::new([3; 32]),
                amount: Amount::new(50),
            },
        ));
        rb.signature = AggSignature::new(0b111, Buf96::new([7; 96]));
        rb
    }

    #[test]
    fn test_rb_roundtrip_bit_exact() {
        let rb = sample_rb();
        let bytes = rb.to_wire();
        let back = RequestBlock::from_wire(&bytes).unwrap();
        assert_eq!(back, rb);
        assert_eq!(back.to_wire(), bytes);
        assert_eq!(back.digest(), rb.digest());
    }

    #[test]
    fn test_mb_roundtrip() {
        let mut mb = MicroBlock::default();
        mb.prefix.epoch_number = 2;
        mb.prefix.sequence = 4;
        mb.last_micro_block = true;
        mb.tips[7] = Buf32::new([9; 32]);
        mb.signature = AggSignature::new(1, Buf96::new([1; 96]));

        let back = MicroBlock::from_wire(&mb.to_wire()).unwrap();
        assert_eq!(back, mb);
    }

    #[test]
    fn test_eb_roundtrip() {
        let mut eb = EpochBlock::default();
        eb.prefix.epoch_number = 9;
        eb.micro_block_tip = Buf32::new([4; 32]);
        eb.delegates[0].account = Buf32::new([5; 32]);
        eb.delegates[0].vote = Amount::new(3);
        eb.delegates[0].stake = Amount::new(11);

        let back = EpochBlock::from_wire(&eb.to_wire()).unwrap();
        assert_eq!(back, eb);
        assert_eq!(back.weight_totals(), (3, 11));
    }

    #[test]
    fn test_digest_excludes_envelope() {
        let mut a = sample_rb();
        let mut b = sample_rb();
        a.signature = AggSignature::new(0b1, Buf96::new([1; 96]));
        b.next = Buf32::new([6; 32]);
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_wrong_tag_rejected() {
        let mut bytes = sample_rb().to_wire();
        bytes[0] = BLOCK_TAG_MICRO;
        assert!(RequestBlock::from_wire(&bytes).is_err());
    }

    #[test]
    fn test_arbitrary_blocks_roundtrip() {
        let mut gen = conclave_test_utils::ArbitraryGenerator::new();
        for _ in 0..8 {
            let mb: MicroBlock = gen.generate();
            assert_eq!(MicroBlock::from_wire(&mb.to_wire()).unwrap(), mb);

            let eb: EpochBlock = gen.generate();
            assert_eq!(EpochBlock::from_wire(&eb.to_wire()).unwrap(), eb);
        }
    }
}
