//! The fixed header preceding every framed message.

use conclave_primitives::prelude::*;
use num_enum::TryFromPrimitive;

use crate::WireProtocolError;

/// Protocol version spoken by this node.
pub const WIRE_VERSION: u8 = 1;

/// Byte length of the prequel on the wire.
pub const PREQUEL_SIZE: usize = 7;

/// Hard cap on a single frame's payload.
pub const MAX_PAYLOAD_SIZE: u32 = 8 * 1024 * 1024;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageType {
    PrePrepare = 0,
    Prepare = 1,
    PostPrepare = 2,
    Commit = 3,
    PostCommit = 4,
    Rejection = 5,
    KeyAdvertisement = 6,
    HeartBeat = 7,
    TipRequest = 8,
    TipResponse = 9,
    PullRequest = 10,
    PullResponse = 11,
    PostCommittedBlock = 12,
}

/// `{version, type, consensus_type, payload_size}`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Prequel {
    pub version: u8,
    pub message_type: MessageType,
    pub consensus_kind: ConsensusKind,
    pub payload_size: u32,
}

impl Prequel {
    pub fn new(message_type: MessageType, consensus_kind: ConsensusKind, payload_size: u32) -> Self {
        Self {
            version: WIRE_VERSION,
            message_type,
            consensus_kind,
            payload_size,
        }
    }

    pub fn encode(&self) -> [u8; PREQUEL_SIZE] {
        let mut out = [0u8; PREQUEL_SIZE];
        out[0] = self.version;
        out[1] = self.message_type as u8;
        out[2] = self.consensus_kind as u8;
        out[3..7].copy_from_slice(&self.payload_size.to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8; PREQUEL_SIZE]) -> Result<Self, WireProtocolError> {
        let version = buf[0];
        if version != WIRE_VERSION {
            return Err(WireProtocolError::BadVersion(version));
        }
        let message_type = MessageType::try_from(buf[1])
            .map_err(|_| WireProtocolError::UnknownMessageType(buf[1]))?;
        let consensus_kind = ConsensusKind::from_u8(buf[2])
            .ok_or(WireProtocolError::UnknownConsensusKind(buf[2]))?;
        let payload_size = u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]);
        if payload_size > MAX_PAYLOAD_SIZE {
            return Err(WireProtocolError::OversizedPayload(payload_size));
        }
        Ok(Self {
            version,
            message_type,
            consensus_kind,
            payload_size,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_prequel_roundtrip() {
        let p = Prequel::new(MessageType::Prepare, ConsensusKind::MicroBlock, 555);
        let back = Prequel::decode(&p.encode()).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn test_rejects_bad_fields() {
        let mut buf = Prequel::new(MessageType::HeartBeat, ConsensusKind::Request, 0).encode();
        buf[1] = 0x7f;
        assert!(matches!(
            Prequel::decode(&buf),
            Err(WireProtocolError::UnknownMessageType(0x7f))
        ));

        let mut buf = Prequel::new(MessageType::HeartBeat, ConsensusKind::Request, 0).encode();
        buf[0] = 9;
        assert!(matches!(
            Prequel::decode(&buf),
            Err(WireProtocolError::BadVersion(9))
        ));
    }
}
