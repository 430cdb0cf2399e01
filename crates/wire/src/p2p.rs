//! Header wrapping for messages carried over the gossip overlay.

use conclave_primitives::prelude::*;

use crate::WireProtocolError;

pub const P2P_VERSION: u8 = 1;

/// Application slot within the overlay.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum P2pAppType {
    Consensus = 0,
    Request = 1,
}

impl P2pAppType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Consensus),
            1 => Some(Self::Request),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct P2pHeader {
    pub version: u8,
    pub app_type: P2pAppType,
}

/// Routing header for consensus traffic.  Post-committed blocks use the
/// broadcast sentinel in both delegate slots.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct P2pConsensusHeader {
    pub epoch_number: u32,
    pub src_delegate: DelegateId,
    pub dest_delegate: DelegateId,
}

impl P2pConsensusHeader {
    pub fn broadcast(epoch_number: u32) -> Self {
        Self {
            epoch_number,
            src_delegate: BROADCAST_DELEGATE_ID,
            dest_delegate: BROADCAST_DELEGATE_ID,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.src_delegate == BROADCAST_DELEGATE_ID && self.dest_delegate == BROADCAST_DELEGATE_ID
    }
}

/// Wraps an inner frame with `P2pHeader || P2pConsensusHeader`.
pub fn wrap(header: &P2pHeader, consensus: &P2pConsensusHeader, inner: &[u8]) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.put_u8(header.version);
    w.put_u8(header.app_type as u8);
    w.put_u32(consensus.epoch_number);
    w.put_u8(consensus.src_delegate);
    w.put_u8(consensus.dest_delegate);
    w.put_bytes(inner);
    w.into_bytes()
}

/// Splits a wrapped message back into headers and the inner frame.
pub fn unwrap(buf: &[u8]) -> Result<(P2pHeader, P2pConsensusHeader, &[u8]), WireProtocolError> {
    let mut r = WireReader::new(buf);
    let version = r.get_u8()?;
    if version != P2P_VERSION {
        return Err(WireProtocolError::BadVersion(version));
    }
    let app_tag = r.get_u8()?;
    let app_type =
        P2pAppType::from_u8(app_tag).ok_or(WireProtocolError::UnknownAppType(app_tag))?;
    let consensus = P2pConsensusHeader {
        epoch_number: r.get_u32()?,
        src_delegate: r.get_u8()?,
        dest_delegate: r.get_u8()?,
    };
    let inner_len = r.remaining();
    let inner = r.take(inner_len)?;
    Ok((P2pHeader { version, app_type }, consensus, inner))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_wrap_unwrap() {
        let header = P2pHeader {
            version: P2P_VERSION,
            app_type: P2pAppType::Consensus,
        };
        let consensus = P2pConsensusHeader::broadcast(7);
        let wrapped = wrap(&header, &consensus, b"inner-bytes");
        let (h, c, inner) = unwrap(&wrapped).unwrap();
        assert_eq!(h, header);
        assert_eq!(c, consensus);
        assert!(c.is_broadcast());
        assert_eq!(inner, b"inner-bytes");
    }
}
