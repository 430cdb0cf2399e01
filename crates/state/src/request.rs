//! User requests: the tagged union carried inside request blocks.
//!
//! Every request shares one envelope (origin chain linkage, fee, account
//! signature); the per-variant payload is a nested struct.  The `work`
//! field is a legacy vestige kept on the wire and never validated.

use arbitrary::Arbitrary;
use borsh::{BorshDeserialize, BorshSerialize};
use conclave_primitives::prelude::*;
use serde::{Deserialize, Serialize};

/// Maximum byte length of token symbol/name/issuer strings on the wire.
const MAX_TOKEN_STRING: usize = 255;

/// Fee schedule of a token account.
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
#[repr(u8)]
#[borsh(use_discriminant = true)]
pub enum TokenFeeType {
    Flat = 0,
    Percentage = 1,
}

impl TokenFeeType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Flat),
            1 => Some(Self::Percentage),
            _ => None,
        }
    }
}

/// Privileges a token controller can hold, one bit each.
pub mod controller_privilege {
    pub const ISSUE: u16 = 1 << 0;
    pub const REVOKE: u16 = 1 << 1;
    pub const FREEZE: u16 = 1 << 2;
    pub const ADJUST_FEE: u16 = 1 << 3;
    pub const WHITELIST: u16 = 1 << 4;
    pub const UPDATE_CONTROLLER: u16 = 1 << 5;
}

/// A token controller and its privilege bits.
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
pub struct ControllerInfo {
    pub account: Buf32,
    pub privileges: u16,
}

impl ControllerInfo {
    pub fn can(&self, privilege: u16) -> bool {
        self.privileges & privilege != 0
    }
}

/// Add or remove a controller.
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
#[repr(u8)]
#[borsh(use_discriminant = true)]
pub enum ControllerAction {
    Add = 0,
    Remove = 1,
}

impl ControllerAction {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Add),
            1 => Some(Self::Remove),
            _ => None,
        }
    }
}

/// The request kind tag as it appears on the wire.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum RequestKind {
    Send = 0,
    TokenSend = 1,
    Issuance = 2,
    Revoke = 3,
    AdjustFee = 4,
    UpdateController = 5,
    ElectionVote = 6,
    AnnounceCandidacy = 7,
    RenounceCandidacy = 8,
    StartRepresenting = 9,
    StopRepresenting = 10,
    Stake = 11,
    Unstake = 12,
    Proxy = 13,
    Claim = 14,
}

/// Per-variant payload.
#[derive(
    Clone, Debug, Eq, PartialEq, Arbitrary, BorshDeserialize, BorshSerialize, Deserialize, Serialize,
)]
pub enum RequestPayload {
    /// Plain value transfer.
    Send { to: Buf32, amount: Amount },

    /// Transfer of a user token.
    TokenSend {
        token: Buf32,
        to: Buf32,
        amount: Amount,
    },

    /// Creation of a new token account.
    Issuance {
        symbol: String,
        name: String,
        total_supply: Amount,
        fee_type: TokenFeeType,
        fee_rate: Amount,
        settings: u16,
        controllers: Vec<ControllerInfo>,
        issuer_info: String,
    },

    /// Controller-forced removal of token units from an account.
    Revoke {
        token: Buf32,
        source: Buf32,
        to: Buf32,
        amount: Amount,
    },

    /// Change of a token's fee schedule.
    AdjustFee {
        token: Buf32,
        fee_type: TokenFeeType,
        fee_rate: Amount,
    },

    /// Change of a token's controller set.
    UpdateController {
        token: Buf32,
        action: ControllerAction,
        controller: ControllerInfo,
    },

    /// Votes cast for delegate candidates, up to the caster's full weight.
    ElectionVote { votes: Vec<(Buf32, u8)> },

    /// Enter the candidate pool for the next election.
    AnnounceCandidacy { stake: Amount, bls_key: Buf48 },

    /// Leave the candidate pool.
    RenounceCandidacy,

    /// Become a representative accepting proxied stake.
    StartRepresenting { stake: Amount },

    /// Stop accepting proxied stake.
    StopRepresenting,

    /// Lock funds as self-stake.
    Stake { amount: Amount },

    /// Begin thawing previously staked funds.
    Unstake,

    /// Delegate voting weight to a representative.
    Proxy {
        rep: Buf32,
        amount: Amount,
        lock: bool,
    },

    /// Claim accumulated epoch rewards.
    Claim { epoch: u32 },
}

impl RequestPayload {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Send { .. } => RequestKind::Send,
            Self::TokenSend { .. } => RequestKind::TokenSend,
            Self::Issuance { .. } => RequestKind::Issuance,
            Self::Revoke { .. } => RequestKind::Revoke,
            Self::AdjustFee { .. } => RequestKind::AdjustFee,
            Self::UpdateController { .. } => RequestKind::UpdateController,
            Self::ElectionVote { .. } => RequestKind::ElectionVote,
            Self::AnnounceCandidacy { .. } => RequestKind::AnnounceCandidacy,
            Self::RenounceCandidacy => RequestKind::RenounceCandidacy,
            Self::StartRepresenting { .. } => RequestKind::StartRepresenting,
            Self::StopRepresenting => RequestKind::StopRepresenting,
            Self::Stake { .. } => RequestKind::Stake,
            Self::Unstake => RequestKind::Unstake,
            Self::Proxy { .. } => RequestKind::Proxy,
            Self::Claim { .. } => RequestKind::Claim,
        }
    }
}

/// A complete signed request.
#[derive(
    Clone, Debug, Eq, PartialEq, Arbitrary, BorshDeserialize, BorshSerialize, Deserialize, Serialize,
)]
pub struct Request {
    pub origin: Buf32,
    pub previous: Buf32,
    pub fee: Amount,
    pub sequence: u32,
    pub work: u64,
    pub payload: RequestPayload,
    pub signature: Buf64,
    /// Back-patched once a successor lands; not part of the digest.
    pub next: Buf32,
}

impl Request {
    pub fn new(origin: Buf32, previous: Buf32, fee: Amount, sequence: u32, payload: RequestPayload) -> Self {
        Self {
            origin,
            previous,
            fee,
            sequence,
            work: 0,
            payload,
            signature: Buf64::zero(),
            next: Buf32::zero(),
        }
    }

    pub fn kind(&self) -> RequestKind {
        self.payload.kind()
    }
}

fn put_string(w: &mut WireWriter, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(MAX_TOKEN_STRING);
    w.put_u16(len as u16);
    w.put_bytes(&bytes[..len]);
}

fn get_string(r: &mut WireReader<'_>) -> Result<String, CodecError> {
    let len = r.get_u16()? as usize;
    if len > MAX_TOKEN_STRING {
        return Err(CodecError::LengthOutOfBounds("string", len, MAX_TOKEN_STRING));
    }
    let bytes = r.take(len)?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

impl RequestPayload {
    fn encode_body(&self, w: &mut WireWriter) {
        match self {
            Self::Send { to, amount } => {
                w.put_buf32(to);
                w.put_amount(*amount);
            }
            Self::TokenSend { token, to, amount } => {
                w.put_buf32(token);
                w.put_buf32(to);
                w.put_amount(*amount);
            }
            Self::Issuance {
                symbol,
                name,
                total_supply,
                fee_type,
                fee_rate,
                settings,
                controllers,
                issuer_info,
            } => {
                put_string(w, symbol);
                put_string(w, name);
                w.put_amount(*total_supply);
                w.put_u8(*fee_type as u8);
                w.put_amount(*fee_rate);
                w.put_u16(*settings);
                w.put_u8(controllers.len() as u8);
                for c in controllers {
                    w.put_buf32(&c.account);
                    w.put_u16(c.privileges);
                }
                put_string(w, issuer_info);
            }
            Self::Revoke {
                token,
                source,
                to,
                amount,
            } => {
                w.put_buf32(token);
                w.put_buf32(source);
                w.put_buf32(to);
                w.put_amount(*amount);
            }
            Self::AdjustFee {
                token,
                fee_type,
                fee_rate,
            } => {
                w.put_buf32(token);
                w.put_u8(*fee_type as u8);
                w.put_amount(*fee_rate);
            }
            Self::UpdateController {
                token,
                action,
                controller,
            } => {
                w.put_buf32(token);
                w.put_u8(*action as u8);
                w.put_buf32(&controller.account);
                w.put_u16(controller.privileges);
            }
            Self::ElectionVote { votes } => {
                w.put_u8(votes.len() as u8);
                for (rep, count) in votes {
                    w.put_buf32(rep);
                    w.put_u8(*count);
                }
            }
            Self::AnnounceCandidacy { stake, bls_key } => {
                w.put_amount(*stake);
                w.put_bytes(bls_key.as_slice());
            }
            Self::RenounceCandidacy => {}
            Self::StartRepresenting { stake } => {
                w.put_amount(*stake);
            }
            Self::StopRepresenting => {}
            Self::Stake { amount } => {
                w.put_amount(*amount);
            }
            Self::Unstake => {}
            Self::Proxy { rep, amount, lock } => {
                w.put_buf32(rep);
                w.put_amount(*amount);
                w.put_u8(*lock as u8);
            }
            Self::Claim { epoch } => {
                w.put_u32(*epoch);
            }
        }
    }

    fn decode_body(kind: u8, r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let payload = match kind {
            0 => Self::Send {
                to: r.get_buf32()?,
                amount: r.get_amount()?,
            },
            1 => Self::TokenSend {
                token: r.get_buf32()?,
                to: r.get_buf32()?,
                amount: r.get_amount()?,
            },
            2 => {
                let symbol = get_string(r)?;
                let name = get_string(r)?;
                let total_supply = r.get_amount()?;
                let ft_tag = r.get_u8()?;
                let fee_type = TokenFeeType::from_u8(ft_tag)
                    .ok_or(CodecError::UnknownTag("fee type", ft_tag))?;
                let fee_rate = r.get_amount()?;
                let settings = r.get_u16()?;
                let count = r.get_u8()? as usize;
                let mut controllers = Vec::with_capacity(count);
                for _ in 0..count {
                    controllers.push(ControllerInfo {
                        account: r.get_buf32()?,
                        privileges: r.get_u16()?,
                    });
                }
                let issuer_info = get_string(r)?;
                Self::Issuance {
                    symbol,
                    name,
                    total_supply,
                    fee_type,
                    fee_rate,
                    settings,
                    controllers,
                    issuer_info,
                }
            }
            3 => Self::Revoke {
                token: r.get_buf32()?,
                source: r.get_buf32()?,
                to: r.get_buf32()?,
                amount: r.get_amount()?,
            },
            4 => {
                let token = r.get_buf32()?;
                let tag = r.get_u8()?;
                let fee_type =
                    TokenFeeType::from_u8(tag).ok_or(CodecError::UnknownTag("fee type", tag))?;
                Self::AdjustFee {
                    token,
                    fee_type,
                    fee_rate: r.get_amount()?,
                }
            }
            5 => {
                let token = r.get_buf32()?;
                let tag = r.get_u8()?;
                let action = ControllerAction::from_u8(tag)
                    .ok_or(CodecError::UnknownTag("controller action", tag))?;
                Self::UpdateController {
                    token,
                    action,
                    controller: ControllerInfo {
                        account: r.get_buf32()?,
                        privileges: r.get_u16()?,
                    },
                }
            }
            6 => {
                let count = r.get_u8()? as usize;
                let mut votes = Vec::with_capacity(count);
                for _ in 0..count {
                    votes.push((r.get_buf32()?, r.get_u8()?));
                }
                Self::ElectionVote { votes }
            }
            7 => Self::AnnounceCandidacy {
                stake: r.get_amount()?,
                bls_key: {
                    let b = r.take(48)?;
                    Buf48::try_from(b).expect("wire: 48 bytes")
                },
            },
            8 => Self::RenounceCandidacy,
            9 => Self::StartRepresenting {
                stake: r.get_amount()?,
            },
            10 => Self::StopRepresenting,
            11 => Self::Stake {
                amount: r.get_amount()?,
            },
            12 => Self::Unstake,
            13 => Self::Proxy {
                rep: r.get_buf32()?,
                amount: r.get_amount()?,
                lock: r.get_u8()? != 0,
            },
            14 => Self::Claim {
                epoch: r.get_u32()?,
            },
            other => return Err(CodecError::UnknownTag("request", other)),
        };
        Ok(payload)
    }
}

impl WireEncode for Request {
    fn encode(&self, w: &mut WireWriter) {
        w.put_u8(self.kind() as u8);
        w.put_buf32(&self.origin);
        w.put_buf32(&self.previous);
        w.put_amount(self.fee);
        w.put_u32(self.sequence);
        w.put_u64(self.work);
        self.payload.encode_body(w);
        w.put_buf64(&self.signature);
        w.put_buf32(&self.next);
    }
}

impl WireDecode for Request {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let kind = r.get_u8()?;
        let origin = r.get_buf32()?;
        let previous = r.get_buf32()?;
        let fee = r.get_amount()?;
        let sequence = r.get_u32()?;
        let work = r.get_u64()?;
        let payload = RequestPayload::decode_body(kind, r)?;
        let signature = r.get_buf64()?;
        let next = r.get_buf32()?;
        Ok(Self {
            origin,
            previous,
            fee,
            sequence,
            work,
            payload,
            signature,
            next,
        })
    }
}

impl ContentDigest for Request {
    fn write_digest(&self, stream: &mut HashStream) {
        // Everything up to (and excluding) the signature participates.
        let mut w = WireWriter::new();
        w.put_u8(self.kind() as u8);
        w.put_buf32(&self.origin);
        w.put_buf32(&self.previous);
        w.put_amount(self.fee);
        w.put_u32(self.sequence);
        w.put_u64(self.work);
        self.payload.encode_body(&mut w);
        stream.write(&w.into_bytes());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn send(seq: u32) -> Request {
        Request::new(
            Buf32::new([1; 32]),
            Buf32::zero(),
            Amount::new(10),
            seq,
            RequestPayload::Send {
                to: Buf32::new([2; 32]),
                amount: Amount::new(100),
            },
        )
    }

    #[test]
    fn test_wire_roundtrip() {
        let req = send(3);
        let bytes = req.to_wire();
        let back = Request::from_wire(&bytes).unwrap();
        assert_eq!(req, back);
        assert_eq!(back.to_wire(), bytes);
    }

    #[test]
    fn test_digest_skips_signature_and_next() {
        let mut a = send(0);
        let mut b = send(0);
        a.signature = Buf64::new([9; 64]);
        b.next = Buf32::new([9; 32]);
        assert_eq!(a.digest(), b.digest());

        b.sequence = 1;
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut bytes = send(0).to_wire();
        bytes[0] = 0xee;
        assert!(matches!(
            Request::from_wire(&bytes),
            Err(CodecError::UnknownTag("request", 0xee))
        ));
    }

    #[test]
    fn test_issuance_roundtrip() {
        let req = Request::new(
            Buf32::new([1; 32]),
            Buf32::new([3; 32]),
            Amount::new(10),
            7,
            RequestPayload::Issuance {
                symbol: "CNV".into(),
                name: "Conclave".into(),
                total_supply: Amount::new(1_000_000),
                fee_type: TokenFeeType::Percentage,
                fee_rate: Amount::new(2),
                settings: 0b1010,
                controllers: vec![ControllerInfo {
                    account: Buf32::new([4; 32]),
                    privileges: controller_privilege::ISSUE | controller_privilege::FREEZE,
                }],
                issuer_info: "issuer".into(),
            },
        );
        let back = Request::from_wire(&req.to_wire()).unwrap();
        assert_eq!(req, back);
    }
}
