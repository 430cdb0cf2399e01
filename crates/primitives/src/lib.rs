//! Fundamental types shared across the node: fixed-size buffers, amounts,
//! digests, the wire codec primitives and protocol constants.

pub mod amount;
pub mod buf;
pub mod hash;
pub mod macros;
pub mod params;
pub mod wire;

pub mod prelude {
    pub use crate::{
        amount::Amount,
        buf::{Buf32, Buf48, Buf64, Buf96},
        hash::{blake2b, ContentDigest, HashStream},
        params::*,
        wire::{CodecError, WireDecode, WireEncode, WireReader, WireWriter},
    };
}
