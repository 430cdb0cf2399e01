//! Chain tips as exchanged during bootstrap.

use arbitrary::Arbitrary;
use borsh::{BorshDeserialize, BorshSerialize};
use conclave_primitives::prelude::*;
use serde::{Deserialize, Serialize};

/// A node's view of all chain heads.
#[derive(
    Clone, Debug, Eq, PartialEq, Arbitrary, BorshDeserialize, BorshSerialize, Deserialize, Serialize,
)]
pub struct TipSet {
    pub epoch_number: u32,
    pub eb_tip: Buf32,
    pub mb_tip: Buf32,
    pub rb_tips: [Buf32; NUM_DELEGATES],
}

impl Default for TipSet {
    fn default() -> Self {
        Self {
            epoch_number: 0,
            eb_tip: Buf32::zero(),
            mb_tip: Buf32::zero(),
            rb_tips: [Buf32::zero(); NUM_DELEGATES],
        }
    }
}

impl WireEncode for TipSet {
    fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.epoch_number);
        w.put_buf32(&self.eb_tip);
        w.put_buf32(&self.mb_tip);
        for tip in &self.rb_tips {
            w.put_buf32(tip);
        }
    }
}

impl WireDecode for TipSet {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let epoch_number = r.get_u32()?;
        let eb_tip = r.get_buf32()?;
        let mb_tip = r.get_buf32()?;
        let mut rb_tips = [Buf32::zero(); NUM_DELEGATES];
        for tip in rb_tips.iter_mut() {
            *tip = r.get_buf32()?;
        }
        Ok(Self {
            epoch_number,
            eb_tip,
            mb_tip,
            rb_tips,
        })
    }
}
