//! Account records: user accounts opened by receiving funds, and token
//! accounts created by issuance.

use arbitrary::Arbitrary;
use borsh::{BorshDeserialize, BorshSerialize};
use conclave_primitives::prelude::*;
use serde::{Deserialize, Serialize};

use crate::request::{ControllerInfo, TokenFeeType};

/// Per-token holdings tracked on a user account.
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
pub struct TokenEntry {
    pub token: Buf32,
    pub balance: Amount,
    pub whitelisted: bool,
    pub frozen: bool,
}

/// A user account.
#[derive(
    Clone, Debug, Eq, PartialEq, Arbitrary, BorshDeserialize, BorshSerialize, Deserialize, Serialize,
)]
pub struct AccountInfo {
    /// Head of the send chain.
    pub head: Buf32,
    /// Head of the receive chain.
    pub receive_head: Buf32,
    /// Head of the staking subchain.
    pub staking_subchain_head: Buf32,
    /// The receive that opened the account.
    pub open_block: Buf32,
    pub balance: Amount,
    /// Unix seconds of the last modification.
    pub modified: u64,
    pub block_count: u32,
    pub receive_count: u32,
    /// Hash of the reserving request, or zero when unreserved.
    pub reservation: Buf32,
    pub reservation_epoch: u32,
    pub token_entries: Vec<TokenEntry>,
}

impl Default for AccountInfo {
    fn default() -> Self {
        Self {
            head: Buf32::zero(),
            receive_head: Buf32::zero(),
            staking_subchain_head: Buf32::zero(),
            open_block: Buf32::zero(),
            balance: Amount::ZERO,
            modified: 0,
            block_count: 0,
            receive_count: 0,
            reservation: Buf32::zero(),
            reservation_epoch: 0,
            token_entries: Vec::new(),
        }
    }
}

impl AccountInfo {
    pub fn is_reserved(&self) -> bool {
        !self.reservation.is_zero()
    }

    pub fn clear_reservation(&mut self) {
        self.reservation = Buf32::zero();
        self.reservation_epoch = 0;
    }

    pub fn token_entry(&self, token: &Buf32) -> Option<&TokenEntry> {
        self.token_entries.iter().find(|e| e.token == *token)
    }

    pub fn token_entry_mut(&mut self, token: &Buf32) -> &mut TokenEntry {
        if let Some(pos) = self.token_entries.iter().position(|e| e.token == *token) {
            return &mut self.token_entries[pos];
        }
        self.token_entries.push(TokenEntry {
            token: *token,
            balance: Amount::ZERO,
            whitelisted: false,
            frozen: false,
        });
        self.token_entries.last_mut().expect("account: just pushed")
    }
}

/// Settings bits on a token account.  Odd values are the may-modify guards
/// of the preceding even value: if the guard bit is clear, the even setting
/// is immutable for the life of the token.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum TokenSetting {
    Issuance = 0,
    ModifyIssuance = 1,
    Revoke = 2,
    ModifyRevoke = 3,
    Freeze = 4,
    ModifyFreeze = 5,
    AdjustFee = 6,
    ModifyAdjustFee = 7,
    Whitelist = 8,
    ModifyWhitelist = 9,
}

impl TokenSetting {
    /// The guard bit controlling whether this setting may be modified.
    pub fn modify_guard(&self) -> Option<TokenSetting> {
        match self {
            Self::Issuance => Some(Self::ModifyIssuance),
            Self::Revoke => Some(Self::ModifyRevoke),
            Self::Freeze => Some(Self::ModifyFreeze),
            Self::AdjustFee => Some(Self::ModifyAdjustFee),
            Self::Whitelist => Some(Self::ModifyWhitelist),
            _ => None,
        }
    }
}

/// A token account.
#[derive(
    Clone, Debug, Eq, PartialEq, Arbitrary, BorshDeserialize, BorshSerialize, Deserialize, Serialize,
)]
pub struct TokenAccount {
    /// Head of the token's own administrative chain.
    pub head: Buf32,
    /// Untokenized fee balance held by the account itself.
    pub balance: Amount,
    pub total_supply: Amount,
    /// Units not yet distributed.
    pub token_balance: Amount,
    /// Accumulated token-denominated fees.
    pub token_fee_balance: Amount,
    pub fee_type: TokenFeeType,
    pub fee_rate: Amount,
    pub symbol: String,
    pub name: String,
    pub issuer_info: String,
    pub controllers: Vec<ControllerInfo>,
    pub settings: u16,
    pub block_count: u32,
}

impl TokenAccount {
    pub fn setting(&self, s: TokenSetting) -> bool {
        self.settings & (1u16 << (s as u8)) != 0
    }

    pub fn set_setting(&mut self, s: TokenSetting, on: bool) {
        if on {
            self.settings |= 1u16 << (s as u8);
        } else {
            self.settings &= !(1u16 << (s as u8));
        }
    }

    /// Whether a setting may still be changed, per its odd guard bit.
    pub fn setting_mutable(&self, s: TokenSetting) -> bool {
        match s.modify_guard() {
            Some(guard) => self.setting(guard),
            // Guard bits themselves may only be cleared, never set; callers
            // enforce the direction.
            None => true,
        }
    }

    pub fn controller(&self, account: &Buf32) -> Option<&ControllerInfo> {
        self.controllers.iter().find(|c| c.account == *account)
    }

    /// The fee owed on a transfer of `amount` under the current schedule.
    pub fn fee_for(&self, amount: Amount) -> Amount {
        match self.fee_type {
            TokenFeeType::Flat => self.fee_rate,
            TokenFeeType::Percentage => Amount::new(amount.raw() * self.fee_rate.raw() / 100),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn token() -> TokenAccount {
        TokenAccount {
            head: Buf32::zero(),
            balance: Amount::ZERO,
            total_supply: Amount::new(1000),
            token_balance: Amount::new(1000),
            token_fee_balance: Amount::ZERO,
            fee_type: TokenFeeType::Flat,
            fee_rate: Amount::new(5),
            symbol: "CNV".into(),
            name: "Conclave".into(),
            issuer_info: String::new(),
            controllers: Vec::new(),
            settings: 0,
            block_count: 0,
        }
    }

    #[test]
    fn test_setting_guard_pairs() {
        let mut t = token();
        t.set_setting(TokenSetting::Freeze, true);
        assert!(t.setting(TokenSetting::Freeze));
        // Guard bit clear: freeze setting is immutable.
        assert!(!t.setting_mutable(TokenSetting::Freeze));
        t.set_setting(TokenSetting::ModifyFreeze, true);
        assert!(t.setting_mutable(TokenSetting::Freeze));
    }

    #[test]
    fn test_fee_types() {
        let mut t = token();
        assert_eq!(t.fee_for(Amount::new(10_000)), Amount::new(5));
        t.fee_type = TokenFeeType::Percentage;
        t.fee_rate = Amount::new(2);
        assert_eq!(t.fee_for(Amount::new(10_000)), Amount::new(200));
    }

    #[test]
    fn test_token_entry_upsert() {
        let mut info = AccountInfo::default();
        let tok = Buf32::new([3; 32]);
        assert!(info.token_entry(&tok).is_none());
        info.token_entry_mut(&tok).balance = Amount::new(4);
        assert_eq!(info.token_entry(&tok).unwrap().balance, Amount::new(4));
        assert_eq!(info.token_entries.len(), 1);
        info.token_entry_mut(&tok).balance += Amount::new(1);
        assert_eq!(info.token_entries.len(), 1);
    }
}
