//! Token-family request rules: issuance, transfers, revocation, fee
//! adjustment and controller management.
//!
//! The fee charged on a token send is the rate in effect when the block is
//! applied, not when the request was validated.

use conclave_db::LedgerTxn;
use conclave_primitives::prelude::*;
use conclave_state::account::{AccountInfo, TokenAccount, TokenSetting};
use conclave_state::process::ProcessResult;
use conclave_state::request::{
    controller_privilege, ControllerAction, Request, RequestPayload, TokenFeeType,
};
use tracing::*;

use crate::errors::{PersistResult, PersistenceError};

type Check = Result<(), ProcessResult>;

/// Upper bound on the controller set of one token.
const MAX_CONTROLLERS: usize = 10;

fn token_get(txn: &mut LedgerTxn<'_>, token: &Buf32) -> Result<TokenAccount, ProcessResult> {
    txn.token_account_get(token)
        .map_err(|_| ProcessResult::InvalidRequest)?
        .ok_or(ProcessResult::InvalidRequest)
}

fn require_privilege(
    account: &TokenAccount,
    origin: &Buf32,
    privilege: u16,
) -> Check {
    let granted = account
        .controller(origin)
        .map(|c| c.can(privilege))
        .unwrap_or(false);
    if !granted {
        return Err(ProcessResult::UntrustedSender);
    }
    Ok(())
}

pub fn validate(txn: &mut LedgerTxn<'_>, request: &Request, info: &AccountInfo) -> Check {
    let origin = &request.origin;
    match &request.payload {
        RequestPayload::TokenSend { token, to, amount } => {
            if amount.is_zero() || to.is_zero() {
                return Err(ProcessResult::InvalidTokenAmount);
            }
            let account = token_get(txn, token)?;

            let entry = info
                .token_entry(token)
                .ok_or(ProcessResult::InsufficientTokenBalance)?;
            if entry.frozen {
                return Err(ProcessResult::FrozenAccount);
            }
            if account.setting(TokenSetting::Whitelist) && !entry.whitelisted {
                return Err(ProcessResult::NotWhitelisted);
            }

            let fee = account.fee_for(*amount);
            let total = amount
                .checked_add(fee)
                .ok_or(ProcessResult::InvalidTokenAmount)?;
            if total > entry.balance {
                return Err(ProcessResult::InsufficientTokenBalance);
            }
            Ok(())
        }
        RequestPayload::Issuance {
            symbol,
            name,
            total_supply,
            fee_type,
            fee_rate,
            controllers,
            ..
        } => {
            if symbol.is_empty() || name.is_empty() || total_supply.is_zero() {
                return Err(ProcessResult::InvalidRequest);
            }
            if *fee_type == TokenFeeType::Percentage && fee_rate.raw() > 100 {
                return Err(ProcessResult::InvalidRequest);
            }
            if controllers.len() > MAX_CONTROLLERS {
                return Err(ProcessResult::InvalidRequest);
            }
            let token_id = request.digest();
            let exists = txn
                .token_account_get(&token_id)
                .map_err(|_| ProcessResult::InvalidRequest)?
                .is_some();
            if exists {
                return Err(ProcessResult::Redundant);
            }
            Ok(())
        }
        RequestPayload::Revoke {
            token,
            source,
            amount,
            ..
        } => {
            let account = token_get(txn, token)?;
            require_privilege(&account, origin, controller_privilege::REVOKE)?;
            if !account.setting(TokenSetting::Revoke) {
                return Err(ProcessResult::Immutable);
            }
            let source_info = txn
                .account_get(source)
                .map_err(|_| ProcessResult::InvalidRequest)?
                .ok_or(ProcessResult::UnknownSourceAccount)?;
            let held = source_info
                .token_entry(token)
                .map(|e| e.balance)
                .unwrap_or(Amount::ZERO);
            if *amount > held {
                return Err(ProcessResult::InsufficientTokenBalance);
            }
            Ok(())
        }
        RequestPayload::AdjustFee {
            token,
            fee_type,
            fee_rate,
        } => {
            let account = token_get(txn, token)?;
            require_privilege(&account, origin, controller_privilege::ADJUST_FEE)?;
            if !account.setting(TokenSetting::AdjustFee) {
                // A token issued without the adjust-fee setting, and with
                // its guard cleared, can never change its schedule.
                return if account.setting_mutable(TokenSetting::AdjustFee) {
                    Err(ProcessResult::RevertImmutability)
                } else {
                    Err(ProcessResult::Immutable)
                };
            }
            if *fee_type == TokenFeeType::Percentage && fee_rate.raw() > 100 {
                return Err(ProcessResult::InvalidRequest);
            }
            Ok(())
        }
        RequestPayload::UpdateController {
            token,
            action,
            controller,
        } => {
            let account = token_get(txn, token)?;
            require_privilege(&account, origin, controller_privilege::UPDATE_CONTROLLER)?;
            match action {
                ControllerAction::Add => {
                    let same = account
                        .controller(&controller.account)
                        .map(|c| c.privileges == controller.privileges)
                        .unwrap_or(false);
                    if same {
                        return Err(ProcessResult::Redundant);
                    }
                    if account.controller(&controller.account).is_none()
                        && account.controllers.len() >= MAX_CONTROLLERS
                    {
                        return Err(ProcessResult::InvalidRequest);
                    }
                }
                ControllerAction::Remove => {
                    if account.controller(&controller.account).is_none() {
                        return Err(ProcessResult::Redundant);
                    }
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

pub fn apply(txn: &mut LedgerTxn<'_>, request: &Request, _epoch: u32) -> PersistResult<()> {
    let origin = request.origin;
    match &request.payload {
        RequestPayload::TokenSend { token, to, amount } => {
            let mut account = txn
                .token_account_get(token)?
                .ok_or_else(|| PersistenceError::Fatal(format!("token {token} vanished")))?;

            // Fee effective at apply time is authoritative.
            let fee = account.fee_for(*amount);

            let mut sender = txn
                .account_get(&origin)?
                .ok_or_else(|| PersistenceError::Fatal(format!("sender {origin} vanished")))?;
            {
                let entry = sender.token_entry_mut(token);
                entry.balance = entry
                    .balance
                    .checked_sub(*amount + fee)
                    .ok_or_else(|| {
                        PersistenceError::Fatal(format!("token balance underflow for {origin}"))
                    })?;
            }
            txn.account_put(&origin, &sender)?;

            let mut receiver = txn.account_get(to)?.unwrap_or_default();
            receiver.token_entry_mut(token).balance += *amount;
            txn.account_put(to, &receiver)?;

            account.token_fee_balance += fee;
            txn.token_account_put(token, &account)?;
            debug!(%token, %amount, %fee, "token transferred");
        }
        RequestPayload::Issuance {
            symbol,
            name,
            total_supply,
            fee_type,
            fee_rate,
            settings,
            controllers,
            issuer_info,
        } => {
            let token_id = request.digest();
            let account = TokenAccount {
                head: request.digest(),
                balance: Amount::ZERO,
                total_supply: *total_supply,
                token_balance: *total_supply,
                token_fee_balance: Amount::ZERO,
                fee_type: *fee_type,
                fee_rate: *fee_rate,
                symbol: symbol.clone(),
                name: name.clone(),
                issuer_info: issuer_info.clone(),
                controllers: controllers.clone(),
                settings: *settings,
                block_count: 1,
            };
            txn.token_account_put(&token_id, &account)?;
            debug!(token = %token_id, %symbol, "token issued");
        }
        RequestPayload::Revoke {
            token,
            source,
            to,
            amount,
        } => {
            let mut source_info = txn
                .account_get(source)?
                .ok_or_else(|| PersistenceError::Fatal(format!("revoke source {source} vanished")))?;
            {
                let entry = source_info.token_entry_mut(token);
                entry.balance = entry.balance.checked_sub(*amount).ok_or_else(|| {
                    PersistenceError::Fatal(format!("revoke underflow for {source}"))
                })?;
            }
            txn.account_put(source, &source_info)?;

            let mut dest = txn.account_get(to)?.unwrap_or_default();
            dest.token_entry_mut(token).balance += *amount;
            txn.account_put(to, &dest)?;
        }
        RequestPayload::AdjustFee {
            token,
            fee_type,
            fee_rate,
        } => {
            let mut account = txn
                .token_account_get(token)?
                .ok_or_else(|| PersistenceError::Fatal(format!("token {token} vanished")))?;
            account.fee_type = *fee_type;
            account.fee_rate = *fee_rate;
            account.block_count += 1;
            account.head = request.digest();
            txn.token_account_put(token, &account)?;
        }
        RequestPayload::UpdateController {
            token,
            action,
            controller,
        } => {
            let mut account = txn
                .token_account_get(token)?
                .ok_or_else(|| PersistenceError::Fatal(format!("token {token} vanished")))?;
            match action {
                ControllerAction::Add => {
                    if let Some(existing) = account
                        .controllers
                        .iter_mut()
                        .find(|c| c.account == controller.account)
                    {
                        existing.privileges = controller.privileges;
                    } else {
                        account.controllers.push(*controller);
                    }
                }
                ControllerAction::Remove => {
                    account.controllers.retain(|c| c.account != controller.account);
                }
            }
            account.block_count += 1;
            account.head = request.digest();
            txn.token_account_put(token, &account)?;
        }
        _ => {}
    }
    Ok(())
}
