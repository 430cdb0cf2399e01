//! JSON-RPC implementation mounted when `rpc_enable` is set.

use std::sync::Arc;

use conclave_db::LedgerDb;
use conclave_primitives::prelude::*;
use conclave_rpc_api::ConclaveApiServer;
use conclave_rpc_types::SubmitResponse;
use conclave_state::account::AccountInfo;
use conclave_state::request::Request;
use conclave_state::tips::TipSet;
use jsonrpsee::core::{async_trait, RpcResult};
use jsonrpsee::types::{ErrorCode, ErrorObjectOwned};

use crate::network::NodeStacks;

pub struct ConclaveRpcImpl {
    db: Arc<LedgerDb>,
    stacks: Arc<NodeStacks>,
}

impl ConclaveRpcImpl {
    pub fn new(db: Arc<LedgerDb>, stacks: Arc<NodeStacks>) -> Self {
        Self { db, stacks }
    }
}

fn invalid_params(msg: &str) -> ErrorObjectOwned {
    ErrorObjectOwned::owned(ErrorCode::InvalidParams.code(), msg.to_string(), None::<()>)
}

fn parse_account(hex_str: &str) -> Result<Buf32, ErrorObjectOwned> {
    let mut raw = [0u8; 32];
    hex::decode_to_slice(hex_str, &mut raw)
        .map_err(|_| invalid_params("expected 64 hex chars"))?;
    Ok(Buf32::new(raw))
}

#[async_trait]
impl ConclaveApiServer for ConclaveRpcImpl {
    async fn submit_request(&self, request_hex: String) -> RpcResult<SubmitResponse> {
        let bytes =
            hex::decode(&request_hex).map_err(|_| invalid_params("request is not hex"))?;
        let request = Request::from_wire(&bytes)
            .map_err(|e| invalid_params(&format!("malformed request: {e}")))?;

        let Some(stack) = self.stacks.current() else {
            return Err(ErrorObjectOwned::owned(
                ErrorCode::InternalError.code(),
                "consensus not running".to_string(),
                None::<()>,
            ));
        };
        Ok(stack.request_handler.on_send_request(request, false).into())
    }

    async fn buffer_complete(&self) -> RpcResult<SubmitResponse> {
        let Some(stack) = self.stacks.current() else {
            return Err(ErrorObjectOwned::owned(
                ErrorCode::InternalError.code(),
                "consensus not running".to_string(),
                None::<()>,
            ));
        };
        Ok(stack.request_handler.buffer_complete().into())
    }

    async fn account_info(&self, account_hex: String) -> RpcResult<Option<AccountInfo>> {
        let account = parse_account(&account_hex)?;
        let mut txn = self.db.begin();
        txn.account_get(&account).map_err(|e| {
            ErrorObjectOwned::owned(ErrorCode::InternalError.code(), e.to_string(), None::<()>)
        })
    }

    async fn tips(&self) -> RpcResult<TipSet> {
        let mut txn = self.db.begin();
        let mut tips = TipSet::default();
        tips.eb_tip = txn.eb_tip_get().ok().flatten().unwrap_or_default();
        tips.mb_tip = txn.mb_tip_get().ok().flatten().unwrap_or_default();
        for delegate in 0..NUM_DELEGATES {
            tips.rb_tips[delegate] = txn
                .rb_tip_get(delegate as DelegateId)
                .ok()
                .flatten()
                .unwrap_or_default();
        }
        Ok(tips)
    }
}
