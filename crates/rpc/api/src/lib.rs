//! jsonrpsee trait for the node's JSON-RPC façade.  The serving stack
//! itself lives with the external collaborators; the node mounts an
//! implementation of this trait.

use conclave_rpc_types::SubmitResponse;
use conclave_state::account::AccountInfo;
use conclave_state::tips::TipSet;
use jsonrpsee::core::RpcResult;
use jsonrpsee::proc_macros::rpc;

#[rpc(server, namespace = "conclave")]
pub trait ConclaveApi {
    /// Submits a hex-encoded request for consensus.
    #[method(name = "submitRequest")]
    async fn submit_request(&self, request_hex: String) -> RpcResult<SubmitResponse>;

    /// Flushes a buffered benchmark stream.
    #[method(name = "bufferComplete")]
    async fn buffer_complete(&self) -> RpcResult<SubmitResponse>;

    /// The account record, if the account exists.
    #[method(name = "accountInfo")]
    async fn account_info(&self, account_hex: String) -> RpcResult<Option<AccountInfo>>;

    /// Current chain heads.
    #[method(name = "tips")]
    async fn tips(&self) -> RpcResult<TipSet>;
}
