use thiserror::Error;

use crate::datacenter::address::DatacenterId;

/// How a call to the engine can fail, as seen by the application
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum RpcFailure {
    /// the server answered with an error that the engine does not handle by itself
    #[error("rpc error {code}: {description}")]
    Rpc { code: i32, description: String },
    /// the auth key is missing, invalid or revoked; a new key must be negotiated
    #[error("authentication required")]
    AuthenticationRequired,
    /// the session was reset while the call was pending; it may be resubmitted
    #[error("session was reset")]
    SessionReset,
    #[error("datacenter {dc} is unreachable after {rounds} discovery rounds")]
    ConnectivityUnavailable { dc: DatacenterId, rounds: u32 },
    #[error("call was cancelled")]
    Cancelled,
    #[error("session is closed")]
    Closed,
}

pub type RpcResult<T> = Result<T, RpcFailure>;
