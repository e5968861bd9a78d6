use bytes::Bytes;

use crate::datacenter::address::DatacenterId;

pub mod correlator;
pub mod error_classification;

/// Successful outcome of a call on a single session
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RpcOutcome {
    Response(Bytes),
    /// the call has to be repeated against a different datacenter
    Migrate { dc: DatacenterId, error_code: i32, description: String },
}
