pub mod codec;
pub mod config;
pub mod datacenter;
pub mod engine;
pub mod error;
pub mod keepalive;
pub mod persistence;
pub mod rpc;
pub mod session;
pub mod util;
pub mod test_util;
