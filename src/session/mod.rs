pub mod ack_coordinator;
pub mod auth_key;
pub mod driver;
pub mod message_id;
pub mod session_state;
