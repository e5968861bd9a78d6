pub mod compression;
pub mod constructors;
pub mod envelope;
pub mod frame;
pub mod service_messages;
