//! Utilities for testing code that talks to datacenters through the engine: a wall clock that
//!  is moved by hand, and a transport that hands the server side of every connection to the
//!  test. They are used for testing the engine itself, but they are also exported for
//!  application testing, so they are part of the crate's regular (non-#[cfg(test)]) code.

pub mod clock;
pub mod environment;
pub mod transport;

pub use clock::ManualClock;
