//! IPC bridge for parent-worker communication.
//!
//! # Architecture
//!
//! - **protocol**: Message types (Call, Shutdown, Result) and correlation ids
//! - **codec**: length-prefixed framing, optionally combined with a serializer
//! - **transport**: Unix socket pair naming, bind/accept (parent) and connect (worker)
//! - **channel**: single-writer sends and the frame receive loop

pub mod channel;
pub mod codec;
pub mod protocol;
pub mod transport;
