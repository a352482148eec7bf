//! Framed secure channel and message protocol shared by the judging server
//! and its workers. All multi-byte integers on the wire are big-endian;
//! strings are a u32 length prefix followed by raw bytes.

#[cfg(test)]
mod tests;

pub mod case_result;
pub mod channel;
pub mod error;
pub mod msg;
pub mod tls;

pub use case_result::{CaseResult, ExeStatus};
pub use channel::{Channel, Timeout, Transport};
pub use error::{NetworkError, ProtocolError, WireError};
pub use msg::{Msg, KEEPALIVE_INTERVAL, PROTOCOL_VERSION};
