//! Content-addressed directory synchronization over a wire channel: manifest
//! diffing, a selective gzip'd tar transfer, and the raw single-file
//! transfer primitive underneath it.

#[cfg(test)]
mod tests;

pub mod error;
pub mod manifest;
pub mod syncdir;
pub mod transfer;

pub use error::SyncError;
pub use manifest::{Digest, FileManifest, DIGEST_LEN};
pub use syncdir::{recv_dir, send_dir, with_keepalive};
pub use transfer::{recv_file, send_file};
