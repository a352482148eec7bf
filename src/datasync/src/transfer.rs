use crate::error::SyncError;
use openssl::sha::Sha1;
use std::{
    convert::TryFrom,
    fs::File,
    io::{Read, Write},
    path::Path,
    time::Instant,
};
use tracing::{debug, warn};
use wire::{Channel, Msg, ProtocolError, Timeout, Transport};

/// Version of the raw transfer sub-protocol, exchanged before any data.
pub const FILE_TRANSFER_VERSION: u32 = 0x0200_0001;

/// Data flows in chunks of this size; the digest is updated per chunk.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Waits for `want`, tolerating keepalives, and translating a peer-side
/// filesystem failure into `SyncError::Remote`.
pub(crate) fn expect_ctl<T: Transport>(
    chan: &mut Channel<T>,
    want: Msg,
    timeout: Timeout,
) -> Result<(), SyncError> {
    match chan.recv_any(&[want, Msg::FileSystemError], timeout)? {
        m if m == want => Ok(()),
        _ => Err(SyncError::Remote),
    }
}

/// Best-effort notification that a local file operation failed, sent before
/// the local error is raised so the peer sees a clean failure instead of a
/// desynchronized stream.
fn report_fs_error<T: Transport>(chan: &mut Channel<T>) {
    if chan.send_msg(Msg::FileSystemError, Timeout::Default).is_err() {
        debug!(peer = %chan.peer(), "could not report filesystem error to peer");
    }
}

fn speed_kib_per_sec(bytes: u64, started: Instant) -> f64 {
    let secs = started.elapsed().as_secs_f64().max(1e-3);
    bytes as f64 / 1024.0 / secs
}

/// Sends the file at `path`. Returns the transfer speed in KiB/s (advisory).
///
/// The sender is authoritative for the integrity verdict: it compares the
/// receiver's digest against the digest of the bytes it read and answers
/// `FileCheckOk` or `FileCheckFail`.
pub fn send_file<T: Transport>(chan: &mut Channel<T>, path: &Path) -> Result<f64, SyncError> {
    let started = Instant::now();
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            report_fs_error(chan);
            return Err(SyncError::io(path, e));
        }
    };
    let size = match file.metadata() {
        Ok(m) => m.len(),
        Err(e) => {
            report_fs_error(chan);
            return Err(SyncError::io(path, e));
        }
    };
    let size32 = u32::try_from(size).map_err(|_| SyncError::TooLarge(size))?;

    chan.send_msg(Msg::FileBegin, Timeout::Default)?;
    expect_ctl(chan, Msg::FileBegin, Timeout::Default)?;
    chan.write_u32(FILE_TRANSFER_VERSION, Timeout::Default)?;
    let theirs = chan.read_u32(Timeout::Default)?;
    if theirs != FILE_TRANSFER_VERSION {
        warn!(peer = %chan.peer(), theirs, "file transfer version mismatch");
        return Err(ProtocolError::VersionMismatch {
            ours: FILE_TRANSFER_VERSION,
            theirs,
        }
        .into());
    }
    chan.write_u32(size32, Timeout::Default)?;
    expect_ctl(chan, Msg::FileTransBegin, Timeout::Default)?;

    let mut ctx = Sha1::new();
    let mut buf = [0u8; CHUNK_SIZE];
    let mut left = size;
    while left > 0 {
        let want = (left as usize).min(CHUNK_SIZE);
        if let Err(e) = file.read_exact(&mut buf[..want]) {
            report_fs_error(chan);
            return Err(SyncError::io(path, e));
        }
        ctx.update(&buf[..want]);
        chan.write_exact(&buf[..want], Timeout::Default)?;
        left -= want as u64;
    }
    let ours = ctx.finish();

    chan.send_msg(Msg::FileEnd, Timeout::Default)?;
    expect_ctl(chan, Msg::FileEnd, Timeout::Default)?;

    let mut theirs_digest = [0u8; 20];
    chan.read_exact(&mut theirs_digest, Timeout::Default)?;
    if theirs_digest == ours {
        chan.send_msg(Msg::FileCheckOk, Timeout::Default)?;
        let speed = speed_kib_per_sec(size, started);
        debug!(peer = %chan.peer(), size, speed, "file sent");
        Ok(speed)
    } else {
        warn!(peer = %chan.peer(), "digest mismatch after sending file");
        chan.send_msg(Msg::FileCheckFail, Timeout::Default)?;
        Err(SyncError::Integrity {
            path: path.to_path_buf(),
        })
    }
}

/// Receives a file into `path`. Returns the transfer speed in KiB/s.
pub fn recv_file<T: Transport>(chan: &mut Channel<T>, path: &Path) -> Result<f64, SyncError> {
    let started = Instant::now();
    let mut file = match File::create(path) {
        Ok(f) => f,
        Err(e) => {
            report_fs_error(chan);
            return Err(SyncError::io(path, e));
        }
    };

    expect_ctl(chan, Msg::FileBegin, Timeout::Default)?;
    chan.send_msg(Msg::FileBegin, Timeout::Default)?;
    chan.write_u32(FILE_TRANSFER_VERSION, Timeout::Default)?;
    let theirs = chan.read_u32(Timeout::Default)?;
    if theirs != FILE_TRANSFER_VERSION {
        warn!(peer = %chan.peer(), theirs, "file transfer version mismatch");
        return Err(ProtocolError::VersionMismatch {
            ours: FILE_TRANSFER_VERSION,
            theirs,
        }
        .into());
    }
    let size = chan.read_u32(Timeout::Default)? as u64;
    chan.send_msg(Msg::FileTransBegin, Timeout::Default)?;

    let mut ctx = Sha1::new();
    let mut buf = [0u8; CHUNK_SIZE];
    let mut left = size;
    while left > 0 {
        let want = (left as usize).min(CHUNK_SIZE);
        chan.read_exact(&mut buf[..want], Timeout::Default)?;
        ctx.update(&buf[..want]);
        if let Err(e) = file.write_all(&buf[..want]) {
            report_fs_error(chan);
            return Err(SyncError::io(path, e));
        }
        left -= want as u64;
    }
    if let Err(e) = file.flush() {
        report_fs_error(chan);
        return Err(SyncError::io(path, e));
    }

    expect_ctl(chan, Msg::FileEnd, Timeout::Default)?;
    chan.send_msg(Msg::FileEnd, Timeout::Default)?;
    chan.write_exact(&ctx.finish(), Timeout::Default)?;

    match chan.recv_any(&[Msg::FileCheckOk, Msg::FileCheckFail], Timeout::Default)? {
        Msg::FileCheckOk => {
            let speed = speed_kib_per_sec(size, started);
            debug!(peer = %chan.peer(), size, speed, "file received");
            Ok(speed)
        }
        _ => {
            warn!(peer = %chan.peer(), "sender rejected our digest of the received file");
            Err(SyncError::Integrity {
                path: path.to_path_buf(),
            })
        }
    }
}
