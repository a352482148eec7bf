use crate::{
    error::SyncError,
    manifest::{Digest, FileManifest},
    transfer::{self, expect_ctl},
};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::{
    collections::HashMap,
    convert::TryInto,
    fs::File,
    path::Path,
    time::Duration,
};
use tracing::{debug, info};
use wire::{Channel, Msg, ProtocolError, Timeout, Transport, KEEPALIVE_INTERVAL};

/// Runs a CPU- or disk-bound job in a side thread while the protocol thread
/// keeps emitting `TellOnline`, so the peer's bounded wait does not mistake
/// the busy period for a dead connection.
pub fn with_keepalive<T, R, F>(chan: &mut Channel<T>, job: F) -> Result<R, SyncError>
where
    T: Transport,
    R: Send,
    F: FnOnce() -> R + Send,
{
    let (tx, rx) = crossbeam_channel::bounded(1);
    std::thread::scope(|scope| {
        scope.spawn(move || {
            let _ = tx.send(job());
        });
        loop {
            match rx.recv_timeout(KEEPALIVE_INTERVAL) {
                Ok(result) => return Ok(result),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    chan.send_msg(Msg::TellOnline, Timeout::Default)?;
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    return Err(SyncError::io(
                        "<keepalive job>",
                        std::io::Error::new(std::io::ErrorKind::Other, "side thread panicked"),
                    ));
                }
            }
        }
    })
}

fn build_archive(out: &Path, dir: &Path, names: &[String]) -> Result<(), SyncError> {
    let file = File::create(out).map_err(|e| SyncError::io(out, e))?;
    let enc = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(enc);
    // archive by content, not by link
    builder.follow_symlinks(true);
    for name in names {
        let path = dir.join(name);
        builder
            .append_path_with_name(&path, name)
            .map_err(|e| SyncError::io(&path, e))?;
    }
    let enc = builder.into_inner().map_err(|e| SyncError::io(out, e))?;
    enc.finish().map_err(|e| SyncError::io(out, e))?;
    Ok(())
}

fn extract_archive(archive: &Path, dir: &Path) -> Result<(), SyncError> {
    let file = File::open(archive).map_err(|e| SyncError::io(archive, e))?;
    let mut ar = tar::Archive::new(GzDecoder::new(file));
    ar.unpack(dir).map_err(|e| SyncError::io(dir, e))?;
    Ok(())
}

fn report_fs_error<T: Transport>(chan: &mut Channel<T>) {
    let _ = chan.send_msg(Msg::FileSystemError, Timeout::Default);
}

/// Brings the peer's copy of `dir` in sync with ours, transferring only the
/// files the peer is missing or holds stale. Returns the archive transfer
/// speed in KiB/s, or `None` if the peer was already up to date.
///
/// `busy` bounds the waits that cover the peer's hashing/extraction phases;
/// the peer signals liveness through keepalives during them.
pub fn send_dir<T: Transport>(
    chan: &mut Channel<T>,
    dir: &Path,
    busy: Duration,
) -> Result<Option<f64>, SyncError> {
    let manifest = match with_keepalive(chan, || FileManifest::of_dir(dir))? {
        Ok(m) => m,
        Err(e) => {
            report_fs_error(chan);
            return Err(e);
        }
    };
    debug!(dir = %dir.display(), files = manifest.len(), "sending manifest");

    chan.send_msg(Msg::SyncdirBegin, Timeout::Default)?;
    chan.write_u32(manifest.len() as u32, Timeout::Default)?;
    for entry in manifest.entries() {
        chan.write_string(entry.name.as_bytes(), Timeout::Default)?;
        chan.write_string(&entry.digest, Timeout::Default)?;
    }

    expect_ctl(chan, Msg::SyncdirFileList, Timeout::After(busy))?;
    let nneed = chan.read_u32(Timeout::Default)?;
    if nneed == 0 {
        expect_ctl(chan, Msg::SyncdirDone, Timeout::Default)?;
        debug!(dir = %dir.display(), "peer already in sync");
        return Ok(None);
    }
    if nneed as usize > manifest.len() {
        return Err(ProtocolError::BadPayload("needed-file list longer than manifest").into());
    }
    let mut wanted = Vec::with_capacity(nneed as usize);
    for _ in 0..nneed {
        let idx = chan.read_u32(Timeout::Default)? as usize;
        match manifest.entries().get(idx) {
            Some(entry) => wanted.push(entry.name.clone()),
            None => {
                return Err(ProtocolError::BadPayload("needed-file index out of range").into());
            }
        }
    }

    let archive = tempfile::NamedTempFile::new().map_err(|e| SyncError::io("<tempfile>", e))?;
    let built = with_keepalive(chan, || build_archive(archive.path(), dir, &wanted))?;
    if let Err(e) = built {
        report_fs_error(chan);
        return Err(e);
    }

    chan.send_msg(Msg::SyncdirFtrans, Timeout::Default)?;
    let speed = transfer::send_file(chan, archive.path())?;
    expect_ctl(chan, Msg::SyncdirDone, Timeout::After(busy))?;
    info!(dir = %dir.display(), files = wanted.len(), speed, "directory sync sent");
    Ok(Some(speed))
}

/// Receives a directory sync into `dir`, deleting local files the sender no
/// longer has and fetching the ones that are new or stale. Returns the
/// archive transfer speed in KiB/s, or `None` if nothing had to move.
pub fn recv_dir<T: Transport>(
    chan: &mut Channel<T>,
    dir: &Path,
    busy: Duration,
) -> Result<Option<f64>, SyncError> {
    let local = if dir.is_dir() {
        match with_keepalive(chan, || FileManifest::of_dir(dir))? {
            Ok(m) => m,
            Err(e) => {
                report_fs_error(chan);
                return Err(e);
            }
        }
    } else {
        if dir.exists() {
            // a plain file squatting on the directory name
            if let Err(e) = std::fs::remove_file(dir) {
                report_fs_error(chan);
                return Err(SyncError::io(dir, e));
            }
        }
        if let Err(e) = std::fs::create_dir_all(dir) {
            report_fs_error(chan);
            return Err(SyncError::io(dir, e));
        }
        FileManifest::default()
    };
    let mut local: HashMap<String, Digest> = local
        .entries()
        .iter()
        .map(|e| (e.name.clone(), e.digest))
        .collect();

    expect_ctl(chan, Msg::SyncdirBegin, Timeout::After(busy))?;
    let nfile = chan.read_u32(Timeout::Default)?;
    let mut needed = Vec::new();
    for i in 0..nfile {
        let name = String::from_utf8(chan.read_string(Timeout::Default)?)
            .map_err(|_| ProtocolError::BadPayload("manifest name is not utf-8"))?;
        let digest: Digest = chan
            .read_string(Timeout::Default)?
            .as_slice()
            .try_into()
            .map_err(|_| ProtocolError::BadPayload("manifest digest must be 20 bytes"))?;
        if name.contains('/') || name.contains('\\') || name == ".." || name.is_empty() {
            return Err(ProtocolError::BadPayload("manifest name escapes the directory").into());
        }
        match local.remove(&name) {
            Some(have) if have == digest => {}
            Some(_) => {
                let path = dir.join(&name);
                if let Err(e) = std::fs::remove_file(&path) {
                    report_fs_error(chan);
                    return Err(SyncError::io(path, e));
                }
                needed.push(i);
            }
            None => needed.push(i),
        }
    }
    // whatever is left locally does not exist on the sender anymore
    for name in local.keys() {
        let path = dir.join(name);
        if let Err(e) = std::fs::remove_file(&path) {
            report_fs_error(chan);
            return Err(SyncError::io(path, e));
        }
    }

    chan.send_msg(Msg::SyncdirFileList, Timeout::Default)?;
    chan.write_u32(needed.len() as u32, Timeout::Default)?;
    if needed.is_empty() {
        chan.send_msg(Msg::SyncdirDone, Timeout::Default)?;
        debug!(dir = %dir.display(), "already in sync with sender");
        return Ok(None);
    }
    for idx in &needed {
        chan.write_u32(*idx, Timeout::Default)?;
    }

    expect_ctl(chan, Msg::SyncdirFtrans, Timeout::After(busy))?;
    let archive = tempfile::NamedTempFile::new().map_err(|e| SyncError::io("<tempfile>", e))?;
    let speed = transfer::recv_file(chan, archive.path())?;

    let unpacked = with_keepalive(chan, || extract_archive(archive.path(), dir))?;
    if let Err(e) = unpacked {
        report_fs_error(chan);
        return Err(e);
    }
    chan.send_msg(Msg::SyncdirDone, Timeout::Default)?;
    info!(dir = %dir.display(), files = needed.len(), speed, "directory sync received");
    Ok(Some(speed))
}
