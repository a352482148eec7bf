use crate::{
    manifest::FileManifest,
    syncdir::{recv_dir, send_dir},
    transfer::{recv_file, send_file},
    SyncError,
};
use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use wire::{Channel, Transport};

const BUSY: Duration = Duration::from_secs(10);

fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

fn chan(stream: TcpStream) -> Channel<TcpStream> {
    Channel::new(stream, Duration::from_secs(5))
}

/// Counts bytes written through it, so tests can assert how much really
/// moved on the wire.
struct Counting {
    inner: TcpStream,
    written: Arc<AtomicU64>,
}

impl Read for Counting {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for Counting {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl Transport for Counting {
    fn set_io_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.inner.set_io_timeout(timeout)
    }

    fn peer_desc(&self) -> String {
        self.inner.peer_desc()
    }

    fn shutdown(&mut self) -> std::io::Result<()> {
        Transport::shutdown(&mut self.inner)
    }
}

/// Flips one bit of the byte at absolute write offset `target`, corrupting
/// the stream in transit.
struct Corrupting {
    inner: TcpStream,
    written: u64,
    target: u64,
}

impl Read for Corrupting {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for Corrupting {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let start = self.written;
        let end = start + buf.len() as u64;
        let n = if self.target >= start && self.target < end {
            let mut owned = buf.to_vec();
            owned[(self.target - start) as usize] ^= 0x01;
            self.inner.write(&owned)?
        } else {
            self.inner.write(buf)?
        };
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl Transport for Corrupting {
    fn set_io_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.inner.set_io_timeout(timeout)
    }

    fn peer_desc(&self) -> String {
        self.inner.peer_desc()
    }

    fn shutdown(&mut self) -> std::io::Result<()> {
        Transport::shutdown(&mut self.inner)
    }
}

/// Deterministic incompressible-ish bytes, so gzip cannot hide transfer
/// volume from the byte-proportionality assertions.
fn noise(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        out.push((state >> 33) as u8);
    }
    out
}

fn write_file(dir: &Path, name: &str, content: &[u8]) {
    std::fs::write(dir.join(name), content).unwrap();
}

#[test]
fn manifest_lists_regular_files_only() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "a.in", b"1 2\n");
    write_file(dir.path(), "a.out", b"3\n");
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    write_file(&dir.path().join("sub"), "nested", b"hidden");

    let manifest = FileManifest::of_dir(dir.path()).unwrap();
    let names: Vec<_> = manifest.entries().iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["a.in", "a.out"]);
}

#[test]
fn manifest_hashes_content() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "x", b"same");
    write_file(dir.path(), "y", b"same");
    write_file(dir.path(), "z", b"different");

    let manifest = FileManifest::of_dir(dir.path()).unwrap();
    assert_eq!(manifest.lookup("x"), manifest.lookup("y"));
    assert_ne!(manifest.lookup("x"), manifest.lookup("z"));
    assert_eq!(manifest.lookup("missing"), None);
}

#[test]
fn file_transfer_round_trip_is_repeatable() {
    let src_dir = tempfile::tempdir().unwrap();
    let payload = noise(7, 100_000); // several chunks plus a partial one
    write_file(src_dir.path(), "blob", &payload);
    let src = src_dir.path().join("blob");

    for round in 0..2 {
        let (client, server) = tcp_pair();
        let dst_dir = tempfile::tempdir().unwrap();
        let dst = dst_dir.path().join("copy");
        let src = src.clone();
        let sender = std::thread::spawn(move || {
            let mut chan = chan(client);
            send_file(&mut chan, &src).unwrap()
        });
        let mut receiver_chan = chan(server);
        let speed = recv_file(&mut receiver_chan, &dst).unwrap();
        assert!(speed > 0.0, "round {}: speed {}", round, speed);
        sender.join().unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), payload);
    }
}

#[test]
fn corrupted_transfer_fails_the_digest_check() {
    let src_dir = tempfile::tempdir().unwrap();
    write_file(src_dir.path(), "blob", &noise(11, 50_000));
    let src = src_dir.path().join("blob");

    let (client, server) = tcp_pair();
    let sender = std::thread::spawn(move || {
        // offset 20 lands inside the data phase (12 bytes of control
        // precede it), so the digests diverge while control stays intact
        let transport = Corrupting {
            inner: client,
            written: 0,
            target: 20,
        };
        let mut chan = Channel::new(transport, Duration::from_secs(5));
        send_file(&mut chan, &src)
    });
    let dst_dir = tempfile::tempdir().unwrap();
    let mut receiver_chan = chan(server);
    let recv_res = recv_file(&mut receiver_chan, &dst_dir.path().join("copy"));
    let send_res = sender.join().unwrap();

    assert!(matches!(send_res, Err(SyncError::Integrity { .. })));
    assert!(matches!(recv_res, Err(SyncError::Integrity { .. })));
}

fn run_sync(sender_dir: &Path, receiver_dir: &Path) -> (Option<f64>, u64) {
    let (client, server) = tcp_pair();
    let written = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&written);
    let sender_dir = sender_dir.to_path_buf();
    let sender = std::thread::spawn(move || {
        let transport = Counting {
            inner: client,
            written: counter,
        };
        let mut chan = Channel::new(transport, Duration::from_secs(5));
        send_dir(&mut chan, &sender_dir, BUSY).unwrap()
    });
    let mut receiver_chan = chan(server);
    let recv_speed = recv_dir(&mut receiver_chan, receiver_dir, BUSY).unwrap();
    let send_speed = sender.join().unwrap();
    assert_eq!(recv_speed.is_some(), send_speed.is_some());
    (recv_speed, written.load(Ordering::Relaxed))
}

#[test]
fn sync_makes_receiver_equal_to_sender() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write_file(src.path(), "1.in", &noise(1, 3000));
    write_file(src.path(), "1.ans", &noise(2, 3000));
    write_file(src.path(), "2.in", &noise(3, 3000));
    // receiver: one stale file, one stray file, one file already correct
    write_file(dst.path(), "1.in", &noise(99, 3000));
    write_file(dst.path(), "stray", b"left over from another problem");
    write_file(dst.path(), "1.ans", &noise(2, 3000));

    let (speed, _) = run_sync(src.path(), dst.path());
    assert!(speed.is_some());
    assert_eq!(
        FileManifest::of_dir(src.path()).unwrap(),
        FileManifest::of_dir(dst.path()).unwrap()
    );
    assert!(!dst.path().join("stray").exists());
}

#[test]
fn sync_into_missing_directory_creates_it() {
    let src = tempfile::tempdir().unwrap();
    write_file(src.path(), "data", &noise(5, 1000));
    let holder = tempfile::tempdir().unwrap();
    let dst = holder.path().join("fresh");

    let (speed, _) = run_sync(src.path(), &dst);
    assert!(speed.is_some());
    assert_eq!(
        FileManifest::of_dir(src.path()).unwrap(),
        FileManifest::of_dir(&dst).unwrap()
    );
}

#[test]
fn identical_directories_move_no_archive() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    for i in 0..4 {
        let content = noise(i, 2000);
        write_file(src.path(), &format!("{}.in", i), &content);
        write_file(dst.path(), &format!("{}.in", i), &content);
    }

    let (speed, bytes) = run_sync(src.path(), dst.path());
    assert_eq!(speed, None);
    // only the manifest and a handful of control words crossed the wire
    assert!(bytes < 4096, "moved {} bytes for a no-op sync", bytes);
}

#[test]
fn transfer_volume_tracks_differing_files_not_directory_size() {
    const FILE_SIZE: usize = 32 * 1024;
    let mut volumes = Vec::new();
    for differing in &[1usize, 4] {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        for i in 0..8 {
            let content = noise(i as u64, FILE_SIZE);
            write_file(src.path(), &format!("{}.dat", i), &content);
            if i < *differing {
                write_file(dst.path(), &format!("{}.dat", i), &noise(1000 + i as u64, FILE_SIZE));
            } else {
                write_file(dst.path(), &format!("{}.dat", i), &content);
            }
        }
        let (speed, bytes) = run_sync(src.path(), dst.path());
        assert!(speed.is_some());
        assert_eq!(
            FileManifest::of_dir(src.path()).unwrap(),
            FileManifest::of_dir(dst.path()).unwrap()
        );
        volumes.push(bytes);
    }
    let (one, four) = (volumes[0], volumes[1]);
    // one differing file must not cost anywhere near the whole directory
    assert!(
        one < (3 * FILE_SIZE) as u64,
        "1 differing file moved {} bytes",
        one
    );
    assert!(four > one, "4 differing files moved {} <= {}", four, one);
}
