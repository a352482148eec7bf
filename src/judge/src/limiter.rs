use crate::config::{LimiterChannel, LimiterConfig};
use std::{
    collections::HashMap,
    convert::TryInto,
    io::Read,
    os::unix::net::UnixListener,
    path::Path,
    process::{Child, Command, Stdio},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, warn};

/// The fixed result record the limiter delivers after the sandboxed process
/// finishes: four little-endian u32 fields, then `info_len` bytes of
/// free-text diagnostics.
const RECORD_LEN: usize = 16;

/// Extra wall-clock the supervisor grants beyond the sandbox's own limit
/// before declaring the limiter hung.
const SUPERVISOR_GRACE: Duration = Duration::from_secs(10);

const POLL_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("failed to spawn limiter")]
    Spawn(#[source] std::io::Error),
    #[error("limiter did not finish within the supervision window")]
    Hung,
    #[error("limiter exited without delivering a result record")]
    NoResult,
    #[error("limiter result record is truncated")]
    ShortRecord,
    #[error("i/o error talking to the limiter")]
    Io(#[from] std::io::Error),
}

/// What the sandbox reported. `status` uses the wire execution-status codes
/// for runtime outcomes; 0 means the program ran to completion and the
/// output still has to be compared.
#[derive(Clone, Debug)]
pub struct LimiterResult {
    pub status: u32,
    pub time_us: u32,
    pub memory_kb: u32,
    pub info: String,
}

fn interpolate(arg: &str, dict: &HashMap<String, String>) -> String {
    let mut out = arg.to_string();
    for (key, value) in dict {
        out = out.replace(&format!("{{{}}}", key), value);
    }
    out
}

fn parse_record(header: &[u8; RECORD_LEN], info: &[u8]) -> LimiterResult {
    LimiterResult {
        status: u32::from_le_bytes(header[0..4].try_into().unwrap()),
        time_us: u32::from_le_bytes(header[4..8].try_into().unwrap()),
        memory_kb: u32::from_le_bytes(header[8..12].try_into().unwrap()),
        info: String::from_utf8_lossy(info).into_owned(),
    }
}

/// Client for the external sandbox subprocess. Each `run` spawns the
/// configured limiter command around one program invocation and collects
/// the 16-byte result record over the configured channel.
pub struct Limiter<'a> {
    config: &'a LimiterConfig,
}

impl<'a> Limiter<'a> {
    pub fn new(config: &'a LimiterConfig) -> Limiter<'a> {
        Limiter { config }
    }

    /// Runs `program` under the limiter. `dict` provides the substitution
    /// values for both command lines (time and memory limits among them);
    /// `stdin`/`stdout` redirect the sandboxed process's standard streams.
    pub fn run(
        &self,
        program: &[String],
        dict: &HashMap<String, String>,
        stdin: Option<&Path>,
        stdout: Option<&Path>,
        time_limit: Duration,
    ) -> Result<LimiterResult, LimiterError> {
        let scratch = tempfile::tempdir().map_err(LimiterError::Io)?;
        let deadline = Instant::now() + time_limit + SUPERVISOR_GRACE;

        let mut dict = dict.clone();
        let socket_path = scratch.path().join("limiter.sock");
        let result_path = scratch.path().join("limiter.result");
        dict.insert(
            "socket".to_string(),
            socket_path.display().to_string(),
        );
        dict.insert(
            "result-file".to_string(),
            result_path.display().to_string(),
        );

        let listener = match self.config.channel {
            LimiterChannel::Socket => {
                let listener = UnixListener::bind(&socket_path).map_err(LimiterError::Io)?;
                listener.set_nonblocking(true).map_err(LimiterError::Io)?;
                Some(listener)
            }
            LimiterChannel::File => None,
        };

        let mut argv: Vec<String> = self
            .config
            .command
            .iter()
            .map(|arg| interpolate(arg, &dict))
            .collect();
        argv.extend(program.iter().map(|arg| interpolate(arg, &dict)));
        debug!(?argv, "running limiter");

        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]);
        command.stdin(match stdin {
            Some(path) => Stdio::from(std::fs::File::open(path).map_err(LimiterError::Io)?),
            None => Stdio::null(),
        });
        command.stdout(match stdout {
            Some(path) => Stdio::from(std::fs::File::create(path).map_err(LimiterError::Io)?),
            None => Stdio::null(),
        });
        command.stderr(Stdio::null());
        let mut child = command.spawn().map_err(LimiterError::Spawn)?;

        let result = match self.config.channel {
            LimiterChannel::Socket => {
                self.collect_socket(listener.as_ref().unwrap(), &mut child, deadline)
            }
            LimiterChannel::File => self.collect_file(&result_path, &mut child, deadline),
        };
        if result.is_err() {
            if let Err(err) = child.kill() {
                debug!(error = %err, "limiter already gone while killing it");
            }
        }
        let _ = child.wait();
        result
    }

    fn collect_socket(
        &self,
        listener: &UnixListener,
        child: &mut Child,
        deadline: Instant,
    ) -> Result<LimiterResult, LimiterError> {
        let mut child_gone_at: Option<Instant> = None;
        let stream = loop {
            match listener.accept() {
                Ok((stream, _)) => break stream,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        warn!("limiter never connected its result socket");
                        return Err(LimiterError::Hung);
                    }
                    // a crashed limiter will never connect; allow a short
                    // grace for a record already in flight
                    if let Some(gone) = child_gone_at {
                        if gone.elapsed() > Duration::from_secs(1) {
                            return Err(LimiterError::NoResult);
                        }
                    } else if child.try_wait().map_err(LimiterError::Io)?.is_some() {
                        child_gone_at = Some(Instant::now());
                    }
                    std::thread::sleep(POLL_SLICE);
                }
                Err(e) => return Err(LimiterError::Io(e)),
            }
        };
        stream
            .set_read_timeout(Some(deadline.saturating_duration_since(Instant::now()).max(POLL_SLICE)))
            .map_err(LimiterError::Io)?;
        let mut stream = stream;
        let mut header = [0u8; RECORD_LEN];
        stream
            .read_exact(&mut header)
            .map_err(|_| LimiterError::ShortRecord)?;
        let info_len = u32::from_le_bytes(header[12..16].try_into().unwrap()) as usize;
        let mut info = vec![0u8; info_len];
        stream
            .read_exact(&mut info)
            .map_err(|_| LimiterError::ShortRecord)?;
        Ok(parse_record(&header, &info))
    }

    fn collect_file(
        &self,
        result_path: &Path,
        child: &mut Child,
        deadline: Instant,
    ) -> Result<LimiterResult, LimiterError> {
        loop {
            if child.try_wait().map_err(LimiterError::Io)?.is_some() {
                break;
            }
            if Instant::now() >= deadline {
                warn!("limiter still running past the supervision window");
                return Err(LimiterError::Hung);
            }
            std::thread::sleep(POLL_SLICE);
        }
        let data = std::fs::read(result_path).map_err(|_| LimiterError::NoResult)?;
        if data.len() < RECORD_LEN {
            return Err(LimiterError::ShortRecord);
        }
        let header: [u8; RECORD_LEN] = data[..RECORD_LEN].try_into().unwrap();
        let info_len = u32::from_le_bytes(header[12..16].try_into().unwrap()) as usize;
        if data.len() < RECORD_LEN + info_len {
            return Err(LimiterError::ShortRecord);
        }
        Ok(parse_record(&header, &data[RECORD_LEN..RECORD_LEN + info_len]))
    }
}
