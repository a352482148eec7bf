use crate::{
    config::JudgeConfig,
    judging::{self, CompileOutcome, Workspace},
    limiter::Limiter,
    problem::ProblemManifest,
};
use anyhow::Context;
use datasync::with_keepalive;
use std::{
    collections::HashMap,
    sync::{Mutex, TryLockError},
};
use thiserror::Error;
use tracing::{error, info, warn};
use util::ShutdownFlag;
use wire::{Channel, Msg, Timeout, Transport, KEEPALIVE_INTERVAL, PROTOCOL_VERSION};

/// The server turned this judge away during the handshake; reconnecting
/// would only repeat the rejection.
#[derive(Debug, Error)]
#[error("server rejected this judge: {0}")]
pub struct Rejected(pub String);

pub struct WorkerSession<'a> {
    cfg: &'a JudgeConfig,
    shutdown: &'a ShutdownFlag,
    /// Guards the toolchain while compiling; contention is answered with
    /// `StartJudgeWait` on the wire.
    compile_lock: &'a Mutex<()>,
    info: HashMap<String, String>,
}

impl<'a> WorkerSession<'a> {
    pub fn new(
        cfg: &'a JudgeConfig,
        shutdown: &'a ShutdownFlag,
        compile_lock: &'a Mutex<()>,
    ) -> WorkerSession<'a> {
        let mut info = HashMap::new();
        info.insert(
            "platform".to_string(),
            format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
        );
        if let Ok(cores) = std::thread::available_parallelism() {
            info.insert("cores".to_string(), cores.to_string());
        }
        for (key, value) in &cfg.info {
            info.insert(key.clone(), value.clone());
        }
        WorkerSession {
            cfg,
            shutdown,
            compile_lock,
            info,
        }
    }

    /// Runs the whole worker side of the protocol on an established channel:
    /// greeting, then serving queries and tasks until shutdown or error.
    pub fn run<T: Transport>(&self, chan: &mut Channel<T>) -> anyhow::Result<()> {
        self.hello(chan).context("greeting failed")?;
        info!(judge = %self.cfg.judge_id, "connected to server");

        while !self.shutdown.is_set() {
            // the server keeps the line warm while idle, so every read is
            // expected to complete within the ordinary timeout
            match chan.recv_msg(Timeout::Default)? {
                Msg::TellOnline => continue,
                Msg::QueryInfo => self.answer_query(chan)?,
                Msg::PrepareData => self.handle_task(chan)?,
                Msg::Error => anyhow::bail!("server reported an internal error"),
                other => anyhow::bail!("unexpected message {:?} while idle", other),
            }
        }
        Ok(())
    }

    fn hello<T: Transport>(&self, chan: &mut Channel<T>) -> anyhow::Result<()> {
        let mut langs: Vec<&String> = self.cfg.langs.keys().collect();
        langs.sort();

        chan.send_msg(Msg::Hello, Timeout::Default)?;
        chan.write_string(self.cfg.judge_id.as_bytes(), Timeout::Default)?;
        chan.write_u32(PROTOCOL_VERSION, Timeout::Default)?;
        chan.write_u32(langs.len() as u32, Timeout::Default)?;
        for lang in langs {
            chan.write_string(lang.as_bytes(), Timeout::Default)?;
        }

        match chan.recv_any(
            &[
                Msg::ConnectOk,
                Msg::DuplicatedId,
                Msg::IdTooLong,
                Msg::Error,
            ],
            Timeout::Default,
        )? {
            Msg::ConnectOk => Ok(()),
            Msg::DuplicatedId => Err(Rejected(format!(
                "id {:?} is already connected",
                self.cfg.judge_id
            ))
            .into()),
            Msg::IdTooLong => Err(Rejected(format!(
                "id {:?} is too long for the server",
                self.cfg.judge_id
            ))
            .into()),
            _ => Err(Rejected("server-side error during registration".to_string()).into()),
        }
    }

    fn answer_query<T: Transport>(&self, chan: &mut Channel<T>) -> anyhow::Result<()> {
        let key = String::from_utf8_lossy(&chan.read_string(Timeout::Default)?).into_owned();
        let value = self
            .info
            .get(&key)
            .map(String::as_str)
            .unwrap_or("unknown");
        chan.send_msg(Msg::AnsQuery, Timeout::Default)?;
        chan.write_string(value.as_bytes(), Timeout::Default)?;
        Ok(())
    }

    fn send_data_error<T: Transport>(
        &self,
        chan: &mut Channel<T>,
        reason: &str,
    ) -> anyhow::Result<()> {
        error!(reason, "aborting task after data stage");
        chan.send_msg(Msg::DataError, Timeout::Default)?;
        chan.write_string(reason.as_bytes(), Timeout::Default)?;
        Ok(())
    }

    /// One full task: sync the problem data, load its manifest, compile and
    /// run every case. Task-local failures answer `DataError`/`CompileFail`
    /// and leave the connection alive.
    fn handle_task<T: Transport>(&self, chan: &mut Channel<T>) -> anyhow::Result<()> {
        let problem = String::from_utf8_lossy(&chan.read_string(Timeout::Default)?).into_owned();
        info!(problem = %problem, "task offered");
        if problem.is_empty()
            || problem.contains('/')
            || problem.contains('\\')
            || problem.contains("..")
        {
            return self.send_data_error(chan, "problem code is not a valid directory name");
        }

        let data_dir = self.cfg.cache_dir.join(&problem);
        match datasync::recv_dir(chan, &data_dir, self.cfg.busy_timeout()) {
            Ok(Some(speed)) => info!(problem = %problem, speed, "data synchronized"),
            Ok(None) => info!(problem = %problem, "data already up to date"),
            Err(err) if err.connection_dead() => {
                return Err(err).context("directory sync failed");
            }
            Err(err) => {
                return self.send_data_error(chan, &format!("data sync failed: {}", err));
            }
        }

        let manifest = match ProblemManifest::load(&data_dir) {
            Ok(manifest) => manifest,
            Err(err) => {
                return self.send_data_error(chan, &format!("bad problem data: {}", err));
            }
        };
        chan.send_msg(Msg::DataOk, Timeout::Default)?;
        chan.write_u32(manifest.cases.len() as u32, Timeout::Default)?;

        chan.expect_msg(Msg::StartJudge, Timeout::Default)?;
        let lang = String::from_utf8_lossy(&chan.read_string(Timeout::Default)?).into_owned();
        let source = String::from_utf8_lossy(&chan.read_string(Timeout::Default)?).into_owned();
        let input_name =
            String::from_utf8_lossy(&chan.read_string(Timeout::Default)?).into_owned();
        let output_name =
            String::from_utf8_lossy(&chan.read_string(Timeout::Default)?).into_owned();

        // hold the toolchain lock through compilation, telling the server
        // we are alive while we wait for it
        let guard = loop {
            match self.compile_lock.try_lock() {
                Ok(guard) => break guard,
                Err(TryLockError::WouldBlock) => {
                    chan.send_msg(Msg::StartJudgeWait, Timeout::Default)?;
                    std::thread::sleep(KEEPALIVE_INTERVAL);
                }
                Err(TryLockError::Poisoned(_)) => {
                    anyhow::bail!("compile lock poisoned by an earlier panic")
                }
            }
        };
        chan.send_msg(Msg::StartJudgeOk, Timeout::Default)?;

        let lang_cfg = match self.cfg.langs.get(&lang) {
            Some(lc) => lc,
            None => {
                drop(guard);
                warn!(lang = %lang, "dispatched a language this judge never declared");
                chan.send_msg(Msg::CompileFail, Timeout::Default)?;
                chan.write_string(b"language not configured on this judge", Timeout::Default)?;
                return Ok(());
            }
        };

        let limiter = Limiter::new(&self.cfg.limiter);
        let workspace = Workspace::prepare(lang_cfg, &source)
            .context("failed to set up the submission workspace")?;
        let outcome = with_keepalive(chan, || judging::compile(lang_cfg, &limiter, &workspace))
            .map_err(anyhow::Error::from)??;
        drop(guard);

        match outcome {
            CompileOutcome::Fail(log) => {
                info!(problem = %problem, "compilation failed");
                chan.send_msg(Msg::CompileFail, Timeout::Default)?;
                chan.write_string(log.as_bytes(), Timeout::Default)?;
                return Ok(());
            }
            CompileOutcome::Success => {
                chan.send_msg(Msg::CompileSucceed, Timeout::Default)?;
            }
        }

        for case in &manifest.cases {
            let result = with_keepalive(chan, || {
                judging::run_case(
                    lang_cfg,
                    &limiter,
                    &workspace,
                    &data_dir,
                    case,
                    &input_name,
                    &output_name,
                )
            })?;
            chan.send_msg(Msg::ReportCase, Timeout::Default)?;
            result.write_to(chan, Timeout::Default)?;
        }
        chan.send_msg(Msg::ReportJudgeFinish, Timeout::Default)?;
        info!(problem = %problem, cases = manifest.cases.len(), "task finished");
        Ok(())
    }
}
