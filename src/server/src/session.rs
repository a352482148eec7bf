use crate::{
    config::ServerConfig,
    queue::{EnqueueError, LangId, LangPool, Task, TaskQueue},
    registry::{JudgeRegistry, RegisterOutcome},
    reporter::{Report, Reporter},
    web::{TaskSource, TaskSourceProvider},
};
use anyhow::Context;
use std::{collections::HashMap, sync::Arc};
use tracing::{error, info, info_span, warn};
use util::ShutdownFlag;
use wire::{CaseResult, Channel, Msg, Timeout, Transport, KEEPALIVE_INTERVAL, PROTOCOL_VERSION};

/// Everything a connection handler needs, constructed once at startup and
/// shared by reference. No process-wide implicit state.
pub struct ServerCtx {
    pub config: ServerConfig,
    pub registry: JudgeRegistry,
    pub queue: TaskQueue,
    pub langs: LangPool,
    pub web: Arc<dyn TaskSourceProvider>,
    pub shutdown: ShutdownFlag,
}

/// Serves one accepted worker connection: handshake, registration, then the
/// dispatch/judging loop. Cleanup runs exactly once on every exit path.
pub fn serve<T: Transport>(ctx: &ServerCtx, mut chan: Channel<T>) {
    let peer = chan.peer().to_string();
    let span = info_span!("judge_conn", peer = %peer);
    let _guard = span.enter();

    let mut session = Session {
        ctx,
        judge_id: None,
        upstream_key: None,
        current_task: None,
        caps: Vec::new(),
        reporter: None,
        web: ctx.web.connect(),
    };
    match session.run(&mut chan) {
        Ok(()) => info!("connection closing after shutdown request"),
        Err(err) => warn!(error = %format!("{:#}", err), "connection failed"),
    }
    session.cleanup();
    chan.close();
}

struct Session<'a> {
    ctx: &'a ServerCtx,
    /// Set once the id is held in the registry; cleanup releases it.
    judge_id: Option<String>,
    /// Set once the judge is registered upstream; cleanup removes it.
    upstream_key: Option<u64>,
    /// The task this connection currently owns. On failure it returns to
    /// the queue; it is dropped only when its failure is terminal.
    current_task: Option<Task>,
    caps: Vec<LangId>,
    reporter: Option<Reporter>,
    web: Box<dyn TaskSource>,
}

impl<'a> Session<'a> {
    fn run<T: Transport>(&mut self, chan: &mut Channel<T>) -> anyhow::Result<()> {
        self.handshake(chan).context("handshake failed")?;

        while !self.ctx.shutdown.is_set() {
            match self.ctx.queue.dequeue(&self.caps) {
                None => {
                    chan.send_msg(Msg::TellOnline, Timeout::Default)?;
                    std::thread::sleep(KEEPALIVE_INTERVAL);
                }
                Some(task) => {
                    self.current_task = Some(task);
                    self.run_task(chan)?;
                }
            }
        }
        Ok(())
    }

    /// HELLO exchange: id length, protocol version and uniqueness are
    /// enforced in that order; each rejection sends its code and ends the
    /// connection.
    fn handshake<T: Transport>(&mut self, chan: &mut Channel<T>) -> anyhow::Result<()> {
        chan.expect_msg(Msg::Hello, Timeout::Default)?;
        let id = String::from_utf8_lossy(&chan.read_string(Timeout::Default)?).into_owned();
        let version = chan.read_u32(Timeout::Default)?;
        let lang_count = chan.read_u32(Timeout::Default)?;
        if lang_count > 256 {
            chan.send_msg(Msg::Error, Timeout::Default)?;
            anyhow::bail!("implausible language count {}", lang_count);
        }
        let mut langs = Vec::with_capacity(lang_count as usize);
        for _ in 0..lang_count {
            let lang = String::from_utf8_lossy(&chan.read_string(Timeout::Default)?).into_owned();
            langs.push(lang);
        }

        if id.len() > self.ctx.config.judge_id_max_len {
            chan.send_msg(Msg::IdTooLong, Timeout::Default)?;
            anyhow::bail!("judge id of {} bytes exceeds the limit", id.len());
        }
        if version != PROTOCOL_VERSION {
            chan.send_msg(Msg::Error, Timeout::Default)?;
            anyhow::bail!(
                "protocol version mismatch: ours {:#x}, theirs {:#x}",
                PROTOCOL_VERSION,
                version
            );
        }
        if langs.is_empty() {
            chan.send_msg(Msg::Error, Timeout::Default)?;
            anyhow::bail!("judge declared no languages");
        }
        match self.ctx.registry.register(&id) {
            RegisterOutcome::Registered => {}
            RegisterOutcome::Duplicate => {
                chan.send_msg(Msg::DuplicatedId, Timeout::Default)?;
                anyhow::bail!("duplicated judge id {:?}", id);
            }
        }
        self.judge_id = Some(id.clone());
        self.caps = self.ctx.langs.ids_of(&langs);
        chan.send_msg(Msg::ConnectOk, Timeout::Default)?;
        info!(judge = %id, langs = ?langs, "judge connected");

        // upstream registration, including the info the source asked for
        let answers = self.collect_query_answers(chan)?;
        let key = match self.web.register_judge(&id, &langs, &answers) {
            Ok(key) => key,
            Err(err) => {
                chan.send_msg(Msg::Error, Timeout::Default)?;
                return Err(err).context("task source refused judge registration");
            }
        };
        self.upstream_key = Some(key);
        self.reporter = Some(Reporter::spawn(self.ctx.web.connect()));
        Ok(())
    }

    fn collect_query_answers<T: Transport>(
        &mut self,
        chan: &mut Channel<T>,
    ) -> anyhow::Result<HashMap<String, String>> {
        let queries = match self.web.query_list() {
            Ok(q) => q,
            Err(err) => {
                chan.send_msg(Msg::Error, Timeout::Default)?;
                return Err(err).context("task source did not provide its query list");
            }
        };
        let mut answers = HashMap::new();
        for key in queries {
            chan.send_msg(Msg::QueryInfo, Timeout::Default)?;
            chan.write_string(key.as_bytes(), Timeout::Default)?;
            chan.expect_msg(Msg::AnsQuery, Timeout::Default)?;
            let value =
                String::from_utf8_lossy(&chan.read_string(Timeout::Default)?).into_owned();
            answers.insert(key, value);
        }
        Ok(answers)
    }

    fn reporter(&self) -> &Reporter {
        self.reporter
            .as_ref()
            .expect("reporter exists after handshake")
    }

    /// Drives one task through data sync, compile and case execution. Any
    /// error returned here is fatal to the connection; task-local failures
    /// settle the task and return `Ok`.
    fn run_task<T: Transport>(&mut self, chan: &mut Channel<T>) -> anyhow::Result<()> {
        let task = self.current_task.clone().expect("run_task without a task");
        let judge_key = self.upstream_key.expect("registered before dispatch");
        let busy = Timeout::After(self.ctx.config.busy_timeout());
        info!(task = task.id, problem = %task.problem, lang = %task.lang, "task dispatched");

        let data_dir = self.ctx.config.data_dir.join(&task.problem);
        if !data_dir.is_dir() {
            error!(task = task.id, problem = %task.problem, "no data for problem, task dropped");
            self.reporter().send(Report::NoData { task: task.id });
            self.current_task = None;
            return Ok(());
        }

        self.reporter().send(Report::SyncingData {
            task: task.id,
            judge_key,
        });
        chan.send_msg(Msg::PrepareData, Timeout::Default)?;
        chan.write_string(task.problem.as_bytes(), Timeout::Default)?;
        if let Err(err) = datasync::send_dir(chan, &data_dir, self.ctx.config.busy_timeout()) {
            if err.connection_dead() {
                return Err(err).context("directory sync failed");
            }
            // the attempt failed locally or on the worker; the worker
            // answers with DataError and the connection lives on
            warn!(task = task.id, error = %err, "directory sync attempt failed");
        }

        let ncase = match chan.recv_any(&[Msg::DataOk, Msg::DataError], busy)? {
            Msg::DataOk => chan.read_u32(Timeout::Default)?,
            _ => {
                let reason =
                    String::from_utf8_lossy(&chan.read_string(Timeout::Default)?).into_owned();
                error!(task = task.id, reason = %reason, "worker rejected problem data");
                self.reporter().send(Report::TaskError {
                    task: task.id,
                    reason: format!("data error: {}", reason),
                });
                self.current_task = None;
                return Ok(());
            }
        };

        chan.send_msg(Msg::StartJudge, Timeout::Default)?;
        chan.write_string(task.lang.as_bytes(), Timeout::Default)?;
        chan.write_string(task.source.as_bytes(), Timeout::Default)?;
        chan.write_string(task.input.as_bytes(), Timeout::Default)?;
        chan.write_string(task.output.as_bytes(), Timeout::Default)?;

        // the worker may hold a local compile lock for a while
        loop {
            match chan.recv_any(&[Msg::StartJudgeOk, Msg::StartJudgeWait], busy)? {
                Msg::StartJudgeOk => break,
                _ => continue,
            }
        }

        self.reporter().send(Report::Compiling { task: task.id });
        match chan.recv_any(&[Msg::CompileSucceed, Msg::CompileFail], busy)? {
            Msg::CompileSucceed => {
                self.reporter().send(Report::CompileResult {
                    task: task.id,
                    ok: true,
                    log: String::new(),
                });
            }
            _ => {
                let log =
                    String::from_utf8_lossy(&chan.read_string(Timeout::Default)?).into_owned();
                info!(task = task.id, "compilation failed on worker");
                self.reporter().send(Report::CompileResult {
                    task: task.id,
                    ok: false,
                    log,
                });
                self.current_task = None;
                return Ok(());
            }
        }

        for case in 0..ncase {
            self.reporter().progress(task.id, case);
            chan.expect_msg(Msg::ReportCase, busy)?;
            let result = CaseResult::read_from(chan, Timeout::Default)?;
            self.reporter().send(Report::Case {
                task: task.id,
                case,
                result,
            });
        }
        chan.expect_msg(Msg::ReportJudgeFinish, Timeout::Default)?;
        self.reporter().send(Report::Finished { task: task.id });
        info!(task = task.id, cases = ncase, "task judged");
        self.current_task = None;
        Ok(())
    }

    /// Runs exactly once per connection: returns any in-flight task to the
    /// queue, releases the id, tells the task source the judge is gone.
    fn cleanup(&mut self) {
        if let Some(task) = self.current_task.take() {
            let key = self.ctx.langs.id_of(&task.lang);
            info!(task = task.id, "returning in-flight task to the queue");
            match self.ctx.queue.enqueue(key, task, &self.ctx.shutdown) {
                Ok(()) => {}
                Err(EnqueueError::Shutdown(task)) => {
                    error!(task = task.id, "task lost to shutdown while requeueing");
                }
            }
        }
        if let Some(reporter) = self.reporter.take() {
            reporter.shutdown();
        }
        if let Some(key) = self.upstream_key.take() {
            if let Err(err) = self.web.remove_judge(key) {
                warn!(error = %err, "failed to notify task source of judge removal");
            }
        }
        if let Some(id) = self.judge_id.take() {
            self.ctx.registry.unregister(&id);
        }
    }
}
