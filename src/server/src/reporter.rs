use crate::web::{UpstreamError, WebClient};
use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex},
    thread::JoinHandle,
};
use tracing::{debug, warn};
use wire::CaseResult;

/// A status update that must reach the task source, in order.
#[derive(Debug)]
pub enum Report {
    SyncingData { task: u64, judge_key: u64 },
    NoData { task: u64 },
    Compiling { task: u64 },
    CompileResult { task: u64, ok: bool, log: String },
    Case { task: u64, case: u32, result: CaseResult },
    Finished { task: u64 },
    TaskError { task: u64, reason: String },
}

/// Where reports end up. The production sink is the task source RPC client;
/// tests substitute their own.
pub trait ReportSink: Send {
    fn deliver(&mut self, report: &Report) -> Result<(), UpstreamError>;
    fn deliver_progress(&mut self, task: u64, case: u32) -> Result<(), UpstreamError>;
}

impl ReportSink for WebClient {
    fn deliver(&mut self, report: &Report) -> Result<(), UpstreamError> {
        match report {
            Report::SyncingData { task, judge_key } => self.report_syncing_data(*task, *judge_key),
            Report::NoData { task } => self.report_no_data(*task),
            Report::Compiling { task } => self.report_compiling(*task),
            Report::CompileResult { task, ok, log } => self.report_compile_result(*task, *ok, log),
            Report::Case { task, case, result } => self.report_case_result(*task, *case, result),
            Report::Finished { task } => self.report_judge_finished(*task),
            Report::TaskError { task, reason } => self.report_task_error(*task, reason),
        }
    }

    fn deliver_progress(&mut self, task: u64, case: u32) -> Result<(), UpstreamError> {
        self.report_progress(task, case)
    }
}

#[derive(Default)]
struct ReporterState {
    fifo: VecDeque<Report>,
    /// Coalescing slot: a backlog of progress updates collapses to the
    /// newest one.
    progress: Option<(u64, u32)>,
    closed: bool,
}

struct Shared {
    state: Mutex<ReporterState>,
    wake: Condvar,
}

/// Per-connection actor that serializes all upstream calls for that
/// connection, so a slow or flaky task source never blocks the judge-facing
/// wire protocol. Failures are logged and swallowed.
pub struct Reporter {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Reporter {
    pub fn spawn<S: ReportSink + 'static>(mut sink: S) -> Reporter {
        let shared = Arc::new(Shared {
            state: Mutex::new(ReporterState::default()),
            wake: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let thread = std::thread::spawn(move || {
            loop {
                enum Item {
                    Must(Report),
                    Progress(u64, u32),
                }
                let item = {
                    let mut st = worker_shared.state.lock().unwrap();
                    loop {
                        if let Some(report) = st.fifo.pop_front() {
                            break Item::Must(report);
                        }
                        if let Some((task, case)) = st.progress.take() {
                            break Item::Progress(task, case);
                        }
                        if st.closed {
                            return;
                        }
                        st = worker_shared.wake.wait(st).unwrap();
                    }
                };
                // the lock is released while the upstream call runs
                let outcome = match &item {
                    Item::Must(report) => sink.deliver(report),
                    Item::Progress(task, case) => sink.deliver_progress(*task, *case),
                };
                if let Err(err) = outcome {
                    match item {
                        Item::Must(report) => {
                            warn!(error = %err, ?report, "failed to deliver report upstream")
                        }
                        Item::Progress(task, case) => {
                            debug!(error = %err, task, case, "failed to deliver progress upstream")
                        }
                    }
                }
            }
        });
        Reporter {
            shared,
            thread: Some(thread),
        }
    }

    /// Ordered, must-deliver.
    pub fn send(&self, report: Report) {
        let mut st = self.shared.state.lock().unwrap();
        st.fifo.push_back(report);
        self.shared.wake.notify_one();
    }

    /// Coalescing: only the newest progress value ever needs to go out.
    pub fn progress(&self, task: u64, case: u32) {
        let mut st = self.shared.state.lock().unwrap();
        st.progress = Some((task, case));
        self.shared.wake.notify_one();
    }

    /// Drains the queue and stops the delivery thread.
    pub fn shutdown(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if let Some(thread) = self.thread.take() {
            {
                let mut st = self.shared.state.lock().unwrap();
                st.closed = true;
                self.shared.wake.notify_one();
            }
            if thread.join().is_err() {
                warn!("reporter thread panicked");
            }
        }
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    struct RecordingSink {
        record: Arc<Mutex<Vec<String>>>,
        gate: Option<mpsc::Receiver<()>>,
    }

    impl ReportSink for RecordingSink {
        fn deliver(&mut self, report: &Report) -> Result<(), UpstreamError> {
            if let Some(gate) = &self.gate {
                gate.recv().ok();
            }
            self.record.lock().unwrap().push(format!("{:?}", report));
            Ok(())
        }

        fn deliver_progress(&mut self, task: u64, case: u32) -> Result<(), UpstreamError> {
            self.record
                .lock()
                .unwrap()
                .push(format!("progress {} {}", task, case));
            Ok(())
        }
    }

    #[test]
    fn reports_are_delivered_in_order() {
        let record = Arc::new(Mutex::new(Vec::new()));
        let reporter = Reporter::spawn(RecordingSink {
            record: Arc::clone(&record),
            gate: None,
        });
        reporter.send(Report::Compiling { task: 1 });
        reporter.send(Report::CompileResult {
            task: 1,
            ok: true,
            log: String::new(),
        });
        reporter.send(Report::Finished { task: 1 });
        reporter.shutdown();

        let got = record.lock().unwrap();
        assert_eq!(got.len(), 3);
        assert!(got[0].contains("Compiling"));
        assert!(got[1].contains("CompileResult"));
        assert!(got[2].contains("Finished"));
    }

    #[test]
    fn progress_backlog_collapses_to_newest() {
        let record = Arc::new(Mutex::new(Vec::new()));
        let (open_gate, gate) = mpsc::channel();
        let reporter = Reporter::spawn(RecordingSink {
            record: Arc::clone(&record),
            gate: Some(gate),
        });
        // the delivery thread blocks inside the first must-deliver report,
        // letting a backlog of progress updates pile up behind it
        reporter.send(Report::Compiling { task: 7 });
        std::thread::sleep(Duration::from_millis(50));
        for case in 1..=5 {
            reporter.progress(7, case);
        }
        open_gate.send(()).unwrap();
        reporter.shutdown();

        let got = record.lock().unwrap();
        assert_eq!(got.len(), 2, "backlog should collapse: {:?}", *got);
        assert!(got[0].contains("Compiling"));
        assert_eq!(got[1], "progress 7 5");
    }

    #[test]
    fn shutdown_drains_pending_reports() {
        let record = Arc::new(Mutex::new(Vec::new()));
        let reporter = Reporter::spawn(RecordingSink {
            record: Arc::clone(&record),
            gate: None,
        });
        for task in 0..20 {
            reporter.send(Report::Finished { task });
        }
        reporter.shutdown();
        assert_eq!(record.lock().unwrap().len(), 20);
    }
}
