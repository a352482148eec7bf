use crate::{
    queue::{EnqueueError, LangPool, TaskQueue},
    web::TaskSource,
};
use std::time::Duration;
use tracing::{debug, error, info};
use util::ShutdownFlag;

/// Consecutive fetch failures tolerated before the whole process gives up:
/// with the task source unreachable there is no work to distribute.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Polling granularity while sleeping between refresh rounds.
const SLEEP_SLICE: Duration = Duration::from_millis(500);

/// Polls the task source and feeds the queue until shutdown. Sets the
/// shutdown flag itself if the source keeps failing.
pub fn run(
    mut web: Box<dyn TaskSource>,
    queue: &TaskQueue,
    langs: &LangPool,
    refresh_interval: Duration,
    shutdown: &ShutdownFlag,
) {
    let mut failures = 0u32;
    while !shutdown.is_set() {
        loop {
            if shutdown.is_set() {
                return;
            }
            match web.fetch_task() {
                Ok(Some(task)) => {
                    failures = 0;
                    debug!(task = task.id, lang = %task.lang, "fetched task");
                    let key = langs.id_of(&task.lang);
                    match queue.enqueue(key, task, shutdown) {
                        Ok(()) => {}
                        Err(EnqueueError::Shutdown(task)) => {
                            info!(task = task.id, "shutdown while enqueueing, task stays upstream");
                            return;
                        }
                    }
                }
                Ok(None) => {
                    failures = 0;
                    break;
                }
                Err(err) => {
                    failures += 1;
                    error!(error = %err, failures, "task fetch failed");
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        error!("task source unreachable, shutting the server down");
                        shutdown.set();
                        return;
                    }
                    break;
                }
            }
        }
        // sleep in slices so a shutdown request is noticed promptly
        let mut slept = Duration::from_millis(0);
        while slept < refresh_interval && !shutdown.is_set() {
            std::thread::sleep(SLEEP_SLICE);
            slept += SLEEP_SLICE;
        }
    }
}
