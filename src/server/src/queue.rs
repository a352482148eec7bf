use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Condvar, Mutex},
    time::Duration,
};
use tracing::debug;
use util::ShutdownFlag;

/// How long a full-queue enqueue sleeps between shutdown-flag checks.
const ENQUEUE_WAIT_SLICE: Duration = Duration::from_millis(500);

/// One submission awaiting judgment. `input`/`output` name the redirection
/// files inside the problem's data; empty means the process standard streams.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
    pub problem: String,
    pub lang: String,
    pub source: String,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub output: String,
}

/// Compact key for a language string. Ids are handed out first-seen and
/// never reused, so they index the queue partitions without re-hashing
/// strings on the hot path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LangId(u32);

/// Append-only language table under its own lock.
#[derive(Debug, Default)]
pub struct LangPool {
    ids: Mutex<HashMap<String, LangId>>,
}

impl LangPool {
    pub fn new() -> LangPool {
        LangPool::default()
    }

    /// Returns the id for `lang`, assigning the next one on first sight.
    pub fn id_of(&self, lang: &str) -> LangId {
        let mut ids = self.ids.lock().unwrap();
        let next = LangId(ids.len() as u32);
        *ids.entry(lang.to_string()).or_insert(next)
    }

    pub fn ids_of(&self, langs: &[String]) -> Vec<LangId> {
        langs.iter().map(|l| self.id_of(l)).collect()
    }
}

#[derive(Debug)]
pub enum EnqueueError {
    /// The process is shutting down; the task was not inserted.
    Shutdown(Task),
}

#[derive(Debug, Default)]
struct QueueInner {
    partitions: HashMap<LangId, VecDeque<Task>>,
    len: usize,
}

/// Pending tasks partitioned per language, with one capacity shared across
/// all partitions so a single busy language cannot starve the memory budget.
///
/// Invariant relied on by `dequeue`'s tie-break: the task source assigns
/// numeric ids monotonically and never reuses them, so the smallest id among
/// partition heads is the globally oldest task.
#[derive(Debug)]
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    space: Condvar,
    capacity: usize,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> TaskQueue {
        TaskQueue {
            inner: Mutex::new(QueueInner::default()),
            space: Condvar::new(),
            capacity,
        }
    }

    /// Inserts `task`, waiting in bounded slices while the queue is at
    /// capacity. Never drops a task silently: if shutdown is observed while
    /// waiting, the task is handed back to the caller.
    pub fn enqueue(
        &self,
        key: LangId,
        task: Task,
        shutdown: &ShutdownFlag,
    ) -> Result<(), EnqueueError> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.len < self.capacity {
                debug!(task = task.id, lang = %task.lang, "task enqueued");
                inner.partitions.entry(key).or_default().push_back(task);
                inner.len += 1;
                return Ok(());
            }
            if shutdown.is_set() {
                return Err(EnqueueError::Shutdown(task));
            }
            let (guard, _timed_out) = self
                .space
                .wait_timeout(inner, ENQUEUE_WAIT_SLICE)
                .unwrap();
            inner = guard;
        }
    }

    /// Removes and returns the oldest task (by id) among the heads of the
    /// caller's partitions, or `None` without blocking if they are all
    /// empty. A worker that speaks several languages therefore always gets
    /// globally-oldest-first work among what it can run.
    pub fn dequeue(&self, capabilities: &[LangId]) -> Option<Task> {
        let mut inner = self.inner.lock().unwrap();
        let best = capabilities
            .iter()
            .filter_map(|key| {
                let head = inner.partitions.get(key)?.front()?;
                Some((head.id, *key))
            })
            .min_by_key(|(id, _)| *id)?;
        let task = inner
            .partitions
            .get_mut(&best.1)
            .and_then(|q| q.pop_front())
            .expect("partition head vanished under the lock");
        inner.len -= 1;
        self.space.notify_one();
        debug!(task = task.id, lang = %task.lang, "task dequeued");
        Some(task)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: u64, lang: &str) -> Task {
        Task {
            id,
            problem: format!("p{}", id),
            lang: lang.to_string(),
            source: "int main() {}".to_string(),
            input: String::new(),
            output: String::new(),
        }
    }

    #[test]
    fn dispatch_is_oldest_first_within_capabilities() {
        let langs = LangPool::new();
        let queue = TaskQueue::new(16);
        let shutdown = ShutdownFlag::new();
        let cpp = langs.id_of("cpp");
        let java = langs.id_of("java");

        queue.enqueue(cpp, task(1, "cpp"), &shutdown).unwrap();
        queue.enqueue(java, task(2, "java"), &shutdown).unwrap();
        queue.enqueue(cpp, task(3, "cpp"), &shutdown).unwrap();

        let cpp_worker = [cpp];
        let java_worker = [java];
        assert_eq!(queue.dequeue(&cpp_worker).unwrap().id, 1);
        assert_eq!(queue.dequeue(&cpp_worker).unwrap().id, 3);
        assert!(queue.dequeue(&cpp_worker).is_none());
        assert_eq!(queue.dequeue(&java_worker).unwrap().id, 2);
    }

    #[test]
    fn multi_language_worker_sees_global_order() {
        let langs = LangPool::new();
        let queue = TaskQueue::new(16);
        let shutdown = ShutdownFlag::new();
        let cpp = langs.id_of("cpp");
        let java = langs.id_of("java");

        queue.enqueue(java, task(10, "java"), &shutdown).unwrap();
        queue.enqueue(cpp, task(11, "cpp"), &shutdown).unwrap();
        queue.enqueue(java, task(12, "java"), &shutdown).unwrap();

        let both = [cpp, java];
        assert_eq!(queue.dequeue(&both).unwrap().id, 10);
        assert_eq!(queue.dequeue(&both).unwrap().id, 11);
        assert_eq!(queue.dequeue(&both).unwrap().id, 12);
    }

    #[test]
    fn returned_task_is_observed_again_unchanged() {
        let langs = LangPool::new();
        let queue = TaskQueue::new(16);
        let shutdown = ShutdownFlag::new();
        let cpp = langs.id_of("cpp");

        let original = task(42, "cpp");
        queue.enqueue(cpp, original.clone(), &shutdown).unwrap();
        let fetched = queue.dequeue(&[cpp]).unwrap();
        // worker dies mid-judging; the handler returns the task
        queue.enqueue(cpp, fetched, &shutdown).unwrap();
        assert_eq!(queue.dequeue(&[cpp]).unwrap(), original);
        assert!(queue.is_empty());
    }

    #[test]
    fn full_queue_blocks_until_space_or_shutdown() {
        let langs = LangPool::new();
        let queue = std::sync::Arc::new(TaskQueue::new(1));
        let shutdown = ShutdownFlag::new();
        let cpp = langs.id_of("cpp");

        queue.enqueue(cpp, task(1, "cpp"), &shutdown).unwrap();

        let q2 = std::sync::Arc::clone(&queue);
        let sd2 = shutdown.clone();
        let blocked = std::thread::spawn(move || q2.enqueue(cpp, task(2, "cpp"), &sd2));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(queue.dequeue(&[cpp]).unwrap().id, 1);
        blocked.join().unwrap().unwrap();
        assert_eq!(queue.dequeue(&[cpp]).unwrap().id, 2);

        // now full again and shutting down: the task comes back, not lost
        queue.enqueue(cpp, task(3, "cpp"), &shutdown).unwrap();
        shutdown.set();
        match queue.enqueue(cpp, task(4, "cpp"), &shutdown) {
            Err(EnqueueError::Shutdown(t)) => assert_eq!(t.id, 4),
            other => panic!("expected shutdown, got {:?}", other),
        }
    }

    #[test]
    fn lang_pool_assigns_stable_ids() {
        let langs = LangPool::new();
        let a = langs.id_of("cpp");
        let b = langs.id_of("java");
        let a2 = langs.id_of("cpp");
        assert_eq!(a, a2);
        assert_ne!(a, b);
    }
}
