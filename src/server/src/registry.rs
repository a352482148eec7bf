use std::collections::HashSet;
use std::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered,
    Duplicate,
}

/// The set of worker identifiers currently online. A second connection
/// claiming an id that is in use is rejected; it never replaces the first.
///
/// Constructed once at startup and shared by handle; the lock is held only
/// for the in-memory mutation, never across network calls.
#[derive(Debug, Default)]
pub struct JudgeRegistry {
    online: Mutex<HashSet<String>>,
}

impl JudgeRegistry {
    pub fn new() -> JudgeRegistry {
        JudgeRegistry::default()
    }

    /// Atomic check-and-insert.
    pub fn register(&self, id: &str) -> RegisterOutcome {
        let mut online = self.online.lock().unwrap();
        if online.insert(id.to_string()) {
            info!(judge = id, "judge registered");
            RegisterOutcome::Registered
        } else {
            warn!(judge = id, "another judge already uses this id");
            RegisterOutcome::Duplicate
        }
    }

    /// Idempotent removal.
    pub fn unregister(&self, id: &str) {
        if self.online.lock().unwrap().remove(id) {
            info!(judge = id, "judge unregistered");
        }
    }

    pub fn count(&self) -> usize {
        self.online.lock().unwrap().len()
    }
}
