use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Cooperative shutdown flag, checked at every blocking-loop boundary.
/// Cloning is cheap and all clones observe the same flag.
#[derive(Clone, Debug, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> ShutdownFlag {
        ShutdownFlag::default()
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Relaxed)
    }

    /// Arranges for SIGTERM and SIGINT to set this flag. Delivery does not
    /// interrupt in-flight work; loops observe the flag at their next check.
    pub fn register_signals(&self) -> std::io::Result<()> {
        signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&self.0))?;
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&self.0))?;
        Ok(())
    }
}
