use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::EnvFilter;

/// Installs the process-wide tracing subscriber. Safe to call more than once;
/// only the first call has any effect.
pub fn setup() {
    static FLAG: AtomicBool = AtomicBool::new(false);
    if FLAG.swap(true, Ordering::SeqCst) {
        return;
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
