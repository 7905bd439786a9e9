use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::trace;

/// Names and spawns the I/O threads that play the reactor role.
///
/// `connect` and `SstListener` take an explicit driver; the process-wide
/// instance behind [`Driver::shared`] is a convenience accessor only,
/// nothing in the core reaches for it.
pub struct Driver {
    name: String,
    spawned: AtomicUsize,
}

static SHARED: OnceLock<Arc<Driver>> = OnceLock::new();

impl Driver {
    /// Create a driver whose threads are named `<name>-<task>`.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            spawned: AtomicUsize::new(0),
        })
    }

    /// The lazily-initialized process-wide driver.
    pub fn shared() -> Arc<Self> {
        SHARED.get_or_init(|| Driver::new("tcpsst")).clone()
    }

    /// This driver's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total threads spawned over this driver's lifetime.
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::Relaxed)
    }

    pub(crate) fn spawn<F>(&self, task: &str, f: F) -> std::io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let thread_name = format!("{}-{}", self.name, task);
        trace!(thread = %thread_name, "spawning io thread");
        std::thread::Builder::new().name(thread_name).spawn(f)?;
        self.spawned.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
