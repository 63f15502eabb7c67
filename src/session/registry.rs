/*!
 * Rundown Registry
 *
 * Tracks every live session so a hosting process can run them all down on
 * abnormal termination. Sessions register themselves when bound and
 * unregister when dropped; the registry holds them weakly and never keeps
 * a session alive.
 *
 * Use `RundownRegistry::global()` for the process-wide instance, or pass an
 * explicit registry to the session builder to keep sessions isolated.
 */

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tracing::{info, warn};

/// Something that can be torn down best-effort
pub trait Rundown: Send + Sync {
    fn rundown(&self);

    /// Label for log lines
    fn label(&self) -> String;
}

/// Handle returned by `register`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Registration(u64);

/// Registry of sessions to run down
#[derive(Default)]
pub struct RundownRegistry {
    entries: Mutex<Vec<(Registration, Weak<dyn Rundown>)>>,
    next_id: AtomicU64,
}

static GLOBAL: OnceLock<Arc<RundownRegistry>> = OnceLock::new();

impl RundownRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry, created on first use
    pub fn global() -> Arc<RundownRegistry> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(RundownRegistry::new())))
    }

    pub fn register(&self, target: Weak<dyn Rundown>) -> Registration {
        let registration = Registration(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push((registration, target));
        registration
    }

    /// Returns `false` if the registration was already gone
    pub fn unregister(&self, registration: Registration) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(id, _)| *id != registration);
        entries.len() != before
    }

    /// Live registrations
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|(_, target)| target.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run down every registered session and clear the registry
    ///
    /// Returns the number of sessions run down. Targets are taken out of
    /// the registry first so a rundown that unregisters does not deadlock.
    pub fn rundown_all(&self) -> usize {
        let entries = std::mem::take(&mut *self.entries.lock());
        let mut count = 0;
        for (_, target) in entries {
            let Some(target) = target.upgrade() else {
                continue;
            };
            let label = target.label();
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| target.rundown())).is_err() {
                warn!(session = %label, "session rundown panicked");
                continue;
            }
            count += 1;
        }
        info!(sessions = count, "registered sessions run down");
        count
    }
}

impl std::fmt::Debug for RundownRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RundownRegistry").field("live", &self.len()).finish()
    }
}
