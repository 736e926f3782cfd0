use std::sync::atomic::{AtomicUsize, Ordering};

/// Global counter for tracking active proxy sessions
pub static ACTIVE_SESSIONS: AtomicUsize = AtomicUsize::new(0);

/// RAII guard to ensure the session count is properly decremented
pub struct ConnectionGuard {
    decremented: bool,
}

impl ConnectionGuard {
    /// Create a new guard and increment the global counter
    pub fn new() -> Self {
        ACTIVE_SESSIONS.fetch_add(1, Ordering::Relaxed);
        Self { decremented: false }
    }

    /// Manually decrement the session counter
    pub fn decrement(&mut self) {
        if !self.decremented {
            ACTIVE_SESSIONS.fetch_sub(1, Ordering::Relaxed);
            self.decremented = true;
        }
    }

    /// Get the current active session count
    pub fn active_count() -> usize {
        ACTIVE_SESSIONS.load(Ordering::Relaxed)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.decrement();
    }
}

impl Default for ConnectionGuard {
    fn default() -> Self {
        Self::new()
    }
}
