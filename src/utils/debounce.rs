/// Generation-counter debouncer for storage writes.
///
/// Reduces frequent write operations by batching updates within a time
/// window. Each `arm()` invalidates every earlier token, so a sleeping
/// save task can check whether it is still the most recent request before
/// touching storage. Unlike a timer-handle debouncer this needs no owned
/// timer, which keeps it usable from any spawned task on both wasm and
/// native targets.

use std::sync::atomic::{AtomicU64, Ordering};

pub struct Debouncer {
    generation: AtomicU64,
}

impl Debouncer {
    pub const fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
        }
    }

    /// Register a new pending call, invalidating all earlier ones.
    /// Returns the token the eventual callback must present.
    pub fn arm(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Whether `token` still identifies the most recent `arm()`.
    pub fn is_current(&self, token: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == token
    }

    /// Cancel any pending call without arming a new one.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_armed_token_is_current() {
        let debouncer = Debouncer::new();
        let token = debouncer.arm();
        assert!(debouncer.is_current(token));
    }

    #[test]
    fn test_rearm_invalidates_previous_token() {
        let debouncer = Debouncer::new();
        let first = debouncer.arm();
        let second = debouncer.arm();
        assert!(!debouncer.is_current(first));
        assert!(debouncer.is_current(second));
    }

    #[test]
    fn test_cancel_invalidates_pending() {
        let debouncer = Debouncer::new();
        let token = debouncer.arm();
        debouncer.cancel();
        assert!(!debouncer.is_current(token));
    }
}
