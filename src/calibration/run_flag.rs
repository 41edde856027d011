//! Running flag shared by the controller and the active pass.
//!
//! The flag is both the single-pass gate (start is refused while it is set)
//! and the only cancellation mechanism: sequencers check it at fixed points
//! and end the pass early once it is cleared.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared running flag.
///
/// Uses SeqCst ordering so a stop request is visible to the pass at its next
/// check point.
#[derive(Debug, Clone, Default)]
pub struct RunFlag {
    running: Arc<AtomicBool>,
}

impl RunFlag {
    /// New, cleared flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag if it is clear. Returns `false` when a pass already runs.
    pub fn try_start(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Clear the flag.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether a pass may continue.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Guard that clears the flag when dropped unless dismissed.
    pub fn guard(&self) -> RunGuard {
        RunGuard {
            flag: Some(self.clone()),
        }
    }
}

/// Clears the running flag on drop, so a panicking pass never leaves the
/// controller locked out.
#[derive(Debug)]
pub struct RunGuard {
    flag: Option<RunFlag>,
}

impl RunGuard {
    /// Disarm the guard; the caller takes over clearing the flag.
    pub fn dismiss(mut self) {
        self.flag = None;
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Some(flag) = self.flag.take() {
            if std::thread::panicking() {
                tracing::error!("calibration pass panicked, clearing running flag");
            }
            flag.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_start_is_refused() {
        let flag = RunFlag::new();
        assert!(flag.try_start());
        assert!(!flag.try_start());
        flag.stop();
        assert!(flag.try_start());
    }

    #[test]
    fn clones_share_state() {
        let flag = RunFlag::new();
        let ui = flag.clone();
        flag.try_start();
        ui.stop();
        assert!(!flag.is_running());
    }

    #[test]
    fn guard_clears_on_drop() {
        let flag = RunFlag::new();
        flag.try_start();
        drop(flag.guard());
        assert!(!flag.is_running());
    }

    #[test]
    fn dismissed_guard_leaves_flag() {
        let flag = RunFlag::new();
        flag.try_start();
        flag.guard().dismiss();
        assert!(flag.is_running());
    }

    #[test]
    fn guard_clears_when_task_panics() {
        let flag = RunFlag::new();
        flag.try_start();
        let inner = flag.clone();
        let result = std::thread::spawn(move || {
            let _guard = inner.guard();
            panic!("boom");
        })
        .join();
        assert!(result.is_err());
        assert!(!flag.is_running());
    }
}
