//! Cancellable timers for exit-race reconciliation.
//!
//! Two shapes are needed: a plain one-shot delay (the POSIX close safety
//! net) and a quiet-period timer whose deadline is pushed forward by
//! activity (the ConPTY exit flush window). Both run on a small dedicated
//! thread guarded by a cancel flag, matching the crate's thread-per-channel
//! runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// One-shot timer. The callback runs after `delay` unless [`cancel`] was
/// called first.
///
/// [`cancel`]: OneShotTimer::cancel
pub struct OneShotTimer {
    cancelled: Arc<AtomicBool>,
}

impl OneShotTimer {
    pub fn start(delay: Duration, callback: impl FnOnce() + Send + 'static) -> Self {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            if !flag.load(Ordering::SeqCst) {
                callback();
            }
        });
        Self { cancelled }
    }

    /// Prevent the callback from running. Dropping the timer does not
    /// cancel it; the pending event must be cleared explicitly.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

struct QuietState {
    deadline: Mutex<Instant>,
    cancelled: AtomicBool,
    window: Duration,
}

/// Quiet-period timer. Fires once the deadline passes without having been
/// pushed by [`poke`]; every poke restarts the window.
///
/// [`poke`]: QuietTimer::poke
pub struct QuietTimer {
    state: Arc<QuietState>,
}

impl QuietTimer {
    pub fn start(window: Duration, callback: impl FnOnce() + Send + 'static) -> Self {
        let state = Arc::new(QuietState {
            deadline: Mutex::new(Instant::now() + window),
            cancelled: AtomicBool::new(false),
            window,
        });
        let shared = state.clone();
        thread::spawn(move || {
            loop {
                if shared.cancelled.load(Ordering::SeqCst) {
                    return;
                }
                let deadline = *shared.deadline.lock().unwrap();
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                thread::sleep(deadline - now);
            }
            if !shared.cancelled.load(Ordering::SeqCst) {
                callback();
            }
        });
        Self { state }
    }

    /// Restart the quiet window.
    pub fn poke(&self) {
        *self.state.deadline.lock().unwrap() = Instant::now() + self.state.window;
    }

    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_one_shot_fires() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let _timer = OneShotTimer::start(Duration::from_millis(10), move || {
            flag.store(true, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(80));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_one_shot_cancel() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let timer = OneShotTimer::start(Duration::from_millis(30), move || {
            flag.store(true, Ordering::SeqCst);
        });
        timer.cancel();
        thread::sleep(Duration::from_millis(100));
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_quiet_timer_pokes_delay_expiry() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let timer = QuietTimer::start(Duration::from_millis(40), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // Keep poking inside the window; the callback must not run yet.
        for _ in 0..4 {
            thread::sleep(Duration::from_millis(15));
            timer.poke();
            assert_eq!(count.load(Ordering::SeqCst), 0);
        }

        // Let it go quiet.
        thread::sleep(Duration::from_millis(150));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_quiet_timer_cancel() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let timer = QuietTimer::start(Duration::from_millis(20), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        timer.cancel();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
