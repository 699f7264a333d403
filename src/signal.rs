//! One-shot synchronization objects shared by the units of a flashing run.
//!
//! Both objects are cheap handles around shared state and are handed to each
//! unit when it is constructed:
//!
//!  * [`ReadinessSignal`] gates the SSH upgrade until the serial driver has
//!    assigned the device its temporary address. It is written once, either
//!    to `Ready` or to `Aborted`, and can be waited on by any number of
//!    readers.
//!  * [`CancelFlag`] is the single cancellation flag every polling loop
//!    checks. It is raised by the operator (Ctrl+C) or by the coordinator
//!    when it winds a run down.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

// =============================================================================
// Public Interface
// =============================================================================

// Readiness ===================================================================

/// The value held by a [`ReadinessSignal`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Readiness {
    Pending,
    Ready,
    Aborted,
}

/// A set-once, multi-reader signal with three states.
///
/// The only legal transitions are `Pending -> Ready` and `Pending ->
/// Aborted`. Any later attempt to set the signal is ignored and reported as
/// such to the caller, so the value never regresses.
#[derive(Debug, Clone)]
pub struct ReadinessSignal {
    inner: Arc<(Mutex<Readiness>, Condvar)>,
}

impl Default for ReadinessSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessSignal {
    pub fn new() -> Self {
        ReadinessSignal {
            inner: Arc::new((Mutex::new(Readiness::Pending), Condvar::new())),
        }
    }

    /// Current value, without blocking on the setter.
    pub fn get(&self) -> Readiness {
        *self.lock()
    }

    /// Moves the signal to `Ready`. Returns `false` if it was already set.
    pub fn set_ready(&self) -> bool {
        self.settle(Readiness::Ready)
    }

    /// Moves the signal to `Aborted`. Returns `false` if it was already set.
    pub fn abort(&self) -> bool {
        self.settle(Readiness::Aborted)
    }

    /// Blocks until the signal leaves `Pending` and returns the final value.
    pub fn wait(&self) -> Readiness {
        let (_, cvar) = &*self.inner;
        let mut value = self.lock();
        while *value == Readiness::Pending {
            value = cvar.wait(value).unwrap_or_else(|e| e.into_inner());
        }
        *value
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`, returning
    /// `Readiness::Pending` in that case.
    pub fn wait_timeout(&self, timeout: Duration) -> Readiness {
        let (_, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut value = self.lock();
        while *value == Readiness::Pending {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            value = cvar
                .wait_timeout(value, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        *value
    }

    fn settle(&self, target: Readiness) -> bool {
        let (_, cvar) = &*self.inner;
        let mut value = self.lock();
        if *value != Readiness::Pending {
            return false;
        }
        *value = target;
        drop(value);
        cvar.notify_all();
        true
    }

    // A panicking holder cannot leave the value half-written, so a poisoned
    // lock is still safe to read.
    fn lock(&self) -> MutexGuard<'_, Readiness> {
        self.inner.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// CancelFlag ==================================================================

/// Shared cancellation flag. Once raised it stays raised.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// The "keep running" view of the flag used by polling loops.
    pub fn keep_running(&self) -> bool {
        !self.is_cancelled()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn starts_pending() {
        assert_eq!(ReadinessSignal::new().get(), Readiness::Pending);
    }

    #[test]
    fn ready_never_regresses() {
        let signal = ReadinessSignal::new();
        assert!(signal.set_ready());
        assert!(!signal.abort());
        assert!(!signal.set_ready());
        assert_eq!(signal.get(), Readiness::Ready);
    }

    #[test]
    fn aborted_never_regresses() {
        let signal = ReadinessSignal::new();
        assert!(signal.abort());
        assert!(!signal.set_ready());
        assert_eq!(signal.get(), Readiness::Aborted);
    }

    #[test]
    fn wakes_every_waiter() {
        let signal = ReadinessSignal::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let signal = signal.clone();
                thread::spawn(move || signal.wait())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        assert!(signal.set_ready());

        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), Readiness::Ready);
        }
    }

    #[test]
    fn wait_timeout_reports_pending() {
        let signal = ReadinessSignal::new();
        assert_eq!(
            signal.wait_timeout(Duration::from_millis(10)),
            Readiness::Pending
        );
    }

    #[test]
    fn racing_setters_settle_once() {
        let signal = ReadinessSignal::new();
        let setters: Vec<_> = (0..8)
            .map(|i| {
                let signal = signal.clone();
                thread::spawn(move || {
                    if i % 2 == 0 {
                        signal.set_ready()
                    } else {
                        signal.abort()
                    }
                })
            })
            .collect();

        let winners = setters
            .into_iter()
            .map(|s| s.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_ne!(signal.get(), Readiness::Pending);
    }

    #[test]
    fn cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(clone.keep_running());
        flag.cancel();
        assert!(clone.is_cancelled());
        assert!(!clone.keep_running());
    }
}
