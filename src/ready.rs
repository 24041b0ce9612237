//! One-shot readiness signalling
//!
//! The embedding process must not start its HTTPS listener before the
//! certificate files exist on disk. [`ReadySignal`] is a latched boolean
//! over a watch channel: it can be signalled any number of times but flips
//! to ready exactly once, stays ready for the process lifetime, and any
//! number of [`ReadyFlag`] observers can poll or await it.

use tokio::sync::watch;

/// The writing half of the readiness latch, held by the rotator.
#[derive(Debug)]
pub struct ReadySignal {
    tx: watch::Sender<bool>,
}

impl ReadySignal {
    /// Create a new signal. `pre_set` starts it already latched (used when
    /// the readiness check is disabled by configuration).
    pub fn new(pre_set: bool) -> Self {
        let (tx, _) = watch::channel(pre_set);
        Self { tx }
    }

    /// Latch the signal. The first call wakes all waiting observers;
    /// subsequent calls are no-ops.
    pub fn signal(&self) {
        self.tx.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        });
    }

    /// Whether the signal has latched
    pub fn is_ready(&self) -> bool {
        *self.tx.borrow()
    }

    /// Create an observer handle
    pub fn subscribe(&self) -> ReadyFlag {
        ReadyFlag {
            rx: self.tx.subscribe(),
        }
    }
}

/// An observer of the readiness latch. Cheap to clone; safe to share.
#[derive(Clone, Debug)]
pub struct ReadyFlag {
    rx: watch::Receiver<bool>,
}

impl ReadyFlag {
    /// Whether the signal has latched
    pub fn is_ready(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the signal latches. Returns `true` once ready, or `false`
    /// if the rotator was dropped without ever becoming ready (in which
    /// case dependents should fail their own readiness probes).
    pub async fn wait(&mut self) -> bool {
        self.rx.wait_for(|ready| *ready).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn latches_exactly_once() {
        let signal = ReadySignal::new(false);
        assert!(!signal.is_ready());

        signal.signal();
        assert!(signal.is_ready());

        // a second signal does not un-latch or re-notify
        signal.signal();
        assert!(signal.is_ready());
    }

    #[tokio::test]
    async fn wakes_multiple_observers() {
        let signal = ReadySignal::new(false);
        let mut a = signal.subscribe();
        let mut b = signal.subscribe();

        let wait_a = tokio::spawn(async move { a.wait().await });
        let wait_b = tokio::spawn(async move { b.wait().await });

        signal.signal();
        assert!(wait_a.await.expect("task a"));
        assert!(wait_b.await.expect("task b"));
    }

    #[tokio::test]
    async fn pre_set_signal_is_immediately_ready() {
        let signal = ReadySignal::new(true);
        let mut flag = signal.subscribe();
        assert!(flag.is_ready());
        assert!(flag.wait().await);
    }

    #[tokio::test]
    async fn dropped_signal_unblocks_waiters_with_not_ready() {
        let signal = ReadySignal::new(false);
        let mut flag = signal.subscribe();
        drop(signal);
        assert!(!flag.wait().await);
    }
}
