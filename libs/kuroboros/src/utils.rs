//! Utilities: event-aware sleep and a TLS self-sign helper.
//!
//! Forcibly aborting an overrunning reconcile hook is handled by
//! `reconciler::invoke`, which races the hook against a deadline in a
//! spawned task and calls `JoinHandle::abort()` on overrun rather than
//! shelling out to a subprocess.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

/// A one-shot, monotonic stop signal shared between a long-running task and
/// whatever wants to stop it. Once set, stays set.
#[derive(Debug, Default)]
pub struct StopSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Returns when `duration` elapses or the signal becomes set, whichever
    /// is first. The only blocking-sleep primitive inside controller and
    /// reconciler tasks; plain `tokio::time::sleep` is used elsewhere (e.g.
    /// leader-election's inter-poll wait) where responsiveness to stop
    /// doesn't matter.
    pub async fn sleep(&self, duration: Duration) {
        // Arm the notification before checking the flag: `notify_waiters`
        // stores no permit, so a `set()` landing between an `is_set()` check
        // and this future's registration would otherwise be missed and the
        // task would sleep the full `duration`.
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_set() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = notified => {}
        }
    }
}

/// Generates a throwaway self-signed certificate and private key, PEM
/// encoded. Used by the demo binary and local development; production
/// deployments always supply operator-managed cert/key files.
pub fn self_signed_cert(subject_alt_names: Vec<String>) -> Result<(String, String), crate::error::Error> {
    let cert = rcgen::generate_simple_self_signed(subject_alt_names)
        .map_err(|e| crate::error::Error::Tls(e.to_string()))?;
    Ok((cert.cert.pem(), cert.signing_key.serialize_pem()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[tokio::test]
    async fn sleep_returns_after_duration_when_not_signalled() {
        let signal = StopSignal::new();
        let start = Instant::now();
        signal.sleep(Duration::from_millis(50)).await;
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn sleep_returns_early_when_signalled() {
        let signal = Arc::new(StopSignal::new());
        let waiter = signal.clone();
        let handle = tokio::spawn(async move {
            let start = Instant::now();
            waiter.sleep(Duration::from_secs(5)).await;
            start.elapsed()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        signal.set();
        let elapsed = handle.await.unwrap();
        assert!(elapsed < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn sleep_is_noop_if_already_signalled() {
        let signal = StopSignal::new();
        signal.set();
        let start = Instant::now();
        signal.sleep(Duration::from_secs(5)).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
