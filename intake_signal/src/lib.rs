//! Phase signalling for intake.
//!
//! Intake runs several timer-driven tasks that must stop together. The
//! rotation task in particular has to finish its final sweep before the
//! process exits. This crate supplies the mechanism
//! for that: a `Broadcaster` that fires exactly once and any number of
//! `Watcher` instances that wait for it.
//!
//! A `Watcher` obtained through [`Watcher::register`] is a peer: the
//! `Broadcaster` can wait via [`Broadcaster::signal_and_wait`] until every peer
//! has observed the signal and dropped off. A cloned `Watcher` observes the
//! signal but is never waited on.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use tokio::sync::{Notify, watch};
use tracing::info;

/// Construct a `Watcher` and `Broadcaster` pair.
///
/// The returned `Watcher` is registered, that is, it counts as a peer of the
/// `Broadcaster`.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    let (sender, receiver) = watch::channel(false);
    let peers = Arc::new(AtomicU32::new(1));
    let notify = Arc::new(Notify::new());

    let w = Watcher {
        receiver,
        peers: Arc::clone(&peers),
        notify: Arc::clone(&notify),
        signal_received: false,
        released: false,
        registered: true,
    };
    let b = Broadcaster {
        sender,
        peers,
        notify,
    };
    (w, b)
}

#[derive(Debug)]
/// Fires the signal for every `Watcher` derived from the same pair.
pub struct Broadcaster {
    /// Flipped to `true` exactly once.
    sender: watch::Sender<bool>,
    /// Registered peers that have not yet dropped off.
    peers: Arc<AtomicU32>,
    /// Woken whenever a peer drops off.
    notify: Arc<Notify>,
}

impl Broadcaster {
    /// Send the signal without waiting for any peer.
    pub fn signal(self) {
        self.sender.send_replace(true);
    }

    /// Send the signal and wait until every registered peer has observed it
    /// or been dropped.
    pub async fn signal_and_wait(self) {
        self.sender.send_replace(true);

        // Register interest before reading the peer count, else a peer that
        // drops off between the load and the await is never seen.
        loop {
            let notified = self.notify.notified();
            let peers = self.peers.load(Ordering::SeqCst);
            if peers == 0 {
                break;
            }
            info!(peers, "waiting for peers to shut down");
            notified.await;
        }
    }
}

/// Errors for `Watcher::try_recv`.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    /// The signal has already been received by this `Watcher`.
    #[error("signal has been received")]
    SignalReceived,
}

/// Errors for `Watcher::register`.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    /// The signal has already been received by this `Watcher`.
    #[error("signal has been received")]
    SignalReceived,
}

#[derive(Debug)]
/// Waits for the signal from a `Broadcaster`.
pub struct Watcher {
    receiver: watch::Receiver<bool>,
    peers: Arc<AtomicU32>,
    notify: Arc<Notify>,
    /// Set once this instance has observed the signal.
    signal_received: bool,
    /// Set once this instance has removed itself from `peers`.
    released: bool,
    /// Whether the `Broadcaster` counts this instance as a peer.
    registered: bool,
}

impl Watcher {
    fn release(&mut self) {
        if !self.registered || self.released {
            return;
        }
        // `fetch_sub` would wrap at zero, hence the loop.
        let mut old = self.peers.load(Ordering::Relaxed);
        while old > 0 {
            match self.peers.compare_exchange_weak(
                old,
                old - 1,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.notify.notify_waiters();
                    break;
                }
                Err(x) => old = x,
            }
        }
        self.released = true;
    }

    /// Wait for the signal. Returns immediately if it has already been sent.
    ///
    /// A `Broadcaster` dropped without signalling counts as a signal.
    pub async fn recv(mut self) {
        if !self.signal_received {
            // Err here means the sender is gone, which we treat as fired.
            let _ = self.receiver.wait_for(|fired| *fired).await;
            self.signal_received = true;
        }
        self.release();
    }

    /// Check for the signal without blocking.
    ///
    /// # Errors
    ///
    /// Returns `TryRecvError::SignalReceived` on every call after the one that
    /// first observed the signal.
    pub fn try_recv(&mut self) -> Result<bool, TryRecvError> {
        if self.signal_received {
            return Err(TryRecvError::SignalReceived);
        }
        let fired = match self.receiver.has_changed() {
            Ok(_) => *self.receiver.borrow_and_update(),
            Err(_) => true,
        };
        if fired {
            self.signal_received = true;
            self.release();
        }
        Ok(fired)
    }

    /// Register a new peer with the `Broadcaster`.
    ///
    /// # Errors
    ///
    /// Returns `RegisterError::SignalReceived` if this instance has already
    /// observed the signal.
    pub fn register(&self) -> Result<Self, RegisterError> {
        if self.signal_received {
            return Err(RegisterError::SignalReceived);
        }
        self.peers.fetch_add(1, Ordering::SeqCst);
        Ok(Self {
            receiver: self.receiver.clone(),
            peers: Arc::clone(&self.peers),
            notify: Arc::clone(&self.notify),
            signal_received: false,
            released: false,
            registered: true,
        })
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.release();
    }
}

impl Clone for Watcher {
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.clone(),
            peers: Arc::clone(&self.peers),
            notify: Arc::clone(&self.notify),
            signal_received: self.signal_received,
            released: false,
            registered: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn watcher_receives_signal() {
        let (watcher, broadcaster) = signal();
        let handle = tokio::spawn(watcher.recv());
        broadcaster.signal_and_wait().await;
        handle.await.expect("watcher task panicked");
    }

    #[tokio::test]
    async fn unregistered_clone_does_not_block_shutdown() {
        let (watcher, broadcaster) = signal();
        let _unregistered = watcher.clone();
        let handle = tokio::spawn(watcher.recv());

        tokio::time::timeout(Duration::from_secs(5), broadcaster.signal_and_wait())
            .await
            .expect("signal_and_wait hung on an unregistered watcher");
        handle.await.expect("watcher task panicked");
    }

    #[tokio::test]
    async fn registered_peers_are_all_waited_for() {
        let (watcher, broadcaster) = signal();
        let second = watcher.register().expect("registration failed");

        let h1 = tokio::spawn(watcher.recv());
        let h2 = tokio::spawn(second.recv());

        broadcaster.signal_and_wait().await;
        h1.await.expect("first watcher panicked");
        h2.await.expect("second watcher panicked");
    }

    #[test]
    fn try_recv_before_and_after_signal() {
        let (mut watcher, broadcaster) = signal();
        assert_eq!(watcher.try_recv(), Ok(false));

        broadcaster.signal();

        assert_eq!(watcher.try_recv(), Ok(true));
        assert_eq!(watcher.try_recv(), Err(TryRecvError::SignalReceived));
        assert!(matches!(
            watcher.register(),
            Err(RegisterError::SignalReceived)
        ));
    }

    #[tokio::test]
    async fn dropped_broadcaster_counts_as_signal() {
        let (watcher, broadcaster) = signal();
        drop(broadcaster);
        tokio::time::timeout(Duration::from_secs(5), watcher.recv())
            .await
            .expect("recv did not return after broadcaster dropped");
    }

    #[tokio::test]
    async fn dropped_watcher_releases_broadcaster() {
        let (watcher, broadcaster) = signal();
        drop(watcher);
        tokio::time::timeout(Duration::from_secs(5), broadcaster.signal_and_wait())
            .await
            .expect("signal_and_wait hung after watcher dropped");
    }
}
