//! Cooperative cancellation shared by every engine worker.
//!
//! Cancellation is broadcast by dropping the sole `Sender` of a zero-capacity
//! channel: every cloned `Receiver` observes the disconnect at once. Workers
//! `select!` on the token's channel at each queue operation, so a blocked
//! worker wakes immediately when the engine shuts down.

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use std::sync::Mutex;

/// Owning side of the cancellation signal. Held by the engine.
pub(crate) struct CancelSource {
    tx: Mutex<Option<Sender<()>>>,
    token: CancelToken,
}

/// Cloneable observer handed to workers and returned from `Engine::done`.
#[derive(Clone)]
pub struct CancelToken {
    rx: Receiver<()>,
}

impl CancelSource {
    pub fn new() -> Self {
        let (tx, rx) = bounded::<()>(0);
        Self {
            tx: Mutex::new(Some(tx)),
            token: CancelToken { rx },
        }
    }

    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    /// Signal cancellation. Safe to call more than once.
    pub fn cancel(&self) {
        self.tx.lock().unwrap().take();
    }
}

impl CancelToken {
    /// Channel for `select!`; yields a disconnect once cancelled. Nothing is
    /// ever sent on it.
    pub fn channel(&self) -> &Receiver<()> {
        &self.rx
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Block the calling thread until the engine is cancelled.
    pub fn wait(&self) {
        let _ = self.rx.recv();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::select;

    #[test]
    fn test_token_observes_cancel() {
        let source = CancelSource::new();
        let token = source.token();
        assert!(!token.is_cancelled());
        source.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let source = CancelSource::new();
        source.cancel();
        source.cancel();
        assert!(source.token().is_cancelled());
    }

    #[test]
    fn test_all_clones_wake() {
        let source = CancelSource::new();
        let tokens: Vec<CancelToken> = (0..4).map(|_| source.token()).collect();

        let handles: Vec<_> = tokens
            .into_iter()
            .map(|t| std::thread::spawn(move || t.wait()))
            .collect();

        source.cancel();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_select_fires_on_cancel() {
        let source = CancelSource::new();
        let token = source.token();
        let (_tx, work_rx) = bounded::<u32>(1);

        source.cancel();
        let cancelled = select! {
            recv(token.channel()) -> _ => true,
            recv(work_rx) -> _ => false,
        };
        assert!(cancelled);
    }
}
