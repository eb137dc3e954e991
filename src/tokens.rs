//! Bounded token pools used as backpressure throughout the engine.
//!
//! A pool is a pre-filled bounded channel: acquiring a token receives from the
//! channel, releasing sends it back. Acquisition honors the shutdown signal so
//! a worker parked on a saturated pool unwinds promptly instead of finishing
//! queued work after the caller asked to stop. The token guard returns its
//! token on drop, covering every exit path including panics and `?` returns.

use crate::shutdown::Shutdown;
use crossbeam_channel::{Receiver, Sender, bounded, select};

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("shutdown requested while waiting for a token")]
    Shutdown,
}

/// A bounded pool of interchangeable tokens. Cheap to clone; clones share
/// the same underlying pool.
#[derive(Clone)]
pub struct TokenPool {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl TokenPool {
    /// Create a pool holding `capacity` tokens.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "token pool must hold at least one token");
        let (tx, rx) = bounded(capacity);
        for _ in 0..capacity {
            tx.send(()).expect("filling a freshly created pool");
        }
        TokenPool { tx, rx }
    }

    /// Block until a token is available or the shutdown signal closes.
    pub fn acquire(&self, shutdown: &Shutdown) -> Result<TokenGuard, TokenError> {
        select! {
            recv(self.rx) -> token => {
                // The pool owns both ends, so the channel cannot disconnect.
                token.expect("token pool channel disconnected");
                Ok(TokenGuard { tx: self.tx.clone() })
            }
            recv(shutdown.receiver()) -> _ => Err(TokenError::Shutdown),
        }
    }

    /// Block until a token is available, ignoring shutdown. Used for work
    /// that must finish even while unwinding, such as sidecar persistence.
    pub fn acquire_blocking(&self) -> TokenGuard {
        self.rx.recv().expect("token pool channel disconnected");
        TokenGuard {
            tx: self.tx.clone(),
        }
    }
}

/// Holds one token; returns it to the pool on drop.
pub struct TokenGuard {
    tx: Sender<()>,
}

impl Drop for TokenGuard {
    fn drop(&mut self) {
        // Capacity equals the token count, so the send cannot block or fail
        // while the pool is alive.
        let _ = self.tx.try_send(());
    }
}
