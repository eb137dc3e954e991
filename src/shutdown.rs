//! Cooperative cancellation signal.
//!
//! A [`Shutdown`] is a read-observable channel whose closure means "stop
//! cooperatively". Holders never receive a value; they only ever observe the
//! sending side going away. Operations check it between units of work and
//! token-pool acquisition selects on it so blocked workers wake up promptly.

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded};
use std::sync::Arc;

/// Requests shutdown when dropped or when [`ShutdownHandle::request`] is called.
pub struct ShutdownHandle {
    tx: Option<Sender<()>>,
}

impl ShutdownHandle {
    /// Close the signal, waking everything that observes it.
    pub fn request(mut self) {
        self.tx.take();
    }
}

impl Drop for ShutdownHandle {
    fn drop(&mut self) {
        self.tx.take();
    }
}

/// The observable side of the shutdown signal. Cheap to clone.
#[derive(Clone)]
pub struct Shutdown {
    rx: Receiver<()>,
    // When present, the channel can never disconnect: this is the "never
    // shut down" signal used by callers that do not support cancellation.
    _keepalive: Option<Arc<Sender<()>>>,
}

impl Shutdown {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (tx, rx) = bounded::<()>(0);
        Shutdown {
            rx,
            _keepalive: Some(Arc::new(tx)),
        }
    }

    /// True once the signal has been closed.
    pub fn is_shutdown(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// The raw receiver, for use in `select!` arms. Receiving only ever
    /// yields a disconnect error; a successful receive cannot happen.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

/// Create a connected handle/signal pair.
pub fn shutdown_pair() -> (ShutdownHandle, Shutdown) {
    let (tx, rx) = bounded::<()>(0);
    (
        ShutdownHandle { tx: Some(tx) },
        Shutdown {
            rx,
            _keepalive: None,
        },
    )
}
