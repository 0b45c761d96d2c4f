//! Process-fatal conditions travel on their own channel so that no caller
//! can swallow them along with an ordinary error return.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

/// Sending half, held by the engine.
#[derive(Clone)]
pub struct FatalErrorSink {
    sender: Sender<String>,
    raised: Arc<AtomicBool>,
}

/// Receiving half, held by the process owner.
pub struct AbortSignal {
    receiver: Receiver<String>,
    raised: Arc<AtomicBool>,
}

pub fn fatal_channel() -> (FatalErrorSink, AbortSignal) {
    let (sender, receiver) = unbounded();
    let raised = Arc::new(AtomicBool::new(false));
    (
        FatalErrorSink {
            sender,
            raised: Arc::clone(&raised),
        },
        AbortSignal { receiver, raised },
    )
}

impl FatalErrorSink {
    pub fn raise(&self, message: impl Into<String>) {
        let message = message.into();
        divid_log::log_error!("fatal: {message}");
        self.raised.store(true, Ordering::SeqCst);
        // A dropped receiver still leaves the raised flag set.
        let _ = self.sender.send(message);
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }
}

impl AbortSignal {
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    pub fn try_recv(&self) -> Option<String> {
        self.receiver.try_recv().ok()
    }

    /// Waits up to `timeout`; `None` on timeout or when every sink is gone.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<String> {
        match self.receiver.recv_timeout(timeout) {
            Ok(message) => Some(message),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Every message raised so far.
    pub fn drain(&self) -> Vec<String> {
        self.receiver.try_iter().collect()
    }
}
