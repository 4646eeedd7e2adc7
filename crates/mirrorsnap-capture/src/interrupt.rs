//! Platform-initiated termination of a mirroring relationship.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mirrorsnap_core::TerminationReason;
use tracing::{debug, info};

use crate::pool::FrameBufferPool;

type Listener = Box<dyn Fn(TerminationReason) + Send + Sync>;

struct Inner {
    fired:    AtomicBool,
    pool:     FrameBufferPool,
    listener: Listener,
}

/// Given to a backend when a mirror is created. The backend calls
/// [`InterruptHandle::interrupt`] from whatever thread observes the platform
/// ending the mirror.
///
/// The first interrupt closes the pool at once, so no further frame is served,
/// then notifies the listener. Later calls, and calls after
/// [`InterruptHandle::disarm`], do nothing.
#[derive(Clone)]
pub struct InterruptHandle {
    inner: Arc<Inner>,
}

impl InterruptHandle {
    pub fn new<F>(pool: FrameBufferPool, listener: F) -> Self
    where
        F: Fn(TerminationReason) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                fired: AtomicBool::new(false),
                pool,
                listener: Box::new(listener),
            }),
        }
    }

    /// Returns `true` if this call delivered the interruption.
    pub fn interrupt(&self, reason: TerminationReason) -> bool {
        if self.inner.fired.swap(true, Ordering::AcqRel) {
            debug!("Mirror interrupt ({reason}) ignored: already ended");
            return false;
        }
        info!("Mirror terminated by platform: {reason}");
        self.inner.pool.close();
        (self.inner.listener)(reason);
        true
    }

    /// Mark the mirror as ended without notifying (explicit stop path).
    pub fn disarm(&self) {
        self.inner.fired.store(true, Ordering::Release);
    }

    pub fn is_fired(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }
}

impl fmt::Debug for InterruptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptHandle").field("fired", &self.is_fired()).finish()
    }
}
