//! Cancellation contexts.
//!
//! A [`Context`] is a cloneable cancellation token handed to blocking store
//! operations. Cancellation is cooperative: it is observed while waiting for
//! the writer slot and at block append/lookup boundaries, never in the middle
//! of a commit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::StoreError;

/// Cancellation token for store operations.
#[derive(Clone, Debug, Default)]
pub struct Context {
    cancelled: Arc<AtomicBool>,
}

impl Context {
    /// A context that is never cancelled.
    pub fn background() -> Context {
        Context::default()
    }

    /// A context paired with a handle that cancels it.
    pub fn cancellable() -> (Context, Canceller) {
        let ctx = Context::default();
        let canceller = Canceller {
            cancelled: Arc::clone(&ctx.cancelled),
        };
        (ctx, canceller)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn check(&self) -> Result<(), StoreError> {
        if self.is_cancelled() {
            Err(StoreError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Cancels the [`Context`] it was created with.
#[derive(Clone, Debug)]
pub struct Canceller {
    cancelled: Arc<AtomicBool>,
}

impl Canceller {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}
