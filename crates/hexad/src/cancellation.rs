use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::UserError;

/// Shared cancellation flag threaded through every long-running operation.
/// Operators check it at fragment boundaries and stop producing once it
/// fires; the stream then surfaces [`UserError::Cancelled`].
#[derive(Default, Clone, Debug)]
pub struct CancellationHandle(Arc<AtomicBool>);

impl CancellationHandle {
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }

    pub fn check(&self) -> Result<(), UserError> {
        if self.is_cancelled() {
            Err(UserError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_shared_between_clones() {
        let handle = CancellationHandle::default();
        let clone = handle.clone();
        assert!(handle.check().is_ok());
        clone.cancel();
        assert!(handle.is_cancelled());
        assert!(matches!(handle.check(), Err(UserError::Cancelled)));
        handle.reset();
        assert!(clone.check().is_ok());
    }
}
