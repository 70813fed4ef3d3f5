//! Single-execution affinity gate
//!
//! The guest engine is single-threaded. A runtime records the thread it was
//! created on and every guest-touching operation checks it first.

use crate::error::BridgeError;
use std::thread::{self, ThreadId};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ThreadAffinity {
    owner: ThreadId,
}

impl ThreadAffinity {
    /// Bind to the calling thread.
    pub fn current() -> Self {
        Self {
            owner: thread::current().id(),
        }
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    pub fn is_current(&self) -> bool {
        thread::current().id() == self.owner
    }

    pub fn check(&self) -> Result<(), BridgeError> {
        let actual = thread::current().id();
        if actual == self.owner {
            Ok(())
        } else {
            tracing::error!(?actual, expected = ?self.owner, "guest access off the engine thread");
            Err(BridgeError::AffinityViolation {
                expected: self.owner,
                actual,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn other_threads_are_rejected() {
        let affinity = ThreadAffinity::current();
        assert!(affinity.check().is_ok());

        let rejected = thread::spawn(move || {
            matches!(affinity.check(), Err(BridgeError::AffinityViolation { .. }))
        })
        .join()
        .unwrap();
        assert!(rejected);
    }
}
