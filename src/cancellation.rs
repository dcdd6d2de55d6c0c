//! Renewable cancellation handle.
//!
//! A [`CancellationHandle`] owns one `CancellationToken` at a time plus a
//! generation counter. Once triggered the token stays triggered; the only way
//! back is [`CancellationHandle::renew`], which the state machine calls from an
//! explicit reset.

use tokio_util::sync::CancellationToken;

/// Cancellation token with a generation counter
#[derive(Debug)]
pub struct CancellationHandle {
    token: CancellationToken,
    generation: u64,
}

impl CancellationHandle {
    /// Create a fresh, untriggered handle at generation 0
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            generation: 0,
        }
    }

    /// Trigger the current token. Idempotent.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Whether the current token has been triggered
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Clone of the current token, scoped to one attempt or hook run
    ///
    /// A clone taken before [`renew`](Self::renew) keeps observing the old
    /// generation and is never un-triggered.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Current generation, bumped on every renewal
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Replace a triggered token with a fresh one
    ///
    /// Returns `true` if the token was triggered and has been replaced. An
    /// untriggered token is kept as is.
    pub fn renew(&mut self) -> bool {
        if !self.token.is_cancelled() {
            return false;
        }
        self.token = CancellationToken::new();
        self.generation += 1;
        true
    }
}

impl Default for CancellationHandle {
    fn default() -> Self {
        Self::new()
    }
}
