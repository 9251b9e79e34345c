// SPDX-License-Identifier: Apache-2.0

//! Termination latches.
//!
//! Cancellation is cooperative: nothing in the runtime injects exceptions
//! into other scheduling units or relies on signals interrupting blocking
//! calls. Instead every component holds two latches and checks them at
//! every suspension boundary.
//!
//! The thread-termination latch is observed by all in-process workers; the
//! process-termination latch is observed by child processes, which learn
//! about it through a `shutdown` control message (or, as a backstop,
//! through heartbeat loss).

use tokio_util::sync::CancellationToken;

/// The pair of termination latches shared by a component tree.
#[derive(Debug, Clone, Default)]
pub struct Latches {
    thread_term: CancellationToken,
    proc_term: CancellationToken,
}

impl Latches {
    /// Fresh, untripped latches.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Trips both latches. Idempotent.
    pub fn terminate(&self) {
        self.thread_term.cancel();
        self.proc_term.cancel();
    }

    /// `true` once termination was requested.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.thread_term.is_cancelled()
    }

    /// The latch in-process workers select on.
    #[must_use]
    pub fn thread_term(&self) -> &CancellationToken {
        &self.thread_term
    }

    /// The latch child processes are told about.
    #[must_use]
    pub fn proc_term(&self) -> &CancellationToken {
        &self.proc_term
    }

    /// Resolves once termination is requested.
    pub async fn observed(&self) {
        self.thread_term.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn terminate_trips_both_latches() {
        let latches = Latches::new();
        assert!(!latches.is_terminated());

        latches.terminate();
        assert!(latches.is_terminated());
        assert!(latches.proc_term().is_cancelled());
        latches.observed().await;

        // idempotent
        latches.terminate();
        assert!(latches.is_terminated());
    }
}
