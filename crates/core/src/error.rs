// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Result kinds surfaced by the control plane helpers

use std::time::Duration;
use thiserror::Error;

/// Outcome of a guarded call that did not produce a value.
///
/// Callers branch on the kind: a timeout is transient contention, a deadlock
/// rejection is a lock-ordering bug upstream, an open breaker means the
/// dependency is cooling off, and `Upstream` carries the wrapped call's own
/// failure untouched.
#[derive(Debug, Error)]
pub enum ControlError<E> {
    #[error("timed out after {} waiting for {resource}", humantime::format_duration(*.timeout))]
    Timeout { resource: String, timeout: Duration },

    #[error("lock on {resource} rejected for {holder}: request would deadlock")]
    DeadlockRejected { resource: String, holder: String },

    #[error("circuit breaker open for {dependency}")]
    BreakerOpen { dependency: String },

    #[error("upstream failure: {0}")]
    Upstream(E),
}

impl<E> ControlError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ControlError::Timeout { .. })
    }

    pub fn is_deadlock_rejected(&self) -> bool {
        matches!(self, ControlError::DeadlockRejected { .. })
    }

    pub fn is_breaker_open(&self) -> bool {
        matches!(self, ControlError::BreakerOpen { .. })
    }

    /// The wrapped operation's own failure, if that is what this is
    pub fn upstream(&self) -> Option<&E> {
        match self {
            ControlError::Upstream(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_upstream(self) -> Option<E> {
        match self {
            ControlError::Upstream(e) => Some(e),
            _ => None,
        }
    }
}

/// Classifies whether a failure is worth another attempt
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl<E: Retryable> Retryable for ControlError<E> {
    fn is_retryable(&self) -> bool {
        match self {
            ControlError::Timeout { .. } => true,
            ControlError::DeadlockRejected { .. } | ControlError::BreakerOpen { .. } => false,
            ControlError::Upstream(e) => e.is_retryable(),
        }
    }
}

impl Retryable for std::io::Error {
    fn is_retryable(&self) -> bool {
        use std::io::ErrorKind;
        matches!(
            self.kind(),
            ErrorKind::TimedOut
                | ErrorKind::Interrupted
                | ErrorKind::WouldBlock
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionRefused
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe
        )
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
