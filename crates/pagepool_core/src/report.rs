//! # Error Reporting
//!
//! The allocator never logs directly to a fixed sink. Conditions that do not
//! fail the call (corruption on return, leaked blocks on destroy) and
//! conditions that do (page allocation failure, bad pointers) are all handed to
//! an injected [`ErrorReporter`].
//!
//! ```rust,ignore
//! let reporter = RecordingReporter::new();
//! let mut pool = SegmentedPoolAllocator::with_reporter(config, reporter.clone())?;
//! // ...
//! assert!(reporter.is_empty());
//! ```

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::PoolError;

/// Severity of a reported condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Severity {
    /// Suspicious but harmless to the allocator.
    Warning,
    /// Memory was corrupted, misused, or could not be obtained.
    Error,
}

/// Sink for conditions detected by an allocator.
///
/// Implemented for any `Fn(Severity, &PoolError)` closure.
pub trait ErrorReporter {
    /// Receives one condition. Must not call back into the allocator.
    fn report(&self, severity: Severity, error: &PoolError);
}

impl<F> ErrorReporter for F
where
    F: Fn(Severity, &PoolError),
{
    fn report(&self, severity: Severity, error: &PoolError) {
        self(severity, error);
    }
}

/// Default reporter: forwards everything to `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, severity: Severity, error: &PoolError) {
        match severity {
            Severity::Warning => tracing::warn!("pool: {}", error),
            Severity::Error => tracing::error!("pool: {}", error),
        }
    }
}

/// Reporter that keeps every condition it receives.
///
/// Clones share the same buffer, so one clone can be handed to the allocator
/// while another is inspected by the owner (a memory viewer, a test).
#[derive(Clone, Debug, Default)]
pub struct RecordingReporter {
    reports: Arc<Mutex<Vec<(Severity, PoolError)>>>,
}

impl RecordingReporter {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of everything recorded so far.
    #[must_use]
    pub fn reports(&self) -> Vec<(Severity, PoolError)> {
        self.reports.lock().clone()
    }

    /// Number of recorded conditions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    /// True if nothing has been reported.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reports.lock().is_empty()
    }

    /// Counts recorded conditions matching `predicate`.
    pub fn count_matching(&self, predicate: impl Fn(&PoolError) -> bool) -> usize {
        self.reports.lock().iter().filter(|(_, e)| predicate(e)).count()
    }

    /// Drops everything recorded so far.
    pub fn clear(&self) {
        self.reports.lock().clear();
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, severity: Severity, error: &PoolError) {
        self.reports.lock().push((severity, error.clone()));
    }
}
