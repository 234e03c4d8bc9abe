//! Cancellation and time budgets for long-running operations.
//!
//! Queries, index rebuilds and garbage sweeps poll a [`Budget`] between units
//! of work. Readers that run out of budget return what they have assembled;
//! writers roll back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Shared flag a caller flips to abort an operation in flight.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Why an operation stopped before finishing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interrupt {
    Cancelled,
    DeadlineExceeded,
}

/// Cancellation flag plus optional deadline.
#[derive(Clone, Debug, Default)]
pub struct Budget {
    cancel: Option<CancelFlag>,
    deadline: Option<Instant>,
}

impl Budget {
    /// A budget that never runs out.
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, flag: CancelFlag) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Returns the reason to stop, if any.
    pub fn check(&self) -> Option<Interrupt> {
        if self.cancel.as_ref().is_some_and(CancelFlag::is_cancelled) {
            return Some(Interrupt::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Interrupt::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.check().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_never_interrupts() {
        assert_eq!(Budget::unlimited().check(), None);
    }

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let budget = Budget::unlimited().with_cancel(flag.clone());
        assert!(!budget.is_exhausted());
        flag.cancel();
        assert_eq!(budget.check(), Some(Interrupt::Cancelled));
    }

    #[test]
    fn test_elapsed_deadline() {
        let budget = Budget::unlimited().with_deadline(Instant::now());
        assert_eq!(budget.check(), Some(Interrupt::DeadlineExceeded));

        let budget = Budget::unlimited().with_timeout(Duration::from_secs(3600));
        assert_eq!(budget.check(), None);
    }

    #[test]
    fn test_cancel_takes_precedence_over_deadline() {
        let flag = CancelFlag::new();
        flag.cancel();
        let budget = Budget::unlimited()
            .with_deadline(Instant::now())
            .with_cancel(flag);
        assert_eq!(budget.check(), Some(Interrupt::Cancelled));
    }
}
