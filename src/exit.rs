//! Process exit contract.
//!
//! Success, outright failure, partially failed batches, and interrupted
//! runs each exit distinctly so scripts can tell them apart.

use crate::batch::BatchOutcome;

/// Exit disposition of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// Everything requested succeeded.
    Success,
    /// The run failed outright.
    Failure,
    /// A batch finished with a mix of successes and failures.
    Partial,
    /// The run was cancelled by the user.
    Interrupted,
}

impl ProcessExit {
    /// Conventional process exit code: 130 follows the shell convention
    /// for SIGINT-terminated commands.
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::Partial => 2,
            Self::Interrupted => 130,
        }
    }

    /// Classifies a finished batch.
    #[must_use]
    pub fn from_batch(outcome: &BatchOutcome) -> Self {
        if outcome.interrupted {
            return Self::Interrupted;
        }
        if outcome.is_complete_success() {
            return Self::Success;
        }
        let succeeded = outcome
            .outcomes
            .iter()
            .filter(|(_, target)| target.is_success())
            .count();
        if succeeded == 0 {
            Self::Failure
        } else {
            Self::Partial
        }
    }
}
