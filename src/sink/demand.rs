//! Demand accounting for a sink delivery pipeline.

/// Tracks how many batches downstream is ready to receive along with the
/// scheduling state of the pull which will satisfy that demand.
///
/// Demand signals arriving in rapid succession coalesce into a single
/// scheduled pull: the first signal schedules, the rest only accumulate. The
/// accumulator itself is pure state; the controller owns the actual timer.
#[derive(Debug, Default)]
pub struct DemandAccumulator {
    /// The number of batches downstream is currently ready to accept.
    outstanding: u64,
    /// A bool indicating that a pull has been scheduled and has not yet fired.
    pull_scheduled: bool,
}

impl DemandAccumulator {
    /// Record downstream readiness for `n` more batches.
    ///
    /// Returns true if a coalesced pull should now be scheduled.
    pub fn add(&mut self, n: u64) -> bool {
        self.outstanding = self.outstanding.saturating_add(n);
        self.request_pull()
    }

    /// Request that a pull be scheduled.
    ///
    /// Returns true only when demand is outstanding and no pull is already
    /// scheduled, preventing duplicate pulls for the same demand.
    pub fn request_pull(&mut self) -> bool {
        if self.pull_scheduled || self.outstanding == 0 {
            return false;
        }
        self.pull_scheduled = true;
        true
    }

    /// Clear the scheduled-pull flag as the scheduled pull fires.
    pub fn consume_pull_slot(&mut self) {
        self.pull_scheduled = false;
    }

    /// Decrement outstanding demand by the number of batches emitted.
    ///
    /// Demand floors at zero, it is never negative.
    pub fn consume_batches(&mut self, batches: u64) {
        self.outstanding = self.outstanding.saturating_sub(batches);
    }

    /// The number of batches downstream is currently ready to accept.
    pub fn outstanding(&self) -> u64 {
        self.outstanding
    }

    /// Whether a pull is currently scheduled.
    pub fn pull_scheduled(&self) -> bool {
        self.pull_scheduled
    }
}
