//! Iteration budget for the mission loop.

/// Upper bound on mission rounds. Zero means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IterationBudget {
    max_iterations: u32,
}

impl IterationBudget {
    pub fn new(max_iterations: u32) -> Self {
        Self { max_iterations }
    }

    /// Configured maximum, `None` when unbounded.
    pub fn limit(self) -> Option<u32> {
        (self.max_iterations > 0).then_some(self.max_iterations)
    }

    /// Whether the 1-indexed `round` may run.
    pub fn allows(self, round: u32) -> bool {
        self.limit().is_none_or(|max| round <= max)
    }
}
