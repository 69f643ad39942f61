//! Reconciler configuration.

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Blocks after which a settled record can no longer be reverted by a
    /// retraction.
    pub confirmations: i64,
    /// How many blocks an open recharge stays eligible for a deposit.
    pub matching_window: i64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            confirmations: 60,
            matching_window: 2880,
        }
    }
}
