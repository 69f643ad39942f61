//! Runtime configuration types.
//!
//! These are the validated values the engine runs with. Loading and parsing
//! the configuration file is handled by the server crate.

mod executor;
mod ledger;
mod provisioner;
mod reconciler;
mod watcher;

pub use executor::ExecutorConfig;
pub use ledger::LedgerConfig;
pub use provisioner::ProvisionerConfig;
pub use reconciler::ReconcilerConfig;
pub use watcher::WatcherConfig;

use std::time::Duration;

/// Everything the [`Manager`](crate::manager::Manager) needs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub ledger: LedgerConfig,
    pub watcher: WatcherConfig,
    pub reconciler: ReconcilerConfig,
    pub executor: ExecutorConfig,
    pub provisioner: ProvisionerConfig,
    /// How long a bus request waits for its response.
    pub request_timeout: Duration,
}
