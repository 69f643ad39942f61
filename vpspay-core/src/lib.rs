#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![forbid(unsafe_code)]

pub mod chain;
pub mod config;
pub mod entities;
pub mod events;
pub mod executor;
pub mod framework;
pub mod ledger;
pub mod manager;
pub mod processors;
pub mod provisioning;
pub mod store;
pub mod utils;

pub use manager::{EngineTasks, Manager, ManagerError};
