//! Shared value objects for the VPS payment-reconciliation engine.
//!
//! Everything in here is plain data that crosses a process or crate
//! boundary: token amounts, and the JSON frames of the live transfer feed.

#![forbid(unsafe_code)]

pub mod objects;
