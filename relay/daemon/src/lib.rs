//! Relay Daemon library
//!
//! The HTTP surface of the relay, split from `main` so handlers can be
//! exercised in-process.

#![deny(missing_docs)]

pub mod server;

pub use server::{router, AppState};
