//! Shared test utilities for service, fetcher and chaos tests.
//!
//! This module provides:
//! - An in-memory upstream replica set (oplogs, readers, ranked sources)
//! - Recording implementations of the fetcher view and rollback handler
//! - Wait helpers over the service's watch channels

#![allow(dead_code)] // Each test binary uses a different subset

pub mod recording;
pub mod upstream;

pub use recording::*;
pub use upstream::*;
