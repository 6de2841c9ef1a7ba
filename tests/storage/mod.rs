//! Shared storage integration tests.
//!
//! Tests the ProjectionStore interface against all implementations.
//! Each implementation module imports these test functions and runs them.

pub mod projection_store_tests;
