//! Integration test crate for the compute marketplace.
//!
//! This crate exists solely to run integration tests that span the ledger
//! gateway and the job-market engine. It has no public API.

#![forbid(unsafe_code)]
