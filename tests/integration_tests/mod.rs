//! Integration tests module
//!
//! End-to-end tests of the relay engine against the in-memory store and
//! transport:
//! - Scheduler passes against the metadata cache
//! - Publish path from source feed to target channel
//! - Failure routing through the retry queue
//! - Cache invalidation on change notifications

pub mod cache_test;
pub mod publish_test;
pub mod retry_test;
pub mod scheduling_test;
