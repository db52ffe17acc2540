//! Resilience patterns for backend calls.

pub mod retry;
