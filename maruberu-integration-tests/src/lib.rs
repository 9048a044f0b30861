//! Integration tests for `maruberu`
//!
//! This crate contains integration tests that drive the bell queue, its
//! worker and a storage backend together the way a request handler would.

// This is a test-only crate
#![cfg(test)]
