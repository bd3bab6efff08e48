//! # rustbit-tests
//!
//! Integration tests for the rustbit networking engine.
//!
//! This crate provides integration testing including:
//! - Decoder tests covering the inline and streaming decode paths
//! - Service tests running real connections over loopback TCP
//! - Property-based tests for the wire primitives

pub mod generators;
pub mod harness;


#[cfg(test)]
mod service_tests;


pub use generators::*;
pub use harness::*;
