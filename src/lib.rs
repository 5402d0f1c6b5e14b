//! TOUCHLINE: live match event pipeline.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod dashboard;
pub mod engine;
pub mod error;
pub mod llm;
pub mod sources;
pub mod storage;
pub mod types;
