//! SHARPLINE: cached multi-book odds feed with arbitrage and middle detection.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod bankroll;
pub mod cache;
pub mod config;
pub mod engine;
pub mod feed;
pub mod strategy;
pub mod types;
