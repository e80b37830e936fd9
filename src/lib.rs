//! Directed connectivity metrics over Granger-causality matrices, with a
//! content-addressed SQLite cache of analysis results.

pub mod aggregate;
pub mod batch;
pub mod compare;
pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod graph;
pub mod loader;
pub mod matrix;
pub mod metadata;
pub mod metrics;
pub mod query;
pub mod registry;
pub mod tables;

#[cfg(test)]
mod testutil;

pub use error::{Error, Result};
