//! Deterministic, pure logic shared by the pipeline.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod actions;
pub mod budget;
pub mod classifier;
pub mod error;
pub mod feature_spec;
pub mod intercept;
pub mod normalize;
pub mod path;
pub mod report;
pub mod scope;
pub mod state;
pub mod types;
