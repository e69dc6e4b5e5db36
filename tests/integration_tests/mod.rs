//! Integration tests module
//!
//! End-to-end tests of the hexagon processor against a scripted search API:
//! - Base scan, subdivision and merged results
//! - Quota denial, failure isolation and retry

pub mod error_scenarios;
pub mod fixtures;
pub mod pipeline_test;
