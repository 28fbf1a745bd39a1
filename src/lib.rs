//! Offline-durability and request-interception engine for live-data
//! dashboards.
//!
//! [`engine`] holds the interception logic and works as a plain library;
//! [`infra::http`] puts it behind a local proxy.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod infra;
