//! # keel
//!
//! The keel server library: HTTP API and configuration loading on top of
//! `keel-core`. The `keel` binary adds the CLI.

pub mod api;
pub mod config;
