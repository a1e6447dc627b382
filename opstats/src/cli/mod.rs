//! Command-line interface for opstats
//!
//! This module contains CLI argument parsing and option selection

pub mod args;

pub use args::Args;
