//! # opstats - Accelerator Trace to Op Statistics
//!
//! opstats turns one recorded trace space (a host plane plus TPU or GPU
//! device planes) into a single [`OpStats`](convert::OpStats) summary:
//! per-op time and cost on host and device, a per-step time breakdown,
//! kernel launch reports, function-call statistics and the run environment.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Trace space (JSON, XSpace)                     │
//! │   host plane  •  device planes  •  programs  •  diagnostics     │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ export::load_xspace
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    convert::op_stats                            │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │  op metrics  │   │ step events  │   │ kernel stats │  ...    │
//! │  │ (per plane)  │   │ (per plane)  │   │ (per plane)  │         │
//! │  └──────┬───────┘   └──────┬───────┘   └──────┬───────┘         │
//! │         └──── executor: one task per plane per kind ─┘          │
//! │                            │                                    │
//! │                            ▼                                    │
//! │   combine (op dbs, step union/intersection, duty cycle)         │
//! │                            │                                    │
//! │                            ▼                                    │
//! │   step db  •  run environment  •  perf env  •  function db      │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ export::write_op_stats_json
//!                         ▼
//!                   op stats (JSON)
//! ```
//!
//! ## Module Structure
//!
//! - [`domain`]: exact picosecond intervals, reserved core ids, errors
//! - [`metrics`]: op records, op-db builders and combiner, duty cycle
//! - [`steps`]: event classification, step events, the step database
//! - [`convert`]: per-plane passes, the worker pool, the pipeline
//! - [`export`]: trace loading and op-stats serialization
//! - [`cli`]: command-line arguments
//!
//! ## Key Concepts
//!
//! - **Self time**: an op's time minus the time of ops nested inside it
//! - **Step**: one iteration of the training/inference loop, identified by
//!   a group id shared by its events
//! - **Incomplete step**: a step whose first or last event lies outside
//!   the recorded window
//! - **Duty cycle**: the share of a chip's time spent running ops

pub mod cli;
pub mod convert;
pub mod domain;
pub mod export;
pub mod metrics;
pub mod steps;
