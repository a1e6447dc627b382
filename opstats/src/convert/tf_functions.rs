//! Per-function aggregation of host function calls.
//!
//! Host events carrying a `tf_function_call` stat name one call of a traced
//! function. The stat encodes how the call ran:
//!
//! ```text
//!   <mode>-<compiler>     e.g. "traced-xla", "eager-nonXla"
//!
//!   mode:     eager | traced | notTraced | concrete
//!   compiler: xla | nonXla
//! ```
//!
//! Self time excludes nested function calls on the same line. Lines are
//! aggregated independently and then merged.

#![allow(clippy::cast_precision_loss)]

use std::collections::BTreeMap;

use log::warn;
use opstats_common::{EventView, StatType, XLine, XPlane};
use serde::Serialize;

use crate::convert::op_metrics_db::visit_nested;
use crate::domain::Timespan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Eager,
    TracedExecution,
    NotTracedExecution,
    ConcreteExecution,
}

impl ExecutionMode {
    /// Modes whose calls pay interpretation or retracing costs.
    #[must_use]
    pub fn is_expensive(self) -> bool {
        matches!(self, ExecutionMode::Eager | ExecutionMode::TracedExecution)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionCompiler {
    Xla,
    Other,
    /// Calls of one function disagreed on the compiler.
    Mixed,
}

/// Parses a `<mode>-<compiler>` call stat.
#[must_use]
pub fn parse_function_call(value: &str) -> Option<(ExecutionMode, FunctionCompiler)> {
    let (mode, compiler) = value.split_once('-')?;
    let mode = match mode {
        "eager" => ExecutionMode::Eager,
        "traced" => ExecutionMode::TracedExecution,
        "notTraced" => ExecutionMode::NotTracedExecution,
        "concrete" => ExecutionMode::ConcreteExecution,
        _ => return None,
    };
    let compiler = match compiler {
        "xla" => FunctionCompiler::Xla,
        "nonXla" => FunctionCompiler::Other,
        _ => return None,
    };
    Some((mode, compiler))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FunctionMetrics {
    pub count: u64,
    pub self_time_ps: u64,
}

/// All calls of one function.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TfFunction {
    pub metrics: BTreeMap<ExecutionMode, FunctionMetrics>,
    pub total_tracing_count: u64,
    pub compiler: FunctionCompiler,
    /// Share of self time spent in expensive modes, in percent.
    pub expensive_call_percent: f64,
}

impl TfFunction {
    fn new(compiler: FunctionCompiler) -> Self {
        Self {
            metrics: BTreeMap::new(),
            total_tracing_count: 0,
            compiler,
            expensive_call_percent: 0.0,
        }
    }

    fn merge_compiler(&mut self, compiler: FunctionCompiler) {
        if self.compiler != compiler {
            self.compiler = FunctionCompiler::Mixed;
        }
    }

    fn update_expensive_call_percent(&mut self) {
        let total_ps: u64 = self.metrics.values().map(|m| m.self_time_ps).sum();
        let expensive_ps: u64 = self
            .metrics
            .iter()
            .filter(|(mode, _)| mode.is_expensive())
            .map(|(_, m)| m.self_time_ps)
            .sum();
        self.expensive_call_percent =
            if total_ps == 0 { 0.0 } else { 100.0 * expensive_ps as f64 / total_ps as f64 };
    }
}

/// Function name → aggregated calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TfFunctionDb {
    pub tf_functions: BTreeMap<String, TfFunction>,
}

impl TfFunctionDb {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tf_functions.is_empty()
    }
}

struct FunctionCall<'a> {
    event: EventView<'a>,
    mode: ExecutionMode,
    compiler: FunctionCompiler,
}

/// Function calls of one host line.
#[must_use]
pub fn convert_host_threads_xline_to_tf_function_db(plane: &XPlane, line: &XLine) -> TfFunctionDb {
    let mut calls = Vec::new();
    for event in plane.events(line) {
        let Some(value) = event.stat(StatType::TfFunctionCall).and_then(|v| v.as_str()) else {
            continue;
        };
        let Some((mode, compiler)) = parse_function_call(value) else {
            warn!("Unrecognized function call '{value}' on {}", event.name());
            continue;
        };
        calls.push((Timespan::from_event(&event), FunctionCall { event, mode, compiler }));
    }

    let mut db = TfFunctionDb::default();
    visit_nested(calls, |call, span, children_ps| {
        let function = db
            .tf_functions
            .entry(call.event.name().to_string())
            .or_insert_with(|| TfFunction::new(call.compiler));
        function.merge_compiler(call.compiler);
        let tracing_count = call
            .event
            .stat(StatType::TfFunctionTracingCount)
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        function.total_tracing_count = function.total_tracing_count.max(tracing_count);
        let metrics = function.metrics.entry(call.mode).or_default();
        metrics.count += 1;
        metrics.self_time_ps += span.duration_ps() - children_ps;
    });
    for function in db.tf_functions.values_mut() {
        function.update_expensive_call_percent();
    }
    db
}

/// Merges `src` into `dst`: counts and self time summed, tracing count
/// maxed, disagreeing compilers become [`FunctionCompiler::Mixed`].
pub fn combine_tf_function_db(src: &TfFunctionDb, dst: &mut TfFunctionDb) {
    for (name, src_function) in &src.tf_functions {
        let Some(dst_function) = dst.tf_functions.get_mut(name) else {
            dst.tf_functions.insert(name.clone(), src_function.clone());
            continue;
        };
        dst_function.merge_compiler(src_function.compiler);
        dst_function.total_tracing_count =
            dst_function.total_tracing_count.max(src_function.total_tracing_count);
        for (&mode, metrics) in &src_function.metrics {
            let dst_metrics = dst_function.metrics.entry(mode).or_default();
            dst_metrics.count += metrics.count;
            dst_metrics.self_time_ps += metrics.self_time_ps;
        }
        dst_function.update_expensive_call_percent();
    }
}
