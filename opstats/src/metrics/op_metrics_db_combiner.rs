//! Additive merging of op-metrics dbs.

use crate::metrics::op_metrics::{combine_memory_breakdown, OpMetrics, OpMetricsDb, PrecisionStats};
use crate::metrics::op_metrics_db_builder::OpMetricsDbBuilder;

/// Folds source dbs into a destination db, keyed by `(hlo_module_id, name)`.
#[derive(Debug)]
pub struct OpMetricsDbCombiner<'a> {
    builder: OpMetricsDbBuilder<'a>,
}

impl<'a> OpMetricsDbCombiner<'a> {
    pub fn new(dst: &'a mut OpMetricsDb) -> Self {
        Self { builder: OpMetricsDbBuilder::new(dst) }
    }

    /// Adds `src` into the destination. With `update_num_cores`, the core
    /// counts of matching records are summed.
    pub fn combine(&mut self, src: &OpMetricsDb, update_num_cores: bool) {
        let dst = self.builder.db_mut();
        dst.total_time_ps += src.total_time_ps;
        dst.total_op_time_ps += src.total_op_time_ps;
        dst.idle_time_ps += src.idle_time_ps;
        dst.busy_time_ps += src.busy_time_ps;
        dst.total_host_infeed_enq_duration_ps += src.total_host_infeed_enq_duration_ps;
        dst.total_host_infeed_enq_start_timestamp_ps_diff +=
            src.total_host_infeed_enq_start_timestamp_ps_diff;
        if let Some(src_precision) = src.precision_stats {
            let precision = dst.precision_stats.get_or_insert_with(PrecisionStats::default);
            precision.compute_16bit_ps += src_precision.compute_16bit_ps;
            precision.compute_32bit_ps += src_precision.compute_32bit_ps;
        }

        for src_metrics in &src.metrics_db {
            let dst_metrics =
                self.builder.lookup_or_insert(src_metrics.hlo_module_id, &src_metrics.name);
            copy_metadata(src_metrics, dst_metrics);
            combine_op_metrics(src_metrics, dst_metrics, update_num_cores);
        }
    }

    #[must_use]
    pub fn db(&self) -> &OpMetricsDb {
        self.builder.db()
    }
}

fn copy_metadata(src: &OpMetrics, dst: &mut OpMetrics) {
    if dst.category.is_empty() {
        dst.category.clone_from(&src.category);
    }
    if dst.provenance.is_empty() {
        dst.provenance.clone_from(&src.provenance);
    }
    if dst.long_name.is_empty() {
        dst.long_name.clone_from(&src.long_name);
    }
    if dst.deduplicated_name.is_empty() {
        dst.deduplicated_name.clone_from(&src.deduplicated_name);
    }
    if dst.source_info.is_none() {
        dst.source_info.clone_from(&src.source_info);
    }
    if dst.children.is_empty() {
        dst.children.clone_from(&src.children);
    }
}

fn combine_op_metrics(src: &OpMetrics, dst: &mut OpMetrics, update_num_cores: bool) {
    dst.min_time_ps = if dst.occurrences == 0 {
        src.min_time_ps
    } else if src.occurrences == 0 {
        dst.min_time_ps
    } else {
        dst.min_time_ps.min(src.min_time_ps)
    };
    dst.is_eager |= src.is_eager;
    dst.occurrences += src.occurrences;
    dst.time_ps += src.time_ps;
    dst.self_time_ps += src.self_time_ps;
    dst.dma_stall_ps += src.dma_stall_ps;
    dst.flops += src.flops;
    dst.model_flops += src.model_flops;
    dst.bytes_accessed += src.bytes_accessed;
    combine_memory_breakdown(&mut dst.memory_accessed_breakdown, &src.memory_accessed_breakdown, 1);
    if update_num_cores {
        dst.num_cores += src.num_cores;
    } else {
        dst.num_cores = dst.num_cores.max(src.num_cores);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::op_metrics::{add_idle_op, IDLE_OP_NAME};

    fn db(ops: &[(&str, u64, u64)], total_time_ps: u64) -> OpMetricsDb {
        let mut db = OpMetricsDb { total_time_ps, ..OpMetricsDb::default() };
        for &(name, occurrences, time_ps) in ops {
            db.metrics_db.push(OpMetrics {
                category: format!("{name}-category"),
                occurrences,
                time_ps,
                self_time_ps: time_ps,
                min_time_ps: time_ps / occurrences.max(1),
                num_cores: 1,
                flops: 10 * occurrences,
                ..OpMetrics::new(1, name)
            });
            db.total_op_time_ps += time_ps;
        }
        add_idle_op(&mut db);
        db
    }

    #[test]
    fn test_combine_is_additive() {
        let a = db(&[("conv", 2, 40), ("relu", 1, 5)], 100);
        let b = db(&[("conv", 1, 10)], 50);
        let mut dst = OpMetricsDb::default();
        let mut combiner = OpMetricsDbCombiner::new(&mut dst);
        combiner.combine(&a, true);
        combiner.combine(&b, true);

        assert_eq!(dst.total_time_ps, 150);
        assert_eq!(dst.total_op_time_ps, 55);
        let conv = dst.find(1, "conv").unwrap();
        assert_eq!(conv.occurrences, 3);
        assert_eq!(conv.time_ps, 50);
        assert_eq!(conv.min_time_ps, 10);
        assert_eq!(conv.flops, 30);
        assert_eq!(conv.num_cores, 2);
        assert_eq!(conv.category, "conv-category");
        // Both IDLE records fold into one.
        let idle = dst.find(0, IDLE_OP_NAME).unwrap();
        assert_eq!(idle.self_time_ps, 95);
        assert_eq!(dst.metrics_db.len(), 3);
    }

    #[test]
    fn test_combine_without_core_update_keeps_max() {
        let a = db(&[("conv", 1, 4)], 10);
        let mut dst = OpMetricsDb::default();
        let mut combiner = OpMetricsDbCombiner::new(&mut dst);
        combiner.combine(&a, false);
        combiner.combine(&a, false);
        assert_eq!(dst.find(1, "conv").unwrap().num_cores, 1);
    }

    #[test]
    fn test_precision_stats_summed() {
        let mut a = OpMetricsDb::default();
        a.precision_stats = Some(PrecisionStats { compute_16bit_ps: 3, compute_32bit_ps: 1 });
        let mut dst = OpMetricsDb::default();
        let mut combiner = OpMetricsDbCombiner::new(&mut dst);
        combiner.combine(&a, false);
        combiner.combine(&a, false);
        assert_eq!(
            dst.precision_stats,
            Some(PrecisionStats { compute_16bit_ps: 6, compute_32bit_ps: 2 })
        );
    }
}
