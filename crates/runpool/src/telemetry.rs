//! Publishes pool metrics as `OpenTelemetry` observable gauges.
//!
//! Only compiled with the `metrics` feature.

use opentelemetry::metrics::{Meter, ObservableGauge};

use crate::pool::ProcessPool;

/// Gauge handles; keep them alive as long as the pool is observed.
pub struct PoolGauges {
    _counts: Vec<ObservableGauge<u64>>,
    _average: ObservableGauge<f64>,
}

/// Register one gauge per [`ProcessMetrics`](crate::pool::ProcessMetrics)
/// field, each reading a fresh snapshot when collected.
pub fn register_pool_gauges(meter: &Meter, pool: &ProcessPool) -> PoolGauges {
    let counter = |name: &'static str, description: &'static str, read: fn(&ProcessPool) -> u64| {
        let pool = pool.clone();
        meter
            .u64_observable_gauge(name)
            .with_description(description)
            .with_callback(move |observer| observer.observe(read(&pool), &[]))
            .build()
    };

    let counts = vec![
        counter(
            "runpool.executions.total",
            "Executions admitted",
            |p| p.metrics().total_executions,
        ),
        counter(
            "runpool.executions.completed",
            "Executions that ran to exit",
            |p| p.metrics().completed_processes,
        ),
        counter(
            "runpool.executions.failed",
            "Executions that failed to spawn, timed out or were killed",
            |p| p.metrics().failed_processes,
        ),
        counter("runpool.processes.active", "Registered processes", |p| {
            u64::try_from(p.active_process_count()).unwrap_or(u64::MAX)
        }),
    ];

    let average = {
        let pool = pool.clone();
        meter
            .f64_observable_gauge("runpool.executions.average_ms")
            .with_description("Running mean execution time")
            .with_unit("ms")
            .with_callback(move |observer| {
                observer.observe(pool.metrics().average_execution_time, &[]);
            })
            .build()
    };

    PoolGauges {
        _counts: counts,
        _average: average,
    }
}
