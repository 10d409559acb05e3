use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use runmat_thunk_api::ThunkError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    /// Number of profiled dispatch scopes closed.
    pub count: u64,
    /// Accumulated host wall time spent inside those scopes, in nanoseconds.
    pub total_wall_time_ns: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThunkTelemetrySnapshot {
    pub dispatch: DispatchStats,
    pub executions: u64,
    pub tuple_bytes_enqueued: u64,
    pub populate_failures: u64,
    pub dispatch_failures: u64,
    pub internal_failures: u64,
}

impl ThunkTelemetrySnapshot {
    pub fn failures(&self) -> u64 {
        self.populate_failures + self.dispatch_failures + self.internal_failures
    }
}

#[derive(Default)]
pub struct ThunkTelemetry {
    dispatch_count: AtomicU64,
    dispatch_wall_ns: AtomicU64,
    executions: AtomicU64,
    tuple_bytes: AtomicU64,
    populate_failures: AtomicU64,
    dispatch_failures: AtomicU64,
    internal_failures: AtomicU64,
}

impl ThunkTelemetry {
    pub const fn new() -> Self {
        Self {
            dispatch_count: AtomicU64::new(0),
            dispatch_wall_ns: AtomicU64::new(0),
            executions: AtomicU64::new(0),
            tuple_bytes: AtomicU64::new(0),
            populate_failures: AtomicU64::new(0),
            dispatch_failures: AtomicU64::new(0),
            internal_failures: AtomicU64::new(0),
        }
    }

    pub fn record_dispatch(&self, wall_ns: u64) {
        self.dispatch_count.fetch_add(1, Ordering::Relaxed);
        if wall_ns > 0 {
            self.dispatch_wall_ns.fetch_add(wall_ns, Ordering::Relaxed);
        }
    }

    pub fn record_dispatch_duration(&self, duration: Duration) {
        self.record_dispatch(saturating_duration_ns(duration));
    }

    pub fn record_execution(&self, tuple_bytes: u64) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        if tuple_bytes > 0 {
            self.tuple_bytes.fetch_add(tuple_bytes, Ordering::Relaxed);
        }
    }

    pub fn record_failure(&self, err: &ThunkError) {
        let counter = match err {
            ThunkError::Populate(_) => &self.populate_failures,
            ThunkError::Dispatch(_) => &self.dispatch_failures,
            ThunkError::Internal { .. } => &self.internal_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.dispatch_count.store(0, Ordering::Relaxed);
        self.dispatch_wall_ns.store(0, Ordering::Relaxed);
        self.executions.store(0, Ordering::Relaxed);
        self.tuple_bytes.store(0, Ordering::Relaxed);
        self.populate_failures.store(0, Ordering::Relaxed);
        self.dispatch_failures.store(0, Ordering::Relaxed);
        self.internal_failures.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ThunkTelemetrySnapshot {
        ThunkTelemetrySnapshot {
            dispatch: DispatchStats {
                count: self.dispatch_count.load(Ordering::Relaxed),
                total_wall_time_ns: self.dispatch_wall_ns.load(Ordering::Relaxed),
            },
            executions: self.executions.load(Ordering::Relaxed),
            tuple_bytes_enqueued: self.tuple_bytes.load(Ordering::Relaxed),
            populate_failures: self.populate_failures.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            internal_failures: self.internal_failures.load(Ordering::Relaxed),
        }
    }
}

fn saturating_duration_ns(duration: Duration) -> u64 {
    duration.as_nanos().min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_are_bucketed_by_stage() {
        let telemetry = ThunkTelemetry::new();
        telemetry.record_failure(&ThunkError::Populate(anyhow::anyhow!("x")));
        telemetry.record_failure(&ThunkError::Internal { thunk: "T" });
        telemetry.record_failure(&ThunkError::Internal { thunk: "T" });
        let snap = telemetry.snapshot();
        assert_eq!(snap.populate_failures, 1);
        assert_eq!(snap.dispatch_failures, 0);
        assert_eq!(snap.internal_failures, 2);
        assert_eq!(snap.failures(), 3);

        telemetry.reset();
        assert_eq!(telemetry.snapshot(), ThunkTelemetrySnapshot::default());
    }

    #[test]
    fn zero_duration_counts_without_time() {
        let telemetry = ThunkTelemetry::new();
        telemetry.record_dispatch_duration(Duration::ZERO);
        telemetry.record_dispatch_duration(Duration::from_micros(3));
        let snap = telemetry.snapshot();
        assert_eq!(snap.dispatch.count, 2);
        assert_eq!(snap.dispatch.total_wall_time_ns, 3_000);
    }
}
