use once_cell::sync::Lazy;
use runmat_thunk_api::ExecutionProfiler;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::telemetry::ThunkTelemetry;

static GLOBAL_TELEMETRY: Lazy<Arc<ThunkTelemetry>> = Lazy::new(|| Arc::new(ThunkTelemetry::new()));

/// Process-wide telemetry shared by profilers created with
/// [`TracingProfiler::global`].
pub fn global_telemetry() -> Arc<ThunkTelemetry> {
    GLOBAL_TELEMETRY.clone()
}

struct OpenScope {
    span: tracing::Span,
    start: Instant,
}

/// Profiler that opens a `tracing` span for each scope and records its wall
/// time into a [`ThunkTelemetry`].
pub struct TracingProfiler {
    telemetry: Arc<ThunkTelemetry>,
    next_token: AtomicU64,
    open: Mutex<HashMap<u64, OpenScope>>,
}

impl TracingProfiler {
    pub fn new(telemetry: Arc<ThunkTelemetry>) -> Self {
        Self {
            telemetry,
            next_token: AtomicU64::new(1),
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn global() -> Self {
        Self::new(global_telemetry())
    }

    pub fn telemetry(&self) -> &Arc<ThunkTelemetry> {
        &self.telemetry
    }

    /// Scopes opened but not yet closed.
    pub fn open_scopes(&self) -> usize {
        self.open.lock().map(|open| open.len()).unwrap_or(0)
    }
}

impl ExecutionProfiler for TracingProfiler {
    fn begin(&self, label: &str) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let span = tracing::info_span!(
            "thunk_dispatch",
            op = %label,
            elapsed_us = tracing::field::Empty
        );
        // Stays entered until `end`.
        span.with_subscriber(|(id, dispatch)| dispatch.enter(id));
        match self.open.lock() {
            Ok(mut open) => {
                open.insert(
                    token,
                    OpenScope {
                        span,
                        start: Instant::now(),
                    },
                );
            }
            Err(_) => {
                span.with_subscriber(|(id, dispatch)| dispatch.exit(id));
            }
        }
        token
    }

    fn end(&self, token: u64) {
        let scope = self.open.lock().ok().and_then(|mut open| open.remove(&token));
        let Some(scope) = scope else {
            log::trace!("profiler: ignoring unknown scope token {token}");
            return;
        };
        let elapsed = scope.start.elapsed();
        scope.span.with_subscriber(|(id, dispatch)| dispatch.exit(id));
        scope
            .span
            .record("elapsed_us", elapsed.as_micros().min(u64::MAX as u128) as u64);
        self.telemetry.record_dispatch_duration(elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runmat_thunk_api::scoped_profile;

    #[test]
    fn scope_records_one_dispatch() {
        let profiler = TracingProfiler::new(Arc::new(ThunkTelemetry::new()));
        {
            let _scope = scoped_profile(&profiler, "conv.7");
            assert_eq!(profiler.open_scopes(), 1);
        }
        assert_eq!(profiler.open_scopes(), 0);
        assert_eq!(profiler.telemetry().snapshot().dispatch.count, 1);
    }

    #[test]
    fn scope_is_the_current_span_until_closed() {
        let subscriber = tracing_subscriber::registry();
        tracing::subscriber::with_default(subscriber, || {
            let profiler = TracingProfiler::new(Arc::new(ThunkTelemetry::new()));
            {
                let _scope = scoped_profile(&profiler, "conv.1");
                assert_eq!(
                    tracing::Span::current().metadata().map(|m| m.name()),
                    Some("thunk_dispatch")
                );
            }
            assert!(tracing::Span::current().metadata().is_none());
        });
    }

    #[test]
    fn unknown_token_is_ignored() {
        let profiler = TracingProfiler::new(Arc::new(ThunkTelemetry::new()));
        profiler.end(42);
        assert_eq!(profiler.telemetry().snapshot().dispatch.count, 0);
    }
}
