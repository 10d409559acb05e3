//! Logging setup for hosts embedding the thunk runtime.
//!
//! Library code logs through the `log` facade; [`init_logging`] bridges those
//! records into a `tracing` subscriber and forwards each event to an optional
//! hook as a [`ThunkLogRecord`].

use once_cell::sync::OnceCell;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::subscriber::DefaultGuard;
use tracing::Subscriber;
use tracing_log::{LogTracer, NormalizeEvent};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Layer;

use crate::config::LoggingConfig;

#[derive(Debug, Clone, Serialize)]
pub struct ThunkLogRecord {
    pub ts: String,
    pub level: String,
    pub target: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<JsonValue>,
}

type LogHook = Arc<dyn Fn(&ThunkLogRecord) + Send + Sync>;

static LOG_HOOK: OnceCell<LogHook> = OnceCell::new();

/// Install the hook receiving every log record. Only the first call wins.
pub fn set_log_hook<F>(hook: F)
where
    F: Fn(&ThunkLogRecord) + Send + Sync + 'static,
{
    let _ = LOG_HOOK.set(Arc::new(hook));
}

pub struct LoggingGuard {
    _guard: Option<DefaultGuard>,
}

#[derive(Clone, Default)]
pub struct LoggingOptions {
    /// Filter used when neither `RUST_LOG` nor `RUNMAT_THUNK_LOG` is set.
    pub default_filter: Option<String>,
    /// Also report span enter/exit to the hook.
    pub enable_traces: bool,
}

impl From<&LoggingConfig> for LoggingOptions {
    fn from(config: &LoggingConfig) -> Self {
        Self {
            default_filter: Some(config.filter.clone()),
            enable_traces: config.traces,
        }
    }
}

pub fn init_logging(opts: LoggingOptions) -> LoggingGuard {
    let _ = LogTracer::init();

    let fallback = opts.default_filter.clone().unwrap_or_else(|| "info".to_string());
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_from_env("RUNMAT_THUNK_LOG"))
        .or_else(|_| EnvFilter::try_new(&fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let build_subscriber = || {
        tracing_subscriber::registry()
            .with(env_filter.clone())
            .with(HookLayer {
                spans: opts.enable_traces,
            })
    };

    let guard = match tracing::subscriber::set_global_default(build_subscriber()) {
        Ok(()) => None,
        Err(_) => Some(tracing::subscriber::set_default(build_subscriber())),
    };

    LoggingGuard { _guard: guard }
}

struct HookLayer {
    spans: bool,
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn emit(record: ThunkLogRecord) {
    if let Some(hook) = LOG_HOOK.get() {
        hook(&record);
    }
}

impl<S> Layer<S> for HookLayer
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: tracing_subscriber::layer::Context<'_, S>) {
        if LOG_HOOK.get().is_none() {
            return;
        }
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);

        let span = ctx
            .event_span(event)
            .map(|span| span.metadata().name().to_string());
        // Records bridged from `log` carry their real target in normalized metadata.
        let normalized = event.normalized_metadata();
        let meta = normalized.as_ref().unwrap_or_else(|| event.metadata());
        emit(ThunkLogRecord {
            ts: now_rfc3339(),
            level: meta.level().to_string(),
            target: meta.target().to_string(),
            message: visitor
                .message
                .unwrap_or_else(|| event.metadata().name().to_string()),
            span,
            fields: visitor
                .fields
                .filter(|obj| obj.as_object().map(|m| !m.is_empty()).unwrap_or(false)),
        });
    }

    fn on_enter(&self, id: &tracing::span::Id, ctx: tracing_subscriber::layer::Context<'_, S>) {
        self.emit_span(id, &ctx, "enter");
    }

    fn on_exit(&self, id: &tracing::span::Id, ctx: tracing_subscriber::layer::Context<'_, S>) {
        self.emit_span(id, &ctx, "exit");
    }
}

impl HookLayer {
    fn emit_span<S>(
        &self,
        id: &tracing::span::Id,
        ctx: &tracing_subscriber::layer::Context<'_, S>,
        phase: &str,
    ) where
        S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        if !self.spans || LOG_HOOK.get().is_none() {
            return;
        }
        let Some(span) = ctx.span(id) else { return };
        let meta = span.metadata();
        emit(ThunkLogRecord {
            ts: now_rfc3339(),
            level: meta.level().to_string(),
            target: meta.target().to_string(),
            message: format!("{phase} {}", meta.name()),
            span: Some(meta.name().to_string()),
            fields: None,
        });
    }
}

#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    fields: Option<JsonValue>,
}

impl JsonVisitor {
    fn insert(&mut self, name: &str, value: JsonValue) {
        if name.starts_with("log.") {
            return;
        }
        let obj = self
            .fields
            .get_or_insert_with(|| JsonValue::Object(Default::default()));
        if let JsonValue::Object(map) = obj {
            map.insert(name.to_string(), value);
        }
    }
}

impl tracing::field::Visit for JsonVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}");
        if field.name() == "message" {
            self.message = Some(rendered);
        } else {
            self.insert(field.name(), JsonValue::String(rendered));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.insert(field.name(), JsonValue::String(value.to_string()));
        }
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.insert(field.name(), JsonValue::from(value));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.insert(field.name(), JsonValue::from(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn hook_receives_log_facade_records() {
        let captured: Arc<Mutex<Vec<ThunkLogRecord>>> = Arc::new(Mutex::new(Vec::new()));
        let hook = {
            let c = captured.clone();
            move |rec: &ThunkLogRecord| {
                c.lock().unwrap().push(rec.clone());
            }
        };
        set_log_hook(hook);
        let _guard = init_logging(LoggingOptions {
            default_filter: Some("trace".to_string()),
            enable_traces: true,
        });

        tracing::info!(queue = 3u64, "thunk log bridge");
        {
            let span = tracing::info_span!("thunk_dispatch");
            let _enter = span.enter();
        }

        let items = captured.lock().unwrap();
        let record = items
            .iter()
            .find(|r| r.message.contains("thunk log bridge"))
            .expect("event forwarded");
        assert_eq!(record.level, "INFO");
        assert_eq!(
            record.fields.as_ref().and_then(|f| f.get("queue")).cloned(),
            Some(JsonValue::from(3u64))
        );
        assert!(items.iter().any(|r| r.message == "enter thunk_dispatch"));
    }
}
