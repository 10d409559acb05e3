//! RunMat Thunk: execution of planned GPU operations.
//!
//! - `conv_thunk`: the convolution thunk (forward, backward-input,
//!   backward-filter) that resolves slices, dispatches to the registered
//!   runner and writes the `[result, scratch]` tuple record.
//! - `populate`: default descriptor → parameter populator.
//! - `in_process`: host-memory device, FIFO queue and reference runner.
//! - `profiler` / `telemetry`: the dispatch instrumentation hook.
//! - `config` / `logging`: ambient setup for embedding hosts.

use once_cell::sync::OnceCell;
use runmat_thunk_api::{ExecutionProfiler, NoopProfiler};

use crate::config::{ConfigLoader, ThunkRuntimeConfig};
use crate::logging::{init_logging, LoggingGuard, LoggingOptions};

pub mod config;
pub mod conv_thunk;
pub mod in_process;
pub mod logging;
pub mod populate;
pub mod profiler;
pub mod telemetry;

pub use conv_thunk::ConvolutionThunk;
pub use in_process::{HostArena, InProcessQueue, ReferenceConvRunner};
pub use populate::DescriptorPopulator;
pub use profiler::TracingProfiler;
pub use telemetry::{ThunkTelemetry, ThunkTelemetrySnapshot};

/// Options controlling which collaborators get registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThunkInitOptions {
    pub register_in_process_runner: bool,
    pub default_algorithm: i64,
    pub profiling: bool,
}

impl Default for ThunkInitOptions {
    fn default() -> Self {
        Self {
            register_in_process_runner: true,
            default_algorithm: -1,
            profiling: true,
        }
    }
}

static POPULATOR: OnceCell<DescriptorPopulator> = OnceCell::new();
static REFERENCE_RUNNER: ReferenceConvRunner = ReferenceConvRunner::new();

/// Register the default populator and, when requested, the in-process runner.
///
/// Collaborators that are already registered are left alone, so calling this
/// more than once is harmless.
pub fn initialize_thunk_runtime_with(options: &ThunkInitOptions) {
    if runmat_thunk_api::param_populator().is_none() {
        let populator = POPULATOR
            .get_or_init(|| DescriptorPopulator::with_default_algorithm(options.default_algorithm));
        runmat_thunk_api::register_param_populator(populator);
        log::info!(
            "RunMat Thunk: descriptor populator registered (default algorithm {})",
            populator.default_algorithm()
        );
    }

    if runmat_thunk_api::conv_runner().is_some() {
        return;
    }
    if options.register_in_process_runner {
        runmat_thunk_api::register_conv_runner(&REFERENCE_RUNNER);
        log::info!("RunMat Thunk: using in-process reference convolution runner");
    } else {
        log::info!(
            "RunMat Thunk: no convolution runner registered; a device backend must provide one"
        );
    }
}

/// A runtime set up from [`config::ThunkRuntimeConfig`]. Holds the logging
/// guard, so keep it alive for as long as logging is wanted.
pub struct ThunkRuntime {
    pub config: ThunkRuntimeConfig,
    pub options: ThunkInitOptions,
    _logging: LoggingGuard,
}

impl ThunkRuntime {
    pub fn profiler(&self) -> Box<dyn ExecutionProfiler> {
        profiler_for(&self.options)
    }
}

/// Load the configuration (defaults if it cannot be loaded), then initialize
/// logging and the collaborators from it.
pub fn initialize_thunk_runtime() -> ThunkRuntime {
    match ConfigLoader::load() {
        Ok(config) => initialize_thunk_runtime_from(config),
        Err(err) => {
            let runtime = initialize_thunk_runtime_from(ThunkRuntimeConfig::default());
            log::warn!("RunMat Thunk: failed to load configuration, using defaults: {err:#}");
            runtime
        }
    }
}

pub fn initialize_thunk_runtime_from(config: ThunkRuntimeConfig) -> ThunkRuntime {
    let logging = init_logging(LoggingOptions::from(&config.logging));
    let options = config.to_init_options();
    initialize_thunk_runtime_with(&options);
    ThunkRuntime {
        config,
        options,
        _logging: logging,
    }
}

/// The profiler matching `options`: a [`TracingProfiler`] feeding the global
/// telemetry, or a no-op.
pub fn profiler_for(options: &ThunkInitOptions) -> Box<dyn ExecutionProfiler> {
    if options.profiling {
        Box::new(TracingProfiler::global())
    } else {
        Box::new(NoopProfiler)
    }
}
