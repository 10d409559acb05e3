//! RunMat Thunk API: the vocabulary shared between planned GPU operations and
//! device backends.
//!
//! A thunk is one statically planned unit of device work. It names its memory
//! through [`BufferSlice`]s, which only become concrete [`DeviceAddress`]es once
//! an execution supplies a [`BufferAllocations`] arena. Work is submitted to a
//! caller-provided [`CommandQueue`]; nothing in this crate blocks on device
//! completion.
//!
//! Convolution parameter population and the convolution implementation itself
//! are pluggable through [`ConvParamPopulator`] and [`ConvRunner`], registered
//! process-wide (or per thread) the same way acceleration providers are.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;
use thiserror::Error;

/// Custom-call target naming a forward convolution.
pub const CONV_FORWARD_TARGET: &str = "__cudnn$convForward";
/// Custom-call target naming a convolution gradient with respect to its input.
pub const CONV_BACKWARD_INPUT_TARGET: &str = "__cudnn$convBackwardInput";
/// Custom-call target naming a convolution gradient with respect to its filter.
pub const CONV_BACKWARD_FILTER_TARGET: &str = "__cudnn$convBackwardFilter";

/// A contiguous span inside one allocation of the program's memory arena.
///
/// Slices are plain descriptors: they never own memory and carry no address
/// until resolved through [`BufferAllocations::device_address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferSlice {
    pub allocation: usize,
    pub offset: u64,
    pub size: u64,
}

impl BufferSlice {
    pub const fn new(allocation: usize, offset: u64, size: u64) -> Self {
        Self {
            allocation,
            offset,
            size,
        }
    }
}

impl fmt::Display for BufferSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "alloc#{}[{}..{}]",
            self.allocation,
            self.offset,
            self.offset.saturating_add(self.size)
        )
    }
}

/// Concrete device memory for the duration of one execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceAddress {
    pub ptr: u64,
    pub size: u64,
}

impl DeviceAddress {
    pub const NULL: DeviceAddress = DeviceAddress { ptr: 0, size: 0 };

    pub const fn new(ptr: u64, size: u64) -> Self {
        Self { ptr, size }
    }

    /// Raw device pointer value.
    pub const fn opaque(&self) -> u64 {
        self.ptr
    }

    pub const fn is_null(&self) -> bool {
        self.ptr == 0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}+{}", self.ptr, self.size)
    }
}

/// Resolves slices to addresses for the current execution.
///
/// Resolution is read-only: it never mutates allocation state and is assumed
/// to succeed for any slice the planner handed out.
pub trait BufferAllocations: Send + Sync {
    fn device_address(&self, slice: &BufferSlice) -> DeviceAddress;
}

/// An ordered, asynchronous device work queue.
///
/// Everything enqueued on one queue executes in submission order. Enqueue
/// failures do not surface as return values; they latch into the queue's
/// error state, which [`CommandQueue::is_ok`] reads without draining.
pub trait CommandQueue: Send + Sync {
    fn id(&self) -> u64 {
        0
    }

    /// Enqueue a copy of `bytes` into device memory at `dst`. The bytes are
    /// captured at enqueue time, so the caller may drop them immediately.
    fn enqueue_host_to_device(&self, dst: DeviceAddress, bytes: &[u8]);

    /// Synchronous status read. Does not wait for queued work.
    fn is_ok(&self) -> bool;

    /// Access to the concrete queue for backends that need their own commands.
    fn as_any(&self) -> &dyn Any;
}

/// Which convolution variant a thunk computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvKind {
    Forward,
    BackwardInput,
    BackwardFilter,
}

impl ConvKind {
    pub fn custom_call_target(&self) -> &'static str {
        match self {
            ConvKind::Forward => CONV_FORWARD_TARGET,
            ConvKind::BackwardInput => CONV_BACKWARD_INPUT_TARGET,
            ConvKind::BackwardFilter => CONV_BACKWARD_FILTER_TARGET,
        }
    }

    pub fn from_custom_call_target(target: &str) -> Option<Self> {
        match target {
            CONV_FORWARD_TARGET => Some(ConvKind::Forward),
            CONV_BACKWARD_INPUT_TARGET => Some(ConvKind::BackwardInput),
            CONV_BACKWARD_FILTER_TARGET => Some(ConvKind::BackwardFilter),
            _ => None,
        }
    }
}

impl fmt::Display for ConvKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvKind::Forward => write!(f, "forward"),
            ConvKind::BackwardInput => write!(f, "backward_input"),
            ConvKind::BackwardFilter => write!(f, "backward_filter"),
        }
    }
}

impl FromStr for ConvKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(kind) = ConvKind::from_custom_call_target(s) {
            return Ok(kind);
        }
        match s.trim().to_ascii_lowercase().as_str() {
            "forward" | "fwd" => Ok(ConvKind::Forward),
            "backward_input" | "backward-input" | "bwd_input" => Ok(ConvKind::BackwardInput),
            "backward_filter" | "backward-filter" | "bwd_filter" => Ok(ConvKind::BackwardFilter),
            other => Err(format!("unknown convolution kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    F16,
    F32,
    F64,
}

impl ElementType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            ElementType::F16 => 2,
            ElementType::F32 => 4,
            ElementType::F64 => 8,
        }
    }
}

/// One spatial dimension of a convolution window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowDim {
    pub size: usize,
    pub stride: usize,
    pub padding_low: usize,
    pub padding_high: usize,
    #[serde(default = "default_dilation")]
    pub dilation: usize,
}

fn default_dilation() -> usize {
    1
}

impl WindowDim {
    pub const fn unit(size: usize) -> Self {
        Self {
            size,
            stride: 1,
            padding_low: 0,
            padding_high: 0,
            dilation: 1,
        }
    }
}

/// The static operation descriptor a convolution thunk is planned from.
///
/// Shapes follow a fixed layout: input `[N, C, spatial..]`, filter
/// `[O, I, spatial..]`, output `[N, O, spatial..]`, all row-major. For the
/// backward kinds the shapes still describe the forward-pass tensors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvDescriptor {
    pub name: String,
    pub custom_call_target: String,
    pub input_shape: Vec<usize>,
    pub filter_shape: Vec<usize>,
    pub output_shape: Vec<usize>,
    pub window: Vec<WindowDim>,
    #[serde(default = "default_feature_group_count")]
    pub feature_group_count: usize,
    pub element_type: ElementType,
    /// JSON-encoded backend configuration; empty means defaults.
    #[serde(default)]
    pub backend_config: String,
}

fn default_feature_group_count() -> usize {
    1
}

/// Algorithm selection handed through to the runner untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlgorithmConfig {
    /// `-1` lets the runner choose.
    pub algorithm: i64,
    pub tensor_ops_enabled: bool,
}

impl Default for AlgorithmConfig {
    fn default() -> Self {
        Self {
            algorithm: -1,
            tensor_ops_enabled: false,
        }
    }
}

/// Shape and algorithm configuration for one convolution invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvConfig {
    pub input_shape: Vec<usize>,
    pub filter_shape: Vec<usize>,
    pub output_shape: Vec<usize>,
    pub window: Vec<WindowDim>,
    pub feature_group_count: usize,
    pub element_type: ElementType,
    pub algorithm: AlgorithmConfig,
    pub result_scale: f64,
}

impl ConvConfig {
    pub fn spatial_rank(&self) -> usize {
        self.window.len()
    }
}

/// A convolution parameter record: kind, the three tensor addresses, and the
/// configuration. Built fresh for each execution and discarded after dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvParams {
    pub kind: ConvKind,
    pub input: DeviceAddress,
    pub filter: DeviceAddress,
    pub output: DeviceAddress,
    pub config: ConvConfig,
}

impl ConvParams {
    /// A record with every address still null.
    pub fn unresolved(kind: ConvKind, config: ConvConfig) -> Self {
        Self {
            kind,
            input: DeviceAddress::NULL,
            filter: DeviceAddress::NULL,
            output: DeviceAddress::NULL,
            config,
        }
    }
}

/// The two-slot pointer record written into a tuple-result slice.
///
/// Slot 0 holds the pointer to the tensor the operation produced, slot 1 the
/// scratch pointer. Consumers rely on this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TupleRecord {
    pub result: u64,
    pub scratch: u64,
}

impl TupleRecord {
    pub const SLOTS: usize = 2;
    pub const SIZE_IN_BYTES: usize = Self::SLOTS * std::mem::size_of::<u64>();

    pub fn new(result: DeviceAddress, scratch: DeviceAddress) -> Self {
        Self {
            result: result.opaque(),
            scratch: scratch.opaque(),
        }
    }

    pub fn slots(&self) -> [u64; 2] {
        [self.result, self.scratch]
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE_IN_BYTES] {
        let slots = self.slots().map(u64::to_le);
        let mut out = [0u8; Self::SIZE_IN_BYTES];
        out.copy_from_slice(bytemuck::cast_slice(&slots));
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE_IN_BYTES {
            return None;
        }
        let slots: Vec<u64> = bytemuck::pod_collect_to_vec(&bytes[..Self::SIZE_IN_BYTES]);
        Some(Self {
            result: u64::from_le(slots[0]),
            scratch: u64::from_le(slots[1]),
        })
    }
}

/// Derives a [`ConvParams`] record (addresses left null) from a descriptor.
pub trait ConvParamPopulator: Send + Sync {
    fn populate(&self, descriptor: &ConvDescriptor) -> anyhow::Result<ConvParams>;
}

/// Enqueues a convolution whose addresses are fully populated.
///
/// Returning `Ok` only means the work was accepted onto `queue`; it may not
/// have run yet.
pub trait ConvRunner: Send + Sync {
    fn name(&self) -> &str {
        "conv-runner"
    }

    fn run(
        &self,
        params: &ConvParams,
        scratch: DeviceAddress,
        queue: &dyn CommandQueue,
    ) -> anyhow::Result<()>;
}

/// Instrumentation hook for thunk execution.
pub trait ExecutionProfiler: Send + Sync {
    /// Open a scope and return a token identifying it.
    fn begin(&self, label: &str) -> u64;
    /// Close the scope opened by `begin`.
    fn end(&self, token: u64);
}

/// Open a profiling scope that is closed when the returned guard drops.
pub fn scoped_profile<'a>(profiler: &'a dyn ExecutionProfiler, label: &str) -> ScopedProfile<'a> {
    let token = profiler.begin(label);
    ScopedProfile { profiler, token }
}

pub struct ScopedProfile<'a> {
    profiler: &'a dyn ExecutionProfiler,
    token: u64,
}

impl Drop for ScopedProfile<'_> {
    fn drop(&mut self) {
        self.profiler.end(self.token);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProfiler;

impl ExecutionProfiler for NoopProfiler {
    fn begin(&self, _label: &str) -> u64 {
        0
    }

    fn end(&self, _token: u64) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThunkKind {
    Convolution,
}

#[derive(Debug, Error)]
pub enum ThunkError {
    /// The operation descriptor could not be turned into parameters.
    #[error(transparent)]
    Populate(anyhow::Error),
    /// The device implementation rejected or failed to enqueue the work.
    #[error(transparent)]
    Dispatch(anyhow::Error),
    /// The queue reported an error after all work was enqueued.
    #[error("{thunk}::execute_on_queue failed")]
    Internal { thunk: &'static str },
}

impl ThunkError {
    pub fn stage(&self) -> &'static str {
        match self {
            ThunkError::Populate(_) => "populate",
            ThunkError::Dispatch(_) => "dispatch",
            ThunkError::Internal { .. } => "internal",
        }
    }
}

/// One planned unit of device work.
pub trait Thunk: Send + Sync {
    fn kind(&self) -> ThunkKind;

    /// Name of the operation this thunk was planned from.
    fn name(&self) -> &str;

    /// Enqueue this thunk's work on `queue`. Returns once enqueue completes,
    /// not once the device finishes.
    fn execute_on_queue(
        &self,
        allocations: &dyn BufferAllocations,
        queue: &dyn CommandQueue,
        profiler: &dyn ExecutionProfiler,
    ) -> Result<(), ThunkError>;
}

static GLOBAL_POPULATOR: Lazy<RwLock<Option<&'static dyn ConvParamPopulator>>> =
    Lazy::new(|| RwLock::new(None));
static GLOBAL_RUNNER: Lazy<RwLock<Option<&'static dyn ConvRunner>>> =
    Lazy::new(|| RwLock::new(None));

thread_local! {
    static THREAD_POPULATOR: Cell<Option<&'static dyn ConvParamPopulator>> = Cell::new(None);
    static THREAD_RUNNER: Cell<Option<&'static dyn ConvRunner>> = Cell::new(None);
}

/// Register the process-wide convolution parameter populator.
pub fn register_param_populator(populator: &'static dyn ConvParamPopulator) {
    if let Ok(mut guard) = GLOBAL_POPULATOR.write() {
        *guard = Some(populator);
    }
}

/// The populator for the current thread: a thread override if one is set,
/// otherwise the global registration.
pub fn param_populator() -> Option<&'static dyn ConvParamPopulator> {
    if let Some(p) = THREAD_POPULATOR.with(|cell| cell.get()) {
        return Some(p);
    }
    GLOBAL_POPULATOR
        .read()
        .ok()
        .and_then(|guard| guard.as_ref().copied())
}

/// Clear the global populator. Intended for tests.
pub fn clear_param_populator() {
    if let Ok(mut guard) = GLOBAL_POPULATOR.write() {
        *guard = None;
    }
}

/// Register the process-wide convolution runner.
pub fn register_conv_runner(runner: &'static dyn ConvRunner) {
    if let Ok(mut guard) = GLOBAL_RUNNER.write() {
        *guard = Some(runner);
    }
}

pub fn conv_runner() -> Option<&'static dyn ConvRunner> {
    if let Some(r) = THREAD_RUNNER.with(|cell| cell.get()) {
        return Some(r);
    }
    GLOBAL_RUNNER
        .read()
        .ok()
        .and_then(|guard| guard.as_ref().copied())
}

/// Clear the global runner. Intended for tests.
pub fn clear_conv_runner() {
    if let Ok(mut guard) = GLOBAL_RUNNER.write() {
        *guard = None;
    }
}

/// Overrides the populator for the current thread until dropped.
pub struct ThreadPopulatorGuard {
    prev: Option<&'static dyn ConvParamPopulator>,
}

impl ThreadPopulatorGuard {
    pub fn set(populator: Option<&'static dyn ConvParamPopulator>) -> Self {
        let prev = THREAD_POPULATOR.with(|cell| cell.replace(populator));
        ThreadPopulatorGuard { prev }
    }
}

impl Drop for ThreadPopulatorGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        THREAD_POPULATOR.with(|cell| cell.set(prev));
    }
}

/// Overrides the runner for the current thread until dropped.
pub struct ThreadRunnerGuard {
    prev: Option<&'static dyn ConvRunner>,
}

impl ThreadRunnerGuard {
    pub fn set(runner: Option<&'static dyn ConvRunner>) -> Self {
        let prev = THREAD_RUNNER.with(|cell| cell.replace(runner));
        ThreadRunnerGuard { prev }
    }
}

impl Drop for ThreadRunnerGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        THREAD_RUNNER.with(|cell| cell.set(prev));
    }
}
