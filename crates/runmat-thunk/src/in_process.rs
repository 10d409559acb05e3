//! In-process device: host memory standing in for device memory, a FIFO
//! command queue that only runs work when drained, and a direct convolution
//! runner for all three convolution kinds.

use anyhow::{anyhow, bail, ensure, Result};
use runmat_thunk_api::{
    BufferAllocations, BufferSlice, CommandQueue, ConvConfig, ConvKind, ConvParams, ConvRunner,
    DeviceAddress, ElementType, TupleRecord, WindowDim,
};
use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const ALLOCATION_SHIFT: u32 = 32;
const OFFSET_MASK: u64 = (1u64 << ALLOCATION_SHIFT) - 1;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Base address of allocation `index`. Allocation 0 starts at `1 << 32`, so no
/// valid address is ever null.
pub fn allocation_base(index: usize) -> u64 {
    (index as u64 + 1) << ALLOCATION_SHIFT
}

/// Backing bytes for every allocation of a [`HostArena`].
#[derive(Debug, Default)]
pub struct DeviceMemory {
    allocations: Vec<Vec<u8>>,
}

impl DeviceMemory {
    fn locate(&self, ptr: u64, len: usize) -> Result<(usize, usize)> {
        let index = (ptr >> ALLOCATION_SHIFT)
            .checked_sub(1)
            .ok_or_else(|| anyhow!("address {ptr:#x} is outside the arena"))?
            as usize;
        let offset = (ptr & OFFSET_MASK) as usize;
        let alloc = self
            .allocations
            .get(index)
            .ok_or_else(|| anyhow!("address {ptr:#x} names missing allocation {index}"))?;
        if offset.checked_add(len).map_or(true, |end| end > alloc.len()) {
            bail!(
                "access of {len} bytes at {ptr:#x} overruns allocation {index} ({} bytes)",
                alloc.len()
            );
        }
        Ok((index, offset))
    }

    pub fn contains(&self, ptr: u64, len: usize) -> bool {
        self.locate(ptr, len).is_ok()
    }

    pub fn read_bytes(&self, ptr: u64, len: usize) -> Result<&[u8]> {
        let (index, offset) = self.locate(ptr, len)?;
        Ok(&self.allocations[index][offset..offset + len])
    }

    pub fn write_bytes(&mut self, ptr: u64, bytes: &[u8]) -> Result<()> {
        let (index, offset) = self.locate(ptr, bytes.len())?;
        self.allocations[index][offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read_f32s(&self, ptr: u64, count: usize) -> Result<Vec<f32>> {
        let bytes = self.read_bytes(ptr, count * std::mem::size_of::<f32>())?;
        Ok(bytemuck::pod_collect_to_vec(bytes))
    }

    pub fn write_f32s(&mut self, ptr: u64, values: &[f32]) -> Result<()> {
        self.write_bytes(ptr, bytemuck::cast_slice(values))
    }
}

/// Host memory arena. One zeroed byte vector per planned allocation.
#[derive(Debug)]
pub struct HostArena {
    memory: Mutex<DeviceMemory>,
}

impl HostArena {
    pub fn new(allocation_sizes: &[usize]) -> Self {
        let allocations = allocation_sizes.iter().map(|&size| vec![0u8; size]).collect();
        Self {
            memory: Mutex::new(DeviceMemory { allocations }),
        }
    }

    pub fn with_memory<R>(&self, f: impl FnOnce(&mut DeviceMemory) -> Result<R>) -> Result<R> {
        let mut guard = self
            .memory
            .lock()
            .map_err(|_| anyhow!("host arena lock poisoned"))?;
        f(&mut guard)
    }

    pub fn allocation_count(&self) -> usize {
        self.memory
            .lock()
            .map(|guard| guard.allocations.len())
            .unwrap_or(0)
    }

    pub fn write_f32s(&self, slice: &BufferSlice, values: &[f32]) -> Result<()> {
        let addr = self.device_address(slice);
        ensure!(
            (values.len() * std::mem::size_of::<f32>()) as u64 <= addr.size,
            "{} values do not fit in {slice}",
            values.len()
        );
        self.with_memory(|mem| mem.write_f32s(addr.ptr, values))
    }

    pub fn read_f32s(&self, slice: &BufferSlice) -> Result<Vec<f32>> {
        let addr = self.device_address(slice);
        let count = addr.size as usize / std::mem::size_of::<f32>();
        self.with_memory(|mem| mem.read_f32s(addr.ptr, count))
    }

    /// Decode the tuple record currently stored in `slice`.
    pub fn read_tuple(&self, slice: &BufferSlice) -> Result<TupleRecord> {
        let addr = self.device_address(slice);
        self.with_memory(|mem| {
            let bytes = mem.read_bytes(addr.ptr, TupleRecord::SIZE_IN_BYTES)?;
            TupleRecord::from_bytes(bytes).ok_or_else(|| anyhow!("short tuple record in {slice}"))
        })
    }
}

impl BufferAllocations for HostArena {
    /// Slices whose offset does not fit the per-allocation address range
    /// resolve to null, which every access rejects.
    fn device_address(&self, slice: &BufferSlice) -> DeviceAddress {
        if slice.offset > OFFSET_MASK {
            log::debug!("slice {slice} does not fit the arena address space");
            return DeviceAddress::NULL;
        }
        let base = (slice.allocation as u64)
            .checked_add(1)
            .and_then(|index| index.checked_mul(1u64 << ALLOCATION_SHIFT));
        match base {
            Some(base) => DeviceAddress::new(base | slice.offset, slice.size),
            None => DeviceAddress::NULL,
        }
    }
}

type KernelFn = Box<dyn FnOnce(&mut DeviceMemory) -> Result<()> + Send>;

enum QueuedCommand {
    Kernel { name: String, run: KernelFn },
    HostToDevice { dst: DeviceAddress, bytes: Vec<u8> },
}

impl QueuedCommand {
    fn label(&self) -> String {
        match self {
            QueuedCommand::Kernel { name, .. } => name.clone(),
            QueuedCommand::HostToDevice { dst, bytes } => format!("h2d:{}@{:#x}", bytes.len(), dst.ptr),
        }
    }
}

/// FIFO command queue over a [`HostArena`].
///
/// Enqueued work runs only when [`InProcessQueue::synchronize`] drains the
/// queue. Once an error has latched, further submissions are dropped.
pub struct InProcessQueue {
    id: u64,
    arena: Arc<HostArena>,
    pending: Mutex<VecDeque<QueuedCommand>>,
    error: Mutex<Option<String>>,
    history: Mutex<Vec<String>>,
}

impl InProcessQueue {
    pub fn new(arena: Arc<HostArena>) -> Self {
        Self {
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            arena,
            pending: Mutex::new(VecDeque::new()),
            error: Mutex::new(None),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn arena(&self) -> &Arc<HostArena> {
        &self.arena
    }

    pub fn enqueue_kernel<F>(&self, name: impl Into<String>, run: F)
    where
        F: FnOnce(&mut DeviceMemory) -> Result<()> + Send + 'static,
    {
        self.push(QueuedCommand::Kernel {
            name: name.into(),
            run: Box::new(run),
        });
    }

    fn push(&self, command: QueuedCommand) {
        if !self.is_ok() {
            log::trace!("queue {}: dropping '{}' after error", self.id, command.label());
            return;
        }
        if let Ok(mut pending) = self.pending.lock() {
            pending.push_back(command);
        }
    }

    /// Latch an error into the queue state.
    pub fn poison(&self, message: impl Into<String>) {
        let message = message.into();
        if let Ok(mut slot) = self.error.lock() {
            if slot.is_none() {
                log::debug!("queue {}: error latched: {message}", self.id);
                *slot = Some(message);
            }
        }
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Labels of commands that have run, in execution order.
    pub fn history(&self) -> Vec<String> {
        self.history
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    /// Run every queued command in submission order. The first failure is
    /// latched, the remaining commands are discarded, and the error returned.
    pub fn synchronize(&self) -> Result<()> {
        loop {
            let next = self
                .pending
                .lock()
                .map_err(|_| anyhow!("queue {} lock poisoned", self.id))?
                .pop_front();
            let Some(command) = next else { break };
            let label = command.label();
            let outcome = self.arena.with_memory(|mem| match command {
                QueuedCommand::Kernel { run, .. } => run(mem),
                QueuedCommand::HostToDevice { dst, bytes } => mem.write_bytes(dst.ptr, &bytes),
            });
            if let Err(err) = outcome {
                let message = format!("'{label}' failed: {err}");
                self.poison(message.clone());
                if let Ok(mut pending) = self.pending.lock() {
                    pending.clear();
                }
                bail!("queue {}: {message}", self.id);
            }
            if let Ok(mut history) = self.history.lock() {
                history.push(label);
            }
        }
        match self.error() {
            Some(message) => Err(anyhow!("queue {}: {message}", self.id)),
            None => Ok(()),
        }
    }
}

impl CommandQueue for InProcessQueue {
    fn id(&self) -> u64 {
        self.id
    }

    fn enqueue_host_to_device(&self, dst: DeviceAddress, bytes: &[u8]) {
        if (bytes.len() as u64) > dst.size {
            self.poison(format!(
                "host-to-device copy of {} bytes into {dst} exceeds the destination",
                bytes.len()
            ));
            return;
        }
        let in_bounds = self
            .arena
            .with_memory(|mem| Ok(mem.contains(dst.ptr, bytes.len())))
            .unwrap_or(false);
        if !in_bounds {
            self.poison(format!(
                "host-to-device copy of {} bytes to {dst} is outside the arena",
                bytes.len()
            ));
            return;
        }
        self.push(QueuedCommand::HostToDevice {
            dst,
            bytes: bytes.to_vec(),
        });
    }

    fn is_ok(&self) -> bool {
        self.error.lock().map(|slot| slot.is_none()).unwrap_or(false)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Extents of one convolution, independent of which kind runs over it.
#[derive(Debug, Clone)]
struct ConvGeometry {
    batch: usize,
    in_features: usize,
    out_features: usize,
    in_spatial: Vec<usize>,
    out_spatial: Vec<usize>,
    window: Vec<WindowDim>,
    in_size: usize,
    out_size: usize,
    kernel_size: usize,
    input_len: usize,
    filter_len: usize,
    output_len: usize,
}

fn element_count(dims: &[usize]) -> Result<usize> {
    dims.iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| anyhow!("element count of {dims:?} overflows usize"))
}

impl ConvGeometry {
    fn new(config: &ConvConfig) -> Result<Self> {
        let rank = config.input_shape.len();
        ensure!(
            rank >= 3 && config.window.len() == rank - 2,
            "convolution needs rank >= 3 with one window entry per spatial dimension"
        );
        ensure!(
            config.filter_shape.len() == rank && config.output_shape.len() == rank,
            "input, filter and output ranks differ"
        );
        let batch = config.input_shape[0];
        let in_features = config.input_shape[1];
        let out_features = config.filter_shape[0];
        let in_spatial = config.input_shape[2..].to_vec();
        let out_spatial = config.output_shape[2..].to_vec();
        let in_size = element_count(&in_spatial)?;
        let out_size = element_count(&out_spatial)?;
        let kernel_dims: Vec<usize> = config.window.iter().map(|w| w.size).collect();
        let kernel_size = element_count(&kernel_dims)?;
        Ok(Self {
            batch,
            in_features,
            out_features,
            input_len: element_count(&[batch, in_features, in_size])?,
            filter_len: element_count(&[out_features, in_features, kernel_size])?,
            output_len: element_count(&[batch, out_features, out_size])?,
            in_size,
            out_size,
            kernel_size,
            in_spatial,
            out_spatial,
            window: config.window.clone(),
        })
    }

    fn input_len(&self) -> usize {
        self.input_len
    }

    fn filter_len(&self) -> usize {
        self.filter_len
    }

    fn output_len(&self) -> usize {
        self.output_len
    }

    /// Visit every (input, filter, output) element triple that contributes to
    /// the convolution, skipping taps that land in padding.
    fn for_each_tap(&self, mut f: impl FnMut(usize, usize, usize)) {
        let (in_size, out_size, kernel_size) = (self.in_size, self.out_size, self.kernel_size);
        let kernel_dims: Vec<usize> = self.window.iter().map(|w| w.size).collect();
        let rank = self.window.len();
        let mut out_pos = vec![0usize; rank];
        let mut tap = vec![0usize; rank];

        for n in 0..self.batch {
            for k in 0..self.out_features {
                for o in 0..out_size {
                    unravel(o, &self.out_spatial, &mut out_pos);
                    let y = (n * self.out_features + k) * out_size + o;
                    for c in 0..self.in_features {
                        for r in 0..kernel_size {
                            unravel(r, &kernel_dims, &mut tap);
                            let Some(i) = self.input_offset(&out_pos, &tap) else {
                                continue;
                            };
                            let x = (n * self.in_features + c) * in_size + i;
                            let w = (k * self.in_features + c) * kernel_size + r;
                            f(x, w, y);
                        }
                    }
                }
            }
        }
    }

    fn input_offset(&self, out_pos: &[usize], tap: &[usize]) -> Option<usize> {
        let mut linear = 0usize;
        for (axis, dim) in self.window.iter().enumerate() {
            let pos = (out_pos[axis] * dim.stride + tap[axis] * dim.dilation) as isize
                - dim.padding_low as isize;
            if pos < 0 || pos as usize >= self.in_spatial[axis] {
                return None;
            }
            linear = linear * self.in_spatial[axis] + pos as usize;
        }
        Some(linear)
    }
}

fn unravel(mut linear: usize, dims: &[usize], out: &mut [usize]) {
    for axis in (0..dims.len()).rev() {
        out[axis] = linear % dims[axis];
        linear /= dims[axis];
    }
}

/// Direct f32 convolution over [`InProcessQueue`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceConvRunner;

impl ReferenceConvRunner {
    pub const fn new() -> Self {
        Self
    }
}

fn check_extent(what: &str, addr: DeviceAddress, elements: usize) -> Result<()> {
    ensure!(!addr.is_null(), "{what} address is null");
    let needed = elements
        .checked_mul(std::mem::size_of::<f32>())
        .ok_or_else(|| anyhow!("{what} size of {elements} f32 values overflows"))?;
    ensure!(
        addr.size >= needed as u64,
        "{what} buffer {addr} holds fewer than {elements} f32 values"
    );
    Ok(())
}

impl ConvRunner for ReferenceConvRunner {
    fn name(&self) -> &str {
        "reference"
    }

    fn run(
        &self,
        params: &ConvParams,
        scratch: DeviceAddress,
        queue: &dyn CommandQueue,
    ) -> Result<()> {
        let queue = queue
            .as_any()
            .downcast_ref::<InProcessQueue>()
            .ok_or_else(|| anyhow!("reference convolution runner needs an in-process queue"))?;
        let config = &params.config;
        if config.element_type != ElementType::F32 {
            bail!(
                "reference convolution runner supports f32 only, got {:?}",
                config.element_type
            );
        }
        if config.feature_group_count != 1 {
            bail!(
                "reference convolution runner does not support {} feature groups",
                config.feature_group_count
            );
        }
        let geometry = ConvGeometry::new(config)?;
        check_extent("input", params.input, geometry.input_len())?;
        check_extent("filter", params.filter, geometry.filter_len())?;
        check_extent("output", params.output, geometry.output_len())?;
        log::trace!(
            "reference conv {}: algorithm {} scratch {}",
            params.kind,
            config.algorithm.algorithm,
            scratch
        );

        let kind = params.kind;
        let (input, filter, output) = (params.input.ptr, params.filter.ptr, params.output.ptr);
        let scale = config.result_scale as f32;
        queue.enqueue_kernel(format!("conv_{kind}"), move |mem| {
            let (dst, values) = match kind {
                ConvKind::Forward => {
                    let x = mem.read_f32s(input, geometry.input_len())?;
                    let w = mem.read_f32s(filter, geometry.filter_len())?;
                    let mut y = vec![0f32; geometry.output_len()];
                    geometry.for_each_tap(|xi, wi, yi| y[yi] += x[xi] * w[wi]);
                    (output, y)
                }
                ConvKind::BackwardInput => {
                    let dy = mem.read_f32s(output, geometry.output_len())?;
                    let w = mem.read_f32s(filter, geometry.filter_len())?;
                    let mut dx = vec![0f32; geometry.input_len()];
                    geometry.for_each_tap(|xi, wi, yi| dx[xi] += dy[yi] * w[wi]);
                    (input, dx)
                }
                ConvKind::BackwardFilter => {
                    let x = mem.read_f32s(input, geometry.input_len())?;
                    let dy = mem.read_f32s(output, geometry.output_len())?;
                    let mut dw = vec![0f32; geometry.filter_len()];
                    geometry.for_each_tap(|xi, wi, yi| dw[wi] += x[xi] * dy[yi]);
                    (filter, dw)
                }
            };
            let scaled: Vec<f32> = values.into_iter().map(|v| v * scale).collect();
            mem.write_f32s(dst, &scaled)
        });
        Ok(())
    }
}
