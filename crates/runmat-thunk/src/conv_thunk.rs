use anyhow::anyhow;
use std::sync::Arc;

use runmat_thunk_api::{
    conv_runner, param_populator, scoped_profile, BufferAllocations, BufferSlice, CommandQueue,
    ConvDescriptor, ConvKind, ConvParams, DeviceAddress, ExecutionProfiler, Thunk, ThunkError,
    ThunkKind, TupleRecord,
};

use crate::telemetry::ThunkTelemetry;

const THUNK_NAME: &str = "ConvolutionThunk";

/// Executes one planned convolution: fills the parameter record's addresses,
/// hands it to the registered [`runmat_thunk_api::ConvRunner`], then writes the
/// `[result, scratch]` tuple record behind it on the same queue.
///
/// Slices are held as given. The planner guarantees they are reserved for this
/// operation, so no locking happens here.
#[derive(Clone)]
pub struct ConvolutionThunk {
    descriptor: ConvDescriptor,
    operand_buffers: Vec<BufferSlice>,
    result_buffer: BufferSlice,
    scratch_buffer: BufferSlice,
    tuple_result_buffer: BufferSlice,
    telemetry: Option<Arc<ThunkTelemetry>>,
}

impl ConvolutionThunk {
    pub fn new(
        descriptor: ConvDescriptor,
        operand_slices: Vec<BufferSlice>,
        result_slice: BufferSlice,
        scratch_slice: BufferSlice,
        tuple_result_slice: BufferSlice,
    ) -> Self {
        Self {
            descriptor,
            operand_buffers: operand_slices,
            result_buffer: result_slice,
            scratch_buffer: scratch_slice,
            tuple_result_buffer: tuple_result_slice,
            telemetry: None,
        }
    }

    /// Count executions and failures of this thunk into `telemetry`.
    pub fn with_telemetry(mut self, telemetry: Arc<ThunkTelemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn descriptor(&self) -> &ConvDescriptor {
        &self.descriptor
    }

    pub fn operand_buffers(&self) -> &[BufferSlice] {
        &self.operand_buffers
    }

    pub fn result_buffer(&self) -> BufferSlice {
        self.result_buffer
    }

    pub fn scratch_buffer(&self) -> BufferSlice {
        self.scratch_buffer
    }

    pub fn tuple_result_buffer(&self) -> BufferSlice {
        self.tuple_result_buffer
    }

    fn operand(&self, index: usize) -> Result<&BufferSlice, ThunkError> {
        self.operand_buffers.get(index).ok_or_else(|| {
            log::warn!(
                "{}: '{}' has no operand {}",
                THUNK_NAME,
                self.descriptor.name,
                index
            );
            ThunkError::Populate(anyhow!(
                "{}: convolution '{}' needs operand {} but was planned with {}",
                THUNK_NAME,
                self.descriptor.name,
                index,
                self.operand_buffers.len()
            ))
        })
    }

    /// Fill the input/filter/output addresses for `params.kind`.
    fn assign_buffers(
        &self,
        params: &mut ConvParams,
        allocations: &dyn BufferAllocations,
    ) -> Result<(), ThunkError> {
        let resolve = |slice: &BufferSlice| allocations.device_address(slice);
        let (input, filter, output) = match params.kind {
            ConvKind::Forward => (
                resolve(self.operand(0)?),
                resolve(self.operand(1)?),
                resolve(&self.result_buffer),
            ),
            ConvKind::BackwardInput => (
                resolve(&self.result_buffer),
                resolve(self.operand(1)?),
                resolve(self.operand(0)?),
            ),
            ConvKind::BackwardFilter => (
                resolve(self.operand(0)?),
                resolve(&self.result_buffer),
                resolve(self.operand(1)?),
            ),
        };
        params.input = input;
        params.filter = filter;
        params.output = output;
        Ok(())
    }
}

/// The address holding the tensor this kind produces. Inverse of
/// `assign_buffers`: it always lands on the result slice.
fn result_address(params: &ConvParams) -> DeviceAddress {
    match params.kind {
        ConvKind::Forward => params.output,
        ConvKind::BackwardInput => params.input,
        ConvKind::BackwardFilter => params.filter,
    }
}

impl Thunk for ConvolutionThunk {
    fn kind(&self) -> ThunkKind {
        ThunkKind::Convolution
    }

    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn execute_on_queue(
        &self,
        allocations: &dyn BufferAllocations,
        queue: &dyn CommandQueue,
        profiler: &dyn ExecutionProfiler,
    ) -> Result<(), ThunkError> {
        let outcome = self.enqueue(allocations, queue, profiler);
        if let Some(telemetry) = &self.telemetry {
            match &outcome {
                Ok(()) => telemetry.record_execution(TupleRecord::SIZE_IN_BYTES as u64),
                Err(err) => telemetry.record_failure(err),
            }
        }
        outcome
    }
}

impl ConvolutionThunk {
    fn enqueue(
        &self,
        allocations: &dyn BufferAllocations,
        queue: &dyn CommandQueue,
        profiler: &dyn ExecutionProfiler,
    ) -> Result<(), ThunkError> {
        let populator = param_populator().ok_or_else(|| {
            log::warn!("{}: no populator registered for '{}'", THUNK_NAME, self.name());
            ThunkError::Populate(anyhow!("no convolution parameter populator registered"))
        })?;
        let mut params = populator.populate(&self.descriptor).map_err(|err| {
            log::warn!("{}: populate failed for '{}': {err}", THUNK_NAME, self.name());
            ThunkError::Populate(err)
        })?;
        log::debug!(
            "{}: executing '{}' ({}) on queue {}",
            THUNK_NAME,
            self.name(),
            params.kind,
            queue.id()
        );

        self.assign_buffers(&mut params, allocations)?;
        let scratch = allocations.device_address(&self.scratch_buffer);
        log::trace!(
            "{}: input={} filter={} output={} scratch={}",
            THUNK_NAME,
            params.input,
            params.filter,
            params.output,
            scratch
        );

        let runner = conv_runner().ok_or_else(|| {
            log::warn!("{}: no runner registered for '{}'", THUNK_NAME, self.name());
            ThunkError::Dispatch(anyhow!("no convolution runner registered"))
        })?;
        {
            let _scope = scoped_profile(profiler, self.name());
            runner.run(&params, scratch, queue).map_err(|err| {
                log::warn!(
                    "{}: runner '{}' failed for '{}': {err}",
                    THUNK_NAME,
                    runner.name(),
                    self.name()
                );
                ThunkError::Dispatch(err)
            })?;
        }

        let record = TupleRecord::new(result_address(&params), scratch);
        let tuple_addr = allocations.device_address(&self.tuple_result_buffer);
        queue.enqueue_host_to_device(tuple_addr, &record.to_bytes());

        if !queue.is_ok() {
            log::warn!(
                "{}: queue {} reported an error after '{}'",
                THUNK_NAME,
                queue.id(),
                self.name()
            );
            return Err(ThunkError::Internal { thunk: THUNK_NAME });
        }
        log::debug!("{}: '{}' enqueued", THUNK_NAME, self.name());
        Ok(())
    }
}
