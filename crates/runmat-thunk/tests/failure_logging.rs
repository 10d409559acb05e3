use runmat_thunk::logging::{init_logging, set_log_hook, LoggingOptions, ThunkLogRecord};
use runmat_thunk::{ConvolutionThunk, DescriptorPopulator, HostArena, InProcessQueue};
use runmat_thunk_api::{
    BufferSlice, ConvDescriptor, ConvKind, ElementType, NoopProfiler, Thunk,
    ThreadPopulatorGuard, ThreadRunnerGuard, WindowDim,
};
use std::sync::{Arc, Mutex};

static POPULATOR: DescriptorPopulator = DescriptorPopulator::new();

fn thunk(operands: usize) -> ConvolutionThunk {
    let descriptor = ConvDescriptor {
        name: "conv.warn".to_string(),
        custom_call_target: ConvKind::Forward.custom_call_target().to_string(),
        input_shape: vec![1, 1, 4],
        filter_shape: vec![1, 1, 2],
        output_shape: vec![1, 1, 3],
        window: vec![WindowDim::unit(2)],
        feature_group_count: 1,
        element_type: ElementType::F32,
        backend_config: String::new(),
    };
    let slots = [BufferSlice::new(0, 0, 16), BufferSlice::new(1, 0, 8)];
    ConvolutionThunk::new(
        descriptor,
        slots[..operands].to_vec(),
        BufferSlice::new(2, 0, 12),
        BufferSlice::new(3, 0, 64),
        BufferSlice::new(4, 0, 16),
    )
}

// Single test: the log hook and subscriber are process-wide.
#[test]
fn failure_paths_without_a_collaborator_error_still_warn() {
    std::env::remove_var("RUST_LOG");
    std::env::remove_var("RUNMAT_THUNK_LOG");
    let captured: Arc<Mutex<Vec<ThunkLogRecord>>> = Arc::new(Mutex::new(Vec::new()));
    let hook = {
        let c = captured.clone();
        move |rec: &ThunkLogRecord| {
            c.lock().unwrap().push(rec.clone());
        }
    };
    set_log_hook(hook);
    let _guard = init_logging(LoggingOptions {
        default_filter: Some("warn".to_string()),
        enable_traces: false,
    });

    let arena = Arc::new(HostArena::new(&[16, 8, 12, 64, 16]));
    let queue = InProcessQueue::new(arena.clone());

    {
        let _p = ThreadPopulatorGuard::set(None);
        let _r = ThreadRunnerGuard::set(None);
        let err = thunk(2)
            .execute_on_queue(arena.as_ref(), &queue, &NoopProfiler)
            .unwrap_err();
        assert_eq!(err.stage(), "populate");
    }
    {
        let _p = ThreadPopulatorGuard::set(Some(&POPULATOR));
        let _r = ThreadRunnerGuard::set(None);
        let err = thunk(2)
            .execute_on_queue(arena.as_ref(), &queue, &NoopProfiler)
            .unwrap_err();
        assert_eq!(err.stage(), "dispatch");

        let err = thunk(1)
            .execute_on_queue(arena.as_ref(), &queue, &NoopProfiler)
            .unwrap_err();
        assert_eq!(err.stage(), "populate");
    }

    let warnings: Vec<String> = captured
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.level == "WARN" && r.target == "runmat_thunk::conv_thunk")
        .map(|r| r.message.clone())
        .collect();
    for expected in [
        "no populator registered for 'conv.warn'",
        "no runner registered for 'conv.warn'",
        "'conv.warn' has no operand 1",
    ] {
        assert!(
            warnings.iter().any(|m| m.contains(expected)),
            "missing warning {expected:?} in {warnings:?}"
        );
    }
}
