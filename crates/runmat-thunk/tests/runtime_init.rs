use runmat_thunk::profiler::global_telemetry;
use runmat_thunk::{initialize_thunk_runtime_with, profiler_for, ThunkInitOptions};
use runmat_thunk_api::{
    clear_conv_runner, clear_param_populator, conv_runner, param_populator, scoped_profile,
    ConvDescriptor, ConvKind, ConvParamPopulator, ConvRunner, ElementType, WindowDim,
};

fn descriptor() -> ConvDescriptor {
    ConvDescriptor {
        name: "conv".to_string(),
        custom_call_target: ConvKind::BackwardFilter.custom_call_target().to_string(),
        input_shape: vec![2, 3, 8],
        filter_shape: vec![4, 3, 3],
        output_shape: vec![2, 4, 6],
        window: vec![WindowDim::unit(3)],
        feature_group_count: 1,
        element_type: ElementType::F32,
        backend_config: String::new(),
    }
}

// Single test: the registries are process-wide.
#[test]
fn initialization_registers_collaborators_once() {
    clear_param_populator();
    clear_conv_runner();

    initialize_thunk_runtime_with(&ThunkInitOptions {
        register_in_process_runner: false,
        default_algorithm: 7,
        profiling: true,
    });
    assert!(conv_runner().is_none());
    let populator = param_populator().expect("populator registered");
    let params = populator.populate(&descriptor()).unwrap();
    assert_eq!(params.kind, ConvKind::BackwardFilter);
    assert_eq!(params.config.algorithm.algorithm, 7);
    assert!(params.input.is_null() && params.filter.is_null() && params.output.is_null());

    // A second call fills in the runner but keeps the existing populator.
    initialize_thunk_runtime_with(&ThunkInitOptions::default());
    assert_eq!(conv_runner().map(|r| r.name().to_string()).as_deref(), Some("reference"));
    let params = param_populator().unwrap().populate(&descriptor()).unwrap();
    assert_eq!(params.config.algorithm.algorithm, 7);

    let before = global_telemetry().snapshot().dispatch.count;
    let profiler = profiler_for(&ThunkInitOptions::default());
    drop(scoped_profile(profiler.as_ref(), "conv"));
    assert_eq!(global_telemetry().snapshot().dispatch.count, before + 1);

    let silent = profiler_for(&ThunkInitOptions {
        profiling: false,
        ..ThunkInitOptions::default()
    });
    drop(scoped_profile(silent.as_ref(), "conv"));
    assert_eq!(global_telemetry().snapshot().dispatch.count, before + 1);

    clear_param_populator();
    clear_conv_runner();
}
