use runmat_thunk::config::ConfigLoader;
use runmat_thunk::initialize_thunk_runtime_from;
use runmat_thunk::logging::{set_log_hook, ThunkLogRecord};
use runmat_thunk_api::scoped_profile;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

// Single test: logging and the registries are process-wide.
#[test]
fn logging_section_of_the_config_reaches_the_hook() {
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

    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("thunk.yaml");
    std::fs::write(&path, "logging:\n  filter: debug\n  traces: true\n").unwrap();
    let config = ConfigLoader::load_from_file(&path).unwrap();

    let runtime = initialize_thunk_runtime_from(config);
    assert!(runtime.config.logging.traces);
    assert!(runtime.options.register_in_process_runner);
    drop(scoped_profile(runtime.profiler().as_ref(), "conv.9"));

    let records = captured.lock().unwrap();
    assert!(records.iter().any(|r| r.message == "enter thunk_dispatch"));
    assert!(records.iter().any(|r| r.message == "exit thunk_dispatch"));
    let registered = records
        .iter()
        .find(|r| r.message.contains("reference convolution runner"))
        .expect("runner registration logged");
    assert_eq!(registered.level, "INFO");
    assert_eq!(registered.target, "runmat_thunk");
}
