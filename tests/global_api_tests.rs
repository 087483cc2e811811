//! The process-global runtime behind the free functions
//!
//! Kept in its own test binary: the global runtime lives for the rest of the
//! process and is configured from the environment on first use.

use critrace::LifecycleState;
use tempfile::TempDir;

#[test]
fn test_free_functions_drive_one_global_runtime() {
    let dir = TempDir::new().unwrap();
    std::env::set_var("CRITRACE_OUTPUT_PATH", dir.path());
    std::env::set_var("CRITRACE_VERBOSE", "-1");
    std::env::set_var("CRITRACE_USE_METRICS", "false");

    critrace::set_mpi(false, false).unwrap();
    critrace::init("trace", false, "global-app").unwrap();
    assert_eq!(critrace::runtime().state(), LifecycleState::PreInit);
    assert!(!critrace::runtime().config().use_comm);

    // before Init the key lands in the configuration
    critrace::set_env("CRITRACE_USE_PID", "1").unwrap();
    assert!(critrace::runtime().config().use_pid);

    assert!(critrace::init_tooling().unwrap());
    assert_eq!(critrace::runtime().state(), LifecycleState::Active);
    assert!(!critrace::init_tooling().unwrap());

    critrace::push_trace("main").unwrap();
    critrace::push_region("inner").unwrap();
    critrace::pop_region("inner").unwrap();
    critrace::pop_trace("main").unwrap();

    let report = critrace::finalize().unwrap();
    assert!(report.performed);
    assert_eq!((report.pushed, report.popped), (2, 2));
    let expected = dir
        .path()
        .join(format!("trace-{}.msgpack", std::process::id()));
    assert_eq!(report.trace_file, Some(expected));

    assert_eq!(critrace::runtime().state(), LifecycleState::Finalized);
    assert!(!critrace::finalize().unwrap().performed);
}
