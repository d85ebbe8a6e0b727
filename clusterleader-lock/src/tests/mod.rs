mod stub_backend;

pub use stub_backend::{StubBackend, StubLock};

/// Route library logs to the test harness, filtered by `RUST_LOG`.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
