use std::sync::Once;

static INIT: Once = Once::new();

/// Installs env_logger once per test process.
pub fn init_default_logging() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}
