//! Shared setup for bridge integration tests.

#![allow(dead_code)]

use hako_script::{ExecutionContext, Runtime};
use std::sync::Once;

static TRACING: Once = Once::new();

/// Route bridge logs through the test harness so they show up on failure.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

pub fn runtime_and_context() -> hako_script::Result<(Runtime, ExecutionContext)> {
    init_tracing();
    let runtime = Runtime::new()?;
    let context = runtime.create_context()?;
    Ok((runtime, context))
}
