use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a test-writer subscriber once per test binary.
///
/// Filtering follows `RUST_LOG`, defaulting to warnings from this crate.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cowtree=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}
