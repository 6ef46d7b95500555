//! # carbon-node
//! Full-node assembly: persistent storage behind a key-value trait, startup
//! chain reload, and the wiring of chain manager, miner, and P2P service.

pub mod config;
pub mod node;
pub mod storage;

/// Install the global tracing subscriber, honoring `RUST_LOG`.
///
/// Call once from the embedding process; repeated calls are ignored.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}
