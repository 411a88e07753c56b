// Backend gateway for a remote image/video generation worker — orchestrates
// model-asset downloads and pushes terminal events to browser clients.

use std::sync::Once;

use tracing::info;
use tracing_subscriber::EnvFilter;

pub mod config;
pub mod downloader;
pub mod hub;
pub mod server;
pub mod upstream;
pub mod util;
pub mod worker;

static INIT_TRACING: Once = Once::new();

/// Install the global tracing subscriber. Safe to call more than once.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();

        info!("gateway tracing initialized");
    });
}
