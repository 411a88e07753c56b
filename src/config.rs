use std::time::Duration;

use serde::Deserialize;

/// Capacity of each subscription's outbound event buffer.
pub const SUBSCRIPTION_BUFFER: usize = 16;

/// Interval between keepalive pings on a subscription.
pub const PING_INTERVAL: Duration = Duration::from_secs(10);

/// Deadline applied to every outbound frame write, pings included.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(10);

/// Idle deadline for the subscription reader; extended on each pong.
pub const READ_DEADLINE: Duration = Duration::from_secs(60);

/// Largest inbound frame accepted on a subscription (1 MiB).
pub const MAX_FRAME_BYTES: usize = 1 << 20;

/// Upper bound on a single upstream request, streamed body included.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(3600);

/// Redirect hop limit for upstream requests.
pub const MAX_REDIRECTS: usize = 10;

/// Longest upstream error body retained in error messages (8 KiB).
pub const ERROR_SNIPPET_BYTES: usize = 8 << 10;

/// Connection settings for the upstream model catalog.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamConfig {
    /// Template for download URLs. Accepts `{id}`, `%s`, or a trailing slash.
    pub download_url: String,
    /// Template for model-version metadata URLs. Same expansion rules.
    pub model_info_url: String,
    /// Bearer token sent to the catalog host.
    pub api_key: String,
}

/// Top-level configuration for the gateway core.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// CORS origin allowed to call the API. `*` disables credentials.
    pub allowed_origins: String,
    /// Root directory the model and lora libraries resolve against.
    pub base_dir: String,
    /// Capacity of the download admission queue.
    pub queue_size: usize,
    /// Number of downloads allowed to run at once.
    pub max_concurrent: usize,
    pub upstream: UpstreamConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            allowed_origins: "*".to_string(),
            base_dir: String::new(),
            queue_size: 16,
            max_concurrent: 3,
            upstream: UpstreamConfig::default(),
        }
    }
}
