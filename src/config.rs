//! Hub configuration.
//!
//! The deployable surface is injected via environment variables; library
//! users construct [`HubConfig`] directly. Defaults match the tuning of
//! the reference deployment.

use std::time::Duration;

/// Configuration for [`crate::hub::CollabHub`].
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Secret used to verify bearer tokens (HS256).
    pub jwt_secret: String,
    /// Allowed `Origin` header value. `None` disables the origin check.
    pub cors_origin: Option<String>,
    /// Periodic snapshot interval per live replica.
    pub save_interval: Duration,
    /// Merged updates since the last save that force a snapshot.
    pub update_threshold: u32,
    /// Idle age past which an empty-room replica is retired by the reaper.
    pub inactive_timeout: Duration,
    /// Reaper wakeup period.
    pub cleanup_check_interval: Duration,
    /// Outbound buffer capacity per session; a session that saturates it
    /// is kicked and must resync on reconnect.
    pub outbound_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9480".to_string(),
            jwt_secret: String::new(),
            cors_origin: None,
            save_interval: Duration::from_secs(30),
            update_threshold: 50,
            inactive_timeout: Duration::from_secs(5 * 60),
            cleanup_check_interval: Duration::from_secs(60),
            outbound_capacity: 256,
        }
    }
}

impl HubConfig {
    /// Load configuration from `COWRITE_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("COWRITE_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(secret) = std::env::var("COWRITE_JWT_SECRET") {
            config.jwt_secret = secret;
        }
        if let Ok(origin) = std::env::var("COWRITE_CORS_ORIGIN") {
            if !origin.is_empty() {
                config.cors_origin = Some(origin);
            }
        }
        if let Some(secs) = env_u64("COWRITE_SAVE_INTERVAL_SECS") {
            config.save_interval = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("COWRITE_UPDATE_THRESHOLD") {
            config.update_threshold = n as u32;
        }
        if let Some(secs) = env_u64("COWRITE_INACTIVE_TIMEOUT_SECS") {
            config.inactive_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("COWRITE_CLEANUP_CHECK_INTERVAL_SECS") {
            config.cleanup_check_interval = Duration::from_secs(secs);
        }
        config
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
