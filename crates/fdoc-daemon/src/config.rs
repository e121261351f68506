//! Listener tuning knobs.

use std::time::Duration;

use serde::Deserialize;

use fdoc_core::messages::to2::MTU_BYTES;

fn default_session_ttl_secs() -> u64 {
    // One hour: long enough for any handshake, short enough that an
    // abandoned bearer token dies.
    3600
}

fn default_to0_wait_seconds() -> u32 {
    // One day between owner re-registrations.
    86400
}

fn default_mtu_bytes() -> usize {
    MTU_BYTES
}

fn default_max_service_info_pages() -> usize {
    256
}

/// Configuration shared by the rendezvous and owner listeners.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// Protocol session retention window in seconds. A session that does
    /// not complete within it becomes inaccessible.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,

    /// Granted TO0 registration lifetime ceiling in seconds.
    #[serde(default = "default_to0_wait_seconds")]
    pub to0_wait_seconds: u32,

    /// Service-info page-size ceiling in bytes.
    #[serde(default = "default_mtu_bytes")]
    pub mtu_bytes: usize,

    /// Most device service-info pages one session will buffer.
    #[serde(default = "default_max_service_info_pages")]
    pub max_service_info_pages: usize,
}

impl ListenerConfig {
    /// Session retention window as a [`Duration`].
    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: default_session_ttl_secs(),
            to0_wait_seconds: default_to0_wait_seconds(),
            mtu_bytes: default_mtu_bytes(),
            max_service_info_pages: default_max_service_info_pages(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_fields() {
        let config: ListenerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.session_ttl(), Duration::from_secs(3600));
        assert_eq!(config.mtu_bytes, 1500);
        assert_eq!(config.max_service_info_pages, 256);
    }

    #[test]
    fn overrides_take_effect() {
        let config: ListenerConfig =
            serde_json::from_str(r#"{"session_ttl_secs": 120, "mtu_bytes": 1200}"#).unwrap();
        assert_eq!(config.session_ttl(), Duration::from_secs(120));
        assert_eq!(config.mtu_bytes, 1200);
        assert_eq!(config.to0_wait_seconds, 86400);
    }
}
