//! Settings shared by the server and its clients.

use std::path::PathBuf;
use std::time::Duration;

use crate::layout::DEFAULT_SLOT_COUNT;

/// Default shared memory object name.
pub const DEFAULT_REGION_NAME: &str = "/bufhub";

/// Default handshake socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/bufhub.sock";

/// Configuration for a hub. Server and clients must agree on the region name,
/// socket path and slot count.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// POSIX shared memory object name (leading `/`, no other slashes).
    pub region_name: String,
    /// Unix socket path of the handshake endpoint.
    pub socket_path: PathBuf,
    /// Number of data slots.
    pub slot_count: u32,
    /// Client-side bound on each request; `None` blocks until answered.
    pub request_timeout: Option<Duration>,
    /// How long a server worker waits for a request before checking for
    /// shutdown and pending reclamation.
    pub poll_interval: Duration,
    /// A lease whose owner has not completed the handshake by then is revoked.
    pub handshake_timeout: Duration,
    /// How long the server waits for a client to release its slot after Finish.
    pub release_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            region_name: DEFAULT_REGION_NAME.to_string(),
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            slot_count: DEFAULT_SLOT_COUNT,
            request_timeout: Some(Duration::from_secs(5)),
            poll_interval: Duration::from_millis(50),
            handshake_timeout: Duration::from_secs(5),
            release_timeout: Duration::from_secs(1),
        }
    }
}

impl HubConfig {
    /// Defaults, overridden by `BUFHUB_REGION`, `BUFHUB_SOCKET`, `BUFHUB_SLOTS`
    /// and `BUFHUB_TIMEOUT_MS` (`0` disables the request timeout).
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(name) = lookup("BUFHUB_REGION") {
            config.region_name = name;
        }
        if let Some(path) = lookup("BUFHUB_SOCKET") {
            config.socket_path = PathBuf::from(path);
        }
        if let Some(raw) = lookup("BUFHUB_SLOTS") {
            match raw.parse() {
                Ok(n) => config.slot_count = n,
                Err(_) => tracing::warn!(value = %raw, "ignoring invalid BUFHUB_SLOTS"),
            }
        }
        if let Some(raw) = lookup("BUFHUB_TIMEOUT_MS") {
            match raw.parse::<u64>() {
                Ok(0) => config.request_timeout = None,
                Ok(ms) => config.request_timeout = Some(Duration::from_millis(ms)),
                Err(_) => tracing::warn!(value = %raw, "ignoring invalid BUFHUB_TIMEOUT_MS"),
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let config = HubConfig::default();
        assert_eq!(config.region_name, "/bufhub");
        assert_eq!(config.slot_count, 7);
        assert_eq!(config.request_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("BUFHUB_REGION", "/other"),
            ("BUFHUB_SLOTS", "3"),
            ("BUFHUB_TIMEOUT_MS", "0"),
        ]
        .into_iter()
        .collect();
        let config = HubConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.region_name, "/other");
        assert_eq!(config.slot_count, 3);
        assert_eq!(config.request_timeout, None);
        assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
    }

    #[test]
    fn invalid_values_keep_defaults() {
        let config = HubConfig::from_lookup(|k| match k {
            "BUFHUB_SLOTS" => Some("many".into()),
            "BUFHUB_TIMEOUT_MS" => Some("-1".into()),
            _ => None,
        });
        assert_eq!(config.slot_count, DEFAULT_SLOT_COUNT);
        assert_eq!(config.request_timeout, Some(Duration::from_secs(5)));
    }
}
