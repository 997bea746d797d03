use std::env;
use std::time::Duration;

use crate::protocol::{SESSION_PATH, UPLOAD_PATH};

/// Tidepool client configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// The session server address (defaults to "127.0.0.1:10101")
    pub session_server: String,
    /// Debounce window before the busy spinner becomes visible
    pub spin_delay: Duration,
    /// First reconnect delay; doubled per attempt up to `reconnect_max`
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let server = env::var("TIDEPOOL_SESSION_SERVER")
            .unwrap_or_else(|_| "127.0.0.1:10101".to_string());
        // Normalize localhost to IPv4 to avoid IPv6 (::1) preference on macOS
        let server = if server.starts_with("localhost:") {
            server.replacen("localhost", "127.0.0.1", 1)
        } else {
            server
        };
        let spin_delay = env_millis("TIDEPOOL_SPIN_DELAY_MS").unwrap_or(Duration::from_millis(500));
        Self {
            session_server: server,
            spin_delay,
            ..Self::default()
        }
    }

    /// WebSocket URL of the session channel
    pub fn session_url(&self) -> String {
        if self.session_server.starts_with("ws://") || self.session_server.starts_with("wss://") {
            format!("{}{}", self.session_server, SESSION_PATH)
        } else if is_local(&self.session_server) {
            format!("ws://{}{}", self.session_server, SESSION_PATH)
        } else {
            format!("wss://{}{}", self.session_server, SESSION_PATH)
        }
    }

    /// HTTP URL of the upload endpoint
    pub fn upload_url(&self) -> String {
        if is_local(&self.session_server) {
            format!("http://{}{}", self.session_server, UPLOAD_PATH)
        } else {
            format!("https://{}{}", self.session_server, UPLOAD_PATH)
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session_server: "127.0.0.1:10101".to_string(),
            spin_delay: Duration::from_millis(500),
            reconnect_initial: Duration::from_millis(250),
            reconnect_max: Duration::from_secs(5),
        }
    }
}

fn is_local(server: &str) -> bool {
    server.contains("127.0.0.1") || server.contains("localhost")
}

fn env_millis(var: &str) -> Option<Duration> {
    env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // Mutex to ensure environment variable tests don't run in parallel
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.session_server, "127.0.0.1:10101");
        assert_eq!(config.spin_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_config_from_env_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();

        let original = env::var("TIDEPOOL_SESSION_SERVER").ok();
        unsafe {
            env::set_var("TIDEPOOL_SESSION_SERVER", "localhost:9999");
        }
        let config = Config::from_env();
        assert_eq!(config.session_server, "127.0.0.1:9999");

        unsafe {
            if let Some(orig) = original {
                env::set_var("TIDEPOOL_SESSION_SERVER", orig);
            } else {
                env::remove_var("TIDEPOOL_SESSION_SERVER");
            }
        }
    }

    #[test]
    fn test_endpoint_urls() {
        let config = Config::default();
        assert_eq!(config.session_url(), "ws://127.0.0.1:10101/_s");
        assert_eq!(config.upload_url(), "http://127.0.0.1:10101/_f");

        let remote = Config {
            session_server: "pages.example.com".to_string(),
            ..Config::default()
        };
        assert_eq!(remote.session_url(), "wss://pages.example.com/_s");
        assert_eq!(remote.upload_url(), "https://pages.example.com/_f");
    }
}
