use serde::Deserialize;
use std::time::Duration;

/// Top-level harness configuration. Every section is optional in YAML.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub mock: MockConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }
}

/// Settings for the in-process proxy service.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProxyConfig {
    /// Loopback port to listen on. "0" lets the OS pick.
    pub listen_port: String,
    pub connect_timeout_ms: u64,
    /// Upper bound for each PRELOGIN / LOGIN7 read during credential injection.
    pub handshake_timeout_ms: u64,
    pub packet_size: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_port: "0".to_string(),
            connect_timeout_ms: 5_000,
            handshake_timeout_ms: 5_000,
            packet_size: 4_096,
        }
    }
}

impl ProxyConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Settings for the mock TDS target.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MockConfig {
    /// Advisory accept deadline. Zero waits forever.
    pub accept_timeout_ms: u64,
    pub read_timeout_ms: u64,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            accept_timeout_ms: 10_000,
            read_timeout_ms: 5_000,
        }
    }
}

impl MockConfig {
    pub fn accept_timeout(&self) -> Option<Duration> {
        (self.accept_timeout_ms > 0).then(|| Duration::from_millis(self.accept_timeout_ms))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Settings for the bundled TDS client executor.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClientConfig {
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub app_name: String,
    pub workstation: String,
    pub packet_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            read_timeout_ms: 5_000,
            app_name: "tds-harness".to_string(),
            workstation: "tds-harness".to_string(),
            packet_size: 4_096,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// Fallback filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
