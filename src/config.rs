//! Gateway configuration.
//!
//! Every option has a default matching the protocol's operational
//! envelope; a JSON file can override any subset. There are no CLI
//! subcommands, the binary takes at most a config path.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen: ListenConfig,
    pub session: SessionConfig,
    pub reaper: ReaperConfig,
    pub decoder: DecoderConfig,
    pub publish: PublishConfig,
    pub command: CommandConfig,
    pub topics: TopicsConfig,
}

impl GatewayConfig {
    /// Load configuration from a JSON file, filling omitted fields with
    /// their defaults.
    pub fn load(path: &Path) -> anyhow::Result<GatewayConfig> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub port: u16,
    /// Seconds without a frame before an authenticated connection is
    /// considered dead.
    pub read_timeout_s: u64,
    /// Seconds a socket write may take before the connection is failed.
    pub write_timeout_s: u64,
}

impl Default for ListenConfig {
    fn default() -> ListenConfig {
        ListenConfig {
            port: 5023,
            read_timeout_s: 180,
            write_timeout_s: 10,
        }
    }
}

impl ListenConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_s)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_s)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle ceiling for authenticated sessions, seconds.
    pub idle_timeout_s: u64,
    /// How long a connection may sit without logging in, seconds.
    pub unauth_timeout_s: u64,
    /// Floor between last-activity writes per session, milliseconds.
    pub touch_min_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            idle_timeout_s: 600,
            unauth_timeout_s: 60,
            touch_min_interval_ms: 1000,
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_s)
    }

    pub fn unauth_timeout(&self) -> Duration {
        Duration::from_secs(self.unauth_timeout_s)
    }

    pub fn touch_min_interval(&self) -> Duration {
        Duration::from_millis(self.touch_min_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub interval_s: u64,
}

impl Default for ReaperConfig {
    fn default() -> ReaperConfig {
        ReaperConfig { interval_s: 60 }
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_s)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub max_frame_bytes: usize,
    pub search_window_bytes: usize,
    /// Decode failures tolerated within `failure_window_s` before the
    /// connection is closed.
    pub failure_limit: usize,
    pub failure_window_s: u64,
}

impl Default for DecoderConfig {
    fn default() -> DecoderConfig {
        DecoderConfig {
            max_frame_bytes: 1024,
            search_window_bytes: 100,
            failure_limit: 16,
            failure_window_s: 30,
        }
    }
}

impl DecoderConfig {
    pub fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_s)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub queue_capacity: usize,
    pub retry_max: u32,
    /// Base delay of the publish retry backoff, milliseconds.
    pub retry_base_ms: u64,
}

impl Default for PublishConfig {
    fn default() -> PublishConfig {
        PublishConfig {
            queue_capacity: 4096,
            retry_max: 5,
            retry_base_ms: 50,
        }
    }
}

impl PublishConfig {
    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Redelivery attempts for commands whose event carries no limit.
    pub retry_max: u32,
}

impl Default for CommandConfig {
    fn default() -> CommandConfig {
        CommandConfig { retry_max: 3 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
    pub session: String,
    pub telemetry: String,
    pub command: String,
    pub location: String,
}

impl Default for TopicsConfig {
    fn default() -> TopicsConfig {
        TopicsConfig {
            session: "device.session".to_owned(),
            telemetry: "device.telemetry".to_owned(),
            command: "device.command".to_owned(),
            location: "device.location".to_owned(),
        }
    }
}
