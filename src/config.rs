//! Configuration loading for the fogwillow daemon.
//!
//! Configuration is loaded from a TOML file and merged with environment
//! variables prefixed with `FW_` (e.g. `FW_OUTPUT_PATH=/var/log/fog`), so
//! every key can be overridden without touching the file. Missing keys fall
//! back to built-in defaults, and a missing file is treated as empty.
//!
//! After loading, [`Config::normalize`] clamps the worker counts to at least
//! one and derives the group interval from the flush interval when it is
//! unset or zero.

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime configuration, read-only once the daemon starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory under which destination files are created.
    #[serde(default = "default_output_path")]
    pub output_path: PathBuf,
    /// Address for the UDP listener and the metrics HTTP server.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Optional shared secret; when non-empty every packet must carry it.
    #[serde(default)]
    pub password: String,
    /// Kernel receive buffer (SO_RCVBUF) for the UDP socket, in bytes.
    #[serde(default = "default_buffer_udp")]
    pub buffer_udp: usize,
    /// Per-datagram allocation size; also the maximum accepted packet size.
    #[serde(default = "default_buffer_packet")]
    pub buffer_packet: usize,
    /// Capacity of the reader -> processor dispatch channel.
    #[serde(default = "default_buffer_chan")]
    pub buffer_chan: usize,
    /// Capacity of the filesystem writer job channel.
    #[serde(default = "default_buffer_file_sys")]
    pub buffer_file_sys: usize,
    /// Number of UDP reader tasks.
    #[serde(default = "default_one")]
    pub listeners: usize,
    /// Number of packet processor tasks.
    #[serde(default = "default_one")]
    pub processors: usize,
    /// Number of filesystem writer tasks.
    #[serde(default = "default_one")]
    pub writers: usize,
    /// How old a buffer must be before the sweep flushes it, in seconds.
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: f64,
    /// How often the memory map is swept for expired buffers, in seconds.
    #[serde(default)]
    pub group_interval_secs: f64,
    /// Enable debug logging.
    #[serde(default)]
    pub debug: bool,
}

fn default_output_path() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_listen_addr() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_buffer_udp() -> usize {
    1024 * 1024
}

fn default_buffer_packet() -> usize {
    1024 * 8
}

fn default_buffer_chan() -> usize {
    1024
}

fn default_buffer_file_sys() -> usize {
    1024
}

fn default_one() -> usize {
    1
}

fn default_flush_interval() -> f64 {
    16.0
}

impl Default for Config {
    fn default() -> Self {
        let mut config = Self {
            output_path: default_output_path(),
            listen_addr: default_listen_addr(),
            password: String::new(),
            buffer_udp: default_buffer_udp(),
            buffer_packet: default_buffer_packet(),
            buffer_chan: default_buffer_chan(),
            buffer_file_sys: default_buffer_file_sys(),
            listeners: 1,
            processors: 1,
            writers: 1,
            flush_interval_secs: default_flush_interval(),
            group_interval_secs: 0.0,
            debug: false,
        };
        config.normalize();
        config
    }
}

impl Config {
    /// Load configuration from a TOML file merged with `FW_`-prefixed
    /// environment variables. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: Config = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("FW_"))
            .extract()
            .with_context(|| format!("parsing configuration from {}", path.display()))?;

        config.normalize();
        Ok(config)
    }

    /// Clamp worker counts and derive missing intervals.
    pub fn normalize(&mut self) {
        if self.listeners < 1 {
            self.listeners = 1;
        }

        if self.processors < 1 {
            self.processors = 1;
        }

        if self.writers < 1 {
            self.writers = 1;
        }

        if self.flush_interval_secs <= 0.0 {
            self.flush_interval_secs = default_flush_interval();
        }

        if self.group_interval_secs <= 0.0 {
            self.group_interval_secs = self.flush_interval_secs / 4.0;
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs_f64(self.flush_interval_secs)
    }

    pub fn group_interval(&self) -> Duration {
        Duration::from_secs_f64(self.group_interval_secs)
    }

    /// Log the effective configuration at startup.
    pub fn log_summary(&self) {
        info!("=> fogwillow starting, pid: {}", std::process::id());
        info!("=> listen address: {}", self.listen_addr);
        info!("=> output path: {}", self.output_path.display());
        info!(
            "=> flush / group interval: {:.3}s / {:.3}s",
            self.flush_interval_secs, self.group_interval_secs
        );
        info!(
            "=> buffers; udp/packet/chan/fs: {}/{}/{}/{}",
            self.buffer_udp, self.buffer_packet, self.buffer_chan, self.buffer_file_sys
        );
        info!(
            "=> threads; listen/process/write: {}/{}/{}",
            self.listeners, self.processors, self.writers
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.output_path, PathBuf::from("/tmp"));
        assert_eq!(config.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.buffer_packet, 8192);
        assert_eq!(config.listeners, 1);
        assert_eq!(config.flush_interval_secs, 16.0);
        // Group interval derives from the flush interval when unset.
        assert_eq!(config.group_interval_secs, 4.0);
    }

    #[test]
    fn normalize_clamps_counts_and_intervals() {
        let mut config = Config {
            listeners: 0,
            processors: 0,
            writers: 0,
            flush_interval_secs: -1.0,
            group_interval_secs: 0.0,
            ..Config::default()
        };
        config.normalize();
        assert_eq!(config.listeners, 1);
        assert_eq!(config.processors, 1);
        assert_eq!(config.writers, 1);
        assert_eq!(config.flush_interval_secs, 16.0);
        assert_eq!(config.group_interval_secs, 4.0);
    }

    #[test]
    fn loads_file_with_env_override() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "fog.conf",
                r#"
                    output_path = "/data/logs"
                    listeners = 4
                    flush_interval_secs = 8.0
                "#,
            )?;
            jail.set_env("FW_LISTENERS", "2");
            jail.set_env("FW_PASSWORD", "hunter2");

            let config = Config::load(Path::new("fog.conf")).expect("load config");
            assert_eq!(config.output_path, PathBuf::from("/data/logs"));
            assert_eq!(config.listeners, 2, "environment beats the file");
            assert_eq!(config.password, "hunter2");
            assert_eq!(config.flush_interval_secs, 8.0);
            assert_eq!(config.group_interval_secs, 2.0);
            Ok(())
        });
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load(Path::new("/nonexistent/fog.conf")).expect("load defaults");
        assert_eq!(config.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.buffer_chan, 1024);
    }
}
