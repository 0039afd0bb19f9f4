//! Configuration loading and defaults.
//!
//! Grounded on the teacher's `config.rs`: a single struct with per-field
//! compiled defaults and a `validate()` method. The teacher resolves env >
//! TOML file > defaults; spec.md §6 describes a flat record read from the
//! environment only, so the file layer is dropped but the struct shape and
//! defaulting pattern carry over unchanged.
//!
//! Read once at startup via [`Config::load`] and treated as immutable for
//! the lifetime of the process (spec.md §3's "Invariants").

use std::env;

/// Top-level configuration (spec.md §6).
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub max_concurrent: usize,
    pub max_queue_depth: usize,
    pub queue_timeout_ms: u64,
    pub default_max_turns: u32,
    pub default_timeout_ms: u64,
    /// Pre-shared secret checked by the HTTP boundary. Absent disables the
    /// check.
    pub proxy_api_key: Option<String>,
    /// CLI binary resolved via `PATH`. Default `claude`, overridable for
    /// testing or alternate deployments.
    pub cli_binary: String,
    /// Permission mode passed to the downstream CLI via `--permission-mode`.
    pub permission_mode: String,
    /// `tracing` filter string. Overridden by `RUST_LOG` if set.
    pub log_level: String,
}

fn default_port() -> u16 {
    9100
}
fn default_max_concurrent() -> usize {
    5
}
fn default_max_queue_depth() -> usize {
    20
}
fn default_queue_timeout_ms() -> u64 {
    60_000
}
fn default_max_turns() -> u32 {
    2
}
fn default_timeout_ms() -> u64 {
    180_000
}
fn default_cli_binary() -> String {
    "claude".to_string()
}
fn default_permission_mode() -> String {
    "default".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            max_concurrent: default_max_concurrent(),
            max_queue_depth: default_max_queue_depth(),
            queue_timeout_ms: default_queue_timeout_ms(),
            default_max_turns: default_max_turns(),
            default_timeout_ms: default_timeout_ms(),
            proxy_api_key: None,
            cli_binary: default_cli_binary(),
            permission_mode: default_permission_mode(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// compiled defaults for anything unset or unparsable.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `GATEWAY_PORT` | 9100 |
    /// | `GATEWAY_MAX_CONCURRENT` | 5 |
    /// | `GATEWAY_MAX_QUEUE_DEPTH` | 20 |
    /// | `GATEWAY_QUEUE_TIMEOUT_MS` | 60000 |
    /// | `GATEWAY_DEFAULT_MAX_TURNS` | 2 |
    /// | `GATEWAY_DEFAULT_TIMEOUT_MS` | 180000 |
    /// | `GATEWAY_PROXY_API_KEY` | unset |
    /// | `GATEWAY_CLI_BINARY` | `claude` |
    /// | `GATEWAY_PERMISSION_MODE` | `default` |
    /// | `RUST_LOG` / `GATEWAY_LOG_LEVEL` | `info` |
    pub fn load() -> Self {
        let defaults = Self::default();
        Self {
            port: env_parsed("GATEWAY_PORT", defaults.port),
            max_concurrent: env_parsed("GATEWAY_MAX_CONCURRENT", defaults.max_concurrent),
            max_queue_depth: env_parsed("GATEWAY_MAX_QUEUE_DEPTH", defaults.max_queue_depth),
            queue_timeout_ms: env_parsed("GATEWAY_QUEUE_TIMEOUT_MS", defaults.queue_timeout_ms),
            default_max_turns: env_parsed("GATEWAY_DEFAULT_MAX_TURNS", defaults.default_max_turns),
            default_timeout_ms: env_parsed("GATEWAY_DEFAULT_TIMEOUT_MS", defaults.default_timeout_ms),
            proxy_api_key: env::var("GATEWAY_PROXY_API_KEY").ok(),
            cli_binary: env::var("GATEWAY_CLI_BINARY").unwrap_or(defaults.cli_binary),
            permission_mode: env::var("GATEWAY_PERMISSION_MODE").unwrap_or(defaults.permission_mode),
            log_level: env::var("RUST_LOG")
                .or_else(|_| env::var("GATEWAY_LOG_LEVEL"))
                .unwrap_or(defaults.log_level),
        }
    }

    /// Validate invariants spec.md §6 requires (`port` 1–65535,
    /// `maxConcurrent ≥ 1`, timeouts `> 0`). `maxQueueDepth` has no lower
    /// bound to check beyond its `usize` type.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.port == 0 {
            errors.push("port must be between 1 and 65535".to_string());
        }
        if self.max_concurrent < 1 {
            errors.push("max_concurrent must be >= 1".to_string());
        }
        if self.queue_timeout_ms == 0 {
            errors.push("queue_timeout_ms must be > 0".to_string());
        }
        if self.default_max_turns < 1 {
            errors.push("default_max_turns must be >= 1".to_string());
        }
        if self.default_timeout_ms == 0 {
            errors.push("default_timeout_ms must be > 0".to_string());
        }
        errors
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let c = Config::default();
        assert_eq!(c.port, 9100);
        assert_eq!(c.max_concurrent, 5);
        assert_eq!(c.max_queue_depth, 20);
        assert_eq!(c.queue_timeout_ms, 60_000);
        assert_eq!(c.default_max_turns, 2);
        assert_eq!(c.default_timeout_ms, 180_000);
        assert!(c.proxy_api_key.is_none());
    }

    #[test]
    fn default_config_validates_clean() {
        assert!(Config::default().validate().is_empty());
    }

    #[test]
    fn invalid_config_reports_errors() {
        let c = Config {
            port: 0,
            max_concurrent: 0,
            queue_timeout_ms: 0,
            default_max_turns: 0,
            default_timeout_ms: 0,
            ..Config::default()
        };
        let errors = c.validate();
        assert_eq!(errors.len(), 5);
    }
}
