//! Runtime-tunable manager configuration (spec.md §6).
//!
//! Loaded from a TOML file the way the teacher's `ConfigManager` loads
//! `server.toml` (`examples/macwilam-linksense/server/src/config.rs`),
//! then optionally overridden by CLI flags and the `DS_*` environment
//! variables at the client edge — never re-read from inside the running
//! `Manager`, per the "Global process state" design note in spec.md §9.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::defaults;

/// Worker-selection policy used by the scheduler (C6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleAlgorithm {
    /// First worker that fits, in connection order.
    #[default]
    Fcfs,
    /// Prefer the worker already holding the most of the task's cached
    /// input files.
    Files,
    /// Prefer the worker with the lowest average task completion time.
    Time,
    /// Uniformly random among fitting workers.
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MonitorMode {
    #[default]
    Disabled,
    /// Summary file only.
    Summary,
    /// Summary plus per-task series/debug logs, gzip-compressed.
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// TCP port to listen on. 0 means ephemeral (assigned by the OS);
    /// overridden by `DS_PORT` at the client edge.
    pub port: u16,
    /// Advertised project name, used for catalog publication. `None`
    /// disables catalog updates entirely (spec.md §4.11).
    pub name: Option<String>,

    /// Path to a TLS private key; requires `tls_cert_path` too.
    pub tls_key_path: Option<String>,
    /// Path to a TLS certificate chain.
    pub tls_cert_path: Option<String>,
    /// Shared password checked during worker admission (§4.5). Never
    /// logged or echoed back.
    pub password: Option<String>,

    pub scheduler: ScheduleAlgorithm,
    pub monitor_mode: MonitorMode,

    /// `resource-submit-multiplier`: overcommit factor (>= 1.0) applied
    /// when advertising worker capacity to the client-facing API.
    pub resource_submit_multiplier: f64,
    /// `force-proportional-resources`.
    pub force_proportional_resources: bool,

    /// `fast-abort-multiplier`: default multiplier applied to categories
    /// that haven't set their own (0 disables, negative means "use this
    /// default", which is itself meaningless here so this field is
    /// always >= 0).
    pub fast_abort_multiplier: f64,

    pub keepalive_interval_secs: u64,
    pub keepalive_timeout_secs: u64,
    pub short_timeout_secs: u64,
    pub long_timeout_secs: u64,

    /// `min-transfer-timeout`.
    pub min_transfer_timeout_secs: u64,
    /// `default-transfer-rate`, bytes/sec, used before any measurement.
    pub default_transfer_rate_bps: f64,
    /// `transfer-outlier-factor`: reject transfers slower than
    /// `1/N` of the running mean rate.
    pub transfer_outlier_factor: f64,
    /// Optional cap on delivered bytes/sec across all transfers
    /// (`DS_BANDWIDTH`).
    pub bandwidth_limit_bps: Option<u64>,

    /// `category-steady-n-tasks`.
    pub category_steady_n_tasks: u64,
    /// `hungry-minimum`: the queue is "hungry" when fewer than this many
    /// ready tasks remain.
    pub hungry_minimum: u64,
    /// `wait-for-workers`: don't dispatch until at least this many
    /// workers are connected (0 disables the gate).
    pub wait_for_workers: usize,
    /// `wait-retrieve-many`: when true, a single `wait()` call may
    /// return more than one completed task.
    pub wait_retrieve_many: bool,

    /// Timeout (seconds) a host stays blocked after a protocol mismatch
    /// or fast-abort-triggered removal.
    pub blocklist_slow_workers_timeout_secs: u64,

    /// Floor for the first assigned task id (`ds_specify_min_taskid`).
    pub min_taskid: u64,

    /// Catalog server host/port (`CATALOG_HOST`/`CATALOG_PORT`).
    pub catalog_host: Option<String>,
    pub catalog_port: Option<u16>,

    /// Directory monitor summaries/series/debug logs are written under,
    /// when `monitor_mode != Disabled`.
    pub monitor_directory: Option<String>,

    /// Where to write the append-only performance log (C12).
    pub perf_log_path: Option<String>,
    /// Where to write the append-only transaction log (C12).
    pub txn_log_path: Option<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            name: None,
            tls_key_path: None,
            tls_cert_path: None,
            password: None,
            scheduler: ScheduleAlgorithm::default(),
            monitor_mode: MonitorMode::default(),
            resource_submit_multiplier: 1.0,
            force_proportional_resources: false,
            fast_abort_multiplier: 0.0,
            keepalive_interval_secs: defaults::DEFAULT_KEEPALIVE_INTERVAL_SECS,
            keepalive_timeout_secs: defaults::DEFAULT_KEEPALIVE_TIMEOUT_SECS,
            short_timeout_secs: defaults::DEFAULT_SHORT_TIMEOUT_SECS,
            long_timeout_secs: defaults::DEFAULT_LONG_TIMEOUT_SECS,
            min_transfer_timeout_secs: defaults::MINIMUM_TRANSFER_TIMEOUT_SECS,
            default_transfer_rate_bps: defaults::DEFAULT_TRANSFER_RATE_BPS,
            transfer_outlier_factor: 10.0,
            bandwidth_limit_bps: None,
            category_steady_n_tasks: 25,
            hungry_minimum: 10,
            wait_for_workers: 0,
            wait_retrieve_many: false,
            blocklist_slow_workers_timeout_secs: 900,
            min_taskid: 1,
            catalog_host: None,
            catalog_port: None,
            monitor_directory: None,
            perf_log_path: None,
            txn_log_path: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

impl ManagerConfig {
    /// Load a config file, falling back to defaults for anything it
    /// doesn't specify.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Apply the `DS_*`/`CATALOG_*` environment variable fallbacks
    /// (spec.md §6). Only fills in fields the file/CLI left at their
    /// defaults; CLI/file values always win.
    pub fn apply_env_fallbacks(&mut self) {
        if self.port == 0 {
            if let Ok(v) = std::env::var("DS_PORT") {
                if let Ok(p) = v.parse() {
                    self.port = p;
                }
            }
        }
        if self.name.is_none() {
            if let Ok(v) = std::env::var("DS_NAME") {
                self.name = Some(v);
            }
        }
        if self.catalog_host.is_none() {
            if let Ok(v) = std::env::var("CATALOG_HOST") {
                self.catalog_host = Some(v);
            }
        }
        if self.catalog_port.is_none() {
            if let Ok(v) = std::env::var("CATALOG_PORT") {
                if let Ok(p) = v.parse() {
                    self.catalog_port = Some(p);
                }
            }
        }
        if self.bandwidth_limit_bps.is_none() {
            if let Ok(v) = std::env::var("DS_BANDWIDTH") {
                self.bandwidth_limit_bps = parse_bandwidth_string(&v);
            }
        }
    }
}

/// Parse a `DS_BANDWIDTH`-style string with a unit suffix (`"10MB"`,
/// `"512KB"`, `"2GB"`, or a bare number of bytes/sec) into bytes/sec.
pub fn parse_bandwidth_string(s: &str) -> Option<u64> {
    let s = s.trim();
    let (digits, mult): (&str, u64) = if let Some(n) = s.strip_suffix("GB") {
        (n, 1_000_000_000)
    } else if let Some(n) = s.strip_suffix("MB") {
        (n, 1_000_000)
    } else if let Some(n) = s.strip_suffix("KB") {
        (n, 1_000)
    } else {
        (s, 1)
    };
    digits.trim().parse::<u64>().ok().map(|n| n * mult)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let c = ManagerConfig::default();
        assert_eq!(c.keepalive_interval_secs, 120);
        assert_eq!(c.keepalive_timeout_secs, 900);
        assert_eq!(c.min_taskid, 1);
        assert!(!c.wait_retrieve_many);
    }

    #[test]
    fn loads_partial_toml_with_defaults_filled_in() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manager.toml");
        std::fs::write(&path, "port = 9123\nname = \"mycluster\"\n").unwrap();
        let cfg = ManagerConfig::load(&path).unwrap();
        assert_eq!(cfg.port, 9123);
        assert_eq!(cfg.name.as_deref(), Some("mycluster"));
        assert_eq!(cfg.keepalive_timeout_secs, 900);
    }

    #[test]
    fn bandwidth_string_parses_unit_suffixes() {
        assert_eq!(parse_bandwidth_string("10MB"), Some(10_000_000));
        assert_eq!(parse_bandwidth_string("512KB"), Some(512_000));
        assert_eq!(parse_bandwidth_string("2GB"), Some(2_000_000_000));
        assert_eq!(parse_bandwidth_string("100"), Some(100));
        assert_eq!(parse_bandwidth_string("garbage"), None);
    }

    #[test]
    fn env_fallback_does_not_override_explicit_file_value() {
        std::env::set_var("DS_NAME", "from-env");
        let mut cfg = ManagerConfig {
            name: Some("from-file".to_string()),
            ..Default::default()
        };
        cfg.apply_env_fallbacks();
        assert_eq!(cfg.name.as_deref(), Some("from-file"));
        std::env::remove_var("DS_NAME");
    }
}
