//! Checker daemon configuration.
//!
//! Loaded from a TOML file with `STRATA_CONFIG_*` environment-variable
//! overrides via [Figment]. Env vars always win over file values; every
//! option carries a default so a missing file yields a runnable local
//! configuration.
//!
//! Nested keys use double underscore separators in env vars, e.g.
//! `STRATA_CONFIG_LISTEN_PORT` overrides `listen_port`.

use std::{path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format as _, Toml},
};
use url::Url;

/// Raw configuration as deserialized from the TOML config file.
#[derive(Debug, Clone, serde::Deserialize)]
struct ConfigFile {
    /// Cadence of the instance scanner and the interval inspector, in
    /// seconds (default: 60)
    #[serde(default = "default_scan_instances_interval_seconds")]
    scan_instances_interval_seconds: u64,

    /// Number of concurrent check workers (default: 16)
    #[serde(default = "default_recycle_concurrency")]
    recycle_concurrency: usize,

    /// Check-job lease TTL in milliseconds; renewal runs every third of
    /// this interval (default: 60000)
    #[serde(default = "default_recycle_job_lease_expired_ms")]
    recycle_job_lease_expired_ms: u64,

    /// Lease duration requested when claiming a check job, in seconds
    /// (default: 43200)
    #[serde(default = "default_check_object_interval_seconds")]
    check_object_interval_seconds: u64,

    /// Safety margin subtracted from the bucket lifecycle when inspecting
    /// check recency, in days (default: 3)
    #[serde(default = "default_reserved_buffer_days")]
    reserved_buffer_days: i64,

    /// If non-empty, only these instance ids are checked (default: [])
    #[serde(default)]
    recycle_whitelist: Vec<String>,

    /// Instance ids excluded from checking; ignored when the whitelist is
    /// non-empty (default: [])
    #[serde(default)]
    recycle_blacklist: Vec<String>,

    /// Run the inverted (storage -> metadata) check after the forward check
    /// (default: false)
    #[serde(default)]
    enable_inverted_check: bool,

    /// Port of the Prometheus metrics exporter; also composes the lessee
    /// identity `ip:port` (default: 5100)
    #[serde(default = "default_listen_port")]
    listen_port: u16,

    /// URL of the transactional KV store holding instance metadata.
    /// The `memory:` scheme selects the in-process backend (default)
    #[serde(default = "default_kv_url")]
    kv_url: String,
}

fn default_scan_instances_interval_seconds() -> u64 {
    60
}

fn default_recycle_concurrency() -> usize {
    16
}

fn default_recycle_job_lease_expired_ms() -> u64 {
    60_000
}

fn default_check_object_interval_seconds() -> u64 {
    43_200
}

fn default_reserved_buffer_days() -> i64 {
    3
}

fn default_listen_port() -> u16 {
    5100
}

fn default_kv_url() -> String {
    "memory:".to_string()
}

/// Resolved checker configuration used at runtime.
///
/// Captured once at daemon start; the daemon does not reload.
#[derive(Debug, Clone)]
pub struct Config {
    /// Cadence of the instance scanner and the interval inspector.
    pub scan_interval: Duration,
    /// Number of concurrent check workers.
    pub recycle_concurrency: usize,
    /// Check-job lease TTL; renewal runs every third of this interval.
    pub lease_expiration: Duration,
    /// Lease duration requested when claiming a check job.
    pub check_object_interval: Duration,
    /// Safety margin subtracted from the bucket lifecycle, in days.
    pub reserved_buffer_days: i64,
    /// If non-empty, only these instance ids are checked.
    pub recycle_whitelist: Vec<String>,
    /// Instance ids excluded from checking.
    pub recycle_blacklist: Vec<String>,
    /// Run the inverted check after the forward check.
    pub enable_inverted_check: bool,
    /// Metrics exporter port, also part of the lessee identity.
    pub listen_port: u16,
    /// URL of the transactional KV store.
    pub kv_url: Url,
}

/// Load configuration, merging the TOML file (if any) with
/// `STRATA_CONFIG_*` env-var overrides.
pub fn load(config_path: Option<&Path>) -> Result<Config, LoadConfigError> {
    let mut figment = Figment::new();
    if let Some(path) = config_path {
        figment = figment.merge(Toml::file(path));
    }
    let figment = figment.merge(Env::prefixed("STRATA_CONFIG_").split("__"));

    let file: ConfigFile = figment
        .extract()
        .map_err(|err| LoadConfigError::Figment(Box::new(err)))?;

    let kv_url = Url::parse(&file.kv_url).map_err(|source| LoadConfigError::InvalidKvUrl {
        value: file.kv_url.clone(),
        source,
    })?;

    Ok(Config {
        scan_interval: Duration::from_secs(file.scan_instances_interval_seconds),
        recycle_concurrency: file.recycle_concurrency.max(1),
        lease_expiration: Duration::from_millis(file.recycle_job_lease_expired_ms),
        check_object_interval: Duration::from_secs(file.check_object_interval_seconds),
        reserved_buffer_days: file.reserved_buffer_days,
        recycle_whitelist: file.recycle_whitelist,
        recycle_blacklist: file.recycle_blacklist,
        enable_inverted_check: file.enable_inverted_check,
        listen_port: file.listen_port,
        kv_url,
    })
}

/// Errors from [`load`].
#[derive(Debug, thiserror::Error)]
pub enum LoadConfigError {
    /// Failed to parse the TOML file or env overrides.
    #[error("config parse error: {0}")]
    Figment(#[source] Box<figment::Error>),

    /// `kv_url` is not a valid URL.
    #[error("invalid kv_url `{value}`: {source}")]
    InvalidKvUrl {
        value: String,
        #[source]
        source: url::ParseError,
    },
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file("config.toml", "")?;

            let config = load(Some(Path::new("config.toml"))).expect("load failed");

            assert_eq!(config.scan_interval, Duration::from_secs(60));
            assert_eq!(config.recycle_concurrency, 16);
            assert_eq!(config.lease_expiration, Duration::from_millis(60_000));
            assert_eq!(config.reserved_buffer_days, 3);
            assert!(!config.enable_inverted_check);
            assert_eq!(config.kv_url.scheme(), "memory");
            Ok(())
        });
    }

    #[test]
    fn toml_values_override_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
scan_instances_interval_seconds = 5
recycle_concurrency = 2
recycle_whitelist = ["i1", "i2"]
enable_inverted_check = true
"#,
            )?;

            let config = load(Some(Path::new("config.toml"))).expect("load failed");

            assert_eq!(config.scan_interval, Duration::from_secs(5));
            assert_eq!(config.recycle_concurrency, 2);
            assert_eq!(config.recycle_whitelist, vec!["i1", "i2"]);
            assert!(config.enable_inverted_check);
            Ok(())
        });
    }

    #[test]
    fn env_var_overrides_toml() {
        Jail::expect_with(|jail| {
            jail.create_file("config.toml", "listen_port = 6000")?;
            jail.set_env("STRATA_CONFIG_LISTEN_PORT", "7000");

            let config = load(Some(Path::new("config.toml"))).expect("load failed");

            assert_eq!(config.listen_port, 7000, "env var should win over TOML");
            Ok(())
        });
    }

    #[test]
    fn invalid_kv_url_is_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("config.toml", r#"kv_url = "not a url""#)?;

            let res = load(Some(Path::new("config.toml")));

            assert!(matches!(res, Err(LoadConfigError::InvalidKvUrl { .. })));
            Ok(())
        });
    }

    #[test]
    fn zero_concurrency_is_clamped() {
        Jail::expect_with(|jail| {
            jail.create_file("config.toml", "recycle_concurrency = 0")?;

            let config = load(Some(Path::new("config.toml"))).expect("load failed");

            assert_eq!(config.recycle_concurrency, 1);
            Ok(())
        });
    }
}
