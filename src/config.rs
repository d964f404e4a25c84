//! Versioned TOML configuration loading: a `Version` probe selects a
//! concrete schema (`V1`), which is then lowered into `Internal`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::line_parser::Direction;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("unsupported config version {0}")]
    UnsupportedVersion(i64),
    #[error("unrecognized scan direction {0:?}")]
    BadDirection(String),
    #[error("log_files must not be empty")]
    NoLogFiles,
}

#[derive(Debug, Deserialize)]
struct Version {
    version: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct V1 {
    log_files: HashMap<String, String>,
    db_file: Option<String>,
    #[serde(default, with = "humantime_serde::option")]
    repeat_period: Option<Duration>,
    repeat_count: Option<u32>,
    #[serde(default, with = "humantime_serde::option")]
    timeout: Option<Duration>,
    bad_ip_threshold: Option<u32>,
    scan_directions: Option<Vec<String>>,
}

/// Fully resolved configuration, decoupled from the on-disk schema so the
/// file format can evolve without touching the rest of the crate.
#[derive(Debug, Clone)]
pub struct Internal {
    pub log_files: HashMap<String, PathBuf>,
    pub db_file: String,
    pub repeat_period: Duration,
    pub repeat_count: u32,
    pub timeout: Duration,
    pub bad_ip_threshold: u32,
    pub scan_directions: Vec<Direction>,
}

impl Default for Internal {
    fn default() -> Internal {
        Internal {
            log_files: HashMap::new(),
            db_file: "dumpster.sqlite".to_string(),
            repeat_period: Duration::from_secs(300),
            repeat_count: 3,
            timeout: Duration::from_secs(900),
            bad_ip_threshold: 25,
            scan_directions: vec![Direction::Inbound],
        }
    }
}

pub fn load(path: &std::path::Path) -> Result<Internal, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    let probe: Version = toml::from_str(&raw)?;
    let version = probe.version.unwrap_or(1);

    match version {
        1 => {
            let parsed: V1 = toml::from_str(&raw)?;
            lower_v1(parsed)
        }
        other => Err(ConfigError::UnsupportedVersion(other)),
    }
}

fn lower_v1(parsed: V1) -> Result<Internal, ConfigError> {
    let defaults = Internal::default();

    if parsed.log_files.is_empty() {
        return Err(ConfigError::NoLogFiles);
    }
    let log_files = parsed
        .log_files
        .into_iter()
        .map(|(label, path)| (label, PathBuf::from(path)))
        .collect();

    let scan_directions = match parsed.scan_directions {
        Some(names) => names
            .iter()
            .map(|name| Direction::parse(name).ok_or_else(|| ConfigError::BadDirection(name.clone())))
            .collect::<Result<Vec<_>, _>>()?,
        None => defaults.scan_directions,
    };

    Ok(Internal {
        log_files,
        db_file: parsed.db_file.unwrap_or(defaults.db_file),
        repeat_period: parsed.repeat_period.unwrap_or(defaults.repeat_period),
        repeat_count: parsed.repeat_count.unwrap_or(defaults.repeat_count),
        timeout: parsed.timeout.unwrap_or(defaults.timeout),
        bad_ip_threshold: parsed.bad_ip_threshold.unwrap_or(defaults.bad_ip_threshold),
        scan_directions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("dumpster.toml");
        std::fs::write(
            &config_path,
            r#"
            [log_files]
            kern = "/var/log/kern.log"
            "#,
        )
        .unwrap();

        let config = load(&config_path).unwrap();
        assert_eq!(config.db_file, "dumpster.sqlite");
        assert_eq!(config.repeat_count, 3);
        assert_eq!(config.bad_ip_threshold, 25);
        assert_eq!(config.scan_directions, vec![Direction::Inbound]);
        assert_eq!(
            config.log_files.get("kern"),
            Some(&PathBuf::from("/var/log/kern.log"))
        );
    }

    #[test]
    fn parses_full_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("dumpster.toml");
        std::fs::write(
            &config_path,
            r#"
            version = 1
            db_file = "/var/lib/dumpster/state.sqlite"
            repeat_period = "5m"
            repeat_count = 5
            timeout = "30m"
            bad_ip_threshold = 10
            scan_directions = ["inbound", "outbound"]

            [log_files]
            kern = "/var/log/kern.log"
            ufw = "/var/log/ufw.log"
            "#,
        )
        .unwrap();

        let config = load(&config_path).unwrap();
        assert_eq!(config.db_file, "/var/lib/dumpster/state.sqlite");
        assert_eq!(config.repeat_period, Duration::from_secs(300));
        assert_eq!(config.repeat_count, 5);
        assert_eq!(config.timeout, Duration::from_secs(1800));
        assert_eq!(config.bad_ip_threshold, 10);
        assert_eq!(
            config.scan_directions,
            vec![Direction::Inbound, Direction::Outbound]
        );
        assert_eq!(config.log_files.len(), 2);
    }

    #[test]
    fn rejects_empty_log_files() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("dumpster.toml");
        std::fs::write(&config_path, "[log_files]\n").unwrap();
        let err = load(&config_path).unwrap_err();
        assert!(matches!(err, ConfigError::NoLogFiles));
    }
}
