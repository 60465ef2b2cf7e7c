use std::env;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

/// Server-wide settings, layered as defaults overridden by
/// `<data-dir>/server_config.json` when present.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub data_dir: PathBuf,
    /// Archived runs kept per app; older archives are deleted.
    pub log_retention_runs: usize,
    /// `current.log` is rotated once it crosses this size.
    pub log_max_size_mb: u64,
    pub default_startup_timeout: u64,
    /// Grace period between SIGTERM and SIGKILL on stop.
    pub stop_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_retention_runs: 10,
            log_max_size_mb: 100,
            default_startup_timeout: 30,
            stop_timeout_secs: 10,
        }
    }
}

fn default_data_dir() -> PathBuf {
    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".clientserverrunner")
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    log_retention_runs: Option<usize>,
    log_max_size_mb: Option<u64>,
    default_startup_timeout: Option<u64>,
    stop_timeout_secs: Option<u64>,
}

impl ServerConfig {
    /// Resolve settings for a data directory. A missing `server_config.json`
    /// yields defaults; an unreadable or invalid one is a startup error.
    pub fn load(data_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut cfg = Self::default();
        if let Some(dir) = data_dir {
            cfg.data_dir = dir;
        }

        let path = cfg.server_config_path();
        if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed reading {}", path.display()))?;
            let file: ConfigFile = serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON in {}", path.display()))?;
            if let Some(v) = file.log_retention_runs {
                cfg.log_retention_runs = v.max(1);
            }
            if let Some(v) = file.log_max_size_mb {
                cfg.log_max_size_mb = v.max(1);
            }
            if let Some(v) = file.default_startup_timeout {
                cfg.default_startup_timeout = v.max(1);
            }
            if let Some(v) = file.stop_timeout_secs {
                cfg.stop_timeout_secs = v.max(1);
            }
        }

        Ok(cfg)
    }

    pub fn server_config_path(&self) -> PathBuf {
        self.data_dir.join("server_config.json")
    }

    pub fn configurations_dir(&self) -> PathBuf {
        self.data_dir.join("configurations")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(rest)
    } else {
        PathBuf::from(path)
    }
}

pub fn is_writable_dir(path: &Path) -> bool {
    let probe = path.join(".csrunner-write-probe");
    match std::fs::write(&probe, b"") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("csrunner-test-{label}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn defaults_without_config_file() {
        let dir = temp_dir("cfg-defaults");
        let cfg = ServerConfig::load(Some(dir.clone())).expect("load");
        assert_eq!(cfg.log_retention_runs, 10);
        assert_eq!(cfg.default_startup_timeout, 30);
        assert_eq!(cfg.stop_timeout_secs, 10);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn file_overrides_are_applied() {
        let dir = temp_dir("cfg-overrides");
        fs::write(
            dir.join("server_config.json"),
            r#"{"log_retention_runs": 3, "stop_timeout_secs": 2}"#,
        )
        .unwrap();
        let cfg = ServerConfig::load(Some(dir.clone())).expect("load");
        assert_eq!(cfg.log_retention_runs, 3);
        assert_eq!(cfg.stop_timeout_secs, 2);
        assert_eq!(cfg.log_max_size_mb, 100);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn invalid_config_file_is_an_error() {
        let dir = temp_dir("cfg-invalid");
        fs::write(dir.join("server_config.json"), "{not json").unwrap();
        assert!(ServerConfig::load(Some(dir.clone())).is_err());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn layout_paths_hang_off_data_dir() {
        let cfg = ServerConfig {
            data_dir: PathBuf::from("/data"),
            ..ServerConfig::default()
        };
        assert_eq!(cfg.configurations_dir(), PathBuf::from("/data/configurations"));
        assert_eq!(cfg.logs_dir(), PathBuf::from("/data/logs"));
        assert_eq!(cfg.state_dir(), PathBuf::from("/data/state"));
    }

    #[test]
    fn tilde_expansion() {
        let p = expand_tilde("~/x");
        assert!(p.ends_with("x"));
        assert!(!p.to_string_lossy().contains('~'));
        assert_eq!(expand_tilde("/abs/x"), PathBuf::from("/abs/x"));
    }
}
