use std::fs;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;

pub fn init_tracing(log_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    // Control replies go to stdout; keep diagnostics on stderr.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Create the data-dir layout. Failures here map to exit code 2.
pub fn ensure_data_dirs(cfg: &ServerConfig) -> anyhow::Result<()> {
    for dir in [
        cfg.data_dir.clone(),
        cfg.configurations_dir(),
        cfg.logs_dir(),
        cfg.state_dir(),
    ] {
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create data dir: {}", dir.display()))?;
    }
    if !crate::config::is_writable_dir(&cfg.data_dir) {
        anyhow::bail!("data dir is not writable: {}", cfg.data_dir.display());
    }
    Ok(())
}

pub async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => { tracing::info!("received SIGTERM, shutting down"); }
        _ = sigint.recv() => { tracing::info!("received SIGINT, shutting down"); }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("csrunner-test-{label}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn creates_full_layout() {
        let dir = temp_dir("layout");
        let cfg = ServerConfig {
            data_dir: dir.clone(),
            ..ServerConfig::default()
        };
        ensure_data_dirs(&cfg).expect("layout");
        assert!(cfg.configurations_dir().is_dir());
        assert!(cfg.logs_dir().is_dir());
        assert!(cfg.state_dir().is_dir());
        fs::remove_dir_all(&dir).ok();
    }
}
