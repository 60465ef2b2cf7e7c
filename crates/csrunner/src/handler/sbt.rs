use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use super::{touch, AppHandler, ReloadFuture, ReloadOutcome};
use crate::domain::AppSpec;

/// Scala apps driven through sbt. `sbt ~run` recompiles on file changes;
/// Play apps can expose an HTTP reload endpoint via `PLAY_RELOAD_URL`.
pub struct SbtHandler;

impl AppHandler for SbtHandler {
    fn kind(&self) -> &str {
        "scala"
    }

    fn display_name(&self) -> &str {
        "Scala (sbt)"
    }

    fn prepare_command(&self, app: &AppSpec, _env: &HashMap<String, String>) -> String {
        app.command.clone()
    }

    fn supports_reload(&self, app: &AppSpec) -> bool {
        let command = app.command.to_lowercase();
        command.contains("~run") || command.contains("play")
    }

    fn trigger_reload<'a>(&'a self, app: &'a AppSpec) -> ReloadFuture<'a> {
        Box::pin(async move {
            if !self.supports_reload(app) {
                return ReloadOutcome::unsupported("application does not support hot reload");
            }

            if is_play_app(app) {
                if let Some(url) = app.env.get("PLAY_RELOAD_URL") {
                    match reqwest::Client::new()
                        .get(url)
                        .timeout(Duration::from_secs(10))
                        .send()
                        .await
                    {
                        Ok(resp) if resp.status().is_success() => {
                            info!(url = %url, "triggered Play reload over http");
                            return ReloadOutcome::ok("Play reload triggered over http");
                        }
                        Ok(resp) => {
                            warn!(url = %url, status = %resp.status(), "Play reload endpoint refused");
                        }
                        Err(e) => {
                            warn!(url = %url, error = %e, "Play reload request failed");
                        }
                    }
                }
            }

            for sources in ["app", "src"] {
                if let Some(path) = find_scala_source(&app.working_dir.join(sources)) {
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    return match touch(&path) {
                        Ok(()) => {
                            ReloadOutcome::ok(format!("reload triggered by touching {name}"))
                        }
                        Err(e) => {
                            ReloadOutcome::unsupported(format!("failed to touch {name}: {e}"))
                        }
                    };
                }
            }

            if app.command.contains("~run") {
                return ReloadOutcome::ok("sbt continuous compilation reloads automatically");
            }
            ReloadOutcome::unsupported("no scala source found to trigger reload")
        })
    }

    fn subcommand(&self, command: &str) -> Option<Vec<String>> {
        let argv: &[&str] = match command {
            "compile" => &["sbt", "compile"],
            "test" => &["sbt", "test"],
            "format" => &["sbt", "scalafmt"],
            "clean" => &["sbt", "clean"],
            "package" => &["sbt", "package"],
            _ => return None,
        };
        Some(argv.iter().map(|s| s.to_string()).collect())
    }

    /// Unknown commands are assumed to be sbt tasks.
    fn passthrough(&self, command: &str, args: &[String]) -> Vec<String> {
        let mut argv = vec!["sbt".to_string(), command.to_string()];
        argv.extend(args.iter().cloned());
        argv
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_secs(900)
    }
}

fn is_play_app(app: &AppSpec) -> bool {
    app.working_dir.join("conf/application.conf").exists()
        || app.working_dir.join("conf/routes").exists()
}

/// First `.scala` file under `dir`, depth-first with sorted entries so the
/// pick is stable across calls.
fn find_scala_source(dir: &Path) -> Option<PathBuf> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .collect();
    entries.sort();
    for path in &entries {
        if path.is_file() && path.extension().is_some_and(|ext| ext == "scala") {
            return Some(path.clone());
        }
    }
    for path in entries {
        if path.is_dir() {
            if let Some(found) = find_scala_source(&path) {
                return Some(found);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_app_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("csrunner-test-{label}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn app(command: &str, dir: &Path) -> AppSpec {
        AppSpec {
            id: "svc".to_string(),
            name: "svc".to_string(),
            app_type: "scala".to_string(),
            working_dir: dir.to_path_buf(),
            command: command.to_string(),
            env: HashMap::new(),
            build_command: None,
            health_check: None,
            auto_restart: false,
            startup_timeout: 30,
            depends_on: Vec::new(),
            port: None,
            port_env_var: None,
        }
    }

    #[test]
    fn reload_detection() {
        let handler = SbtHandler;
        let dir = Path::new("/tmp");
        assert!(handler.supports_reload(&app("sbt ~run", dir)));
        assert!(handler.supports_reload(&app("sbt play:run", dir)));
        assert!(!handler.supports_reload(&app("sbt run", dir)));
    }

    #[test]
    fn subcommand_table_maps_to_sbt_tasks() {
        let handler = SbtHandler;
        assert_eq!(
            handler.subcommand("compile"),
            Some(vec!["sbt".to_string(), "compile".to_string()])
        );
        assert_eq!(
            handler.subcommand("format"),
            Some(vec!["sbt".to_string(), "scalafmt".to_string()])
        );
        assert_eq!(
            handler.passthrough("dist", &[]),
            vec!["sbt".to_string(), "dist".to_string()]
        );
    }

    #[test]
    fn play_detection_by_conf_files() {
        let dir = temp_app_dir("sbt-play");
        assert!(!is_play_app(&app("sbt ~run", &dir)));
        fs::create_dir_all(dir.join("conf")).unwrap();
        fs::write(dir.join("conf/routes"), "").unwrap();
        assert!(is_play_app(&app("sbt ~run", &dir)));
        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn reload_touches_first_scala_source() {
        let dir = temp_app_dir("sbt-reload");
        fs::create_dir_all(dir.join("src/main/scala")).unwrap();
        fs::write(dir.join("src/main/scala/Main.scala"), "object Main").unwrap();
        let handler = SbtHandler;
        let outcome = handler.trigger_reload(&app("sbt ~run", &dir)).await;
        assert!(outcome.ok);
        assert!(outcome.message.contains("Main.scala"));
        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn continuous_run_reloads_automatically_without_sources() {
        let dir = temp_app_dir("sbt-auto");
        let handler = SbtHandler;
        let outcome = handler.trigger_reload(&app("sbt ~run", &dir)).await;
        assert!(outcome.ok);
        assert!(outcome.message.contains("automatically"));
        fs::remove_dir_all(&dir).ok();
    }
}
