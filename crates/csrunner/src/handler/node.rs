use std::collections::HashMap;
use std::time::Duration;

use super::{touch_first, AppHandler, ReloadFuture, ReloadOutcome};
use crate::domain::AppSpec;

/// Node package apps driven through npm scripts. Modern dev servers all
/// ship HMR, so reload is usually a file touch away.
pub struct NpmHandler;

const ENTRY_POINTS: &[&str] = &[
    "src/main.tsx",
    "src/main.ts",
    "src/main.jsx",
    "src/main.js",
    "src/index.tsx",
    "src/index.ts",
    "src/index.jsx",
    "src/index.js",
    "src/App.tsx",
    "src/App.ts",
    "src/App.jsx",
    "src/App.js",
    "pages/index.tsx",
    "pages/index.jsx",
];

impl AppHandler for NpmHandler {
    fn kind(&self) -> &str {
        "npm"
    }

    fn display_name(&self) -> &str {
        "Node.js (npm)"
    }

    fn prepare_command(&self, app: &AppSpec, _env: &HashMap<String, String>) -> String {
        app.command.clone()
    }

    fn supports_reload(&self, app: &AppSpec) -> bool {
        let command = app.command.to_lowercase();
        [
            "npm run dev",
            "npm start",
            "vite",
            "next dev",
            "react-scripts start",
            "parcel",
            "webpack-dev-server",
        ]
        .iter()
        .any(|needle| command.contains(needle))
    }

    fn trigger_reload<'a>(&'a self, app: &'a AppSpec) -> ReloadFuture<'a> {
        Box::pin(async move {
            if !self.supports_reload(app) {
                return ReloadOutcome::unsupported("application does not support hot reload");
            }
            if let Some(outcome) = touch_first(app, ENTRY_POINTS) {
                return outcome;
            }
            if app.working_dir.join("package.json").exists() {
                return ReloadOutcome::ok(
                    "HMR is automatic for this dev server, no manual trigger needed",
                );
            }
            ReloadOutcome::unsupported("no entry point file found to trigger reload")
        })
    }

    fn subcommand(&self, command: &str) -> Option<Vec<String>> {
        let argv: &[&str] = match command {
            "lint" => &["npm", "run", "lint"],
            "format" => &["npm", "run", "format"],
            "build" => &["npm", "run", "build"],
            "typecheck" => &["npm", "run", "typecheck"],
            "test" => &["npm", "test"],
            _ => return None,
        };
        Some(argv.iter().map(|s| s.to_string()).collect())
    }

    /// Unknown commands are assumed to be package scripts.
    fn passthrough(&self, command: &str, args: &[String]) -> Vec<String> {
        let mut argv = vec!["npm".to_string(), "run".to_string(), command.to_string()];
        argv.extend(args.iter().cloned());
        argv
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_secs(600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::{Path, PathBuf};

    fn temp_app_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("csrunner-test-{label}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn app(command: &str, dir: &Path) -> AppSpec {
        AppSpec {
            id: "web".to_string(),
            name: "web".to_string(),
            app_type: "npm".to_string(),
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
    fn reload_detection_by_dev_server() {
        let handler = NpmHandler;
        let dir = Path::new("/tmp");
        assert!(handler.supports_reload(&app("npm run dev", dir)));
        assert!(handler.supports_reload(&app("vite --port 3000", dir)));
        assert!(handler.supports_reload(&app("next dev", dir)));
        assert!(!handler.supports_reload(&app("node dist/server.js", dir)));
    }

    #[test]
    fn unknown_commands_become_npm_scripts() {
        let handler = NpmHandler;
        assert_eq!(
            handler.passthrough("e2e", &["--headed".to_string()]),
            vec!["npm", "run", "e2e", "--headed"]
        );
        assert_eq!(
            handler.subcommand("test"),
            Some(vec!["npm".to_string(), "test".to_string()])
        );
    }

    #[tokio::test]
    async fn reload_touches_conventional_entry_point() {
        let dir = temp_app_dir("npm-reload");
        fs::create_dir_all(dir.join("src")).unwrap();
        fs::write(dir.join("src/main.tsx"), "").unwrap();
        let handler = NpmHandler;
        let outcome = handler.trigger_reload(&app("npm run dev", &dir)).await;
        assert!(outcome.ok);
        assert!(outcome.message.contains("src/main.tsx"));
        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn reload_falls_back_to_automatic_hmr() {
        let dir = temp_app_dir("npm-hmr");
        fs::write(dir.join("package.json"), "{}").unwrap();
        let handler = NpmHandler;
        let outcome = handler.trigger_reload(&app("npm run dev", &dir)).await;
        assert!(outcome.ok);
        assert!(outcome.message.contains("automatic"));
        fs::remove_dir_all(&dir).ok();
    }
}
