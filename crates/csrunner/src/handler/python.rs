use std::collections::HashMap;
use std::time::Duration;

use super::{touch_first, AppHandler, ReloadFuture, ReloadOutcome};
use crate::domain::AppSpec;

/// Python apps: uvicorn, flask, django and friends. Commands run as given;
/// the tool chain is ruff / mypy / pytest.
pub struct PythonHandler;

/// Conventional entry points, in touch priority order.
const ENTRY_POINTS: &[&str] = &[
    "main.py", "app.py", "server.py", "wsgi.py", "asgi.py", "manage.py",
];

impl AppHandler for PythonHandler {
    fn kind(&self) -> &str {
        "python"
    }

    fn display_name(&self) -> &str {
        "Python"
    }

    fn prepare_command(&self, app: &AppSpec, _env: &HashMap<String, String>) -> String {
        // The user specifies the full command, e.g.
        // `uvicorn main:app --reload --port 8000`.
        app.command.clone()
    }

    fn supports_reload(&self, app: &AppSpec) -> bool {
        let command = app.command.to_lowercase();
        ["--reload", "--debug", "runserver", "watchfiles"]
            .iter()
            .any(|needle| command.contains(needle))
    }

    fn trigger_reload<'a>(&'a self, app: &'a AppSpec) -> ReloadFuture<'a> {
        Box::pin(async move {
            if !self.supports_reload(app) {
                return ReloadOutcome::unsupported("application does not support hot reload");
            }
            touch_first(app, ENTRY_POINTS).unwrap_or_else(|| {
                ReloadOutcome::unsupported("no entry point file found to trigger reload")
            })
        })
    }

    fn subcommand(&self, command: &str) -> Option<Vec<String>> {
        let argv: &[&str] = match command {
            "lint" => &["ruff", "check", "."],
            "format" => &["ruff", "format", "."],
            "typecheck" => &["mypy", "."],
            "test" => &["pytest"],
            _ => return None,
        };
        Some(argv.iter().map(|s| s.to_string()).collect())
    }

    fn passthrough(&self, command: &str, args: &[String]) -> Vec<String> {
        let mut argv = vec![command.to_string()];
        argv.extend(args.iter().cloned());
        argv
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_secs(300)
    }
}
