mod node;
mod python;
mod sbt;

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use tracing::{debug, info};

use crate::domain::{AppSpec, CommandResult};

pub type ReloadFuture<'a> = Pin<Box<dyn Future<Output = ReloadOutcome> + Send + 'a>>;

#[derive(Debug, Clone, Serialize)]
pub struct ReloadOutcome {
    pub ok: bool,
    pub message: String,
}

impl ReloadOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

/// Per-family adapter between the uniform control contract and one process
/// family's tool chain.
pub trait AppHandler: Send + Sync {
    /// Tag matched against `AppSpec::app_type`.
    fn kind(&self) -> &str;

    fn display_name(&self) -> &str;

    /// Rewrite or wrap the raw start command. Must be pure and idempotent.
    fn prepare_command(&self, app: &AppSpec, env: &HashMap<String, String>) -> String;

    /// Static inspection of the start command.
    fn supports_reload(&self, app: &AppSpec) -> bool;

    fn trigger_reload<'a>(&'a self, app: &'a AppSpec) -> ReloadFuture<'a>;

    /// Map a recognised subcommand to the family tool chain, or None when
    /// the command should pass through.
    fn subcommand(&self, command: &str) -> Option<Vec<String>>;

    /// argv for an unrecognised command.
    fn passthrough(&self, command: &str, args: &[String]) -> Vec<String>;

    fn command_timeout(&self) -> Duration;
}

/// Maps `app_type` tags to handlers. Additional families register under
/// new tags without touching the process manager.
pub struct HandlerRegistry {
    handlers: Vec<Box<dyn AppHandler>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn register(&mut self, handler: impl AppHandler + 'static) {
        self.handlers.push(Box::new(handler));
    }

    pub fn get(&self, kind: &str) -> Option<&dyn AppHandler> {
        self.handlers
            .iter()
            .find(|h| h.kind() == kind)
            .map(|h| h.as_ref())
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.kind()).collect()
    }
}

/// The built-in families.
pub fn default_registry() -> HandlerRegistry {
    let mut reg = HandlerRegistry::new();
    reg.register(python::PythonHandler);
    reg.register(node::NpmHandler);
    reg.register(sbt::SbtHandler);
    reg
}

/// Execute a handler subcommand synchronously in the app's working
/// directory with the resolved environment. A non-zero exit is a normal
/// result, not an error.
pub async fn run_custom_command(
    handler: &dyn AppHandler,
    app: &AppSpec,
    command: &str,
    args: &[String],
    env: &HashMap<String, String>,
) -> CommandResult {
    let argv = match handler.subcommand(command) {
        Some(mut mapped) => {
            mapped.extend(args.iter().cloned());
            mapped
        }
        None => handler.passthrough(command, args),
    };
    info!(
        app_id = %app.id,
        handler = handler.kind(),
        command,
        argv = ?argv,
        "running custom command"
    );

    let started = Instant::now();
    let mut cmd = tokio::process::Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .current_dir(&app.working_dir)
        .env_clear()
        .envs(env)
        .kill_on_drop(true)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return CommandResult {
                exit_code: -1,
                stdout: String::new(),
                stderr: format!("failed to spawn {}: {e}", argv[0]),
                duration_seconds: started.elapsed().as_secs_f64(),
            };
        }
    };

    let timeout = handler.command_timeout();
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => CommandResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration_seconds: started.elapsed().as_secs_f64(),
        },
        Ok(Err(e)) => CommandResult {
            exit_code: -1,
            stdout: String::new(),
            stderr: format!("failed to collect output: {e}"),
            duration_seconds: started.elapsed().as_secs_f64(),
        },
        // Dropping the wait future kills the child via kill_on_drop.
        Err(_) => CommandResult {
            exit_code: -1,
            stdout: String::new(),
            stderr: format!("command timed out after {}s", timeout.as_secs()),
            duration_seconds: started.elapsed().as_secs_f64(),
        },
    }
}

/// Bump a file's mtime so watching dev servers pick up a change.
pub(crate) fn touch(path: &Path) -> std::io::Result<()> {
    let file = OpenOptions::new().append(true).open(path)?;
    file.set_modified(SystemTime::now())?;
    debug!(path = %path.display(), "touched for reload");
    Ok(())
}

/// Touch the first existing candidate, reporting which one.
pub(crate) fn touch_first(app: &AppSpec, candidates: &[&str]) -> Option<ReloadOutcome> {
    for candidate in candidates {
        let path = app.working_dir.join(candidate);
        if path.exists() {
            return Some(match touch(&path) {
                Ok(()) => ReloadOutcome::ok(format!("reload triggered by touching {candidate}")),
                Err(e) => ReloadOutcome::unsupported(format!("failed to touch {candidate}: {e}")),
            });
        }
    }
    None
}
