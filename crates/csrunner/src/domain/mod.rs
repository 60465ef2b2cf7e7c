use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    Stopped,
    Starting,
    Running,
    Failed,
    Stopping,
}

impl AppState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Stopping => "stopping",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthVerdict {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckKind {
    Http,
    Tcp,
    Process,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    #[serde(rename = "type")]
    pub kind: HealthCheckKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Probe interval in seconds.
    #[serde(default = "default_interval")]
    pub interval: u64,
    /// Per-probe timeout in seconds.
    #[serde(default = "default_probe_timeout")]
    pub timeout: u64,
}

fn default_interval() -> u64 {
    5
}

fn default_probe_timeout() -> u64 {
    3
}

/// One managed child process within a configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSpec {
    pub id: String,
    pub name: String,
    /// Handler tag: `python`, `npm`, `scala`, or a registered extension.
    pub app_type: String,
    pub working_dir: PathBuf,
    pub command: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckSpec>,
    #[serde(default)]
    pub auto_restart: bool,
    /// Seconds to wait for the app to reach `running` after spawn.
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout: u64,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Fixed port, or 0 to have one allocated dynamically.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Env var name that receives the allocated port in the child.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_env_var: Option<String>,
}

fn default_startup_timeout() -> u64 {
    30
}

impl AppSpec {
    /// A dynamic port is requested by `port: 0` or by naming a
    /// `port_env_var` without a fixed port.
    pub fn wants_dynamic_port(&self) -> bool {
        match self.port {
            Some(0) => true,
            Some(_) => false,
            None => self.port_env_var.is_some(),
        }
    }

    pub fn fixed_port(&self) -> Option<u16> {
        match self.port {
            Some(p) if p > 0 => Some(p),
            _ => None,
        }
    }
}

/// A named group of application specs managed as a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub applications: Vec<AppSpec>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Configuration {
    pub fn app(&self, app_id: &str) -> Option<&AppSpec> {
        self.applications.iter().find(|a| a.id == app_id)
    }

    /// Validate document-level invariants: unique app ids, dependencies
    /// that exist, an acyclic dependency graph, sane health checks.
    pub fn validate(&self) -> Result<(), Error> {
        let mut seen = HashSet::new();
        for app in &self.applications {
            if app.id.trim().is_empty() {
                return Err(Error::config_invalid("application id cannot be empty"));
            }
            if !seen.insert(app.id.as_str()) {
                return Err(Error::config_invalid(format!(
                    "duplicate application id '{}'",
                    app.id
                )));
            }
            if !app.working_dir.is_absolute() {
                return Err(Error::config_invalid(format!(
                    "working_dir for '{}' must be absolute, got {}",
                    app.id,
                    app.working_dir.display()
                )));
            }
            if app.command.trim().is_empty() {
                return Err(Error::config_invalid(format!(
                    "command for '{}' cannot be empty",
                    app.id
                )));
            }
            if let Some(hc) = &app.health_check {
                match hc.kind {
                    HealthCheckKind::Http if hc.url.is_none() => {
                        return Err(Error::config_invalid(format!(
                            "http health check for '{}' requires a url",
                            app.id
                        )));
                    }
                    HealthCheckKind::Tcp if hc.port.is_none() && !app.wants_dynamic_port() => {
                        return Err(Error::config_invalid(format!(
                            "tcp health check for '{}' requires a port or an allocated port",
                            app.id
                        )));
                    }
                    _ => {}
                }
            }
        }

        for app in &self.applications {
            for dep in &app.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(Error::config_invalid(format!(
                        "application '{}' depends on unknown app '{}'",
                        app.id, dep
                    )));
                }
            }
        }

        if let Some(cycle) = find_cycle(&self.applications) {
            return Err(Error::ConfigInvalid {
                message: format!("circular dependency: {}", cycle.join(" -> ")),
                details: Some(serde_json::json!({ "cycle": cycle })),
            });
        }

        Ok(())
    }
}

/// Kahn's algorithm over `depends_on`; the nodes left with a positive
/// in-degree after draining the queue are exactly the cycle members.
pub fn find_cycle(apps: &[AppSpec]) -> Option<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = apps.iter().map(|a| (a.id.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for app in apps {
        for dep in &app.depends_on {
            dependents.entry(dep.as_str()).or_default().push(&app.id);
            *in_degree.get_mut(app.id.as_str()).unwrap() += 1;
        }
    }

    let mut queue: Vec<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut drained = 0usize;
    while let Some(id) = queue.pop() {
        drained += 1;
        for dependent in dependents.get(id).into_iter().flatten() {
            let d = in_degree.get_mut(dependent).unwrap();
            *d -= 1;
            if *d == 0 {
                queue.push(dependent);
            }
        }
    }

    if drained == apps.len() {
        return None;
    }
    let mut cycle: Vec<String> = in_degree
        .into_iter()
        .filter(|(_, d)| *d > 0)
        .map(|(id, _)| id.to_string())
        .collect();
    cycle.sort();
    Some(cycle)
}

/// Runtime status of one application, as reported over the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct ApplicationStatus {
    pub app_id: String,
    pub state: AppState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub health: HealthVerdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocated_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
}

impl ApplicationStatus {
    pub fn stopped(app_id: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            state: AppState::Stopped,
            pid: None,
            exit_code: None,
            started_at: None,
            error_message: None,
            health: HealthVerdict::Unknown,
            allocated_port: None,
            uptime_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigurationSummary {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub app_count: usize,
    pub has_running: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Result of a handler subcommand. A non-zero exit code here is a
/// successful dispatch, not an error.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_seconds: f64,
}
