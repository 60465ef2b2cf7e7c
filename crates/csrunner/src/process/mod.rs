use std::collections::{HashMap, HashSet, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::domain::{AppSpec, AppState, ApplicationStatus, Configuration, HealthVerdict};
use crate::error::{Error, Result};
use crate::handler::HandlerRegistry;
use crate::health::{HealthProber, ProbeContext};
use crate::logs::{run_id_for, LogManager};
use crate::ports::PortAllocator;
use crate::store::ConfigStore;

const BUILD_TIMEOUT: Duration = Duration::from_secs(300);
const MONITOR_POLL: Duration = Duration::from_millis(500);
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);
const RESTART_WINDOW: Duration = Duration::from_secs(3600);
const RESTART_BUDGET: usize = 10;

type RuntimeKey = (String, String);

/// Delay before auto-restart attempt `n` (0-based): 1, 2, 4, 8, 16, 30, 30, …
fn backoff_delay(attempt: usize) -> Duration {
    let secs = 2u64.saturating_pow(attempt.min(32) as u32).min(30);
    Duration::from_secs(secs)
}

/// `<UPPER(dep_id)>_PORT`; non-alphanumeric id characters become `_`.
fn dep_port_var(dep_id: &str) -> String {
    let upper: String = dep_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{upper}_PORT")
}

fn signal_group(pid: u32, signal: i32) -> bool {
    // The child was spawned with process_group(0), so PGID == PID and the
    // negative pid reaches the whole tree.
    unsafe { libc::kill(-(pid as i32), signal) == 0 }
}

/// Everything the supervisor knows about one app at runtime. Mutated only
/// by the process manager, under the per-app lock.
struct RuntimeState {
    state: AppState,
    child: Option<Child>,
    pid: Option<u32>,
    allocated_port: Option<u16>,
    started_at: Option<OffsetDateTime>,
    exit_code: Option<i32>,
    error_message: Option<String>,
    health: HealthVerdict,
    run_id: Option<String>,
    /// Bumped on every start/stop; stale monitors and pending restarts
    /// check it and retire.
    generation: u64,
}

impl RuntimeState {
    fn new() -> Self {
        Self {
            state: AppState::Stopped,
            child: None,
            pid: None,
            allocated_port: None,
            started_at: None,
            exit_code: None,
            error_message: None,
            health: HealthVerdict::Unknown,
            run_id: None,
            generation: 0,
        }
    }
}

struct RestartTracker {
    attempts: VecDeque<Instant>,
}

impl RestartTracker {
    fn new() -> Self {
        Self {
            attempts: VecDeque::new(),
        }
    }

    /// Returns the attempt index for backoff, or None once the rolling
    /// window budget is spent.
    fn try_begin(&mut self, now: Instant) -> Option<usize> {
        while let Some(front) = self.attempts.front() {
            if now.duration_since(*front) > RESTART_WINDOW {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
        if self.attempts.len() >= RESTART_BUDGET {
            return None;
        }
        let attempt = self.attempts.len();
        self.attempts.push_back(now);
        Some(attempt)
    }
}

struct AppRuntime {
    state: tokio::sync::Mutex<RuntimeState>,
    restarts: parking_lot::Mutex<RestartTracker>,
    /// Last spawned pid, readable without the state lock for the
    /// last-resort kill on shutdown. Zero means none.
    current_pid: AtomicU32,
}

impl AppRuntime {
    fn new() -> Self {
        Self {
            state: tokio::sync::Mutex::new(RuntimeState::new()),
            restarts: parking_lot::Mutex::new(RestartTracker::new()),
            current_pid: AtomicU32::new(0),
        }
    }
}

/// Per-app entry in a group start/stop reply.
#[derive(Debug, Clone, Serialize)]
pub struct AppActionResult {
    pub app_id: String,
    pub state: AppState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocated_port: Option<u16>,
    pub message: String,
}

impl AppActionResult {
    fn ok(app_id: &str, state: AppState, message: impl Into<String>) -> Self {
        Self {
            app_id: app_id.to_string(),
            state,
            error: None,
            pid: None,
            allocated_port: None,
            message: message.into(),
        }
    }

    fn failed(app_id: &str, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            app_id: app_id.to_string(),
            state: AppState::Failed,
            message: error.clone(),
            error: Some(error),
            pid: None,
            allocated_port: None,
        }
    }
}

/// The orchestration core: dependency-ordered lifecycle, port threading,
/// health-gated startup, auto-restart with backoff.
pub struct ProcessManager {
    store: Arc<ConfigStore>,
    pub(crate) logs: Arc<LogManager>,
    pub(crate) ports: Arc<PortAllocator>,
    registry: Arc<HandlerRegistry>,
    prober: HealthProber,
    stop_timeout: Duration,
    runtimes: parking_lot::Mutex<HashMap<RuntimeKey, Arc<AppRuntime>>>,
}

impl ProcessManager {
    pub fn new(
        store: Arc<ConfigStore>,
        logs: Arc<LogManager>,
        ports: Arc<PortAllocator>,
        registry: Arc<HandlerRegistry>,
        stop_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            logs,
            ports,
            registry,
            prober: HealthProber::new(),
            stop_timeout,
            runtimes: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    fn runtime(&self, config_id: &str, app_id: &str) -> Arc<AppRuntime> {
        let key = (config_id.to_string(), app_id.to_string());
        self.runtimes
            .lock()
            .entry(key)
            .or_insert_with(|| Arc::new(AppRuntime::new()))
            .clone()
    }

    fn runtime_if_exists(&self, config_id: &str, app_id: &str) -> Option<Arc<AppRuntime>> {
        self.runtimes
            .lock()
            .get(&(config_id.to_string(), app_id.to_string()))
            .cloned()
    }

    /// Start a target set (default: every app) in dependency order.
    /// A failure aborts the remaining untouched apps; already-running apps
    /// are left alone. Both outcomes are reported per app.
    pub async fn start(
        self: &Arc<Self>,
        config_id: &str,
        app_ids: Option<&[String]>,
    ) -> Result<Vec<AppActionResult>> {
        let config = self.store.get(config_id)?;
        let targets = expand_with_dependencies(&config, app_ids)?;
        let order = topological_order(&config, &targets)?;
        info!(config_id, order = ?order, "group start");

        let mut results = Vec::with_capacity(order.len());
        let mut aborted_by: Option<String> = None;
        for app_id in &order {
            let spec = config.app(app_id).expect("ordered ids come from the config");
            if let Some(failed_dep) = &aborted_by {
                results.push(AppActionResult::ok(
                    app_id,
                    self.current_state(config_id, app_id).await,
                    format!("not attempted: '{failed_dep}' failed earlier in the group"),
                ));
                continue;
            }

            let result = self.start_app(&config, spec).await;
            if result.error.is_some() {
                aborted_by = Some(app_id.clone());
            }
            results.push(result);
        }
        Ok(results)
    }

    /// Stop a target set (default: every app) plus everything that depends
    /// on it, in reverse dependency order.
    pub async fn stop(
        self: &Arc<Self>,
        config_id: &str,
        app_ids: Option<&[String]>,
        graceful: bool,
    ) -> Result<Vec<AppActionResult>> {
        let config = self.store.get(config_id)?;
        let targets = expand_with_dependents(&config, app_ids)?;
        let mut order = topological_order(&config, &targets)?;
        order.reverse();
        info!(config_id, order = ?order, graceful, "group stop");

        let mut results = Vec::with_capacity(order.len());
        for app_id in &order {
            results.push(self.stop_app(config_id, app_id, graceful).await);
        }
        Ok(results)
    }

    pub async fn restart(
        self: &Arc<Self>,
        config_id: &str,
        app_ids: Option<&[String]>,
    ) -> Result<(Vec<AppActionResult>, Vec<AppActionResult>)> {
        let stopped = self.stop(config_id, app_ids, true).await?;
        let started = self.start(config_id, app_ids).await?;
        Ok((stopped, started))
    }

    pub async fn status(
        &self,
        config_id: &str,
        app_ids: Option<&[String]>,
    ) -> Result<Vec<ApplicationStatus>> {
        let config = self.store.get(config_id)?;
        let targets = restrict_targets(&config, app_ids)?;

        let mut statuses = Vec::new();
        for app in &config.applications {
            if !targets.contains(app.id.as_str()) {
                continue;
            }
            statuses.push(self.app_status(config_id, &app.id).await);
        }
        Ok(statuses)
    }

    async fn app_status(&self, config_id: &str, app_id: &str) -> ApplicationStatus {
        let Some(runtime) = self.runtime_if_exists(config_id, app_id) else {
            return ApplicationStatus::stopped(app_id);
        };
        let st = runtime.state.lock().await;
        let uptime = match (st.state, st.started_at) {
            (AppState::Running, Some(started)) => {
                let delta = OffsetDateTime::now_utc() - started;
                Some(delta.whole_seconds().max(0) as u64)
            }
            _ => None,
        };
        ApplicationStatus {
            app_id: app_id.to_string(),
            state: st.state,
            pid: st.pid,
            exit_code: st.exit_code,
            started_at: st.started_at,
            error_message: st.error_message.clone(),
            health: st.health,
            allocated_port: st.allocated_port,
            uptime_seconds: uptime,
        }
    }

    async fn current_state(&self, config_id: &str, app_id: &str) -> AppState {
        match self.runtime_if_exists(config_id, app_id) {
            Some(runtime) => runtime.state.lock().await.state,
            None => AppState::Stopped,
        }
    }

    /// True while any app of the configuration is not `stopped`.
    pub async fn any_active(&self, config_id: &str) -> bool {
        let runtimes: Vec<Arc<AppRuntime>> = {
            let map = self.runtimes.lock();
            map.iter()
                .filter(|((cfg, _), _)| cfg == config_id)
                .map(|(_, rt)| rt.clone())
                .collect()
        };
        for runtime in runtimes {
            if runtime.state.lock().await.state != AppState::Stopped {
                return true;
            }
        }
        false
    }

    /// Drop runtime entries after a configuration is deleted.
    pub fn forget_config(&self, config_id: &str) {
        self.runtimes.lock().retain(|(cfg, _), _| cfg != config_id);
    }

    /// Resolved environment for a handler command: OS env, spec env, the
    /// app's own port if currently allocated, dependency ports.
    pub async fn command_env(
        &self,
        config: &Configuration,
        spec: &AppSpec,
    ) -> HashMap<String, String> {
        let allocated = match self.runtime_if_exists(&config.id, &spec.id) {
            Some(rt) => rt.state.lock().await.allocated_port,
            None => None,
        };
        self.resolved_env(config, spec, allocated).await
    }

    async fn resolved_env(
        &self,
        config: &Configuration,
        spec: &AppSpec,
        allocated: Option<u16>,
    ) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = std::env::vars().collect();
        env.extend(spec.env.clone());
        if let (Some(var), Some(port)) = (&spec.port_env_var, allocated) {
            env.insert(var.clone(), port.to_string());
        }
        for dep_id in &spec.depends_on {
            if let Some(dep_rt) = self.runtime_if_exists(&config.id, dep_id) {
                let dep_state = dep_rt.state.lock().await;
                if let Some(port) = dep_state.allocated_port {
                    env.insert(dep_port_var(dep_id), port.to_string());
                }
            }
        }
        env
    }

    /// Drain everything on supervisor shutdown: graceful stops under an
    /// outer deadline, then SIGKILL for survivors.
    pub async fn shutdown_all(self: &Arc<Self>) {
        let config_ids: HashSet<String> = {
            let map = self.runtimes.lock();
            map.keys().map(|(cfg, _)| cfg.clone()).collect()
        };
        if config_ids.is_empty() {
            return;
        }
        info!(configs = config_ids.len(), "draining process manager");

        let drain = async {
            for config_id in &config_ids {
                if let Err(e) = self.stop(config_id, None, true).await {
                    warn!(config_id = %config_id, error = %e, "drain stop failed");
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_DEADLINE, drain).await.is_err() {
            warn!("shutdown deadline exceeded, killing survivors");
            let runtimes: Vec<Arc<AppRuntime>> = self.runtimes.lock().values().cloned().collect();
            for runtime in runtimes {
                let pid = runtime.current_pid.load(Ordering::SeqCst);
                if pid != 0 {
                    signal_group(pid, libc::SIGKILL);
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Single-app lifecycle
    // -----------------------------------------------------------------

    async fn start_app(
        self: &Arc<Self>,
        config: &Configuration,
        spec: &AppSpec,
    ) -> AppActionResult {
        let config_id = config.id.as_str();
        let runtime = self.runtime(config_id, &spec.id);

        // Claim the app: only stopped/failed apps may start.
        let (generation, previous_run) = {
            let mut st = runtime.state.lock().await;
            match st.state {
                AppState::Stopped | AppState::Failed => {}
                other => {
                    return AppActionResult::ok(
                        &spec.id,
                        other,
                        format!("already {}", other.as_str()),
                    );
                }
            }
            st.state = AppState::Starting;
            st.generation += 1;
            st.exit_code = None;
            st.error_message = None;
            st.health = HealthVerdict::Unknown;
            (st.generation, st.run_id.take())
        };
        info!(config_id, app_id = %spec.id, "starting application");

        let Some(handler) = self.registry.get(&spec.app_type) else {
            return self
                .fail_start(
                    &runtime,
                    &spec.id,
                    generation,
                    None,
                    None,
                    Error::HandlerMissing(spec.app_type.clone()),
                )
                .await;
        };

        if !spec.working_dir.is_dir() {
            return self
                .fail_start(
                    &runtime,
                    &spec.id,
                    generation,
                    None,
                    None,
                    Error::config_invalid(format!(
                        "working directory does not exist: {}",
                        spec.working_dir.display()
                    )),
                )
                .await;
        }

        // Ports: fixed ports are verified against other managed apps;
        // dynamic ones come from the allocator.
        let allocated_port = if let Some(fixed) = spec.fixed_port() {
            match self.ports.reserve_fixed(fixed) {
                Ok(()) => Some(fixed),
                Err(e) => {
                    return self
                        .fail_start(&runtime, &spec.id, generation, None, None, e)
                        .await;
                }
            }
        } else if spec.wants_dynamic_port() {
            match self.ports.allocate() {
                Ok(port) => Some(port),
                Err(e) => {
                    return self
                        .fail_start(&runtime, &spec.id, generation, None, None, e)
                        .await;
                }
            }
        } else {
            None
        };

        let env = self.resolved_env(config, spec, allocated_port).await;
        let writer = self.logs.writer(config_id, &spec.id);

        if let Some(build_command) = &spec.build_command {
            if let Err(result) = self
                .run_build(
                    spec,
                    build_command,
                    &env,
                    &writer,
                    &runtime,
                    generation,
                    allocated_port,
                )
                .await
            {
                return result;
            }
        }

        // Roll the log over before the new run writes anything.
        let previous_run = previous_run.unwrap_or_else(|| run_id_for(OffsetDateTime::now_utc()));
        writer.archive(&previous_run).await;
        let run_id = run_id_for(OffsetDateTime::now_utc());

        let command = handler.prepare_command(spec, &env);
        debug!(
            config_id,
            app_id = %spec.id,
            handler = handler.display_name(),
            command = %command,
            "spawning child"
        );
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&command)
            .current_dir(&spec.working_dir)
            .env_clear()
            .envs(&env)
            .process_group(0)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return self
                    .fail_start(
                        &runtime,
                        &spec.id,
                        generation,
                        None,
                        allocated_port,
                        Error::StartupFailed {
                            reason: format!("failed to spawn: {e}"),
                        },
                    )
                    .await;
            }
        };
        let pid = child.id();
        if let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) {
            writer.attach(stdout, stderr);
        }

        {
            let mut st = runtime.state.lock().await;
            st.child = Some(child);
            st.pid = pid;
            st.started_at = Some(OffsetDateTime::now_utc());
            st.run_id = Some(run_id);
            st.allocated_port = allocated_port;
        }
        runtime
            .current_pid
            .store(pid.unwrap_or(0), Ordering::SeqCst);

        match self.await_healthy(config_id, spec, &runtime, generation).await {
            Ok(()) => {
                {
                    let mut st = runtime.state.lock().await;
                    st.state = AppState::Running;
                    st.health = HealthVerdict::Healthy;
                }
                info!(config_id, app_id = %spec.id, pid, port = allocated_port, "application running");
                self.spawn_monitor(config_id, spec, runtime.clone(), generation);
                let mut result = AppActionResult::ok(&spec.id, AppState::Running, "started");
                result.pid = pid;
                result.allocated_port = allocated_port;
                result
            }
            Err(reason) => {
                // Tear the child down before reporting failure.
                let child = {
                    let mut st = runtime.state.lock().await;
                    st.child.take()
                };
                if let Some(mut child) = child {
                    kill_child(&mut child, Duration::from_millis(500)).await;
                }
                self.fail_start(
                    &runtime,
                    &spec.id,
                    generation,
                    None,
                    allocated_port,
                    Error::StartupFailed { reason },
                )
                .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_build(
        self: &Arc<Self>,
        spec: &AppSpec,
        build_command: &str,
        env: &HashMap<String, String>,
        writer: &Arc<crate::logs::LogWriter>,
        runtime: &Arc<AppRuntime>,
        generation: u64,
        allocated_port: Option<u16>,
    ) -> std::result::Result<(), AppActionResult> {
        info!(app_id = %spec.id, build_command, "running build command");
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(build_command)
            .current_dir(&spec.working_dir)
            .env_clear()
            .envs(env)
            .kill_on_drop(true)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = match cmd.spawn() {
            Ok(child) => tokio::time::timeout(BUILD_TIMEOUT, child.wait_with_output()).await,
            Err(e) => {
                return Err(self
                    .fail_start(
                        runtime,
                        &spec.id,
                        generation,
                        None,
                        allocated_port,
                        Error::BuildFailed {
                            exit_code: -1,
                            tail: format!("failed to spawn: {e}"),
                        },
                    )
                    .await);
            }
        };

        match output {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                for line in stdout.lines() {
                    writer.write_line("stdout", line);
                }
                for line in stderr.lines() {
                    writer.write_line("stderr", line);
                }
                if output.status.success() {
                    Ok(())
                } else {
                    let code = output.status.code().unwrap_or(-1);
                    let tail: Vec<&str> = stderr.lines().rev().take(20).collect();
                    let tail: String = tail.into_iter().rev().collect::<Vec<_>>().join("\n");
                    Err(self
                        .fail_start(
                            runtime,
                            &spec.id,
                            generation,
                            Some(code),
                            allocated_port,
                            Error::BuildFailed {
                                exit_code: code,
                                tail,
                            },
                        )
                        .await)
                }
            }
            Ok(Err(e)) => Err(self
                .fail_start(
                    runtime,
                    &spec.id,
                    generation,
                    None,
                    allocated_port,
                    Error::BuildFailed {
                        exit_code: -1,
                        tail: e.to_string(),
                    },
                )
                .await),
            Err(_) => Err(self
                .fail_start(
                    runtime,
                    &spec.id,
                    generation,
                    Some(-1),
                    allocated_port,
                    Error::BuildFailed {
                        exit_code: -1,
                        tail: format!("timed out after {}s", BUILD_TIMEOUT.as_secs()),
                    },
                )
                .await),
        }
    }

    /// Wait for the first healthy verdict, the child exiting, or the
    /// startup timeout, whichever comes first. Apps without a health
    /// check are running as soon as the spawn stuck.
    async fn await_healthy(
        &self,
        config_id: &str,
        spec: &AppSpec,
        runtime: &Arc<AppRuntime>,
        generation: u64,
    ) -> std::result::Result<(), String> {
        let Some(hc) = &spec.health_check else {
            let mut st = runtime.state.lock().await;
            if st.generation != generation {
                return Err("cancelled".to_string());
            }
            if let Some(child) = st.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    let code = status.code().unwrap_or(-1);
                    st.exit_code = Some(code);
                    return Err(format!("process exited with code {code} during startup"));
                }
            }
            return Ok(());
        };

        let deadline = Instant::now() + Duration::from_secs(spec.startup_timeout);
        let interval = Duration::from_secs(hc.interval.max(1));
        loop {
            // Child death beats the probe.
            {
                let mut st = runtime.state.lock().await;
                if st.generation != generation {
                    return Err("cancelled".to_string());
                }
                if let Some(child) = st.child.as_mut() {
                    if let Ok(Some(status)) = child.try_wait() {
                        let code = status.code().unwrap_or(-1);
                        st.exit_code = Some(code);
                        return Err(format!("process exited with code {code} during startup"));
                    }
                }
            }

            let ctx = {
                let st = runtime.state.lock().await;
                ProbeContext {
                    pid: st.pid,
                    allocated_port: st.allocated_port,
                }
            };
            if self.prober.probe(hc, &ctx).await == HealthVerdict::Healthy {
                return Ok(());
            }
            debug!(config_id, app_id = %spec.id, "health probe not yet passing");

            let now = Instant::now();
            if now >= deadline {
                return Err(format!(
                    "startup timeout after {}s without a healthy probe",
                    spec.startup_timeout
                ));
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
        }
    }

    /// Commit a start failure: the app latches `failed` with the error
    /// recorded, resources are released, and the per-app entry carries the
    /// rendered error.
    async fn fail_start(
        &self,
        runtime: &Arc<AppRuntime>,
        app_id: &str,
        generation: u64,
        exit_code: Option<i32>,
        port: Option<u16>,
        err: Error,
    ) -> AppActionResult {
        let reason = err.to_string();
        error!(app_id, error = %reason, "start failed");
        if let Some(port) = port {
            self.ports.release(port);
        }
        let mut st = runtime.state.lock().await;
        if st.generation == generation {
            st.state = AppState::Failed;
            st.error_message = Some(reason.clone());
            if exit_code.is_some() {
                st.exit_code = exit_code;
            }
            st.health = HealthVerdict::Unhealthy;
            st.child = None;
            st.pid = None;
            st.allocated_port = None;
            st.started_at = None;
        }
        runtime.current_pid.store(0, Ordering::SeqCst);
        AppActionResult::failed(app_id, reason)
    }

    async fn stop_app(
        self: &Arc<Self>,
        config_id: &str,
        app_id: &str,
        graceful: bool,
    ) -> AppActionResult {
        let Some(runtime) = self.runtime_if_exists(config_id, app_id) else {
            return AppActionResult::ok(app_id, AppState::Stopped, "not running");
        };

        let (child, port, run_id) = {
            let mut st = runtime.state.lock().await;
            match st.state {
                AppState::Stopped => {
                    // Still cancels any pending auto-restart.
                    st.generation += 1;
                    return AppActionResult::ok(app_id, AppState::Stopped, "not running");
                }
                AppState::Failed => {
                    st.generation += 1;
                    st.state = AppState::Stopped;
                    st.exit_code = None;
                    st.error_message = None;
                    st.health = HealthVerdict::Unknown;
                    return AppActionResult::ok(app_id, AppState::Stopped, "stopped");
                }
                AppState::Stopping => {
                    return AppActionResult::ok(app_id, AppState::Stopping, "already stopping");
                }
                AppState::Starting | AppState::Running => {}
            }
            st.state = AppState::Stopping;
            st.generation += 1;
            (st.child.take(), st.allocated_port.take(), st.run_id.clone())
        };
        info!(config_id, app_id, graceful, "stopping application");

        if let Some(mut child) = child {
            if let Some(pid) = child.id() {
                if graceful {
                    if !signal_group(pid, libc::SIGTERM) {
                        let _ = child.start_kill();
                    }
                    if tokio::time::timeout(self.stop_timeout, child.wait())
                        .await
                        .is_err()
                    {
                        warn!(config_id, app_id, pid, "graceful stop timed out, killing group");
                        signal_group(pid, libc::SIGKILL);
                        let _ = child.wait().await;
                    } else {
                        // The leader is gone; make sure stray group members are too.
                        signal_group(pid, libc::SIGKILL);
                    }
                } else {
                    signal_group(pid, libc::SIGKILL);
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            } else {
                let _ = child.wait().await;
            }
        }

        if let Some(run_id) = &run_id {
            self.logs.writer(config_id, app_id).archive(run_id).await;
        }
        if let Some(port) = port {
            self.ports.release(port);
        }

        {
            let mut st = runtime.state.lock().await;
            st.state = AppState::Stopped;
            st.child = None;
            st.pid = None;
            st.started_at = None;
            st.exit_code = None;
            st.error_message = None;
            st.health = HealthVerdict::Unknown;
            st.run_id = None;
        }
        runtime.current_pid.store(0, Ordering::SeqCst);
        info!(config_id, app_id, "application stopped");
        AppActionResult::ok(app_id, AppState::Stopped, "stopped")
    }

    // -----------------------------------------------------------------
    // Exit monitoring and auto-restart
    // -----------------------------------------------------------------

    fn spawn_monitor(
        self: &Arc<Self>,
        config_id: &str,
        spec: &AppSpec,
        runtime: Arc<AppRuntime>,
        generation: u64,
    ) {
        let manager = Arc::clone(self);
        let config_id = config_id.to_string();
        let spec = spec.clone();
        tokio::spawn(async move {
            manager
                .monitor_app(&config_id, &spec, runtime, generation)
                .await;
        });
    }

    async fn monitor_app(
        self: Arc<Self>,
        config_id: &str,
        spec: &AppSpec,
        runtime: Arc<AppRuntime>,
        generation: u64,
    ) {
        let mut last_probe = Instant::now();
        loop {
            tokio::time::sleep(MONITOR_POLL).await;

            let exited = {
                let mut st = runtime.state.lock().await;
                if st.generation != generation || st.state != AppState::Running {
                    return;
                }
                match st.child.as_mut().map(|c| c.try_wait()) {
                    Some(Ok(Some(status))) => {
                        let code = status.code().unwrap_or(-1);
                        st.state = AppState::Failed;
                        st.exit_code = Some(code);
                        st.error_message = Some(format!("process exited with code {code}"));
                        st.health = HealthVerdict::Unhealthy;
                        st.child = None;
                        st.pid = None;
                        st.started_at = None;
                        if let Some(port) = st.allocated_port.take() {
                            self.ports.release(port);
                        }
                        Some(code)
                    }
                    _ => None,
                }
            };

            if let Some(code) = exited {
                runtime.current_pid.store(0, Ordering::SeqCst);
                warn!(config_id, app_id = %spec.id, code, "application exited unexpectedly");
                if spec.auto_restart {
                    self.schedule_restart(config_id, spec, runtime, generation);
                }
                return;
            }

            // Keep the health verdict fresh while running.
            if let Some(hc) = &spec.health_check {
                if last_probe.elapsed() >= Duration::from_secs(hc.interval.max(1)) {
                    last_probe = Instant::now();
                    let ctx = {
                        let st = runtime.state.lock().await;
                        ProbeContext {
                            pid: st.pid,
                            allocated_port: st.allocated_port,
                        }
                    };
                    let verdict = self.prober.probe(hc, &ctx).await;
                    let mut st = runtime.state.lock().await;
                    if st.generation == generation && st.state == AppState::Running {
                        st.health = verdict;
                    }
                }
            }
        }
    }

    fn schedule_restart(
        self: &Arc<Self>,
        config_id: &str,
        spec: &AppSpec,
        runtime: Arc<AppRuntime>,
        generation: u64,
    ) {
        let attempt = runtime.restarts.lock().try_begin(Instant::now());
        let Some(attempt) = attempt else {
            error!(config_id, app_id = %spec.id, "restart budget exhausted, latching failed");
            let runtime = runtime.clone();
            tokio::spawn(async move {
                let mut st = runtime.state.lock().await;
                if st.generation == generation {
                    st.error_message =
                        Some("restart limit reached (10 within the last hour)".to_string());
                }
            });
            return;
        };

        let delay = backoff_delay(attempt);
        info!(
            config_id,
            app_id = %spec.id,
            attempt,
            delay_secs = delay.as_secs(),
            "scheduling auto-restart"
        );
        let manager = Arc::clone(self);
        let config_id = config_id.to_string();
        let app_id = spec.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // A manual start or stop in the meantime wins.
            {
                let st = runtime.state.lock().await;
                if st.generation != generation || st.state != AppState::Failed {
                    debug!(config_id = %config_id, app_id = %app_id, "pending restart cancelled");
                    return;
                }
            }
            let config = match manager.store.get(&config_id) {
                Ok(config) => config,
                Err(_) => return,
            };
            let Some(spec) = config.app(&app_id).cloned() else {
                return;
            };
            info!(config_id = %config_id, app_id = %app_id, "auto-restarting");
            let result = manager.start_app(&config, &spec).await;
            if let Some(err) = result.error {
                warn!(config_id = %config_id, app_id = %app_id, error = %err, "auto-restart failed");
            }
        });
    }
}

/// SIGTERM the group, give it a moment, then SIGKILL. For startup-failure
/// teardown where the configured stop timeout does not apply.
async fn kill_child(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        return;
    };
    if !signal_group(pid, libc::SIGTERM) {
        let _ = child.start_kill();
    }
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        signal_group(pid, libc::SIGKILL);
        let _ = child.wait().await;
    } else {
        signal_group(pid, libc::SIGKILL);
    }
}

// ---------------------------------------------------------------------
// Target-set and ordering helpers
// ---------------------------------------------------------------------

fn restrict_targets<'a>(
    config: &'a Configuration,
    app_ids: Option<&[String]>,
) -> Result<HashSet<&'a str>> {
    match app_ids {
        None => Ok(config.applications.iter().map(|a| a.id.as_str()).collect()),
        Some(ids) => {
            let mut targets = HashSet::new();
            for id in ids {
                let app = config
                    .app(id)
                    .ok_or_else(|| Error::NotFound(format!("application '{id}'")))?;
                targets.insert(app.id.as_str());
            }
            Ok(targets)
        }
    }
}

/// The requested set plus everything it transitively depends on.
fn expand_with_dependencies<'a>(
    config: &'a Configuration,
    app_ids: Option<&[String]>,
) -> Result<HashSet<&'a str>> {
    let mut targets = restrict_targets(config, app_ids)?;
    let mut queue: Vec<&str> = targets.iter().copied().collect();
    while let Some(id) = queue.pop() {
        let app = config.app(id).expect("target ids come from the config");
        for dep in &app.depends_on {
            let dep_app = config.app(dep).ok_or_else(|| {
                Error::config_invalid(format!("application '{id}' depends on unknown app '{dep}'"))
            })?;
            if targets.insert(dep_app.id.as_str()) {
                queue.push(dep_app.id.as_str());
            }
        }
    }
    Ok(targets)
}

/// The requested set plus everything that transitively depends on it.
fn expand_with_dependents<'a>(
    config: &'a Configuration,
    app_ids: Option<&[String]>,
) -> Result<HashSet<&'a str>> {
    let mut targets = restrict_targets(config, app_ids)?;
    loop {
        let mut grew = false;
        for app in &config.applications {
            if targets.contains(app.id.as_str()) {
                continue;
            }
            if app.depends_on.iter().any(|d| targets.contains(d.as_str())) {
                targets.insert(app.id.as_str());
                grew = true;
            }
        }
        if !grew {
            return Ok(targets);
        }
    }
}

/// Dependency-first order over the target subgraph, stable in config
/// order. Rejects cycles with the offending members.
fn topological_order(config: &Configuration, targets: &HashSet<&str>) -> Result<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    for app in &config.applications {
        if !targets.contains(app.id.as_str()) {
            continue;
        }
        let degree = app
            .depends_on
            .iter()
            .filter(|d| targets.contains(d.as_str()))
            .count();
        in_degree.insert(app.id.as_str(), degree);
    }

    let mut order = Vec::with_capacity(in_degree.len());
    let mut emitted: HashSet<&str> = HashSet::new();
    while order.len() < in_degree.len() {
        let mut progressed = false;
        for app in &config.applications {
            let id = app.id.as_str();
            if !targets.contains(id) || emitted.contains(id) {
                continue;
            }
            if in_degree[id] == 0 {
                emitted.insert(id);
                order.push(id.to_string());
                progressed = true;
                for other in &config.applications {
                    if targets.contains(other.id.as_str())
                        && other.depends_on.iter().any(|d| d == id)
                    {
                        *in_degree.get_mut(other.id.as_str()).unwrap() -= 1;
                    }
                }
            }
        }
        if !progressed {
            let mut cycle: Vec<String> = in_degree
                .iter()
                .filter(|(id, _)| !emitted.contains(*id))
                .map(|(id, _)| id.to_string())
                .collect();
            cycle.sort();
            return Err(Error::ConfigInvalid {
                message: format!("circular dependency: {}", cycle.join(" -> ")),
                details: Some(serde_json::json!({ "cycle": cycle })),
            });
        }
    }
    Ok(order)
}
