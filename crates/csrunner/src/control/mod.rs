use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use crate::domain::{AppSpec, ConfigurationSummary};
use crate::error::Error;
use crate::handler::{run_custom_command, HandlerRegistry};
use crate::logs::LogManager;
use crate::process::{AppActionResult, ProcessManager};
use crate::store::ConfigStore;

#[derive(Debug, Deserialize)]
struct RequestEnvelope {
    request_id: String,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct ResponseEnvelope {
    request_id: String,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

fn render_ok(request_id: String, result: Value) -> ResponseEnvelope {
    ResponseEnvelope {
        request_id,
        ok: true,
        result: Some(result),
        error: None,
    }
}

fn render_err(request_id: String, err: Error) -> ResponseEnvelope {
    ResponseEnvelope {
        request_id,
        ok: false,
        result: None,
        error: Some(ErrorBody {
            code: err.code().to_string(),
            message: err.to_string(),
            details: err.details(),
        }),
    }
}

#[derive(Clone)]
pub struct ControlState {
    pub store: Arc<ConfigStore>,
    pub manager: Arc<ProcessManager>,
    pub logs: Arc<LogManager>,
    pub registry: Arc<HandlerRegistry>,
    pub data_dir: std::path::PathBuf,
}

#[derive(Debug, Deserialize)]
struct CreateParams {
    name: String,
    #[serde(default)]
    description: Option<String>,
    applications: Vec<AppSpec>,
}

#[derive(Debug, Deserialize)]
struct ConfigIdParams {
    config_id: String,
}

#[derive(Debug, Deserialize)]
struct UpdateParams {
    config_id: String,
    updates: Value,
}

#[derive(Debug, Deserialize)]
struct DeleteParams {
    config_id: String,
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Deserialize)]
struct TargetParams {
    config_id: String,
    #[serde(default)]
    app_ids: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct StopParams {
    config_id: String,
    #[serde(default)]
    app_ids: Option<Vec<String>>,
    #[serde(default = "default_graceful")]
    graceful: bool,
}

fn default_graceful() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct LogsParams {
    config_id: String,
    app_id: String,
    #[serde(default = "default_lines")]
    lines: usize,
    #[serde(default)]
    run_id: Option<String>,
}

fn default_lines() -> usize {
    100
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    config_id: String,
    app_id: String,
    query: String,
    #[serde(default = "default_max_results")]
    max_results: usize,
    #[serde(default)]
    case_sensitive: bool,
}

fn default_max_results() -> usize {
    100
}

#[derive(Debug, Deserialize)]
struct AppParams {
    config_id: String,
    app_id: String,
}

#[derive(Debug, Deserialize)]
struct CommandParams {
    config_id: String,
    app_id: String,
    command: String,
    #[serde(default)]
    args: Vec<String>,
}

/// Serve the control protocol over standard I/O: one JSON request envelope
/// per stdin line, one response envelope per stdout line. Returns when
/// stdin reaches EOF, which the caller treats as a shutdown request.
pub async fn serve_stdio(state: ControlState) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    serve(stdin, stdout, state).await
}

async fn serve(
    input: impl tokio::io::AsyncRead + Unpin,
    mut output: impl AsyncWrite + Unpin,
    state: ControlState,
) -> anyhow::Result<()> {
    info!("control surface listening on standard I/O");
    let mut reader = BufReader::new(input).lines();
    while let Some(line) = reader.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<RequestEnvelope>(&line) {
            Ok(req) => {
                debug!(method = %req.method, request_id = %req.request_id, "control request");
                dispatch_request(req, &state).await
            }
            Err(err) => ResponseEnvelope {
                request_id: "unknown".to_string(),
                ok: false,
                result: None,
                error: Some(ErrorBody {
                    code: "config_invalid".to_string(),
                    message: format!("bad request envelope: {err}"),
                    details: None,
                }),
            },
        };
        let payload = serde_json::to_string(&response)?;
        output.write_all(payload.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
    }
    info!("control input closed");
    Ok(())
}

macro_rules! parse_params {
    ($req:ident) => {
        match serde_json::from_value($req.params) {
            Ok(v) => v,
            Err(e) => {
                return render_err(
                    $req.request_id,
                    Error::config_invalid(format!("invalid params: {e}")),
                );
            }
        }
    };
}

/// Look up (config, app spec) or early-return the NotFound response.
macro_rules! find_app {
    ($state:expr, $req:ident, $config_id:expr, $app_id:expr) => {{
        let config = match $state.store.get($config_id) {
            Ok(config) => config,
            Err(e) => return render_err($req.request_id, e),
        };
        match config.app($app_id) {
            Some(app) => (config.clone(), app.clone()),
            None => {
                return render_err(
                    $req.request_id,
                    Error::NotFound(format!("application '{}'", $app_id)),
                );
            }
        }
    }};
}

fn per_app(results: Vec<AppActionResult>) -> Value {
    let map: BTreeMap<String, Value> = results
        .into_iter()
        .map(|r| {
            let app_id = r.app_id.clone();
            (app_id, serde_json::to_value(r).unwrap_or(Value::Null))
        })
        .collect();
    json!(map)
}

async fn dispatch_request(req: RequestEnvelope, state: &ControlState) -> ResponseEnvelope {
    match req.method.as_str() {
        "ping" => render_ok(
            req.request_id,
            json!({
                "pong": true,
                "version": env!("CARGO_PKG_VERSION"),
                "data_dir": state.data_dir.to_string_lossy(),
                "handlers": state.registry.kinds(),
            }),
        ),

        "list_configurations" => {
            let mut summaries: Vec<ConfigurationSummary> = Vec::new();
            for config in state.store.list() {
                let has_running = state.manager.any_active(&config.id).await;
                summaries.push(ConfigurationSummary {
                    id: config.id,
                    name: config.name,
                    description: config.description,
                    app_count: config.applications.len(),
                    has_running,
                    created_at: config.created_at,
                    updated_at: config.updated_at,
                });
            }
            render_ok(req.request_id, json!({ "configurations": summaries }))
        }

        "create_configuration" => {
            let params: CreateParams = parse_params!(req);
            match state
                .store
                .create(&params.name, params.description, params.applications)
            {
                Ok(config) => render_ok(req.request_id, json!({ "id": config.id })),
                Err(e) => render_err(req.request_id, e),
            }
        }

        "get_configuration" => {
            let params: ConfigIdParams = parse_params!(req);
            match state.store.get(&params.config_id) {
                Ok(config) => render_ok(
                    req.request_id,
                    serde_json::to_value(config).unwrap_or(Value::Null),
                ),
                Err(e) => render_err(req.request_id, e),
            }
        }

        "update_configuration" => {
            let params: UpdateParams = parse_params!(req);
            if let Err(e) = state.store.get(&params.config_id) {
                return render_err(req.request_id, e);
            }
            if state.manager.any_active(&params.config_id).await {
                return render_err(
                    req.request_id,
                    Error::Busy(format!(
                        "configuration '{}' has non-stopped applications",
                        params.config_id
                    )),
                );
            }
            match state.store.update(&params.config_id, &params.updates) {
                Ok(config) => render_ok(
                    req.request_id,
                    serde_json::to_value(config).unwrap_or(Value::Null),
                ),
                Err(e) => render_err(req.request_id, e),
            }
        }

        "delete_configuration" => {
            let params: DeleteParams = parse_params!(req);
            if let Err(e) = state.store.get(&params.config_id) {
                return render_err(req.request_id, e);
            }
            if state.manager.any_active(&params.config_id).await {
                if !params.force {
                    return render_err(
                        req.request_id,
                        Error::Busy(format!(
                            "configuration '{}' has non-stopped applications, use force",
                            params.config_id
                        )),
                    );
                }
                if let Err(e) = state.manager.stop(&params.config_id, None, true).await {
                    return render_err(req.request_id, e);
                }
            }
            if let Err(e) = state.store.delete(&params.config_id) {
                return render_err(req.request_id, e);
            }
            if let Err(e) = state.logs.remove_config_logs(&params.config_id) {
                return render_err(req.request_id, Error::internal(e));
            }
            state.manager.forget_config(&params.config_id);
            render_ok(req.request_id, json!({ "ok": true }))
        }

        "start_configuration" => {
            let params: TargetParams = parse_params!(req);
            match state
                .manager
                .start(&params.config_id, params.app_ids.as_deref())
                .await
            {
                Ok(results) => render_ok(req.request_id, json!({ "per_app": per_app(results) })),
                Err(e) => render_err(req.request_id, e),
            }
        }

        "stop_configuration" => {
            let params: StopParams = parse_params!(req);
            match state
                .manager
                .stop(&params.config_id, params.app_ids.as_deref(), params.graceful)
                .await
            {
                Ok(results) => render_ok(req.request_id, json!({ "per_app": per_app(results) })),
                Err(e) => render_err(req.request_id, e),
            }
        }

        "restart_configuration" => {
            let params: TargetParams = parse_params!(req);
            match state
                .manager
                .restart(&params.config_id, params.app_ids.as_deref())
                .await
            {
                Ok((stopped, started)) => render_ok(
                    req.request_id,
                    json!({
                        "stopped": per_app(stopped),
                        "per_app": per_app(started),
                    }),
                ),
                Err(e) => render_err(req.request_id, e),
            }
        }

        "get_status" => {
            let params: TargetParams = parse_params!(req);
            match state
                .manager
                .status(&params.config_id, params.app_ids.as_deref())
                .await
            {
                Ok(statuses) => {
                    let map: BTreeMap<String, Value> = statuses
                        .into_iter()
                        .map(|s| {
                            let id = s.app_id.clone();
                            (id, serde_json::to_value(s).unwrap_or(Value::Null))
                        })
                        .collect();
                    render_ok(req.request_id, json!({ "per_app": map }))
                }
                Err(e) => render_err(req.request_id, e),
            }
        }

        "get_logs" => {
            let params: LogsParams = parse_params!(req);
            let _ = find_app!(state, req, &params.config_id, &params.app_id);
            let entries = state.logs.tail(
                &params.config_id,
                &params.app_id,
                params.lines,
                params.run_id.as_deref(),
            );
            render_ok(req.request_id, json!({ "entries": entries }))
        }

        "search_logs" => {
            let params: SearchParams = parse_params!(req);
            let _ = find_app!(state, req, &params.config_id, &params.app_id);
            let matches = state.logs.search(
                &params.config_id,
                &params.app_id,
                &params.query,
                params.max_results,
                params.case_sensitive,
            );
            render_ok(req.request_id, json!({ "matches": matches }))
        }

        "list_log_runs" => {
            let params: AppParams = parse_params!(req);
            let _ = find_app!(state, req, &params.config_id, &params.app_id);
            let runs = state.logs.list_runs(&params.config_id, &params.app_id);
            render_ok(req.request_id, json!({ "runs": runs }))
        }

        "run_command" => {
            let params: CommandParams = parse_params!(req);
            if params.command.trim().is_empty() {
                return render_err(req.request_id, Error::CommandFailed { exit_code: -1 });
            }
            let (config, app) = find_app!(state, req, &params.config_id, &params.app_id);
            let Some(handler) = state.registry.get(&app.app_type) else {
                return render_err(req.request_id, Error::HandlerMissing(app.app_type.clone()));
            };
            let env = state.manager.command_env(&config, &app).await;
            let result =
                run_custom_command(handler, &app, &params.command, &params.args, &env).await;
            render_ok(
                req.request_id,
                serde_json::to_value(result).unwrap_or(Value::Null),
            )
        }

        "trigger_reload" => {
            let params: AppParams = parse_params!(req);
            let (_, app) = find_app!(state, req, &params.config_id, &params.app_id);
            let Some(handler) = state.registry.get(&app.app_type) else {
                return render_err(req.request_id, Error::HandlerMissing(app.app_type.clone()));
            };
            let outcome = handler.trigger_reload(&app).await;
            render_ok(
                req.request_id,
                serde_json::to_value(outcome).unwrap_or(Value::Null),
            )
        }

        other => render_err(
            req.request_id,
            Error::NotFound(format!("method '{other}'")),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::default_registry;
    use crate::ports::PortAllocator;
    use std::path::PathBuf;
    use std::time::Duration;

    fn temp_state(label: &str) -> (ControlState, PathBuf) {
        let dir =
            std::env::temp_dir().join(format!("csrunner-test-{label}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(dir.join("configurations")).unwrap();
        std::fs::create_dir_all(dir.join("logs")).unwrap();

        let store = Arc::new(ConfigStore::new(dir.join("configurations")));
        let logs = Arc::new(LogManager::new(dir.join("logs"), 10, 100));
        let ports = Arc::new(PortAllocator::new());
        let registry = Arc::new(default_registry());
        let manager = ProcessManager::new(
            store.clone(),
            logs.clone(),
            ports,
            registry.clone(),
            Duration::from_secs(2),
        );
        (
            ControlState {
                store,
                manager,
                logs,
                registry,
                data_dir: dir.clone(),
            },
            dir,
        )
    }

    async fn call(state: &ControlState, method: &str, params: Value) -> ResponseEnvelope {
        dispatch_request(
            RequestEnvelope {
                request_id: "req-1".to_string(),
                method: method.to_string(),
                params,
            },
            state,
        )
        .await
    }

    fn app_json(id: &str, command: &str) -> Value {
        json!({
            "id": id,
            "name": id,
            "app_type": "python",
            "working_dir": "/tmp",
            "command": command,
        })
    }

    #[tokio::test]
    async fn create_get_list_roundtrip() {
        let (state, dir) = temp_state("ctl-roundtrip");
        let resp = call(
            &state,
            "create_configuration",
            json!({"name": "web", "applications": [app_json("a", "true")]}),
        )
        .await;
        assert!(resp.ok, "create failed: {:?}", resp.error);
        let id = resp.result.unwrap()["id"].as_str().unwrap().to_string();

        let resp = call(&state, "get_configuration", json!({"config_id": id})).await;
        assert!(resp.ok);
        assert_eq!(resp.result.unwrap()["name"], "web");

        let resp = call(&state, "list_configurations", json!({})).await;
        let list = resp.result.unwrap();
        assert_eq!(list["configurations"].as_array().unwrap().len(), 1);
        assert_eq!(list["configurations"][0]["has_running"], false);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn cyclic_create_is_rejected_with_cycle_details() {
        let (state, dir) = temp_state("ctl-cycle");
        let mut a = app_json("a", "true");
        a["depends_on"] = json!(["b"]);
        let mut b = app_json("b", "true");
        b["depends_on"] = json!(["a"]);
        let resp = call(
            &state,
            "create_configuration",
            json!({"name": "cyclic", "applications": [a, b]}),
        )
        .await;
        assert!(!resp.ok);
        let err = resp.error.unwrap();
        assert_eq!(err.code, "config_invalid");
        assert!(err.details.unwrap()["cycle"].is_array());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn update_while_running_is_busy() {
        let (state, dir) = temp_state("ctl-busy");
        let resp = call(
            &state,
            "create_configuration",
            json!({"name": "web", "applications": [app_json("svc", "sleep 30")]}),
        )
        .await;
        let id = resp.result.unwrap()["id"].as_str().unwrap().to_string();

        let resp = call(&state, "start_configuration", json!({"config_id": id})).await;
        assert!(resp.ok);
        assert_eq!(resp.result.unwrap()["per_app"]["svc"]["state"], "running");

        let resp = call(
            &state,
            "update_configuration",
            json!({"config_id": id, "updates": {"description": "nope"}}),
        )
        .await;
        assert!(!resp.ok);
        assert_eq!(resp.error.unwrap().code, "busy");

        let resp = call(&state, "stop_configuration", json!({"config_id": id})).await;
        assert!(resp.ok);
        let resp = call(
            &state,
            "update_configuration",
            json!({"config_id": id, "updates": {"description": "now fine"}}),
        )
        .await;
        assert!(resp.ok);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn force_delete_stops_apps_and_removes_everything() {
        let (state, dir) = temp_state("ctl-delete");
        let resp = call(
            &state,
            "create_configuration",
            json!({"name": "web", "applications": [app_json("svc", "echo hi; sleep 30")]}),
        )
        .await;
        let id = resp.result.unwrap()["id"].as_str().unwrap().to_string();
        call(&state, "start_configuration", json!({"config_id": id})).await;

        // Without force: busy.
        let resp = call(&state, "delete_configuration", json!({"config_id": id})).await;
        assert_eq!(resp.error.unwrap().code, "busy");

        let resp = call(
            &state,
            "delete_configuration",
            json!({"config_id": id, "force": true}),
        )
        .await;
        assert!(resp.ok, "{:?}", resp.error);
        assert!(!dir.join(format!("configurations/{id}.json")).exists());
        assert!(!dir.join(format!("logs/{id}")).exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn log_verbs_validate_ids() {
        let (state, dir) = temp_state("ctl-logs");
        let resp = call(
            &state,
            "get_logs",
            json!({"config_id": "ghost", "app_id": "x"}),
        )
        .await;
        assert_eq!(resp.error.unwrap().code, "not_found");

        let resp = call(
            &state,
            "create_configuration",
            json!({"name": "web", "applications": [app_json("svc", "true")]}),
        )
        .await;
        let id = resp.result.unwrap()["id"].as_str().unwrap().to_string();
        let resp = call(
            &state,
            "get_logs",
            json!({"config_id": id, "app_id": "nope"}),
        )
        .await;
        assert_eq!(resp.error.unwrap().code, "not_found");

        let resp = call(
            &state,
            "get_logs",
            json!({"config_id": id, "app_id": "svc"}),
        )
        .await;
        assert!(resp.ok);
        assert!(resp.result.unwrap()["entries"].as_array().unwrap().is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn run_command_passes_through_and_reports_exit() {
        let (state, dir) = temp_state("ctl-cmd");
        let resp = call(
            &state,
            "create_configuration",
            json!({"name": "web", "applications": [app_json("svc", "true")]}),
        )
        .await;
        let id = resp.result.unwrap()["id"].as_str().unwrap().to_string();

        let resp = call(
            &state,
            "run_command",
            json!({
                "config_id": id, "app_id": "svc",
                "command": "sh", "args": ["-c", "echo custom-out; exit 4"],
            }),
        )
        .await;
        assert!(resp.ok, "non-zero exit is still a successful dispatch");
        let result = resp.result.unwrap();
        assert_eq!(result["exit_code"], 4);
        assert_eq!(result["stdout"].as_str().unwrap().trim(), "custom-out");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn trigger_reload_reports_unsupported() {
        let (state, dir) = temp_state("ctl-reload");
        let resp = call(
            &state,
            "create_configuration",
            json!({"name": "web", "applications": [app_json("svc", "python server.py")]}),
        )
        .await;
        let id = resp.result.unwrap()["id"].as_str().unwrap().to_string();

        let resp = call(
            &state,
            "trigger_reload",
            json!({"config_id": id, "app_id": "svc"}),
        )
        .await;
        assert!(resp.ok);
        assert_eq!(resp.result.unwrap()["ok"], false);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn unknown_method_is_not_found() {
        let (state, dir) = temp_state("ctl-unknown");
        let resp = call(&state, "frobnicate", json!({})).await;
        assert_eq!(resp.error.unwrap().code, "not_found");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn serve_speaks_line_delimited_json() {
        let (state, dir) = temp_state("ctl-serve");
        let input = b"{\"request_id\": \"r1\", \"method\": \"ping\", \"params\": {}}\n" as &[u8];
        let mut output = Vec::new();
        serve(input, &mut output, state).await.unwrap();

        let line = String::from_utf8(output).unwrap();
        let resp: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(resp["request_id"], "r1");
        assert_eq!(resp["ok"], true);
        assert_eq!(resp["result"]["pong"], true);
        std::fs::remove_dir_all(&dir).ok();
    }
}
