use std::time::Duration;

use tracing::debug;

use crate::domain::{HealthCheckKind, HealthCheckSpec, HealthVerdict};

/// Runtime facts a probe may need beyond the check definition.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeContext {
    pub pid: Option<u32>,
    pub allocated_port: Option<u16>,
}

/// Stateless per call; looping at the probe interval is the process
/// manager's job. No call outlives the check's configured timeout.
pub struct HealthProber {
    http: reqwest::Client,
}

impl Default for HealthProber {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthProber {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    pub async fn probe(&self, spec: &HealthCheckSpec, ctx: &ProbeContext) -> HealthVerdict {
        let timeout = Duration::from_secs(spec.timeout);
        match spec.kind {
            HealthCheckKind::Http => self.probe_http(spec, timeout).await,
            HealthCheckKind::Tcp => {
                let Some(port) = spec.port.or(ctx.allocated_port) else {
                    return HealthVerdict::Unknown;
                };
                probe_tcp(port, timeout).await
            }
            HealthCheckKind::Process => probe_process(ctx.pid),
        }
    }

    /// 2xx and 3xx are healthy; network errors and timeouts are not.
    async fn probe_http(&self, spec: &HealthCheckSpec, timeout: Duration) -> HealthVerdict {
        let Some(url) = &spec.url else {
            return HealthVerdict::Unknown;
        };
        match self.http.get(url).timeout(timeout).send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() || status.is_redirection() {
                    HealthVerdict::Healthy
                } else {
                    debug!(url, status = %status, "http probe returned non-2xx/3xx");
                    HealthVerdict::Unhealthy
                }
            }
            Err(err) => {
                debug!(url, error = %err, "http probe failed");
                HealthVerdict::Unhealthy
            }
        }
    }
}

async fn probe_tcp(port: u16, timeout: Duration) -> HealthVerdict {
    match tokio::time::timeout(
        timeout,
        tokio::net::TcpStream::connect(("127.0.0.1", port)),
    )
    .await
    {
        Ok(Ok(_)) => HealthVerdict::Healthy,
        _ => HealthVerdict::Unhealthy,
    }
}

/// Signal 0 reports deliverability without delivering anything. The
/// manager's exit monitor reaps children promptly, so a zombie shows up
/// as an exit rather than a live pid.
fn probe_process(pid: Option<u32>) -> HealthVerdict {
    let Some(pid) = pid else {
        return HealthVerdict::Unhealthy;
    };
    let alive = unsafe { libc::kill(pid as i32, 0) } == 0;
    if alive {
        HealthVerdict::Healthy
    } else {
        HealthVerdict::Unhealthy
    }
}
