use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use ureq::Agent;

use crate::app::error::AppError;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// The HTTP surface of the on-device automation stub.
pub trait StubEndpoint: Send + Sync {
    /// Liveness probe; true when the stub answers `ping` with `"pong"`.
    fn ping(&self, trace_id: &str) -> bool;

    /// Asks the stub to exit on its own.
    fn shutdown(&self, trace_id: &str) -> Result<(), AppError>;

    fn call(&self, method: &str, params: Value, trace_id: &str) -> Result<Value, AppError>;
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

/// JSON-RPC 2.0 over the forwarded port.
pub struct RpcClient {
    base_url: String,
    probe: Agent,
    agent: Agent,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(local_port: u16, request_timeout: Duration) -> Self {
        Self {
            base_url: format!("http://127.0.0.1:{local_port}"),
            probe: build_agent(PROBE_TIMEOUT.min(request_timeout)),
            agent: build_agent(request_timeout),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn rpc_url(&self) -> String {
        format!("{}/jsonrpc/0", self.base_url)
    }

    pub fn stop_url(&self) -> String {
        format!("{}/stop", self.base_url)
    }

    fn post(
        &self,
        agent: &Agent,
        method: &str,
        params: Value,
        trace_id: &str,
    ) -> Result<Value, AppError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = build_request(id, method, params);
        let payload = serde_json::to_vec(&body)
            .map_err(|err| AppError::system(format!("Failed to encode RPC request: {err}"), trace_id))?;

        debug!(trace_id = %trace_id, method = %method, id, "rpc request");
        let response = agent
            .post(self.rpc_url().as_str())
            .header("Content-Type", "application/json")
            .send(payload.as_slice())
            .map_err(|err| {
                AppError::rpc_transport(format!("RPC {method} failed: {err}"), trace_id)
            })?;
        let text = response.into_body().read_to_string().map_err(|err| {
            AppError::rpc_transport(format!("RPC {method} response unreadable: {err}"), trace_id)
        })?;
        parse_response(method, &text, trace_id)
    }
}

fn build_agent(timeout: Duration) -> Agent {
    Agent::config_builder()
        .timeout_global(Some(timeout))
        .build()
        .into()
}

pub fn build_request(id: u64, method: &str, params: Value) -> Value {
    let params = match params {
        Value::Null => json!([]),
        Value::Array(_) => params,
        other => json!([other]),
    };
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": id,
    })
}

pub fn parse_response(method: &str, text: &str, trace_id: &str) -> Result<Value, AppError> {
    let response: RpcResponse = serde_json::from_str(text).map_err(|err| {
        AppError::rpc_transport(format!("RPC {method} returned malformed body: {err}"), trace_id)
    })?;
    if let Some(error) = response.error {
        return Err(AppError::rpc_remote(
            format!("RPC {method} error {}: {}", error.code, error.message),
            trace_id,
        ));
    }
    Ok(response.result.unwrap_or(Value::Null))
}

impl StubEndpoint for RpcClient {
    fn ping(&self, trace_id: &str) -> bool {
        match self.post(&self.probe, "ping", Value::Null, trace_id) {
            Ok(value) => value.as_str() == Some("pong"),
            Err(err) => {
                debug!(trace_id = %trace_id, error = %err, "ping failed");
                false
            }
        }
    }

    fn shutdown(&self, trace_id: &str) -> Result<(), AppError> {
        self.probe
            .get(self.stop_url().as_str())
            .call()
            .map(|_| ())
            .map_err(|err| AppError::rpc_transport(format!("Stub shutdown failed: {err}"), trace_id))
    }

    fn call(&self, method: &str, params: Value, trace_id: &str) -> Result<Value, AppError> {
        self.post(&self.agent, method, params, trace_id)
    }
}
