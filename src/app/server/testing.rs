use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;

use crate::app::error::AppError;
use crate::app::server::lifecycle::{ServerOptions, RUNTIME_ARTIFACTS, STUB_ARTIFACTS};
use crate::app::server::rpc::StubEndpoint;

/// A host libs directory holding every artifact the server pushes.
pub fn artifact_dir() -> TempDir {
    let dir = TempDir::new().expect("tempdir");
    for name in STUB_ARTIFACTS.iter().chain(RUNTIME_ARTIFACTS.iter()) {
        fs::write(dir.path().join(name), b"jar").expect("write artifact");
    }
    dir
}

/// Short budgets so failing starts finish quickly.
pub fn fast_options(libs: &TempDir) -> ServerOptions {
    ServerOptions {
        local_port: 9008,
        device_port: 9008,
        start_timeout: Duration::from_millis(500),
        poll_interval: Duration::from_millis(100),
        shutdown_grace: Duration::from_millis(100),
        device_dir: "/data/local/tmp/".to_string(),
        libs_dir: libs.path().to_path_buf(),
    }
}

type PingHandler = Box<dyn Fn(usize) -> bool + Send + Sync>;
type CallHandler = Box<dyn Fn(&str, &Value, usize) -> Result<Value, AppError> + Send + Sync>;

/// Scripted stub endpoint. Handlers receive the zero-based attempt number.
pub struct FakeEndpoint {
    ping: PingHandler,
    call: CallHandler,
    shutdown_ok: bool,
    pings: AtomicUsize,
    shutdowns: AtomicUsize,
    calls: Mutex<Vec<String>>,
}

impl FakeEndpoint {
    pub fn new(
        ping: impl Fn(usize) -> bool + Send + Sync + 'static,
        call: impl Fn(&str, &Value, usize) -> Result<Value, AppError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            ping: Box::new(ping),
            call: Box::new(call),
            shutdown_ok: true,
            pings: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn alive() -> Self {
        Self::new(|_| true, |_, _, _| Ok(Value::Null))
    }

    pub fn dead() -> Self {
        Self::new(|_| false, |method, _, _| {
            Err(AppError::rpc_transport(format!("RPC {method} failed: connection refused"), "fake"))
        })
        .with_failing_shutdown()
    }

    pub fn with_failing_shutdown(mut self) -> Self {
        self.shutdown_ok = false;
        self
    }

    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn methods(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }
}

impl StubEndpoint for FakeEndpoint {
    fn ping(&self, _trace_id: &str) -> bool {
        let attempt = self.pings.fetch_add(1, Ordering::SeqCst);
        (self.ping)(attempt)
    }

    fn shutdown(&self, trace_id: &str) -> Result<(), AppError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        if self.shutdown_ok {
            Ok(())
        } else {
            Err(AppError::rpc_transport("Stub shutdown failed: connection refused", trace_id))
        }
    }

    fn call(&self, method: &str, params: Value, _trace_id: &str) -> Result<Value, AppError> {
        let attempt = {
            let mut calls = self.calls.lock().expect("calls");
            calls.push(method.to_string());
            calls.iter().filter(|name| name.as_str() == method).count() - 1
        };
        (self.call)(method, &params, attempt)
    }
}
