use serde::Serialize;
use std::fmt;

pub const ERR_VALIDATION: &str = "ERR_VALIDATION";
pub const ERR_DEPENDENCY: &str = "ERR_DEPENDENCY";
pub const ERR_SYSTEM: &str = "ERR_SYSTEM";
pub const ERR_STREAM_ENDED: &str = "ERR_STREAM_ENDED";
pub const ERR_WATCH_TIMEOUT: &str = "ERR_WATCH_TIMEOUT";
pub const ERR_CONCURRENCY: &str = "ERR_CONCURRENCY";
pub const ERR_SERVER_START: &str = "ERR_SERVER_START";
pub const ERR_RPC_TRANSPORT: &str = "ERR_RPC_TRANSPORT";
pub const ERR_RPC_REMOTE: &str = "ERR_RPC_REMOTE";

#[derive(Debug, Clone, Serialize)]
pub struct AppError {
    pub error: String,
    pub code: String,
    pub trace_id: String,
}

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: code.into(),
            trace_id: trace_id.into(),
        }
    }

    pub fn validation(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_VALIDATION, message, trace_id)
    }

    pub fn dependency(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_DEPENDENCY, message, trace_id)
    }

    pub fn system(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_SYSTEM, message, trace_id)
    }

    pub fn stream_ended(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_STREAM_ENDED, message, trace_id)
    }

    pub fn watch_timeout(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_WATCH_TIMEOUT, message, trace_id)
    }

    pub fn concurrency(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_CONCURRENCY, message, trace_id)
    }

    pub fn server_start(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_SERVER_START, message, trace_id)
    }

    pub fn rpc_transport(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_RPC_TRANSPORT, message, trace_id)
    }

    pub fn rpc_remote(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_RPC_REMOTE, message, trace_id)
    }

    pub fn is_code(&self, code: &str) -> bool {
        self.code == code
    }

    /// The stub could not be reached at all, as opposed to answering with an error.
    pub fn is_transport(&self) -> bool {
        self.is_code(ERR_RPC_TRANSPORT)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code)
    }
}

impl std::error::Error for AppError {}
