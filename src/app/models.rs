use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::app::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceSummary {
    pub serial: String,
    pub state: String,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Fail,
    Warn,
    Skip,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub duration_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of one runner or smoke invocation, printed as JSON with `--json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub tool: &'static str,
    pub status: CheckStatus,
    pub trace_id: String,
    pub serial: Option<String>,
    pub adb_program: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_data_dir: Option<String>,
    pub checks: Vec<CheckResult>,
}

impl RunSummary {
    pub fn new(tool: &'static str, trace_id: &str) -> Self {
        Self {
            tool,
            status: CheckStatus::Pass,
            trace_id: trace_id.to_string(),
            serial: None,
            adb_program: None,
            failure_data_dir: None,
            checks: Vec::new(),
        }
    }

    /// Runs `step` as a required check. A failure marks the whole run failed.
    pub fn check<T>(&mut self, name: &str, step: impl FnOnce() -> Result<T, AppError>) -> Option<T> {
        self.timed(name, CheckStatus::Fail, step)
    }

    /// Runs `step` as an advisory check. A failure is recorded as a warning.
    pub fn advise<T>(&mut self, name: &str, step: impl FnOnce() -> Result<T, AppError>) -> Option<T> {
        self.timed(name, CheckStatus::Warn, step)
    }

    pub fn skip(&mut self, name: &str, reason: &str) {
        self.checks.push(CheckResult {
            name: name.to_string(),
            status: CheckStatus::Skip,
            duration_ms: 0,
            error_code: None,
            error: Some(reason.to_string()),
        });
    }

    pub fn passed(&self) -> bool {
        self.status != CheckStatus::Fail
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks
            .iter()
            .filter(|check| check.status == CheckStatus::Fail)
    }

    fn timed<T>(
        &mut self,
        name: &str,
        on_error: CheckStatus,
        step: impl FnOnce() -> Result<T, AppError>,
    ) -> Option<T> {
        let start = Instant::now();
        let result = step();
        let duration_ms = start.elapsed().as_millis();
        match result {
            Ok(value) => {
                self.checks.push(CheckResult {
                    name: name.to_string(),
                    status: CheckStatus::Pass,
                    duration_ms,
                    error_code: None,
                    error: None,
                });
                Some(value)
            }
            Err(err) => {
                self.checks.push(CheckResult {
                    name: name.to_string(),
                    status: on_error,
                    duration_ms,
                    error_code: Some(err.code),
                    error: Some(err.error),
                });
                if on_error == CheckStatus::Fail {
                    self.status = CheckStatus::Fail;
                }
                None
            }
        }
    }
}
