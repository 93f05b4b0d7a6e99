use std::io::{BufRead, BufReader};
use std::time::Duration;

use tracing::debug;

use crate::app::adb::process::AdbProcess;
use crate::app::adb::runner::{collect_output, spawn_piped, CommandOutput};
use crate::app::error::AppError;

/// The only way the rest of the crate talks to a device.
pub trait CommandChannel: Send + Sync {
    /// Starts a bridge command and hands back the running process. stdout stays piped.
    fn spawn(&self, args: &[String], trace_id: &str) -> Result<AdbProcess, AppError>;

    /// Runs a bridge command to completion.
    fn run(&self, args: &[String], timeout: Duration, trace_id: &str)
        -> Result<CommandOutput, AppError>;

    fn serial(&self) -> Option<&str>;
}

#[derive(Debug, Clone)]
pub struct AdbChannel {
    program: String,
    serial: Option<String>,
}

impl AdbChannel {
    pub fn new(program: impl Into<String>, serial: Option<String>) -> Self {
        Self {
            program: program.into(),
            serial: serial
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn full_args(&self, args: &[String]) -> Vec<String> {
        let mut full = Vec::with_capacity(args.len() + 2);
        if let Some(serial) = &self.serial {
            full.push("-s".to_string());
            full.push(serial.clone());
        }
        full.extend(args.iter().cloned());
        full
    }
}

impl CommandChannel for AdbChannel {
    fn spawn(&self, args: &[String], trace_id: &str) -> Result<AdbProcess, AppError> {
        let full = self.full_args(args);
        debug!(trace_id = %trace_id, args = ?full, "spawning adb process");
        let mut child = spawn_piped(&self.program, &full, trace_id)?;

        // Long-running commands rarely write to stderr, but it still has to be drained.
        if let Some(stderr) = child.stderr.take() {
            let trace_stderr = trace_id.to_string();
            std::thread::spawn(move || {
                let reader = BufReader::new(stderr);
                for line in reader.lines() {
                    let Ok(line) = line else { break };
                    if !line.trim().is_empty() {
                        debug!(trace_id = %trace_stderr, stderr = %line, "adb process stderr");
                    }
                }
            });
        }
        Ok(AdbProcess::from_child(child))
    }

    fn run(
        &self,
        args: &[String],
        timeout: Duration,
        trace_id: &str,
    ) -> Result<CommandOutput, AppError> {
        let full = self.full_args(args);
        debug!(trace_id = %trace_id, args = ?full, "running adb command");
        let child = spawn_piped(&self.program, &full, trace_id)?;
        collect_output(child, timeout, trace_id)
    }

    fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }
}

pub fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}
