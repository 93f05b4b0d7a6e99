use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use crate::app::adb::channel::CommandChannel;
use crate::app::adb::process::AdbProcess;
use crate::app::adb::runner::CommandOutput;
use crate::app::error::AppError;

type RunHandler = Box<dyn Fn(&[String]) -> Result<CommandOutput, AppError> + Send + Sync>;

/// Records every bridge invocation and answers `run` from a handler. `spawn`
/// starts a local shell script instead of adb.
pub struct FakeChannel {
    calls: Mutex<Vec<Vec<String>>>,
    handler: RunHandler,
    spawn_script: String,
}

impl FakeChannel {
    pub fn new(
        handler: impl Fn(&[String]) -> Result<CommandOutput, AppError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            handler: Box::new(handler),
            spawn_script: "exec sleep 30".to_string(),
        }
    }

    pub fn ok() -> Self {
        Self::new(|_| Ok(output("")))
    }

    pub fn with_spawn_script(mut self, script: &str) -> Self {
        self.spawn_script = script.to_string();
        self
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().expect("calls").clone()
    }

    pub fn joined_calls(&self) -> Vec<String> {
        self.calls().iter().map(|call| call.join(" ")).collect()
    }
}

pub fn output(stdout: &str) -> CommandOutput {
    CommandOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: Some(0),
    }
}

impl CommandChannel for FakeChannel {
    fn spawn(&self, args: &[String], trace_id: &str) -> Result<AdbProcess, AppError> {
        self.calls.lock().expect("calls").push(args.to_vec());
        let child = Command::new("sh")
            .args(["-c", &self.spawn_script])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| AppError::system(format!("spawn failed: {err}"), trace_id))?;
        Ok(AdbProcess::from_child(child))
    }

    fn run(
        &self,
        args: &[String],
        _timeout: Duration,
        _trace_id: &str,
    ) -> Result<CommandOutput, AppError> {
        self.calls.lock().expect("calls").push(args.to_vec());
        (self.handler)(args)
    }

    fn serial(&self) -> Option<&str> {
        Some("FAKE")
    }
}
