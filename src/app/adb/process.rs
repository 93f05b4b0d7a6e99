use std::process::{Child, ChildStdout};
use std::time::{Duration, Instant};

/// A bridge command that keeps running after it was spawned (logcat, the automation stub).
pub struct AdbProcess {
    child: Child,
    exit_code: Option<Option<i32>>,
}

impl AdbProcess {
    pub fn from_child(child: Child) -> Self {
        Self {
            child,
            exit_code: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn has_exited(&mut self) -> bool {
        self.poll().is_some()
    }

    /// `None` while running; `Some(code)` once exited (`code` is `None` when killed by a signal).
    pub fn poll(&mut self) -> Option<Option<i32>> {
        if self.exit_code.is_none() {
            if let Ok(Some(status)) = self.child.try_wait() {
                self.exit_code = Some(status.code());
            }
        }
        self.exit_code
    }

    pub fn wait(&mut self) -> Option<i32> {
        if let Some(code) = self.exit_code {
            return code;
        }
        let code = self.child.wait().ok().and_then(|status| status.code());
        self.exit_code = Some(code);
        code
    }

    pub fn wait_timeout(&mut self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.has_exited() {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    pub fn terminate(&mut self) {
        if self.has_exited() {
            return;
        }
        let _ = self.child.kill();
        self.wait();
    }
}

impl std::fmt::Debug for AdbProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdbProcess")
            .field("pid", &self.child.id())
            .field("exit_code", &self.exit_code)
            .finish()
    }
}
