use std::io::{BufRead, BufReader, Read};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::app::adb::channel::{args, CommandChannel};
use crate::app::adb::process::AdbProcess;
use crate::app::error::AppError;

/// Closes the process feeding a [`LogTail`] from any thread. Killing the
/// process closes its stdout, which unblocks a reader parked in `next_line`.
#[derive(Clone, Default)]
pub struct TailCloser {
    process: Arc<Mutex<Option<AdbProcess>>>,
    interruptible: bool,
}

impl TailCloser {
    fn tracking(process: AdbProcess) -> Self {
        Self {
            process: Arc::new(Mutex::new(Some(process))),
            interruptible: true,
        }
    }

    /// False for reader-backed tails: closing them cannot wake a blocked read.
    pub fn can_interrupt(&self) -> bool {
        self.interruptible
    }

    pub fn close(&self) {
        let taken = self
            .process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut process) = taken {
            debug!(pid = process.id(), "closing log tail process");
            process.terminate();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// Live, line-oriented view of the device log.
pub struct LogTail {
    reader: Box<dyn BufRead + Send>,
    closer: TailCloser,
    ended: bool,
}

impl LogTail {
    /// Starts `adb logcat` on the channel's device.
    pub fn open(channel: &dyn CommandChannel, trace_id: &str) -> Result<Self, AppError> {
        let process = channel.spawn(&args(&["logcat"]), trace_id)?;
        Self::from_process(process, trace_id)
    }

    pub fn from_process(mut process: AdbProcess, trace_id: &str) -> Result<Self, AppError> {
        let Some(stdout) = process.take_stdout() else {
            process.terminate();
            return Err(AppError::system("Log process has no stdout pipe", trace_id));
        };
        Ok(Self {
            reader: Box::new(BufReader::new(stdout)),
            closer: TailCloser::tracking(process),
            ended: false,
        })
    }

    /// A tail over a finite or self-terminating source. `close` cannot
    /// interrupt a read that is blocked on it; a watcher over such a tail
    /// detaches its worker on stop instead of joining it.
    pub fn from_reader(reader: impl Read + Send + 'static) -> Self {
        Self {
            reader: Box::new(BufReader::new(reader)),
            closer: TailCloser::default(),
            ended: false,
        }
    }

    /// Next non-blank line without its terminator, or `None` once the source
    /// reports end of file (or a read error).
    pub fn next_line(&mut self) -> Option<String> {
        let mut buf = Vec::new();
        while !self.ended {
            buf.clear();
            match self.reader.read_until(b'\n', &mut buf) {
                Ok(0) => self.ended = true,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\r', '\n']);
                    if !line.trim().is_empty() {
                        return Some(line.to_string());
                    }
                }
                Err(err) => {
                    debug!(error = %err, "log tail read failed");
                    self.ended = true;
                }
            }
        }
        None
    }

    pub fn has_ended(&self) -> bool {
        self.ended
    }

    pub fn closer(&self) -> TailCloser {
        self.closer.clone()
    }

    pub fn close(&mut self) {
        self.closer.close();
    }
}

impl Drop for LogTail {
    fn drop(&mut self) {
        self.closer.close();
    }
}

impl std::fmt::Debug for LogTail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogTail")
            .field("ended", &self.ended)
            .field("closed", &self.closer.is_closed())
            .finish()
    }
}
