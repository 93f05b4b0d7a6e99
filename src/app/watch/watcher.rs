use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::app::adb::channel::CommandChannel;
use crate::app::adb::device;
use crate::app::error::AppError;
use crate::app::watch::matcher::Matcher;
use crate::app::watch::registry::{PatternRegistry, WatchHandle};
use crate::app::watch::tail::{LogTail, TailCloser};

pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Created,
    Running,
    Stopped,
}

/// Admits at most one live watcher. Owned by the device session and shared by
/// clone.
#[derive(Debug, Clone, Default)]
pub struct WatchSlot {
    active: Arc<AtomicBool>,
}

impl WatchSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, trace_id: &str) -> Result<SlotGuard, AppError> {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(AppError::concurrency(
                "Another log watcher is already active",
                trace_id,
            ));
        }
        Ok(SlotGuard {
            active: Arc::clone(&self.active),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// Releases the slot when dropped.
#[derive(Debug)]
pub struct SlotGuard {
    active: Arc<AtomicBool>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub timeout: Duration,
    /// Total budget measured from the start of the wait. Only used when it
    /// exceeds `timeout`.
    pub stall: Option<Duration>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_WAIT_TIMEOUT,
            stall: None,
        }
    }
}

impl WaitOptions {
    pub fn from_millis(timeout_ms: u64, stall_ms: u64) -> Self {
        Self {
            timeout: Duration::from_millis(timeout_ms),
            stall: (stall_ms > 0).then(|| Duration::from_millis(stall_ms)),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_stall(mut self, stall: Duration) -> Self {
        self.stall = Some(stall);
        self
    }
}

/// Tails the device log on a worker thread and resolves registered
/// expectations as matching lines arrive.
pub struct LogWatcher {
    trace_id: String,
    registry: Arc<PatternRegistry>,
    tail: Option<LogTail>,
    closer: TailCloser,
    stop_flag: Arc<AtomicBool>,
    stream_ended: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    state: WatcherState,
    guard: Option<SlotGuard>,
}

impl LogWatcher {
    /// Claims the slot, optionally clears the device log buffer, then starts
    /// `adb logcat`.
    pub fn open(
        slot: &WatchSlot,
        channel: &dyn CommandChannel,
        clear_log: bool,
        trace_id: &str,
    ) -> Result<Self, AppError> {
        let guard = slot.acquire(trace_id)?;
        if clear_log {
            device::clear_log(channel, trace_id)?;
        }
        let tail = LogTail::open(channel, trace_id)?;
        Ok(Self::with_guard(guard, tail, trace_id))
    }

    /// Wraps an existing tail. A tail built with `LogTail::from_reader` should
    /// reach end of file on its own; if its read is still blocked at `stop`,
    /// the worker is detached rather than joined.
    pub fn new(slot: &WatchSlot, mut tail: LogTail, trace_id: &str) -> Result<Self, AppError> {
        match slot.acquire(trace_id) {
            Ok(guard) => Ok(Self::with_guard(guard, tail, trace_id)),
            Err(err) => {
                tail.close();
                Err(err)
            }
        }
    }

    fn with_guard(guard: SlotGuard, tail: LogTail, trace_id: &str) -> Self {
        Self {
            trace_id: trace_id.to_string(),
            registry: Arc::new(PatternRegistry::new()),
            closer: tail.closer(),
            tail: Some(tail),
            stop_flag: Arc::new(AtomicBool::new(false)),
            stream_ended: Arc::new(AtomicBool::new(false)),
            worker: None,
            state: WatcherState::Created,
            guard: Some(guard),
        }
    }

    pub fn start(&mut self) -> Result<(), AppError> {
        if self.state != WatcherState::Created {
            return Err(AppError::validation(
                format!("Log watcher cannot start from state {:?}", self.state),
                &self.trace_id,
            ));
        }
        let Some(tail) = self.tail.take() else {
            return Err(AppError::system("Log watcher has no log stream", &self.trace_id));
        };

        let registry = Arc::clone(&self.registry);
        let stop_flag = Arc::clone(&self.stop_flag);
        let stream_ended = Arc::clone(&self.stream_ended);
        let trace_id = self.trace_id.clone();
        let worker = thread::Builder::new()
            .name("log-watcher".to_string())
            .spawn(move || run_worker(tail, registry, stop_flag, stream_ended, trace_id))
            .map_err(|err| {
                AppError::system(format!("Failed to spawn log watcher: {err}"), &self.trace_id)
            })?;

        self.worker = Some(worker);
        self.state = WatcherState::Running;
        info!(trace_id = %self.trace_id, "log watcher started");
        Ok(())
    }

    pub fn watch(&self, pattern: &str) -> Result<WatchHandle, AppError> {
        self.watch_times(pattern, 1)
    }

    pub fn watch_times(&self, pattern: &str, min_times: u32) -> Result<WatchHandle, AppError> {
        let matcher = Matcher::pattern(pattern, &self.trace_id)?;
        self.watch_matcher(matcher, min_times)
    }

    pub fn watch_matcher(&self, matcher: Matcher, min_times: u32) -> Result<WatchHandle, AppError> {
        if self.state == WatcherState::Stopped {
            return Err(AppError::validation(
                "Log watcher is stopped; cannot register patterns",
                &self.trace_id,
            ));
        }
        let handle = self.registry.register(matcher, min_times);
        debug!(
            trace_id = %self.trace_id,
            watch = %handle.id(),
            pattern = %handle.description(),
            min_times = min_times.max(1),
            "watch registered"
        );
        Ok(handle)
    }

    /// Waits for every expectation registered so far.
    pub fn wait(&self, options: WaitOptions) -> Result<(), AppError> {
        let handles = self.registry.pending();
        self.wait_for(&handles, options)
    }

    pub fn wait_for(&self, handles: &[WatchHandle], options: WaitOptions) -> Result<(), AppError> {
        if handles.is_empty() {
            return Ok(());
        }
        if self.state != WatcherState::Running {
            warn!(trace_id = %self.trace_id, state = ?self.state, "waiting on a watcher that is not running");
        }

        let start = Instant::now();
        let mut unresolved = wait_all(handles, start + options.timeout);
        if unresolved.is_empty() {
            return Ok(());
        }

        if let Some(stall) = options.stall.filter(|stall| *stall > options.timeout) {
            debug!(
                trace_id = %self.trace_id,
                pending = unresolved.len(),
                stall_ms = stall.as_millis() as u64,
                "watch timeout reached; stalling"
            );
            unresolved = wait_all(&unresolved, start + stall);
            if unresolved.is_empty() {
                return Ok(());
            }
        }

        let err = self.timeout_error(&unresolved, start.elapsed());
        warn!(trace_id = %self.trace_id, error = %err, "watch failed");
        Err(err)
    }

    fn timeout_error(&self, unresolved: &[WatchHandle], elapsed: Duration) -> AppError {
        let patterns = unresolved
            .iter()
            .map(|handle| format!("pattern: {}", handle.description()))
            .collect::<Vec<_>>()
            .join("; ");
        let mut message = format!(
            "Timed out after {}ms waiting for log lines ({patterns})",
            elapsed.as_millis()
        );
        if self.stream_ended() {
            message.push_str("; log stream ended");
        }
        AppError::watch_timeout(message, &self.trace_id)
    }

    /// Stops the worker, closes the log stream, and releases the slot.
    pub fn stop(&mut self) {
        if self.state == WatcherState::Stopped {
            return;
        }
        self.stop_flag.store(true, Ordering::Release);
        self.closer.close();
        self.tail = None;
        if let Some(worker) = self.worker.take() {
            if !self.closer.can_interrupt() && !worker.is_finished() {
                // The stop flag makes it exit on its next line or at end of file.
                debug!(trace_id = %self.trace_id, "log source cannot be interrupted; detaching worker");
            } else if worker.join().is_err() {
                warn!(trace_id = %self.trace_id, "log watcher worker panicked");
            }
        }
        self.state = WatcherState::Stopped;
        self.guard = None;
        info!(
            trace_id = %self.trace_id,
            pending = self.registry.len(),
            "log watcher stopped"
        );
    }

    pub fn state(&self) -> WatcherState {
        self.state
    }

    pub fn pending_count(&self) -> usize {
        self.registry.len()
    }

    pub fn stream_ended(&self) -> bool {
        self.stream_ended.load(Ordering::Acquire)
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }
}

impl Drop for LogWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for LogWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWatcher")
            .field("trace_id", &self.trace_id)
            .field("state", &self.state)
            .field("pending", &self.registry.len())
            .finish()
    }
}

fn wait_all(handles: &[WatchHandle], deadline: Instant) -> Vec<WatchHandle> {
    handles
        .iter()
        .filter(|handle| !handle.wait_until(deadline))
        .cloned()
        .collect()
}

fn run_worker(
    mut tail: LogTail,
    registry: Arc<PatternRegistry>,
    stop_flag: Arc<AtomicBool>,
    stream_ended: Arc<AtomicBool>,
    trace_id: String,
) {
    let mut lines = 0u64;
    loop {
        if stop_flag.load(Ordering::Acquire) {
            break;
        }
        let Some(line) = tail.next_line() else {
            if !stop_flag.load(Ordering::Acquire) {
                stream_ended.store(true, Ordering::Release);
                let err = AppError::stream_ended("Log stream ended while watching", &trace_id);
                warn!(
                    trace_id = %trace_id,
                    error = %err,
                    pending = registry.len(),
                    "log stream ended"
                );
            }
            break;
        };
        if stop_flag.load(Ordering::Acquire) {
            break;
        }
        lines += 1;
        registry.process_line(&line, &trace_id);
    }
    debug!(trace_id = %trace_id, lines, "log watcher worker exiting");
}
