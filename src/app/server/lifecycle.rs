use std::collections::BTreeSet;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::ChildStdout;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::app::adb::channel::{args, CommandChannel};
use crate::app::adb::device;
use crate::app::adb::parse::parse_pid_line;
use crate::app::adb::paths::device_join;
use crate::app::adb::process::AdbProcess;
use crate::app::config::ServerSettings;
use crate::app::error::AppError;
use crate::app::server::rpc::StubEndpoint;

/// Process name of the running stub on the device.
pub const STUB_TOKEN: &str = "uiautomator";
pub const STUB_ARTIFACTS: [&str; 2] = ["bundle.jar", "uiautomator-stub.jar"];
/// Needed on SDK 21+ where the platform no longer ships a usable uiautomator.
pub const RUNTIME_ARTIFACTS: [&str; 3] = ["android.test.runner.jar", "uiautomator", "uiautomator.jar"];
const STUB_CLASS: &str = "com.github.uiautomatorstub.Stub";
const RUNTIME_MIN_SDK: u32 = 21;
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Alive,
    Stopping,
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub local_port: u16,
    pub device_port: u16,
    pub start_timeout: Duration,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
    pub device_dir: String,
    pub libs_dir: PathBuf,
}

impl From<&ServerSettings> for ServerOptions {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            local_port: settings.local_port,
            device_port: settings.device_port,
            start_timeout: settings.start_timeout(),
            poll_interval: settings.poll_interval(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            device_dir: settings.device_dir.clone(),
            libs_dir: PathBuf::from(&settings.libs_dir),
        }
    }
}

impl ServerOptions {
    pub fn launch_command(&self) -> String {
        format!(
            "echo $$; exec {} runtest {} -c {STUB_CLASS}",
            device_join(&self.device_dir, "uiautomator"),
            STUB_ARTIFACTS.join(" ")
        )
    }
}

struct Lifecycle {
    state: ServerState,
    process: Option<AdbProcess>,
    runtime_ready: bool,
}

/// Owns the on-device automation stub: deployment, launch, liveness, and
/// best-effort teardown.
pub struct AutomatorServer {
    channel: Arc<dyn CommandChannel>,
    endpoint: Arc<dyn StubEndpoint>,
    options: ServerOptions,
    lifecycle: Mutex<Lifecycle>,
    tracked_pids: Arc<Mutex<BTreeSet<u32>>>,
}

impl AutomatorServer {
    pub fn new(
        channel: Arc<dyn CommandChannel>,
        endpoint: Arc<dyn StubEndpoint>,
        options: ServerOptions,
    ) -> Self {
        Self {
            channel,
            endpoint,
            options,
            lifecycle: Mutex::new(Lifecycle {
                state: ServerState::Stopped,
                process: None,
                runtime_ready: false,
            }),
            tracked_pids: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn endpoint(&self) -> &dyn StubEndpoint {
        self.endpoint.as_ref()
    }

    pub fn state(&self) -> ServerState {
        self.lock().state
    }

    pub fn is_alive(&self, trace_id: &str) -> bool {
        self.endpoint.ping(trace_id)
    }

    /// Device pids recorded from launched stubs that have not been killed yet.
    pub fn tracked_pids(&self) -> Vec<u32> {
        self.pids().iter().copied().collect()
    }

    /// Pushes the uiautomator runtime on devices that need it.
    pub fn prepare_runtime(&self, trace_id: &str) -> Result<(), AppError> {
        let sdk = device::sdk_int(self.channel.as_ref(), trace_id)?;
        if sdk < RUNTIME_MIN_SDK {
            debug!(trace_id = %trace_id, sdk, "platform uiautomator runtime is usable");
            return Ok(());
        }
        for name in RUNTIME_ARTIFACTS {
            device::push(
                self.channel.as_ref(),
                &self.options.libs_dir.join(name),
                &self.options.device_dir,
                trace_id,
            )?;
        }
        device::chmod(
            self.channel.as_ref(),
            "555",
            &device_join(&self.options.device_dir, "uiautomator"),
            trace_id,
        )?;
        info!(trace_id = %trace_id, sdk, "uiautomator runtime deployed");
        Ok(())
    }

    pub fn start(&self, trace_id: &str) -> Result<(), AppError> {
        self.start_with_timeout(self.options.start_timeout, trace_id)
    }

    pub fn start_with_timeout(&self, timeout: Duration, trace_id: &str) -> Result<(), AppError> {
        let mut lifecycle = self.lock();
        if lifecycle.state == ServerState::Alive && self.endpoint.ping(trace_id) {
            return Ok(());
        }
        if lifecycle.state != ServerState::Stopped || lifecycle.process.is_some() {
            debug!(trace_id = %trace_id, state = ?lifecycle.state, "clearing stale server before start");
            self.stop_locked(&mut lifecycle, trace_id);
        }

        lifecycle.state = ServerState::Starting;
        let started = Instant::now();
        info!(trace_id = %trace_id, local_port = self.options.local_port, "starting automation server");
        match self.launch(&mut lifecycle, timeout, trace_id) {
            Ok(()) => {
                lifecycle.state = ServerState::Alive;
                info!(
                    trace_id = %trace_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "automation server alive"
                );
                Ok(())
            }
            Err(err) => {
                error!(trace_id = %trace_id, error = %err, "automation server failed to start");
                self.stop_locked(&mut lifecycle, trace_id);
                Err(err)
            }
        }
    }

    /// Best-effort teardown; never fails and leaves the server `Stopped`.
    pub fn stop(&self, trace_id: &str) {
        let mut lifecycle = self.lock();
        self.stop_locked(&mut lifecycle, trace_id);
    }

    pub fn restart(&self, trace_id: &str) -> Result<(), AppError> {
        info!(trace_id = %trace_id, "restarting automation server");
        self.stop(trace_id);
        self.start(trace_id)
    }

    fn launch(
        &self,
        lifecycle: &mut Lifecycle,
        timeout: Duration,
        trace_id: &str,
    ) -> Result<(), AppError> {
        let deploy_failed = |err: AppError| {
            AppError::server_start(format!("Failed to deploy automation stub: {}", err.error), trace_id)
        };
        if !lifecycle.runtime_ready {
            self.prepare_runtime(trace_id).map_err(deploy_failed)?;
            lifecycle.runtime_ready = true;
        }
        for name in STUB_ARTIFACTS {
            device::push(
                self.channel.as_ref(),
                &self.options.libs_dir.join(name),
                &self.options.device_dir,
                trace_id,
            )
            .map_err(deploy_failed)?;
        }

        let command = self.options.launch_command();
        let mut process = self
            .channel
            .spawn(&args(&["shell", &command]), trace_id)
            .map_err(deploy_failed)?;
        let stdout = process.take_stdout();
        lifecycle.process = Some(process);
        if let Some(stdout) = stdout {
            self.follow_output(stdout, trace_id)?;
        }

        device::forward(
            self.channel.as_ref(),
            self.options.local_port,
            self.options.device_port,
            trace_id,
        )
        .map_err(deploy_failed)?;

        self.poll_until_alive(timeout, trace_id)
    }

    fn poll_until_alive(&self, timeout: Duration, trace_id: &str) -> Result<(), AppError> {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if self.endpoint.ping(trace_id) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(AppError::server_start(
                    format!(
                        "Automation server did not answer ping within {}ms ({attempts} attempts)",
                        timeout.as_millis()
                    ),
                    trace_id,
                ));
            }
            thread::sleep(self.options.poll_interval.min(deadline - now));
        }
    }

    // The launch shell echoes its pid before exec'ing the stub; everything after
    // that is instrumentation chatter.
    fn follow_output(&self, stdout: ChildStdout, trace_id: &str) -> Result<(), AppError> {
        let tracked = Arc::clone(&self.tracked_pids);
        let trace = trace_id.to_string();
        thread::Builder::new()
            .name("automator-output".to_string())
            .spawn(move || {
                let reader = BufReader::new(stdout);
                let mut pid_seen = false;
                for line in reader.lines() {
                    let Ok(line) = line else { break };
                    if !pid_seen {
                        pid_seen = true;
                        if let Some(pid) = parse_pid_line(&line) {
                            debug!(trace_id = %trace, pid, "automation stub pid recorded");
                            tracked
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .insert(pid);
                            continue;
                        }
                    }
                    if !line.trim().is_empty() {
                        debug!(trace_id = %trace, output = %line, "automation stub output");
                    }
                }
            })
            .map(|_| ())
            .map_err(|err| AppError::system(format!("Failed to follow stub output: {err}"), trace_id))
    }

    fn stop_locked(&self, lifecycle: &mut Lifecycle, trace_id: &str) {
        lifecycle.state = ServerState::Stopping;
        if let Some(mut process) = lifecycle.process.take() {
            if !process.has_exited() {
                match self.endpoint.shutdown(trace_id) {
                    Ok(()) => {
                        if !process.wait_timeout(self.options.shutdown_grace) {
                            debug!(trace_id = %trace_id, "stub still running after shutdown; terminating");
                            process.terminate();
                        }
                    }
                    Err(err) => {
                        debug!(trace_id = %trace_id, error = %err, "graceful shutdown failed; terminating");
                        process.terminate();
                    }
                }
            }
        }

        let channel = self.channel.as_ref();
        let mut killed = BTreeSet::new();
        let tracked = std::mem::take(&mut *self.pids());
        for pid in tracked {
            kill_quietly(channel, pid, trace_id);
            killed.insert(pid);
        }
        match device::list_process_ids(channel, STUB_TOKEN, trace_id) {
            Ok(pids) => {
                for pid in pids.into_iter().filter(|pid| !killed.contains(pid)) {
                    warn!(trace_id = %trace_id, pid, "killing untracked automation stub");
                    kill_quietly(channel, pid, trace_id);
                }
            }
            Err(err) => debug!(trace_id = %trace_id, error = %err, "process scan failed"),
        }
        if let Err(err) = device::remove_forward(channel, self.options.local_port, trace_id) {
            debug!(trace_id = %trace_id, error = %err, "forward removal failed");
        }

        lifecycle.state = ServerState::Stopped;
        debug!(trace_id = %trace_id, "automation server stopped");
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pids(&self) -> MutexGuard<'_, BTreeSet<u32>> {
        self.tracked_pids.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn kill_quietly(channel: &dyn CommandChannel, pid: u32, trace_id: &str) {
    if let Err(err) = device::kill_pid(channel, pid, trace_id) {
        debug!(trace_id = %trace_id, pid, error = %err, "kill failed");
    }
}

impl std::fmt::Debug for AutomatorServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutomatorServer")
            .field("state", &self.state())
            .field("local_port", &self.options.local_port)
            .field("device_port", &self.options.device_port)
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::app::adb::testing::{output, FakeChannel};
    use crate::app::server::testing::{artifact_dir as libs_dir, fast_options as options, FakeEndpoint};
    use tempfile::TempDir;

    const PS_OUTPUT: &str = "\
USER           PID  PPID     VSZ    RSS WCHAN            ADDR S NAME
root             1     0 10912060  8396 0                   0 S init
shell         4242  4240 1234567  90000 0                   0 S uiautomator
shell         4300  4240 1234567  90000 0                   0 S uiautomator
";

    fn device_channel(sdk: &'static str, ps: &'static str) -> FakeChannel {
        FakeChannel::new(move |args| {
            let joined = args.join(" ");
            if joined == "shell getprop ro.build.version.sdk" {
                Ok(output(sdk))
            } else if joined == "shell ps -A" {
                Ok(output(ps))
            } else {
                Ok(output(""))
            }
        })
    }

    fn server(
        channel: Arc<FakeChannel>,
        endpoint: Arc<FakeEndpoint>,
        libs: &TempDir,
    ) -> AutomatorServer {
        AutomatorServer::new(channel, endpoint, options(libs))
    }

    #[test]
    fn launch_command_runs_stub_class() {
        let libs = libs_dir();
        assert_eq!(
            options(&libs).launch_command(),
            "echo $$; exec /data/local/tmp/uiautomator runtest bundle.jar uiautomator-stub.jar -c com.github.uiautomatorstub.Stub"
        );
    }

    #[test]
    fn failing_start_reports_within_budget() {
        let libs = libs_dir();
        let channel = Arc::new(device_channel("30", ""));
        let endpoint = Arc::new(FakeEndpoint::dead());
        let server = server(Arc::clone(&channel), Arc::clone(&endpoint), &libs);

        let start = Instant::now();
        let err = server
            .start_with_timeout(Duration::from_millis(500), "trace-start")
            .expect_err("expected start failure");
        let elapsed = start.elapsed();

        assert_eq!(err.code, "ERR_SERVER_START");
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_millis(1500));
        assert!(endpoint.ping_count() >= 5);
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(channel
            .joined_calls()
            .contains(&"forward --remove tcp:9008".to_string()));
    }

    #[test]
    fn start_deploys_launches_and_forwards() {
        let libs = libs_dir();
        let channel = Arc::new(
            device_channel("30", PS_OUTPUT).with_spawn_script("echo 4242; exec sleep 30"),
        );
        let endpoint = Arc::new(FakeEndpoint::alive());
        let server = server(Arc::clone(&channel), Arc::clone(&endpoint), &libs);

        server.start("trace-start").expect("start");
        assert_eq!(server.state(), ServerState::Alive);

        let calls = channel.joined_calls();
        let libs_path = libs.path().display().to_string();
        assert!(calls.contains(&format!("push {libs_path}/android.test.runner.jar /data/local/tmp/")));
        assert!(calls.contains(&"shell chmod 555 /data/local/tmp/uiautomator".to_string()));
        assert!(calls.contains(&format!("push {libs_path}/bundle.jar /data/local/tmp/")));
        assert!(calls.contains(&format!("push {libs_path}/uiautomator-stub.jar /data/local/tmp/")));
        assert!(calls.contains(&format!("shell {}", options(&libs).launch_command())));
        assert!(calls.contains(&"forward tcp:9008 tcp:9008".to_string()));

        let deadline = Instant::now() + Duration::from_secs(2);
        while server.tracked_pids().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(server.tracked_pids(), vec![4242]);

        server.stop("trace-stop");
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(endpoint.shutdown_count(), 1);
        assert!(server.tracked_pids().is_empty());
        let calls = channel.joined_calls();
        assert_eq!(calls.iter().filter(|call| *call == "shell kill -9 4242").count(), 1);
        assert!(calls.contains(&"shell kill -9 4300".to_string()));
    }

    #[test]
    fn start_when_alive_is_noop() {
        let libs = libs_dir();
        let channel = Arc::new(device_channel("30", ""));
        let endpoint = Arc::new(FakeEndpoint::alive());
        let server = server(Arc::clone(&channel), endpoint, &libs);

        server.start("trace-1").expect("first start");
        let calls_after_first = channel.calls().len();
        server.start("trace-2").expect("second start");
        assert_eq!(channel.calls().len(), calls_after_first);
        server.stop("trace-stop");
    }

    #[test]
    fn runtime_is_deployed_once_per_server() {
        let libs = libs_dir();
        let channel = Arc::new(device_channel("30", ""));
        let server = server(Arc::clone(&channel), Arc::new(FakeEndpoint::alive()), &libs);

        server.start("trace-1").expect("start");
        server.restart("trace-2").expect("restart");
        let chmods = channel
            .joined_calls()
            .iter()
            .filter(|call| call.starts_with("shell chmod"))
            .count();
        assert_eq!(chmods, 1);
        server.stop("trace-stop");
    }

    #[test]
    fn old_sdk_skips_runtime() {
        let libs = libs_dir();
        let channel = Arc::new(device_channel("19", ""));
        let server = server(Arc::clone(&channel), Arc::new(FakeEndpoint::alive()), &libs);

        server.prepare_runtime("trace-sdk").expect("prepare");
        assert_eq!(channel.joined_calls(), vec!["shell getprop ro.build.version.sdk"]);
    }

    #[test]
    fn missing_artifact_fails_start() {
        let libs = TempDir::new().expect("tempdir");
        let channel = Arc::new(device_channel("19", ""));
        let endpoint = Arc::new(FakeEndpoint::alive());
        let server = server(Arc::clone(&channel), Arc::clone(&endpoint), &libs);

        let err = server.start("trace-missing").expect_err("expected failure");
        assert_eq!(err.code, "ERR_SERVER_START");
        assert!(err.error.contains("bundle.jar"));
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(endpoint.ping_count(), 0);
    }

    #[test]
    fn stop_is_safe_when_never_started_and_repeated() {
        let libs = libs_dir();
        let channel = Arc::new(device_channel("30", PS_OUTPUT));
        let endpoint = Arc::new(FakeEndpoint::dead());
        let server = server(Arc::clone(&channel), Arc::clone(&endpoint), &libs);

        server.stop("trace-1");
        server.stop("trace-2");
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(endpoint.shutdown_count(), 0);
        // Orphans from an earlier run are still cleaned up.
        assert!(channel.joined_calls().contains(&"shell kill -9 4242".to_string()));
    }

    #[test]
    fn stop_kills_orphans_listed_by_toolbox_ps() {
        let libs = libs_dir();
        let channel = Arc::new(FakeChannel::new(|args| match args.join(" ").as_str() {
            "shell getprop ro.build.version.sdk" => Ok(output("23")),
            "shell ps -A" => Ok(output("USER     PID   PPID  VSIZE  RSS     WCHAN    PC         NAME\n")),
            "shell ps" => Ok(output(
                "USER     PID   PPID  VSIZE  RSS     WCHAN    PC         NAME\n\
                 root      1     0     8904   784   ffffffff 00000000 S /init\n\
                 shell     4242  4240  1200   900   ffffffff 00000000 S uiautomator\n",
            )),
            _ => Ok(output("")),
        }));
        let server = server(Arc::clone(&channel), Arc::new(FakeEndpoint::dead()), &libs);

        server.stop("trace-toolbox");
        let calls = channel.joined_calls();
        assert!(calls.contains(&"shell ps".to_string()));
        assert!(calls.contains(&"shell kill -9 4242".to_string()));
        assert!(!calls.contains(&"shell kill -9 1".to_string()));
    }

    #[test]
    fn stop_swallows_device_errors() {
        let libs = libs_dir();
        let channel = Arc::new(FakeChannel::new(|_| {
            Err(AppError::dependency("device offline", "fake"))
        }));
        let server = server(channel, Arc::new(FakeEndpoint::dead()), &libs);
        server.stop("trace-offline");
        assert_eq!(server.state(), ServerState::Stopped);
    }
}
