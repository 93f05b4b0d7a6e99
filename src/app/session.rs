use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::app::adb::channel::{AdbChannel, CommandChannel};
use crate::app::adb::device;
use crate::app::adb::locator::{resolve_adb_program, validate_adb_program};
use crate::app::config::MagnetoConfig;
use crate::app::error::AppError;
use crate::app::server::automator::AutomatorDevice;
use crate::app::server::lifecycle::{AutomatorServer, ServerOptions};
use crate::app::server::rpc::{RpcClient, StubEndpoint};
use crate::app::watch::watcher::{LogWatcher, WaitOptions, WatchSlot};

/// Everything a run needs for one device: the bridge channel, the automation
/// server, and the slot that admits a single log watcher.
pub struct DeviceSession {
    trace_id: String,
    config: MagnetoConfig,
    channel: Arc<dyn CommandChannel>,
    server: Arc<AutomatorServer>,
    device: AutomatorDevice,
    watch_slot: WatchSlot,
}

impl DeviceSession {
    pub fn connect(config: MagnetoConfig, trace_id: &str) -> Result<Self, AppError> {
        let android_home = std::env::var("ANDROID_HOME").ok();
        let program = resolve_adb_program(&config.adb.command_path, android_home.as_deref());
        validate_adb_program(&program).map_err(|message| AppError::validation(message, trace_id))?;

        let serial = match Some(config.adb.serial.trim()).filter(|value| !value.is_empty()) {
            Some(serial) => serial.to_string(),
            None => device::pick_single_device(&AdbChannel::new(program.clone(), None), trace_id)?,
        };
        let channel: Arc<dyn CommandChannel> =
            Arc::new(AdbChannel::new(program.clone(), Some(serial)));
        let endpoint: Arc<dyn StubEndpoint> = Arc::new(RpcClient::new(
            config.server.local_port,
            config.server.request_timeout(),
        ));
        info!(
            trace_id = %trace_id,
            adb = %program,
            serial = %channel.serial().unwrap_or("default"),
            "device session opened"
        );
        Ok(Self::with_parts(config, channel, endpoint, trace_id))
    }

    pub fn with_parts(
        config: MagnetoConfig,
        channel: Arc<dyn CommandChannel>,
        endpoint: Arc<dyn StubEndpoint>,
        trace_id: &str,
    ) -> Self {
        let options = ServerOptions::from(&config.server);
        let server = Arc::new(AutomatorServer::new(Arc::clone(&channel), endpoint, options));
        let manufacturer = match device::getprop(channel.as_ref(), "ro.product.manufacturer", trace_id) {
            Ok(value) if !value.is_empty() => Some(value),
            Ok(_) => None,
            Err(err) => {
                warn!(trace_id = %trace_id, error = %err, "manufacturer lookup failed");
                None
            }
        };
        let device = AutomatorDevice::new(
            Arc::clone(&server),
            manufacturer,
            Duration::from_millis(config.ui.wait_for_element_timeout_ms),
        );
        Self {
            trace_id: trace_id.to_string(),
            config,
            channel,
            server,
            device,
            watch_slot: WatchSlot::new(),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn config(&self) -> &MagnetoConfig {
        &self.config
    }

    pub fn channel(&self) -> &dyn CommandChannel {
        self.channel.as_ref()
    }

    pub fn server(&self) -> &AutomatorServer {
        &self.server
    }

    pub fn device(&self) -> &AutomatorDevice {
        &self.device
    }

    pub fn wait_options(&self) -> WaitOptions {
        WaitOptions::from_millis(
            self.config.watch.default_timeout_ms,
            self.config.watch.default_stall_ms,
        )
    }

    /// A started watcher. Fails with `ERR_CONCURRENCY` while another watcher
    /// from this session is alive.
    pub fn open_watcher(&self) -> Result<LogWatcher, AppError> {
        let mut watcher = LogWatcher::open(
            &self.watch_slot,
            self.channel.as_ref(),
            self.config.watch.clear_log_on_start,
            &self.trace_id,
        )?;
        watcher.start()?;
        Ok(watcher)
    }

    /// Runs `body` with a fresh watcher that is stopped on every exit path.
    pub fn with_watcher<T>(
        &self,
        body: impl FnOnce(&LogWatcher) -> Result<T, AppError>,
    ) -> Result<T, AppError> {
        let mut watcher = self.open_watcher()?;
        let result = body(&watcher);
        watcher.stop();
        result
    }

    pub fn shutdown(&self) {
        self.server.stop(&self.trace_id);
        info!(trace_id = %self.trace_id, "device session closed");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::app::adb::testing::{output, FakeChannel};
    use crate::app::server::testing::FakeEndpoint;

    fn session(channel: FakeChannel, config: MagnetoConfig) -> DeviceSession {
        DeviceSession::with_parts(
            config,
            Arc::new(channel),
            Arc::new(FakeEndpoint::alive()),
            "trace-session",
        )
    }

    #[test]
    fn with_watcher_resolves_and_releases() {
        let channel = FakeChannel::ok().with_spawn_script("sleep 0.2; echo I/Calc: button clicked; exec sleep 30");
        let session = session(channel, MagnetoConfig::default());

        let line = session
            .with_watcher(|watcher| {
                let handle = watcher.watch("button clicked")?;
                watcher.wait(WaitOptions::default().with_timeout(Duration::from_secs(5)))?;
                Ok(handle.value())
            })
            .expect("watch");
        assert_eq!(line.as_deref(), Some("I/Calc: button clicked"));

        // The slot is free again.
        let mut again = session.open_watcher().expect("second watcher");
        again.stop();
    }

    #[test]
    fn concurrent_watchers_are_rejected() {
        let session = session(FakeChannel::ok(), MagnetoConfig::default());
        let mut first = session.open_watcher().expect("first");
        let err = session.open_watcher().expect_err("second");
        assert_eq!(err.code, "ERR_CONCURRENCY");
        first.stop();
    }

    #[test]
    fn with_watcher_stops_on_error() {
        let session = session(FakeChannel::ok(), MagnetoConfig::default());
        let err = session
            .with_watcher(|watcher| {
                watcher.watch("never")?;
                watcher.wait(WaitOptions::default().with_timeout(Duration::from_millis(100)))
            })
            .expect_err("timeout");
        assert_eq!(err.code, "ERR_WATCH_TIMEOUT");
        session.open_watcher().expect("slot released").stop();
    }

    #[test]
    fn wait_options_follow_config() {
        let mut config = MagnetoConfig::default();
        config.watch.default_timeout_ms = 2000;
        config.watch.default_stall_ms = 9000;
        let session = session(FakeChannel::ok(), config);
        let options = session.wait_options();
        assert_eq!(options.timeout, Duration::from_secs(2));
        assert_eq!(options.stall, Some(Duration::from_secs(9)));
    }

    #[test]
    fn device_info_carries_manufacturer() {
        let channel = FakeChannel::new(|args| {
            if args.join(" ") == "shell getprop ro.product.manufacturer" {
                Ok(output("Samsung\n"))
            } else {
                Ok(output(""))
            }
        });
        let endpoint = FakeEndpoint::new(|_| true, |_, _, _| Ok(serde_json::json!({"sdkInt": 33})));
        let session = DeviceSession::with_parts(
            MagnetoConfig::default(),
            Arc::new(channel),
            Arc::new(endpoint),
            "trace-info",
        );

        let info = session.device().device_info("trace-info").expect("info");
        assert_eq!(info["manufacturer"], "samsung");
        assert_eq!(session.channel().serial(), Some("FAKE"));
        assert!(session.server().options().libs_dir.ends_with("libs"));
    }
}
