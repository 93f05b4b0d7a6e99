use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::app::error::AppError;
use crate::app::server::lifecycle::AutomatorServer;

pub const DEFAULT_WAIT_FOR_TRUE_TIMEOUT: Duration = Duration::from_secs(15);
const WAIT_FOR_TRUE_INTERVAL: Duration = Duration::from_millis(500);

const MASK_TEXT: u32 = 0x01;
const MASK_TEXT_CONTAINS: u32 = 0x02;
const MASK_CLASS_NAME: u32 = 0x10;
const MASK_DESCRIPTION: u32 = 0x40;
const MASK_DESCRIPTION_CONTAINS: u32 = 0x80;
const MASK_CLICKABLE: u32 = 0x1000;
const MASK_ENABLED: u32 = 0x8000;
const MASK_PACKAGE_NAME: u32 = 0x08_0000;
const MASK_RESOURCE_ID: u32 = 0x20_0000;
const MASK_INDEX: u32 = 0x80_0000;
const MASK_INSTANCE: u32 = 0x0100_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Child,
    Sibling,
}

impl Relation {
    fn as_str(self) -> &'static str {
        match self {
            Self::Child => "child",
            Self::Sibling => "sibling",
        }
    }
}

/// Element query in the stub's wire format: every set field flips its bit in
/// `mask`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selector {
    text: Option<String>,
    text_contains: Option<String>,
    class_name: Option<String>,
    description: Option<String>,
    description_contains: Option<String>,
    clickable: Option<bool>,
    enabled: Option<bool>,
    package_name: Option<String>,
    resource_id: Option<String>,
    index: Option<u32>,
    instance: Option<u32>,
    relatives: Vec<(Relation, Selector)>,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, value: impl Into<String>) -> Self {
        self.text = Some(value.into());
        self
    }

    pub fn text_contains(mut self, value: impl Into<String>) -> Self {
        self.text_contains = Some(value.into());
        self
    }

    pub fn class_name(mut self, value: impl Into<String>) -> Self {
        self.class_name = Some(value.into());
        self
    }

    pub fn description(mut self, value: impl Into<String>) -> Self {
        self.description = Some(value.into());
        self
    }

    pub fn description_contains(mut self, value: impl Into<String>) -> Self {
        self.description_contains = Some(value.into());
        self
    }

    pub fn clickable(mut self, value: bool) -> Self {
        self.clickable = Some(value);
        self
    }

    pub fn enabled(mut self, value: bool) -> Self {
        self.enabled = Some(value);
        self
    }

    pub fn package_name(mut self, value: impl Into<String>) -> Self {
        self.package_name = Some(value.into());
        self
    }

    pub fn resource_id(mut self, value: impl Into<String>) -> Self {
        self.resource_id = Some(value.into());
        self
    }

    pub fn index(mut self, value: u32) -> Self {
        self.index = Some(value);
        self
    }

    pub fn instance(mut self, value: u32) -> Self {
        self.instance = Some(value);
        self
    }

    pub fn child(mut self, selector: Selector) -> Self {
        self.relatives.push((Relation::Child, selector));
        self
    }

    pub fn sibling(mut self, selector: Selector) -> Self {
        self.relatives.push((Relation::Sibling, selector));
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn to_json(&self) -> Value {
        let mut fields = Map::new();
        let mut mask = 0u32;
        let mut set = |key: &str, bit: u32, value: Option<Value>| {
            if let Some(value) = value {
                fields.insert(key.to_string(), value);
                mask |= bit;
            }
        };
        set("text", MASK_TEXT, self.text.clone().map(Value::from));
        set("textContains", MASK_TEXT_CONTAINS, self.text_contains.clone().map(Value::from));
        set("className", MASK_CLASS_NAME, self.class_name.clone().map(Value::from));
        set("description", MASK_DESCRIPTION, self.description.clone().map(Value::from));
        set(
            "descriptionContains",
            MASK_DESCRIPTION_CONTAINS,
            self.description_contains.clone().map(Value::from),
        );
        set("clickable", MASK_CLICKABLE, self.clickable.map(Value::from));
        set("enabled", MASK_ENABLED, self.enabled.map(Value::from));
        set("packageName", MASK_PACKAGE_NAME, self.package_name.clone().map(Value::from));
        set("resourceId", MASK_RESOURCE_ID, self.resource_id.clone().map(Value::from));
        set("index", MASK_INDEX, self.index.map(Value::from));
        set("instance", MASK_INSTANCE, self.instance.map(Value::from));

        fields.insert("mask".to_string(), json!(mask));
        fields.insert(
            "childOrSibling".to_string(),
            Value::Array(
                self.relatives
                    .iter()
                    .map(|(relation, _)| Value::from(relation.as_str()))
                    .collect(),
            ),
        );
        fields.insert(
            "childOrSiblingSelector".to_string(),
            Value::Array(self.relatives.iter().map(|(_, selector)| selector.to_json()).collect()),
        );
        Value::Object(fields)
    }
}

/// UI queries against the stub. A call that cannot reach the stub restarts
/// the server and is retried once.
pub struct AutomatorDevice {
    server: Arc<AutomatorServer>,
    manufacturer: Option<String>,
    wait_for_element_timeout: Duration,
}

impl AutomatorDevice {
    pub fn new(
        server: Arc<AutomatorServer>,
        manufacturer: Option<String>,
        wait_for_element_timeout: Duration,
    ) -> Self {
        Self {
            server,
            manufacturer: manufacturer.map(|value| value.trim().to_lowercase()),
            wait_for_element_timeout,
        }
    }

    pub fn server(&self) -> &AutomatorServer {
        &self.server
    }

    pub fn call(&self, method: &str, params: Value, trace_id: &str) -> Result<Value, AppError> {
        let endpoint = self.server.endpoint();
        let err = match endpoint.call(method, params.clone(), trace_id) {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transport() => err,
            Err(err) => return Err(err),
        };

        warn!(trace_id = %trace_id, method = %method, error = %err, "stub unreachable; restarting once");
        let restarted = self.server.restart(trace_id);
        let retried = self.server.endpoint().call(method, params, trace_id);
        match (restarted, retried) {
            (_, Ok(value)) => Ok(value),
            (Err(start_err), Err(_)) => Err(start_err),
            (Ok(()), Err(retry_err)) => Err(retry_err),
        }
    }

    pub fn exists(&self, selector: &Selector, trace_id: &str) -> Result<bool, AppError> {
        let value = self.call("exist", json!([selector.to_json()]), trace_id)?;
        expect_bool("exist", value, trace_id)
    }

    pub fn wait_for_exists(
        &self,
        selector: &Selector,
        timeout: Duration,
        trace_id: &str,
    ) -> Result<bool, AppError> {
        let params = json!([selector.to_json(), timeout.as_millis() as u64]);
        let value = self.call("waitForExists", params, trace_id)?;
        expect_bool("waitForExists", value, trace_id)
    }

    /// `wait_for_exists` with the configured default when `timeout` is `None`.
    pub fn wait_for_element(
        &self,
        selector: &Selector,
        timeout: Option<Duration>,
        trace_id: &str,
    ) -> Result<bool, AppError> {
        let timeout = timeout.unwrap_or(self.wait_for_element_timeout);
        self.wait_for_exists(selector, timeout, trace_id)
    }

    /// Stub device info with the build manufacturer merged in.
    pub fn device_info(&self, trace_id: &str) -> Result<Map<String, Value>, AppError> {
        let value = self.call("deviceInfo", Value::Null, trace_id)?;
        let Value::Object(mut info) = value else {
            return Err(AppError::rpc_transport("deviceInfo returned a non-object", trace_id));
        };
        if let Some(manufacturer) = &self.manufacturer {
            info.insert("manufacturer".to_string(), Value::from(manufacturer.as_str()));
        }
        Ok(info)
    }

    pub fn press(&self, key: &str, trace_id: &str) -> Result<bool, AppError> {
        let value = self.call("pressKey", json!([key]), trace_id)?;
        expect_bool("pressKey", value, trace_id)
    }

    /// Polls `check` every 500ms until it returns true or `timeout` passes.
    /// Returns the last result.
    pub fn wait_for_true(&self, timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if check() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(timeout_ms = timeout.as_millis() as u64, "condition still false");
                return false;
            }
            thread::sleep(WAIT_FOR_TRUE_INTERVAL.min(deadline - now));
        }
    }
}

fn expect_bool(method: &str, value: Value, trace_id: &str) -> Result<bool, AppError> {
    value.as_bool().ok_or_else(|| {
        AppError::rpc_transport(format!("RPC {method} returned {value}, expected a boolean"), trace_id)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_sets_mask_bits() {
        let selector = Selector::new()
            .text("OK")
            .resource_id("com.example:id/confirm")
            .instance(0);
        let json = selector.to_json();
        assert_eq!(json["mask"], json!(0x0120_0001u32));
        assert_eq!(json["text"], "OK");
        assert_eq!(json["resourceId"], "com.example:id/confirm");
        assert_eq!(json["childOrSibling"], json!([]));
        assert!(json.get("className").is_none());
    }

    #[test]
    fn selector_nests_relatives() {
        let selector = Selector::new()
            .class_name("android.widget.ListView")
            .child(Selector::new().text("Settings"))
            .sibling(Selector::new().description("back"));
        let json = selector.to_json();
        assert_eq!(json["childOrSibling"], json!(["child", "sibling"]));
        assert_eq!(json["childOrSiblingSelector"][0]["mask"], json!(MASK_TEXT));
        assert_eq!(json["childOrSiblingSelector"][1]["description"], "back");
        assert!(!selector.is_empty());
        assert!(Selector::new().is_empty());
    }

    #[cfg(unix)]
    mod restart {
        use super::*;
        use crate::app::adb::testing::FakeChannel;
        use crate::app::server::testing::{artifact_dir, fast_options, FakeEndpoint};
        use tempfile::TempDir;

        fn device(endpoint: Arc<FakeEndpoint>, channel: Arc<FakeChannel>, libs: &TempDir) -> AutomatorDevice {
            let mut options = fast_options(libs);
            options.start_timeout = Duration::from_millis(200);
            let server = Arc::new(AutomatorServer::new(channel, endpoint, options));
            AutomatorDevice::new(server, Some(" Google ".to_string()), Duration::from_secs(5))
        }

        fn sdk_channel() -> Arc<FakeChannel> {
            Arc::new(FakeChannel::new(|args| {
                if args.join(" ") == "shell getprop ro.build.version.sdk" {
                    Ok(crate::app::adb::testing::output("30"))
                } else {
                    Ok(crate::app::adb::testing::output(""))
                }
            }))
        }

        #[test]
        fn transport_failure_restarts_and_retries_once() {
            let libs = artifact_dir();
            let channel = sdk_channel();
            let endpoint = Arc::new(FakeEndpoint::new(
                |_| true,
                |_, _, attempt| {
                    if attempt == 0 {
                        Err(AppError::rpc_transport("connection reset", "fake"))
                    } else {
                        Ok(Value::Bool(true))
                    }
                },
            ));
            let device = device(Arc::clone(&endpoint), Arc::clone(&channel), &libs);

            assert!(device.exists(&Selector::new().text("OK"), "trace-retry").expect("exists"));
            assert_eq!(endpoint.methods(), vec!["exist", "exist"]);
            assert!(channel.joined_calls().iter().any(|call| call.starts_with("forward tcp:")));
        }

        #[test]
        fn missing_element_does_not_restart() {
            let libs = artifact_dir();
            let channel = sdk_channel();
            let endpoint = Arc::new(FakeEndpoint::new(|_| true, |_, _, _| Ok(Value::Bool(false))));
            let device = device(Arc::clone(&endpoint), Arc::clone(&channel), &libs);

            assert!(!device.exists(&Selector::new().text("Nope"), "trace-absent").expect("exists"));
            assert_eq!(endpoint.methods().len(), 1);
            assert!(channel.calls().is_empty());
        }

        #[test]
        fn remote_error_does_not_restart() {
            let libs = artifact_dir();
            let channel = sdk_channel();
            let endpoint = Arc::new(FakeEndpoint::new(
                |_| true,
                |_, _, _| Err(AppError::rpc_remote("UiObjectNotFoundException", "fake")),
            ));
            let device = device(Arc::clone(&endpoint), Arc::clone(&channel), &libs);

            let err = device.press("home", "trace-remote").expect_err("expected error");
            assert_eq!(err.code, "ERR_RPC_REMOTE");
            assert_eq!(endpoint.methods().len(), 1);
            assert!(channel.calls().is_empty());
        }

        #[test]
        fn failed_restart_is_surfaced_without_recursion() {
            let libs = artifact_dir();
            let channel = sdk_channel();
            let endpoint = Arc::new(FakeEndpoint::dead());
            let device = device(Arc::clone(&endpoint), Arc::clone(&channel), &libs);

            let err = device.device_info("trace-dead").expect_err("expected error");
            assert_eq!(err.code, "ERR_SERVER_START");
            assert_eq!(endpoint.methods(), vec!["deviceInfo", "deviceInfo"]);
        }

        #[test]
        fn device_info_includes_manufacturer() {
            let libs = artifact_dir();
            let endpoint = Arc::new(FakeEndpoint::new(
                |_| true,
                |_, _, _| Ok(json!({"displayRotation": 0, "sdkInt": 30})),
            ));
            let device = device(endpoint, sdk_channel(), &libs);

            let info = device.device_info("trace-info").expect("info");
            assert_eq!(info["manufacturer"], "google");
            assert_eq!(info["sdkInt"], 30);
        }

        #[test]
        fn wait_for_true_polls_until_condition_holds() {
            let libs = artifact_dir();
            let device = device(Arc::new(FakeEndpoint::alive()), sdk_channel(), &libs);

            let mut calls = 0;
            assert!(device.wait_for_true(Duration::from_secs(3), || {
                calls += 1;
                calls == 2
            }));
            assert_eq!(calls, 2);
            assert!(!device.wait_for_true(Duration::from_millis(100), || false));
        }
    }
}
