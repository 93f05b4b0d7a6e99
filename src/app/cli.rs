use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tracing::{error, info};
use uuid::Uuid;

use crate::app::adb::device;
use crate::app::adb::locator::resolve_adb_program;
use crate::app::config::{
    config_path, load_config, load_config_from_path, save_config, save_config_to_path,
    validate_config, MagnetoConfig,
};
use crate::app::diagnostics::save_failure_data;
use crate::app::error::AppError;
use crate::app::logging::init_logging;
use crate::app::models::{CheckStatus, RunSummary};
use crate::app::server::automator::Selector;
use crate::app::session::DeviceSession;

const TOOL: &str = "magneto_rust";
const BOOT_TIMEOUT: Duration = Duration::from_secs(60);

const USAGE: &str = "Usage: magneto_rust [--config PATH] [--serial SERIAL] [--apk PATH] [--clean-install]
       [--app-package PKG] [--app-activity ACTIVITY] [--expect PATTERN]... [--expect-times N]
       [--timeout-ms MS] [--stall-ms MS] [--wait-for-text TEXT] [--wait-for-element-timeout MS]
       [--failed-data-dir DIR] [--save-data-on-failure] [--no-server] [--log LEVEL] [--json]
       [--write-config]
";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    pub config: Option<PathBuf>,
    pub serial: Option<String>,
    pub apk: Option<PathBuf>,
    pub clean_install: bool,
    pub app_package: Option<String>,
    pub app_activity: Option<String>,
    pub expect: Vec<String>,
    pub expect_times: u32,
    pub timeout_ms: Option<u64>,
    pub stall_ms: Option<u64>,
    pub wait_for_text: Option<String>,
    pub wait_for_element_timeout_ms: Option<u64>,
    pub failed_data_dir: Option<String>,
    pub save_data_on_failure: bool,
    pub no_server: bool,
    pub log: Option<String>,
    pub json: bool,
    pub write_config: bool,
}

/// `Ok(None)` means help was requested.
pub fn parse_args<I>(raw: I) -> Result<Option<Args>, String>
where
    I: IntoIterator<Item = String>,
{
    let mut args = Args {
        expect_times: 1,
        ..Args::default()
    };

    let mut it = raw.into_iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => args.config = Some(PathBuf::from(value(&mut it, "--config")?)),
            "--serial" => {
                args.serial = Some(value(&mut it, "--serial")?.trim().to_string())
                    .filter(|serial| !serial.is_empty());
                if args.serial.is_none() {
                    return Err("--serial requires a value".to_string());
                }
            }
            "--apk" => args.apk = Some(PathBuf::from(value(&mut it, "--apk")?)),
            "--clean-install" => args.clean_install = true,
            "--app-package" => args.app_package = Some(value(&mut it, "--app-package")?),
            "--app-activity" => args.app_activity = Some(value(&mut it, "--app-activity")?),
            "--expect" => args.expect.push(value(&mut it, "--expect")?),
            "--expect-times" => {
                args.expect_times = number(&value(&mut it, "--expect-times")?, "--expect-times")?
            }
            "--timeout-ms" => {
                args.timeout_ms = Some(number(&value(&mut it, "--timeout-ms")?, "--timeout-ms")?)
            }
            "--stall-ms" => {
                args.stall_ms = Some(number(&value(&mut it, "--stall-ms")?, "--stall-ms")?)
            }
            "--wait-for-text" => args.wait_for_text = Some(value(&mut it, "--wait-for-text")?),
            "--wait-for-element-timeout" => {
                let raw = value(&mut it, "--wait-for-element-timeout")?;
                args.wait_for_element_timeout_ms = Some(number(&raw, "--wait-for-element-timeout")?);
            }
            "--failed-data-dir" => {
                args.failed_data_dir = Some(value(&mut it, "--failed-data-dir")?)
            }
            "--save-data-on-failure" => args.save_data_on_failure = true,
            "--no-server" => args.no_server = true,
            "--log" => args.log = Some(value(&mut it, "--log")?),
            "--json" => args.json = true,
            "--write-config" => args.write_config = true,
            "-h" | "--help" => return Ok(None),
            other => return Err(format!("Unknown arg: {other}")),
        }
    }

    if args.expect_times == 0 {
        return Err("--expect-times must be at least 1".to_string());
    }
    if args.clean_install && (args.apk.is_none() || args.app_package.is_none()) {
        return Err("--clean-install requires --apk and --app-package".to_string());
    }
    if args.app_activity.is_some() && args.app_package.is_none() {
        return Err("--app-activity requires --app-package".to_string());
    }
    if args.wait_for_text.is_some() && args.no_server {
        return Err("--wait-for-text needs the automation server".to_string());
    }

    Ok(Some(args))
}

fn value(it: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, String> {
    it.next().ok_or_else(|| format!("{flag} requires a value"))
}

fn number<T: FromStr>(raw: &str, flag: &str) -> Result<T, String> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| format!("{flag} expects a number, got {raw:?}"))
}

/// Command-line flags win over the config file.
pub fn apply_overrides(mut config: MagnetoConfig, args: &Args) -> MagnetoConfig {
    if let Some(serial) = &args.serial {
        config.adb.serial = serial.clone();
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.watch.default_timeout_ms = timeout_ms;
    }
    if let Some(stall_ms) = args.stall_ms {
        config.watch.default_stall_ms = stall_ms;
    }
    if let Some(timeout_ms) = args.wait_for_element_timeout_ms {
        config.ui.wait_for_element_timeout_ms = timeout_ms;
    }
    if let Some(dir) = &args.failed_data_dir {
        config.failure.failed_data_dir = dir.clone();
    }
    if args.save_data_on_failure {
        config.failure.save_data_on_failure = true;
    }
    if let Some(level) = &args.log {
        config.logging.log_level = level.clone();
    }
    validate_config(config)
}

/// Entry point of the runner binary; returns the process exit code.
pub fn run() -> i32 {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(Some(args)) => args,
        Ok(None) => {
            print!("{USAGE}");
            return 0;
        }
        Err(msg) => {
            eprintln!("{msg}\n{USAGE}");
            return 2;
        }
    };

    let trace_id = Uuid::new_v4().to_string();
    let mut summary = RunSummary::new(TOOL, &trace_id);

    let loaded = match &args.config {
        Some(path) => load_config_from_path(path),
        None => load_config(),
    };
    let config = match loaded {
        Ok(config) => apply_overrides(config, &args),
        Err(err) => {
            summary.check("load_config", || Err::<(), _>(err));
            print_summary(&summary, args.json);
            return 1;
        }
    };
    init_logging(Some(&config.logging.log_level));

    if args.write_config {
        return match write_config(&config, args.config.as_deref()) {
            Ok(path) => {
                println!("config written to {}", path.display());
                0
            }
            Err(err) => {
                eprintln!("{}", err.error);
                1
            }
        };
    }
    info!(trace_id = %trace_id, version = %config.version, "run started");

    let android_home = std::env::var("ANDROID_HOME").ok();
    summary.adb_program = Some(resolve_adb_program(
        &config.adb.command_path,
        android_home.as_deref(),
    ));
    let failure = config.failure.clone();

    let Some(session) = summary.check("connect", || DeviceSession::connect(config, &trace_id)) else {
        print_summary(&summary, args.json);
        return 1;
    };
    summary.serial = session.channel().serial().map(str::to_string);

    run_session(&session, &args, &mut summary);

    if !summary.passed() && failure.save_data_on_failure {
        let base = PathBuf::from(&failure.failed_data_dir);
        let saved = summary.advise("save_failure_data", || {
            save_failure_data(session.channel(), &base, "run", &trace_id)
        });
        summary.failure_data_dir = saved.map(|dir| dir.to_string_lossy().to_string());
    }

    session.shutdown();
    print_summary(&summary, args.json);
    if summary.passed() {
        0
    } else {
        error!(trace_id = %trace_id, failed = summary.failed_checks().count(), "run failed");
        1
    }
}

/// Persists the merged config. A `--config` file keeps its backup beside it.
pub fn write_config(config: &MagnetoConfig, path: Option<&Path>) -> Result<PathBuf, AppError> {
    match path {
        Some(path) => {
            save_config_to_path(config, path, &path.with_extension("backup.json"))?;
            Ok(path.to_path_buf())
        }
        None => {
            save_config(config)?;
            Ok(config_path())
        }
    }
}

fn run_session(session: &DeviceSession, args: &Args, summary: &mut RunSummary) {
    let trace_id = session.trace_id().to_string();
    let channel = session.channel();

    summary.advise("wait_for_boot", || {
        if device::wait_for_boot(channel, BOOT_TIMEOUT, &trace_id) {
            Ok(())
        } else {
            Err(AppError::dependency("Device did not finish booting in time", &trace_id))
        }
    });
    summary.advise("unlock", || device::unlock(channel, &trace_id));

    match &args.apk {
        Some(apk) => {
            if args.clean_install {
                if let Some(package) = &args.app_package {
                    summary.advise("uninstall", || device::uninstall(channel, package, &trace_id));
                }
            }
            let installed = summary.check("install", || install(session, apk, &trace_id));
            if installed.is_none() {
                return;
            }
        }
        None => summary.skip("install", "no --apk given"),
    }

    if args.no_server {
        summary.skip("start_server", "--no-server given");
    } else {
        if summary.check("start_server", || session.server().start(&trace_id)).is_none() {
            return;
        }
        summary.advise("device_info", || {
            let info = session.device().device_info(&trace_id)?;
            info!(trace_id = %trace_id, info = %serde_json::Value::Object(info), "device info");
            Ok(())
        });
    }

    if args.expect.is_empty() {
        summary.skip("watch", "no --expect given");
        if launch(session, args, summary) {
            wait_for_text(session, args, summary);
        }
        return;
    }

    let Some(mut watcher) = summary.check("open_watcher", || session.open_watcher()) else {
        return;
    };
    let handles = summary.check("register", || {
        args.expect
            .iter()
            .map(|pattern| watcher.watch_times(pattern, args.expect_times))
            .collect::<Result<Vec<_>, _>>()
    });
    if let Some(handles) = handles {
        if launch(session, args, summary) {
            let options = session.wait_options();
            summary.check("watch", || watcher.wait_for(&handles, options));
            wait_for_text(session, args, summary);
        }
    }
    watcher.stop();
}

fn install(session: &DeviceSession, apk: &Path, trace_id: &str) -> Result<(), AppError> {
    if device::install(session.channel(), apk, &["-r"], trace_id)? {
        Ok(())
    } else {
        Err(AppError::dependency(
            format!("Failed to install {}", apk.display()),
            trace_id,
        ))
    }
}

/// Returns false when the launch was attempted and failed.
fn launch(session: &DeviceSession, args: &Args, summary: &mut RunSummary) -> bool {
    let Some(package) = &args.app_package else {
        summary.skip("launch", "no --app-package given");
        return true;
    };
    let Some(activity) = &args.app_activity else {
        summary.skip("launch", "no --app-activity given");
        return true;
    };
    summary.advise("force_stop", || device::force_stop(session.channel(), package, session.trace_id()));
    summary
        .check("launch", || {
            device::start_activity(session.channel(), package, activity, None, session.trace_id())
        })
        .is_some()
}

fn wait_for_text(session: &DeviceSession, args: &Args, summary: &mut RunSummary) {
    let Some(text) = &args.wait_for_text else {
        return;
    };
    let trace_id = session.trace_id();
    summary.check("wait_for_element", || {
        let selector = Selector::new().text(text.as_str());
        if session.device().wait_for_element(&selector, None, trace_id)? {
            Ok(())
        } else {
            Err(AppError::watch_timeout(
                format!("Element with text {text:?} did not appear"),
                trace_id,
            ))
        }
    });
}

fn print_summary(summary: &RunSummary, json: bool) {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(summary).unwrap_or_default()
        );
        return;
    }
    for check in &summary.checks {
        let status = match check.status {
            CheckStatus::Pass => "PASS",
            CheckStatus::Fail => "FAIL",
            CheckStatus::Warn => "WARN",
            CheckStatus::Skip => "SKIP",
        };
        match &check.error {
            Some(error) => println!("{status:<4} {:<18} {:>6}ms  {error}", check.name, check.duration_ms),
            None => println!("{status:<4} {:<18} {:>6}ms", check.name, check.duration_ms),
        }
    }
    let verdict = if summary.passed() { "passed" } else { "failed" };
    println!("run {verdict} (trace {})", summary.trace_id);
}
