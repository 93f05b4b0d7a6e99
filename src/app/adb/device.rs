use std::path::Path;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime, TimeDelta};
use tracing::{debug, info, warn};

use crate::app::adb::channel::{args, CommandChannel};
use crate::app::adb::parse::{
    first_line, parse_adb_devices, parse_install_result, parse_ps_pids, parse_screen_on,
    ps_lists_processes,
};
use crate::app::adb::runner::CommandOutput;
use crate::app::error::AppError;
use crate::app::models::DeviceSummary;

const SHORT_TIMEOUT: Duration = Duration::from_secs(10);
const PUSH_TIMEOUT: Duration = Duration::from_secs(60);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(180);
const BOOT_POLL_INTERVAL: Duration = Duration::from_secs(1);

fn ensure_success(
    output: &CommandOutput,
    what: &str,
    trace_id: &str,
) -> Result<(), AppError> {
    if output.success() {
        return Ok(());
    }
    let detail = if output.stderr.trim().is_empty() {
        output.stdout.trim()
    } else {
        output.stderr.trim()
    };
    Err(AppError::dependency(format!("{what} failed: {detail}"), trace_id))
}

pub fn list_devices(channel: &dyn CommandChannel, trace_id: &str) -> Result<Vec<DeviceSummary>, AppError> {
    let output = channel.run(&args(&["devices", "-l"]), SHORT_TIMEOUT, trace_id)?;
    ensure_success(&output, "adb devices", trace_id)?;
    Ok(parse_adb_devices(&output.stdout))
}

/// The serial of the only online device. Several online devices need an explicit choice.
pub fn pick_single_device(channel: &dyn CommandChannel, trace_id: &str) -> Result<String, AppError> {
    let online: Vec<DeviceSummary> = list_devices(channel, trace_id)?
        .into_iter()
        .filter(|summary| summary.state == "device")
        .collect();
    match online.as_slice() {
        [] => Err(AppError::dependency("No online adb devices found.", trace_id)),
        [only] => Ok(only.serial.clone()),
        many => {
            let serials = many
                .iter()
                .map(|summary| summary.serial.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            Err(AppError::validation(
                format!("Multiple online devices found ({serials}). Set ANDROID_SERIAL or pass --serial."),
                trace_id,
            ))
        }
    }
}

pub fn clear_log(channel: &dyn CommandChannel, trace_id: &str) -> Result<(), AppError> {
    let output = channel.run(&args(&["logcat", "-c"]), SHORT_TIMEOUT, trace_id)?;
    ensure_success(&output, "Logcat clear", trace_id)
}

pub fn dump_log(channel: &dyn CommandChannel, trace_id: &str) -> Result<Vec<String>, AppError> {
    let output = channel.run(
        &args(&["logcat", "-v", "time", "-d"]),
        Duration::from_secs(30),
        trace_id,
    )?;
    ensure_success(&output, "Logcat dump", trace_id)?;
    Ok(output
        .stdout
        .lines()
        .map(|line| line.trim().to_string())
        .collect())
}

pub fn getprop(channel: &dyn CommandChannel, prop: &str, trace_id: &str) -> Result<String, AppError> {
    let output = channel.run(&args(&["shell", "getprop", prop]), SHORT_TIMEOUT, trace_id)?;
    ensure_success(&output, "getprop", trace_id)?;
    Ok(first_line(&output.stdout))
}

pub fn sdk_int(channel: &dyn CommandChannel, trace_id: &str) -> Result<u32, AppError> {
    let raw = getprop(channel, "ro.build.version.sdk", trace_id)?;
    raw.parse::<u32>()
        .map_err(|_| AppError::dependency(format!("Unexpected SDK level: {raw:?}"), trace_id))
}

pub fn start_activity(
    channel: &dyn CommandChannel,
    package_name: &str,
    activity_name: &str,
    extras: Option<&str>,
    trace_id: &str,
) -> Result<(), AppError> {
    if package_name.trim().is_empty() || activity_name.trim().is_empty() {
        return Err(AppError::validation("package and activity are required", trace_id));
    }
    debug!(trace_id = %trace_id, activity = %activity_name, "opening activity");
    let mut command = args(&["shell", "am", "start"]);
    if let Some(extras) = extras {
        command.extend(extras.split_whitespace().map(str::to_string));
    }
    command.push(format!("{package_name}/{activity_name}"));
    let output = channel.run(&command, SHORT_TIMEOUT, trace_id)?;
    ensure_success(&output, "Activity start", trace_id)
}

pub fn force_stop(channel: &dyn CommandChannel, package_name: &str, trace_id: &str) -> Result<(), AppError> {
    let output = channel.run(
        &args(&["shell", "am", "force-stop", package_name]),
        SHORT_TIMEOUT,
        trace_id,
    )?;
    ensure_success(&output, "Force stop", trace_id)
}

/// Installs an apk, retrying once when adb does not report `Success`.
pub fn install(
    channel: &dyn CommandChannel,
    apk_path: &Path,
    extra_args: &[&str],
    trace_id: &str,
) -> Result<bool, AppError> {
    let apk = apk_path.to_string_lossy().to_string();
    let mut command = args(&["install"]);
    command.extend(extra_args.iter().map(|value| value.to_string()));
    command.push(apk.clone());

    for attempt in 1..=2 {
        debug!(trace_id = %trace_id, apk = %apk, attempt, "installing app");
        let output = channel.run(&command, INSTALL_TIMEOUT, trace_id)?;
        let verdict = parse_install_result(&format!("{}\n{}", output.stdout, output.stderr));
        if verdict.starts_with("Success") {
            info!(trace_id = %trace_id, apk = %apk, "app installed");
            return Ok(true);
        }
        warn!(trace_id = %trace_id, apk = %apk, result = %verdict, attempt, "app install failed");
    }
    Ok(false)
}

pub fn uninstall(channel: &dyn CommandChannel, package_name: &str, trace_id: &str) -> Result<(), AppError> {
    debug!(trace_id = %trace_id, package = %package_name, "uninstalling app");
    channel.run(&args(&["uninstall", package_name]), INSTALL_TIMEOUT, trace_id)?;
    // Needs root; devices without su just leave the data dir behind.
    let wipe = format!("rm -rf /data/data/{package_name}");
    if let Err(err) = channel.run(&args(&["shell", "su", "-c", &wipe]), SHORT_TIMEOUT, trace_id) {
        debug!(trace_id = %trace_id, error = %err, "app data wipe skipped");
    }
    Ok(())
}

/// Polls `sys.boot_completed`. Returns false on timeout; callers carry on regardless.
pub fn wait_for_boot(channel: &dyn CommandChannel, timeout: Duration, trace_id: &str) -> bool {
    let command = args(&["wait-for-device", "shell", "getprop", "sys.boot_completed"]);
    let start = Instant::now();
    loop {
        match channel.run(&command, timeout.max(SHORT_TIMEOUT), trace_id) {
            Ok(output) if first_line(&output.stdout) == "1" => return true,
            Ok(_) => debug!(trace_id = %trace_id, "waiting for device to finish booting"),
            Err(err) => debug!(trace_id = %trace_id, error = %err, "boot check failed"),
        }
        if start.elapsed() + BOOT_POLL_INTERVAL > timeout {
            warn!(
                trace_id = %trace_id,
                "timed out waiting for sys.boot_completed; there might not be a default launcher set"
            );
            return false;
        }
        std::thread::sleep(BOOT_POLL_INTERVAL);
    }
}

pub fn unlock(channel: &dyn CommandChannel, trace_id: &str) -> Result<(), AppError> {
    let power = channel.run(&args(&["shell", "dumpsys", "power"]), SHORT_TIMEOUT, trace_id)?;
    if !parse_screen_on(&power.stdout) {
        debug!(trace_id = %trace_id, "screen is off; pressing power");
        keyevent(channel, 26, trace_id)?;
    }
    keyevent(channel, 82, trace_id)
}

fn keyevent(channel: &dyn CommandChannel, code: u32, trace_id: &str) -> Result<(), AppError> {
    let output = channel.run(
        &args(&["shell", "input", "keyevent", &code.to_string()]),
        SHORT_TIMEOUT,
        trace_id,
    )?;
    ensure_success(&output, "keyevent", trace_id)
}

pub fn push(
    channel: &dyn CommandChannel,
    local_path: &Path,
    device_dir: &str,
    trace_id: &str,
) -> Result<(), AppError> {
    if !local_path.is_file() {
        return Err(AppError::validation(
            format!("Artifact not found: {}", local_path.display()),
            trace_id,
        ));
    }
    let local = local_path.to_string_lossy().to_string();
    let output = channel.run(&args(&["push", &local, device_dir]), PUSH_TIMEOUT, trace_id)?;
    ensure_success(&output, "Push", trace_id)
}

pub fn chmod(channel: &dyn CommandChannel, mode: &str, device_path: &str, trace_id: &str) -> Result<(), AppError> {
    let output = channel.run(&args(&["shell", "chmod", mode, device_path]), SHORT_TIMEOUT, trace_id)?;
    ensure_success(&output, "chmod", trace_id)
}

pub fn forward(channel: &dyn CommandChannel, local_port: u16, device_port: u16, trace_id: &str) -> Result<(), AppError> {
    let output = channel.run(
        &args(&["forward", &format!("tcp:{local_port}"), &format!("tcp:{device_port}")]),
        SHORT_TIMEOUT,
        trace_id,
    )?;
    ensure_success(&output, "Port forward", trace_id)
}

pub fn remove_forward(channel: &dyn CommandChannel, local_port: u16, trace_id: &str) -> Result<(), AppError> {
    let output = channel.run(
        &args(&["forward", "--remove", &format!("tcp:{local_port}")]),
        SHORT_TIMEOUT,
        trace_id,
    )?;
    ensure_success(&output, "Forward removal", trace_id)
}

pub fn kill_pid(channel: &dyn CommandChannel, pid: u32, trace_id: &str) -> Result<(), AppError> {
    let output = channel.run(
        &args(&["shell", "kill", "-9", &pid.to_string()]),
        SHORT_TIMEOUT,
        trace_id,
    )?;
    ensure_success(&output, "kill", trace_id)
}

pub fn list_process_ids(channel: &dyn CommandChannel, token: &str, trace_id: &str) -> Result<Vec<u32>, AppError> {
    let output = channel.run(&args(&["shell", "ps", "-A"]), SHORT_TIMEOUT, trace_id)?;
    ensure_success(&output, "ps", trace_id)?;
    if ps_lists_processes(&output.stdout) {
        return Ok(parse_ps_pids(&output.stdout, token));
    }
    // Pre-toybox devices already list every process with plain `ps`.
    debug!(trace_id = %trace_id, "ps -A listed no processes, retrying with plain ps");
    let output = channel.run(&args(&["shell", "ps"]), SHORT_TIMEOUT, trace_id)?;
    ensure_success(&output, "ps", trace_id)?;
    Ok(parse_ps_pids(&output.stdout, token))
}

/// Sets the device clock (local time). Needs root.
pub fn set_datetime(channel: &dyn CommandChannel, at: &NaiveDateTime, trace_id: &str) -> Result<(), AppError> {
    let command = format!("'date -s {}'", at.format("%Y%m%d.%H%M%S"));
    let output = channel.run(&args(&["shell", "su", "-c", &command]), SHORT_TIMEOUT, trace_id)?;
    ensure_success(&output, "date", trace_id)
}

/// Runs `body` with the device clock shifted by `offset`, then puts the clock
/// back to the host's current time. A failed restore is logged, not returned.
pub fn timewarp<T>(
    channel: &dyn CommandChannel,
    offset: TimeDelta,
    trace_id: &str,
    body: impl FnOnce() -> T,
) -> Result<T, AppError> {
    set_datetime(channel, &(Local::now().naive_local() + offset), trace_id)?;
    info!(trace_id = %trace_id, offset_secs = offset.num_seconds(), "device clock shifted");
    let result = body();
    if let Err(err) = set_datetime(channel, &Local::now().naive_local(), trace_id) {
        warn!(trace_id = %trace_id, error = %err, "failed to restore device clock");
    }
    Ok(result)
}

pub fn emit_log(channel: &dyn CommandChannel, tag: &str, message: &str, trace_id: &str) -> Result<(), AppError> {
    let output = channel.run(&args(&["shell", "log", "-t", tag, message]), SHORT_TIMEOUT, trace_id)?;
    ensure_success(&output, "log", trace_id)
}
