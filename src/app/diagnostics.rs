use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, TimeZone};
use tracing::{debug, info};

use crate::app::adb::channel::CommandChannel;
use crate::app::adb::device::dump_log;
use crate::app::adb::paths::sanitize_filename_component;
use crate::app::error::AppError;

/// `<base>/<serial>-<YYYYmmddHHMM>`; one directory per run.
pub fn failure_data_dir<Tz: TimeZone>(base: &Path, serial: &str, timestamp: &DateTime<Tz>) -> PathBuf
where
    Tz::Offset: std::fmt::Display,
{
    let serial = sanitize_filename_component(serial);
    base.join(format!("{serial}-{}", timestamp.format("%Y%m%d%H%M")))
}

/// Writes the current device log buffer to `<dir>/<name>.logcat.log`.
pub fn save_logcat_dump(
    channel: &dyn CommandChannel,
    dir: &Path,
    name: &str,
    trace_id: &str,
) -> Result<PathBuf, AppError> {
    fs::create_dir_all(dir).map_err(|err| {
        AppError::system(format!("Failed to create {}: {err}", dir.display()), trace_id)
    })?;
    let lines = dump_log(channel, trace_id)?;
    let path = dir.join(format!("{}.logcat.log", sanitize_filename_component(name)));
    fs::write(&path, lines.join("\n")).map_err(|err| {
        AppError::system(format!("Failed to write {}: {err}", path.display()), trace_id)
    })?;
    debug!(trace_id = %trace_id, path = %path.display(), lines = lines.len(), "logcat saved");
    Ok(path)
}

pub fn save_failure_data(
    channel: &dyn CommandChannel,
    base: &Path,
    name: &str,
    trace_id: &str,
) -> Result<PathBuf, AppError> {
    let dir = failure_data_dir(base, channel.serial().unwrap_or_default(), &Local::now());
    info!(trace_id = %trace_id, dir = %dir.display(), "saving failed run data");
    save_logcat_dump(channel, &dir, name, trace_id)?;
    Ok(dir)
}
