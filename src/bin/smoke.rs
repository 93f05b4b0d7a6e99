use std::time::Duration;

use magneto_rust_lib::app::adb::device::emit_log;
use magneto_rust_lib::app::adb::locator::resolve_adb_program;
use magneto_rust_lib::app::config::{load_config, validate_config};
use magneto_rust_lib::app::error::AppError;
use magneto_rust_lib::app::logging::init_logging;
use magneto_rust_lib::app::models::RunSummary;
use magneto_rust_lib::app::session::DeviceSession;
use magneto_rust_lib::app::watch::WaitOptions;
use uuid::Uuid;

const SMOKE_TAG: &str = "MagnetoSmoke";

#[derive(Debug, Clone)]
struct Args {
    serial: Option<String>,
    timeout_ms: u64,
    with_server: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut serial = None;
    let mut timeout_ms = 10_000;
    let mut with_server = true;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--serial" => {
                serial = it
                    .next()
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty());
                if serial.is_none() {
                    return Err("--serial requires a value".to_string());
                }
            }
            "--timeout-ms" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--timeout-ms requires a value".to_string())?;
                timeout_ms = value
                    .parse::<u64>()
                    .map_err(|_| format!("--timeout-ms expects a number, got {value:?}"))?;
            }
            "--no-server" => {
                with_server = false;
            }
            "-h" | "--help" => {
                return Err(
                    "Usage: cargo run --bin smoke -- [--serial SERIAL] [--timeout-ms MS] [--no-server]\n"
                        .to_string(),
                );
            }
            other => return Err(format!("Unknown arg: {other}")),
        }
    }

    Ok(Args {
        serial,
        timeout_ms,
        with_server,
    })
}

fn print_and_exit(summary: &RunSummary) -> ! {
    println!(
        "{}",
        serde_json::to_string_pretty(summary).unwrap_or_default()
    );
    std::process::exit(if summary.passed() { 0 } else { 1 });
}

fn main() {
    let args = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    let trace_id = Uuid::new_v4().to_string();
    let mut summary = RunSummary::new("magneto_smoke", &trace_id);

    let Some(mut config) = summary.check("load_config", load_config) else {
        print_and_exit(&summary);
    };
    if let Some(serial) = &args.serial {
        config.adb.serial = serial.clone();
    }
    let config = validate_config(config);
    init_logging(Some(&config.logging.log_level));

    let android_home = std::env::var("ANDROID_HOME").ok();
    summary.adb_program = Some(resolve_adb_program(
        &config.adb.command_path,
        android_home.as_deref(),
    ));

    let Some(session) = summary.check("connect", || DeviceSession::connect(config, &trace_id)) else {
        print_and_exit(&summary);
    };
    summary.serial = session.channel().serial().map(str::to_string);

    if args.with_server {
        if summary
            .check("start_server", || session.server().start(&trace_id))
            .is_some()
        {
            summary.check("ping", || {
                if session.server().is_alive(&trace_id) {
                    Ok(())
                } else {
                    Err(AppError::rpc_transport("Stub did not answer ping", &trace_id))
                }
            });
            summary.advise("device_info", || session.device().device_info(&trace_id).map(|_| ()));
        }
    } else {
        summary.skip("start_server", "--no-server given");
    }

    // Marker unique to this run so stale buffer lines cannot satisfy the watch.
    let marker = format!("smoke-{trace_id}");
    let options = WaitOptions::default().with_timeout(Duration::from_millis(args.timeout_ms));
    summary.check("log_watch", || {
        session.with_watcher(|watcher| {
            let handle = watcher.watch(&regex::escape(&marker))?;
            emit_log(session.channel(), SMOKE_TAG, &marker, &trace_id)?;
            watcher.wait_for(&[handle], options)
        })
    });

    session.shutdown();
    print_and_exit(&summary);
}
