use crate::app::models::DeviceSummary;

pub fn parse_adb_devices(output: &str) -> Vec<DeviceSummary> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.trim_start().starts_with('*'))
        .filter(|line| !line.to_lowercase().contains("list of devices"))
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 2 {
                return None;
            }
            let mut summary = DeviceSummary {
                serial: tokens[0].to_string(),
                state: tokens[1].to_string(),
                model: None,
            };
            for token in tokens.iter().skip(2) {
                if let Some(value) = token.strip_prefix("model:") {
                    summary.model = Some(value.to_string());
                }
            }
            Some(summary)
        })
        .collect()
}

pub fn first_line(output: &str) -> String {
    output
        .lines()
        .next()
        .unwrap_or_default()
        .trim_end_matches(['\r', '\n'])
        .trim()
        .to_string()
}

/// `adb install` prints progress lines first; the verdict is the last non-empty line.
pub fn parse_install_result(output: &str) -> String {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .unwrap_or_default()
        .to_string()
}

pub fn parse_pid_line(line: &str) -> Option<u32> {
    line.trim().parse::<u32>().ok().filter(|pid| *pid > 0)
}

/// Finds the PID column from the `ps` header and returns the pids of rows whose
/// process name is `token` (or a path ending in `/token`).
pub fn parse_ps_pids(output: &str, token: &str) -> Vec<u32> {
    let mut lines = output.lines().filter(|line| !line.trim().is_empty());
    let Some(header) = lines.next() else {
        return Vec::new();
    };
    let Some(pid_index) = header.split_whitespace().position(|column| column == "PID") else {
        return Vec::new();
    };
    let suffix = format!("/{token}");
    lines
        .filter_map(|line| {
            let columns: Vec<&str> = line.split_whitespace().collect();
            if columns.len() <= pid_index {
                return None;
            }
            let name = columns.last()?;
            if *name != token && !name.ends_with(&suffix) {
                return None;
            }
            parse_pid_line(columns[pid_index])
        })
        .collect()
}

/// True when `ps` printed a PID column and at least one process row. Toolbox
/// `ps` treats `-A` as a name filter and prints only the header.
pub fn ps_lists_processes(output: &str) -> bool {
    let mut lines = output.lines().filter(|line| !line.trim().is_empty());
    let has_pid_column = lines
        .next()
        .is_some_and(|header| header.split_whitespace().any(|column| column == "PID"));
    has_pid_column && lines.next().is_some()
}

pub fn parse_screen_on(dumpsys_power: &str) -> bool {
    dumpsys_power.lines().map(str::trim).any(|line| {
        line.contains("mScreenOn=true")
            || line.contains("mWakefulness=Awake")
            || line.contains("Display Power: state=ON")
    })
}
