use tracing_subscriber::EnvFilter;

pub fn init_logging(level: Option<&str>) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(level)));

    if cfg!(debug_assertions) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .with_target(false)
            .try_init();
    }
}

// Config stores upper-case level names ("INFO", "WARNING"); EnvFilter wants lowercase directives.
fn default_directive(level: Option<&str>) -> String {
    let normalized = level
        .map(|value| value.trim().to_lowercase())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "info".to_string());
    match normalized.as_str() {
        "warning" => "warn".to_string(),
        "critical" | "fatal" => "error".to_string(),
        "trace" | "debug" | "info" | "warn" | "error" | "off" => normalized,
        _ => "info".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_config_levels_to_directives() {
        assert_eq!(default_directive(Some("INFO")), "info");
        assert_eq!(default_directive(Some("WARNING")), "warn");
        assert_eq!(default_directive(Some(" debug ")), "debug");
        assert_eq!(default_directive(Some("CRITICAL")), "error");
    }

    #[test]
    fn falls_back_to_info() {
        assert_eq!(default_directive(None), "info");
        assert_eq!(default_directive(Some("")), "info");
        assert_eq!(default_directive(Some("verbose")), "info");
    }
}
