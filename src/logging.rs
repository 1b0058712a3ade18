use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_ENV_VAR: &str = "GRADESHEETD_LOG";

/// Filter directive for the sidecar's own target. `GRADESHEETD_LOG`, when
/// set, replaces it entirely.
pub fn filter_directive(base_level: &str, env_override: Option<String>) -> String {
    match env_override {
        Some(s) if !s.trim().is_empty() => s,
        _ => format!("gradesheetd={base_level}"),
    }
}

/// Install the global subscriber. Output goes to stderr: stdout carries the
/// JSON protocol and must stay clean.
pub fn init_tracing(log_level: &str) {
    let directive = filter_directive(log_level, std::env::var(LOG_ENV_VAR).ok());
    let _ = fmt()
        .with_env_filter(EnvFilter::new(&directive))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
