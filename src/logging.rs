//! Logging setup
//!
//! The runtime lives inside someone else's process, so it only installs a
//! subscriber when the host has not already done so.

use tracing_subscriber::EnvFilter;

/// Environment key that overrides the computed filter directive
pub const LOG_ENV: &str = "CRITRACE_LOG";

/// Map the runtime verbosity onto a tracing level directive
pub fn level_for(verbose: i32, debug: bool) -> &'static str {
    if debug {
        return "trace";
    }
    match verbose {
        v if v < 0 => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Initialize the tracing subscriber writing to stderr
///
/// Returns false when another subscriber was already installed.
pub fn init_logging(verbose: i32, debug: bool) -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(format!("critrace={}", level_for(verbose, debug))));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(level_for(-1, false), "error");
        assert_eq!(level_for(0, false), "info");
        assert_eq!(level_for(1, false), "debug");
        assert_eq!(level_for(3, false), "trace");
        assert_eq!(level_for(-1, true), "trace");
    }

    #[test]
    fn test_second_init_is_harmless() {
        let _ = init_logging(0, false);
        assert!(!init_logging(0, false));
    }
}
