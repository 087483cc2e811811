//! Runtime configuration
//!
//! Settings are layered, lowest precedence first:
//!
//! 1. [`RuntimeConfig::default`]
//! 2. a TOML file named by `CRITRACE_CONFIG_FILE`
//! 3. `CRITRACE_*` environment variables
//! 4. overrides recorded through `set_env` before the runtime is initialized
//!
//! Key parsing is intentionally small: each key maps onto one field and
//! unknown keys are ignored.

use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Prefix shared by every environment key
pub const ENV_PREFIX: &str = "CRITRACE_";

/// Environment key naming an optional TOML configuration file
pub const CONFIG_FILE_ENV: &str = "CRITRACE_CONFIG_FILE";

/// Where recorded trace data goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Record in-process and write the trace file at finalize
    #[default]
    InProcess,
    /// Defer to an external system collector; no in-process session
    System,
    /// Both of the above
    All,
}

impl Backend {
    /// True when an external collector owns the session
    pub fn is_system(self) -> bool {
        self != Backend::InProcess
    }
}

impl FromStr for Backend {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inprocess" | "in_process" => Ok(Backend::InProcess),
            "system" => Ok(Backend::System),
            "all" => Ok(Backend::All),
            other => Err(RuntimeError::Config(format!("unknown backend '{other}'"))),
        }
    }
}

/// Behavior of the trace buffer once it is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FillPolicy {
    /// Overwrite the oldest packets
    RingBuffer,
    /// Keep the oldest packets, drop new ones
    #[default]
    Discard,
}

impl FromStr for FillPolicy {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ring_buffer" | "ringbuffer" | "ring" => Ok(FillPolicy::RingBuffer),
            "discard" => Ok(FillPolicy::Discard),
            other => Err(RuntimeError::Config(format!("unknown fill policy '{other}'"))),
        }
    }
}

/// What to do when `init`/`set_mpi` are called again with different arguments
///
/// The conflict itself is always reported (fatal in strict mode). Outside
/// strict mode this decides which arguments stay in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    KeepFirst,
    KeepLast,
    /// Fail the call even outside strict mode
    Error,
}

impl FromStr for ConflictPolicy {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keep_first" | "first" => Ok(ConflictPolicy::KeepFirst),
            "keep_last" | "last" => Ok(ConflictPolicy::KeepLast),
            "error" => Ok(ConflictPolicy::Error),
            other => Err(RuntimeError::Config(format!(
                "unknown conflict policy '{other}'"
            ))),
        }
    }
}

/// Complete runtime configuration
///
/// # Example
/// ```
/// use critrace::config::RuntimeConfig;
///
/// let config = RuntimeConfig::default();
/// assert_eq!(config.mode, "trace");
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Instrumentation mode reported in the banner ("trace", "sampling", ...)
    pub mode: String,
    /// Strict (CI) mode: usage errors and invariant violations are fatal
    pub strict: bool,
    /// Verbosity: <0 quiet, 0 normal, 1 debug, >=2 trace
    pub verbose: i32,
    pub debug: bool,
    /// When false, `init_tooling` only initializes the library and returns false
    pub init_tooling: bool,

    pub use_trace: bool,
    pub use_metrics: bool,
    pub use_sampling: bool,
    pub use_process_sampling: bool,
    pub use_critical_trace: bool,
    pub use_device_sampling: bool,
    pub use_gpu: bool,
    pub use_ompt: bool,
    pub use_comm: bool,
    pub use_code_coverage: bool,
    /// Append the process id to output file names
    pub use_pid: bool,

    /// Signal sampling frequency in Hz
    pub sampling_freq: u32,
    pub process_sampling_interval_ms: u64,
    pub thread_pool_size: usize,

    pub backend: Backend,
    pub buffer_size_kb: u64,
    pub fill_policy: FillPolicy,
    pub shmem_size_hint_kb: u64,
    /// Enabled trace categories; empty means all
    pub categories: BTreeSet<String>,
    /// Concatenate every rank's trace into one file on rank 0
    pub combined_traces: bool,

    pub output_dir: PathBuf,
    pub conflict_policy: ConflictPolicy,
    pub max_bundles_per_thread: usize,
    /// Metrics components measured per region
    pub components: Vec<String>,

    /// Set by `set_mpi`
    pub use_mpi: bool,
    pub attached: bool,
    /// Set by `init`
    pub is_binary_rewrite: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: "trace".to_string(),
            strict: false,
            verbose: 0,
            debug: false,
            init_tooling: true,
            use_trace: true,
            use_metrics: true,
            use_sampling: false,
            use_process_sampling: false,
            use_critical_trace: false,
            use_device_sampling: false,
            use_gpu: false,
            use_ompt: false,
            use_comm: false,
            use_code_coverage: false,
            use_pid: false,
            sampling_freq: 100,
            process_sampling_interval_ms: 50,
            thread_pool_size: 8,
            backend: Backend::InProcess,
            buffer_size_kb: 1_024_000,
            fill_policy: FillPolicy::Discard,
            shmem_size_hint_kb: 4096,
            categories: BTreeSet::new(),
            combined_traces: false,
            output_dir: PathBuf::from("critrace-output"),
            conflict_policy: ConflictPolicy::KeepFirst,
            max_bundles_per_thread: 65_536,
            components: vec!["wall_clock".to_string()],
            use_mpi: false,
            attached: false,
            is_binary_rewrite: false,
        }
    }
}

impl RuntimeConfig {
    /// Load defaults, then the optional TOML file, then the environment
    ///
    /// A `CRITRACE_*` value that does not parse is skipped with a warning,
    /// and the remaining keys still apply. Variables that are not valid
    /// UTF-8 are ignored.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_FILE_ENV) {
            Ok(path) if !path.is_empty() => Self::from_toml_file(Path::new(&path))?,
            _ => Self::default(),
        };

        if std::env::var("CI").map(|v| parse_bool(&v) == Some(true)).unwrap_or(false) {
            config.strict = true;
        }

        for (key, value) in std::env::vars_os() {
            let (Some(key), Some(value)) = (key.to_str(), value.to_str()) else {
                tracing::debug!("Skipping non-UTF-8 environment entry {key:?}");
                continue;
            };
            if key == CONFIG_FILE_ENV || !key.starts_with(ENV_PREFIX) {
                continue;
            }
            match config.apply(key, value) {
                Ok(true) => {}
                Ok(false) => tracing::debug!("Ignoring unknown configuration key {key}"),
                Err(err) => tracing::warn!("Ignoring {key}: {err}"),
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Read and parse a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| RuntimeError::Config(format!("failed to render configuration: {e}")))
    }

    /// Apply a single `CRITRACE_*` key
    ///
    /// Returns `Ok(false)` for keys this runtime does not know.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<bool> {
        let Some(name) = key.strip_prefix(ENV_PREFIX) else {
            return Ok(false);
        };

        match name {
            "MODE" => self.mode = value.to_string(),
            "CI" => self.strict = bool_value(key, value)?,
            "VERBOSE" => self.verbose = number_value(key, value)?,
            "DEBUG" => self.debug = bool_value(key, value)?,
            "INIT_TOOLING" => self.init_tooling = bool_value(key, value)?,
            "USE_TRACE" => self.use_trace = bool_value(key, value)?,
            "USE_METRICS" => self.use_metrics = bool_value(key, value)?,
            "USE_SAMPLING" => self.use_sampling = bool_value(key, value)?,
            "USE_PROCESS_SAMPLING" => self.use_process_sampling = bool_value(key, value)?,
            "USE_CRITICAL_TRACE" => self.use_critical_trace = bool_value(key, value)?,
            "USE_DEVICE_SAMPLING" => self.use_device_sampling = bool_value(key, value)?,
            "USE_GPU" => self.use_gpu = bool_value(key, value)?,
            "USE_OMPT" => self.use_ompt = bool_value(key, value)?,
            "USE_COMM" => self.use_comm = bool_value(key, value)?,
            "USE_CODE_COVERAGE" => self.use_code_coverage = bool_value(key, value)?,
            "USE_PID" => self.use_pid = bool_value(key, value)?,
            "SAMPLING_FREQ" => self.sampling_freq = number_value(key, value)?,
            "PROCESS_SAMPLING_INTERVAL" => {
                self.process_sampling_interval_ms = number_value(key, value)?
            }
            "THREAD_POOL_SIZE" => self.thread_pool_size = number_value(key, value)?,
            "BACKEND" => self.backend = value.parse()?,
            "BUFFER_SIZE_KB" => self.buffer_size_kb = number_value(key, value)?,
            "FILL_POLICY" => self.fill_policy = value.parse()?,
            "SHMEM_SIZE_HINT_KB" => self.shmem_size_hint_kb = number_value(key, value)?,
            "CATEGORIES" => self.categories = split_list(value).into_iter().collect(),
            "COMBINED_TRACES" => self.combined_traces = bool_value(key, value)?,
            "OUTPUT_PATH" => self.output_dir = PathBuf::from(value),
            "CONFLICT_POLICY" => self.conflict_policy = value.parse()?,
            "MAX_BUNDLES" => self.max_bundles_per_thread = number_value(key, value)?,
            "COMPONENTS" => self.components = split_list(value),
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.use_sampling && self.sampling_freq == 0 {
            return Err(RuntimeError::Config(
                "sampling_freq must be > 0 when sampling is enabled".to_string(),
            ));
        }
        if self.buffer_size_kb == 0 {
            return Err(RuntimeError::Config(
                "buffer_size_kb must be > 0".to_string(),
            ));
        }
        if self.max_bundles_per_thread == 0 {
            return Err(RuntimeError::Config(
                "max_bundles_per_thread must be > 0".to_string(),
            ));
        }
        if self.use_process_sampling && self.process_sampling_interval_ms == 0 {
            return Err(RuntimeError::Config(
                "process_sampling_interval_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Path of the binary trace file
    pub fn trace_output_path(&self) -> PathBuf {
        let name = if self.use_pid {
            format!("trace-{}.msgpack", std::process::id())
        } else {
            "trace.msgpack".to_string()
        };
        self.output_dir.join(name)
    }

    /// Path of the metrics summary
    pub fn metrics_output_path(&self) -> PathBuf {
        let name = if self.use_pid {
            format!("metrics-{}.json", std::process::id())
        } else {
            "metrics.json".to_string()
        };
        self.output_dir.join(name)
    }

    /// Path of the critical-trace report
    pub fn critical_trace_output_path(&self) -> PathBuf {
        self.output_dir.join("critical-trace.json")
    }
}

/// Parse the usual boolean spellings
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "on" | "true" | "yes" | "y" => Some(true),
        "0" | "off" | "false" | "no" | "n" | "" => Some(false),
        _ => None,
    }
}

fn bool_value(key: &str, value: &str) -> Result<bool> {
    parse_bool(value)
        .ok_or_else(|| RuntimeError::Config(format!("{key}: '{value}' is not a boolean")))
}

fn number_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| RuntimeError::Config(format!("{key}: '{value}' is not a number")))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split([',', ';', ' '])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_from_env_skips_non_utf8_entries() {
        use std::os::unix::ffi::OsStrExt;
        let blob = std::ffi::OsStr::from_bytes(b"f\xffo");
        std::env::set_var("CRITRACE_TEST_BLOB", blob);
        std::env::set_var(blob, "1");
        std::env::set_var("CRITRACE_SAMPLING_FREQ", "250");

        let config = RuntimeConfig::from_env();

        std::env::remove_var("CRITRACE_TEST_BLOB");
        std::env::remove_var(blob);
        std::env::remove_var("CRITRACE_SAMPLING_FREQ");
        assert_eq!(config.unwrap().sampling_freq, 250);
    }

    #[test]
    #[serial]
    fn test_from_env_skips_bad_value_keeps_others() {
        std::env::set_var("CRITRACE_USE_TRACE", "maybe");
        std::env::set_var("CRITRACE_THREAD_POOL_SIZE", "3");

        let config = RuntimeConfig::from_env();

        std::env::remove_var("CRITRACE_USE_TRACE");
        std::env::remove_var("CRITRACE_THREAD_POOL_SIZE");
        let config = config.unwrap();
        assert!(config.use_trace);
        assert_eq!(config.thread_pool_size, 3);
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.backend, Backend::InProcess);
        assert_eq!(config.fill_policy, FillPolicy::Discard);
        assert_eq!(config.conflict_policy, ConflictPolicy::KeepFirst);
        assert!(!config.use_critical_trace);
    }

    #[test]
    fn test_apply_known_keys() {
        let mut config = RuntimeConfig::default();
        assert!(config.apply("CRITRACE_USE_CRITICAL_TRACE", "ON").unwrap());
        assert!(config.apply("CRITRACE_THREAD_POOL_SIZE", "4").unwrap());
        assert!(config.apply("CRITRACE_FILL_POLICY", "ring_buffer").unwrap());
        assert!(config.apply("CRITRACE_CATEGORIES", "host, user").unwrap());

        assert!(config.use_critical_trace);
        assert_eq!(config.thread_pool_size, 4);
        assert_eq!(config.fill_policy, FillPolicy::RingBuffer);
        assert_eq!(config.categories.len(), 2);
        assert!(config.categories.contains("host"));
    }

    #[test]
    fn test_apply_unknown_key() {
        let mut config = RuntimeConfig::default();
        assert!(!config.apply("CRITRACE_NOT_A_KEY", "1").unwrap());
        assert!(!config.apply("OTHER_PREFIX", "1").unwrap());
    }

    #[test]
    fn test_apply_rejects_bad_values() {
        let mut config = RuntimeConfig::default();
        assert!(config.apply("CRITRACE_USE_TRACE", "maybe").is_err());
        assert!(config.apply("CRITRACE_SAMPLING_FREQ", "fast").is_err());
        assert!(config.apply("CRITRACE_BACKEND", "cloud").is_err());
    }

    #[test]
    fn test_parse_bool_spellings() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("yes"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("Off"), Some(false));
        assert_eq!(parse_bool("perhaps"), None);
    }

    #[test]
    fn test_validate_rejects_zero_frequency() {
        let config = RuntimeConfig {
            use_sampling: true,
            sampling_freq: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip_keeps_fields() {
        let config = RuntimeConfig {
            use_critical_trace: true,
            backend: Backend::All,
            ..Default::default()
        };
        let rendered = config.to_toml().unwrap();
        let parsed = RuntimeConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed = RuntimeConfig::from_toml_str("use_sampling = true\nsampling_freq = 250\n")
            .unwrap();
        assert!(parsed.use_sampling);
        assert_eq!(parsed.sampling_freq, 250);
        assert_eq!(parsed.mode, "trace");
    }

    #[test]
    fn test_output_paths_with_pid() {
        let config = RuntimeConfig {
            use_pid: true,
            output_dir: PathBuf::from("/tmp/out"),
            ..Default::default()
        };
        let path = config.trace_output_path();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("trace-"));
        assert!(name.ends_with(".msgpack"));
        assert!(name.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_backend_is_system() {
        assert!(!Backend::InProcess.is_system());
        assert!(Backend::System.is_system());
        assert!(Backend::All.is_system());
    }
}
