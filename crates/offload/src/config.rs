use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cycling::CyclingStrategy;
use crate::error::OffloadError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

// ── Backend ─────────────────────────────────────────────────────────

/// Isolation used for worker execution contexts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// One OS process per worker, talking over stdin/stdout.
    #[default]
    #[serde(alias = "processes")]
    Process,

    /// One OS thread per worker inside the master process.
    #[serde(alias = "threads")]
    Thread,
}

impl FromStr for Backend {
    type Err = OffloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" | "processes" => Ok(Self::Process),
            "thread" | "threads" => Ok(Self::Thread),
            other => Err(OffloadError::Configuration(format!(
                "unknown backend '{other}', expected 'process' or 'thread'"
            ))),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process => f.write_str("process"),
            Self::Thread => f.write_str("thread"),
        }
    }
}

// ── Top-level config ────────────────────────────────────────────────

/// Pool configuration. Fixed once the pool is locked.
///
/// Parsed from TOML with support for `OFFLOAD_*` environment variable
/// overrides, or assembled with the `with_*` setters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffloadConfig {
    #[serde(default)]
    pub backend: Backend,

    /// Number of workers to spawn. Defaults to host parallelism.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Emit per-call debug events.
    #[serde(default)]
    pub debug: bool,

    /// How long a single worker may take to signal ready.
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    /// Optional upper bound on how long a call may stay pending.
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,

    /// Executable re-launched for process workers (defaults to the current one).
    #[serde(default)]
    pub program: Option<PathBuf>,

    /// Extra arguments passed to process workers.
    #[serde(default)]
    pub program_args: Vec<String>,

    #[serde(skip)]
    pub cycling: CyclingStrategy,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_startup_timeout_ms() -> u64 {
    30_000
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            workers: default_workers(),
            debug: false,
            startup_timeout_ms: default_startup_timeout_ms(),
            call_timeout_ms: None,
            program: None,
            program_args: Vec::new(),
            cycling: CyclingStrategy::default(),
        }
    }
}

impl OffloadConfig {
    /// Parse config from a TOML string.
    ///
    /// The backend name is resolved separately so an unknown name reports the
    /// same `Configuration` error as the `OFFLOAD_BACKEND` override.
    pub fn from_toml(toml_str: &str) -> Result<Self, OffloadError> {
        let mut table: toml::Table = toml_str.parse()?;
        let backend = match table.remove("backend") {
            None => None,
            Some(toml::Value::String(name)) => Some(name.parse::<Backend>()?),
            Some(other) => {
                return Err(OffloadError::Configuration(format!(
                    "backend must be a string, got {other}"
                )))
            }
        };

        let mut config: Self = toml::Value::Table(table).try_into()?;
        if let Some(backend) = backend {
            config.backend = backend;
        }
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, OffloadError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Defaults plus environment overrides (call `load_dotenv()` first).
    pub fn from_env() -> Result<Self, OffloadError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_cycling(mut self, cycling: CyclingStrategy) -> Self {
        self.cycling = cycling;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    /// Reject configurations that must never reach worker provisioning.
    pub fn validate(&self) -> Result<(), OffloadError> {
        if self.workers == 0 {
            return Err(OffloadError::Configuration(
                "worker count must be at least 1".into(),
            ));
        }
        if self.startup_timeout_ms == 0 {
            return Err(OffloadError::Configuration(
                "startup timeout must be greater than zero".into(),
            ));
        }
        if self.call_timeout_ms == Some(0) {
            return Err(OffloadError::Configuration(
                "call timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// - `OFFLOAD_BACKEND` -> `backend`
    /// - `OFFLOAD_WORKERS` -> `workers`
    /// - `OFFLOAD_DEBUG` -> `debug`
    /// - `OFFLOAD_STARTUP_TIMEOUT_MS` -> `startup_timeout_ms`
    /// - `OFFLOAD_CALL_TIMEOUT_MS` -> `call_timeout_ms`
    pub(crate) fn apply_env_overrides(&mut self) -> Result<(), OffloadError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), OffloadError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("OFFLOAD_BACKEND") {
            self.backend = v.parse()?;
        }
        if let Some(v) = lookup("OFFLOAD_WORKERS") {
            self.workers = parse_number("OFFLOAD_WORKERS", &v)?;
        }
        if let Some(v) = lookup("OFFLOAD_DEBUG") {
            self.debug = matches!(v.trim(), "1" | "true" | "yes" | "on");
        }
        if let Some(v) = lookup("OFFLOAD_STARTUP_TIMEOUT_MS") {
            self.startup_timeout_ms = parse_number("OFFLOAD_STARTUP_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("OFFLOAD_CALL_TIMEOUT_MS") {
            self.call_timeout_ms = Some(parse_number("OFFLOAD_CALL_TIMEOUT_MS", &v)?);
        }
        Ok(())
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, OffloadError> {
    value.trim().parse().map_err(|_| {
        OffloadError::Configuration(format!("{key} must be a non-negative integer, got '{value}'"))
    })
}
