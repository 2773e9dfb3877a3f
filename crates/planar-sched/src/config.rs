//! Dispatch configuration.
//!
//! Supports loading configuration from:
//! 1. A YAML file
//! 2. Environment variables (with `PLANAR_` prefix)
//!
//! Precedence (highest to lowest): environment, file, defaults. The CLI
//! applies its own flags on top.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::{HostTarget, RetryPolicy, DEFAULT_MAX_ATTEMPTS};
use crate::error::{DispatchError, DispatchResult};
use crate::script::DEFAULT_ENTRY_POINT;

/// Everything a dispatch run needs besides the save folder.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Cluster login host.
    #[serde(default)]
    pub host: String,

    /// SSH port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Login name.
    #[serde(default)]
    pub username: String,

    /// Login password (prefer `PLANAR_PASSWORD` over storing it in a file).
    #[serde(default)]
    pub password: String,

    /// Root on the cluster that mirrors `local_root`.
    #[serde(default)]
    pub remote_root: String,

    /// Local root used when a descriptor does not declare `save_path0`.
    #[serde(default)]
    pub local_root: Option<PathBuf>,

    /// Cores requested per plane.
    #[serde(default = "default_n_cores")]
    pub n_cores: u32,

    /// Conda environment activated by the bootstrap script.
    #[serde(default = "default_env_name")]
    pub env_name: String,

    /// Memory units requested per started gigabyte of binary data.
    #[serde(default = "default_mem_request_multiplier")]
    pub mem_request_multiplier: u32,

    /// Extra scheduler arguments, passed through verbatim.
    #[serde(default)]
    pub scheduler_args: String,

    /// Scheduler submission program.
    #[serde(default = "default_submit_command")]
    pub submit_command: String,

    /// Job-name prefix; the plane index is appended.
    #[serde(default = "default_job_name")]
    pub job_name: String,

    /// Command the bootstrap script runs with the descriptor path.
    #[serde(default = "default_entry_point")]
    pub entry_point: String,

    /// Connection attempts before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Seconds between connection attempts.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    /// Local directory the bootstrap script is written to.
    #[serde(default)]
    pub bootstrap_dir: Option<PathBuf>,
}

fn default_port() -> u16 {
    22
}

fn default_n_cores() -> u32 {
    8
}

fn default_env_name() -> String {
    "suite2p".to_string()
}

fn default_mem_request_multiplier() -> u32 {
    2
}

fn default_submit_command() -> String {
    "bsub".to_string()
}

fn default_job_name() -> String {
    "plane".to_string()
}

fn default_entry_point() -> String {
    DEFAULT_ENTRY_POINT.to_string()
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_retry_delay_secs() -> u64 {
    2
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            username: String::new(),
            password: String::new(),
            remote_root: String::new(),
            local_root: None,
            n_cores: default_n_cores(),
            env_name: default_env_name(),
            mem_request_multiplier: default_mem_request_multiplier(),
            scheduler_args: String::new(),
            submit_command: default_submit_command(),
            job_name: default_job_name(),
            entry_point: default_entry_point(),
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
            bootstrap_dir: None,
        }
    }
}

impl fmt::Debug for DispatchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("remote_root", &self.remote_root)
            .field("local_root", &self.local_root)
            .field("n_cores", &self.n_cores)
            .field("env_name", &self.env_name)
            .field("mem_request_multiplier", &self.mem_request_multiplier)
            .field("scheduler_args", &self.scheduler_args)
            .field("submit_command", &self.submit_command)
            .field("job_name", &self.job_name)
            .field("entry_point", &self.entry_point)
            .field("max_attempts", &self.max_attempts)
            .field("retry_delay_secs", &self.retry_delay_secs)
            .field("bootstrap_dir", &self.bootstrap_dir)
            .finish()
    }
}

impl DispatchConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> DispatchResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            DispatchError::Config(format!("cannot read {}: {e}", path.as_ref().display()))
        })?;
        serde_yaml_ng::from_str(&contents).map_err(|e| DispatchError::Config(e.to_string()))
    }

    /// Load configuration: optional file, then environment overrides.
    pub fn load(config_file: Option<&Path>) -> DispatchResult<Self> {
        let config = match config_file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.merge_env()
    }

    /// Apply `PLANAR_*` environment variables.
    pub fn merge_env(self) -> DispatchResult<Self> {
        self.merge_vars(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, keyed by `PLANAR_*` variable names.
    ///
    /// Only variables that are set override the current values.
    pub fn merge_vars<F>(mut self, lookup: F) -> DispatchResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &str, value: String) -> DispatchResult<T> {
            value
                .trim()
                .parse()
                .map_err(|_| DispatchError::Config(format!("invalid value for {key}: {value}")))
        }

        if let Some(v) = lookup("PLANAR_HOST") {
            self.host = v;
        }
        if let Some(v) = lookup("PLANAR_PORT") {
            self.port = parsed("PLANAR_PORT", v)?;
        }
        if let Some(v) = lookup("PLANAR_USERNAME") {
            self.username = v;
        }
        if let Some(v) = lookup("PLANAR_PASSWORD") {
            self.password = v;
        }
        if let Some(v) = lookup("PLANAR_REMOTE_ROOT") {
            self.remote_root = v;
        }
        if let Some(v) = lookup("PLANAR_LOCAL_ROOT") {
            self.local_root = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("PLANAR_N_CORES") {
            self.n_cores = parsed("PLANAR_N_CORES", v)?;
        }
        if let Some(v) = lookup("PLANAR_ENV_NAME") {
            self.env_name = v;
        }
        if let Some(v) = lookup("PLANAR_MEM_MULTIPLIER") {
            self.mem_request_multiplier = parsed("PLANAR_MEM_MULTIPLIER", v)?;
        }
        if let Some(v) = lookup("PLANAR_SCHEDULER_ARGS") {
            self.scheduler_args = v;
        }
        if let Some(v) = lookup("PLANAR_SUBMIT_COMMAND") {
            self.submit_command = v;
        }
        if let Some(v) = lookup("PLANAR_JOB_NAME") {
            self.job_name = v;
        }

        Ok(self)
    }

    /// Check that the configuration can drive a dispatch run.
    pub fn validate(&self) -> DispatchResult<()> {
        let required = [
            ("host", &self.host),
            ("username", &self.username),
            ("remote_root", &self.remote_root),
            ("submit_command", &self.submit_command),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(DispatchError::Config(format!("{name} must be set")));
            }
        }

        if self.n_cores == 0 {
            return Err(DispatchError::Config("n_cores must be positive".into()));
        }
        if self.mem_request_multiplier == 0 {
            return Err(DispatchError::Config(
                "mem_request_multiplier must be positive".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(DispatchError::Config("max_attempts must be positive".into()));
        }
        if self.env_name.chars().any(char::is_whitespace) {
            return Err(DispatchError::Config(format!(
                "env_name must be a single word: {:?}",
                self.env_name
            )));
        }

        Ok(())
    }

    /// Connection target built from host, port and credentials.
    pub fn host_target(&self) -> HostTarget {
        HostTarget::new(&self.host, &self.username, &self.password).with_port(self.port)
    }

    /// Retry policy for connecting.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            retry_delay: Duration::from_secs(self.retry_delay_secs),
        }
    }

    /// Directory the bootstrap script is written to.
    ///
    /// Defaults to `~/.planar`, or a temp directory when no home is known.
    pub fn bootstrap_dir(&self) -> PathBuf {
        self.bootstrap_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(".planar")
        })
    }
}
