// Configuration module - Ecosystem file parsing and validation

mod spec;
mod store;

pub use spec::{infer_interpreter, ProcessSpec};
pub use store::{LoadReport, RejectedEntry, SpecDiff, SpecStore};

use crate::error::{Result, WardenError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Keys recognized in a single `apps` entry
pub const APP_KEYS: &[&str] = &[
    "name",
    "script",
    "args",
    "interpreter",
    "instances",
    "autorestart",
    "watch",
    "max_memory_restart",
    "cwd",
    "env",
    "max_restarts",
    "restart_delay",
    "min_uptime",
    "kill_timeout",
];

/// Global supervisor tuning, read from the optional `supervisor` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorSettings {
    /// How often the resource monitor samples live processes
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_ms: u64,

    /// Base delay of the exponential restart backoff
    #[serde(default = "default_restart_delay")]
    pub restart_delay_ms: u64,

    /// Upper bound of the restart backoff
    #[serde(default = "default_max_restart_delay")]
    pub max_restart_delay_ms: u64,

    /// Restarts allowed inside the sliding window before escalating
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Width of the sliding restart window
    #[serde(default = "default_restart_window")]
    pub restart_window_secs: u64,

    /// Running time after which the backoff resets to its base
    #[serde(default = "default_min_uptime")]
    pub min_uptime_ms: u64,

    /// Time allowed for a spawn before it is reported as timed out
    #[serde(default = "default_spawn_timeout")]
    pub spawn_timeout_ms: u64,

    /// Grace period between the stop signal and SIGKILL
    #[serde(default = "default_kill_timeout")]
    pub kill_timeout_ms: u64,
}

fn default_monitor_interval() -> u64 {
    2_000
}

fn default_restart_delay() -> u64 {
    100
}

fn default_max_restart_delay() -> u64 {
    15_000
}

fn default_max_restarts() -> u32 {
    15
}

fn default_restart_window() -> u64 {
    60
}

fn default_min_uptime() -> u64 {
    30_000
}

fn default_spawn_timeout() -> u64 {
    5_000
}

fn default_kill_timeout() -> u64 {
    1_600
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            monitor_interval_ms: default_monitor_interval(),
            restart_delay_ms: default_restart_delay(),
            max_restart_delay_ms: default_max_restart_delay(),
            max_restarts: default_max_restarts(),
            restart_window_secs: default_restart_window(),
            min_uptime_ms: default_min_uptime(),
            spawn_timeout_ms: default_spawn_timeout(),
            kill_timeout_ms: default_kill_timeout(),
        }
    }
}

impl SupervisorSettings {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_millis(self.spawn_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.monitor_interval_ms == 0 {
            return Err(WardenError::ConfigError(
                "supervisor.monitor_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_restart_delay_ms < self.restart_delay_ms {
            return Err(WardenError::ConfigError(
                "supervisor.max_restart_delay_ms must not be below restart_delay_ms".to_string(),
            ));
        }
        if self.max_restarts == 0 {
            return Err(WardenError::ConfigError(
                "supervisor.max_restarts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// `args` accepts a single command line or a list of arguments
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ArgsValue {
    Line(String),
    List(Vec<String>),
}

/// `watch` accepts a flag (watch the working directory) or explicit paths
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum WatchValue {
    Enabled(bool),
    Paths(Vec<PathBuf>),
}

impl Default for WatchValue {
    fn default() -> Self {
        WatchValue::Enabled(false)
    }
}

/// `max_memory_restart` accepts a size string ("1G") or a byte count
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum MemoryValue {
    Bytes(u64),
    Text(String),
}

/// One entry of the `apps` list, as written in the file
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppEntry {
    pub name: String,
    pub script: String,
    #[serde(default)]
    pub args: Option<ArgsValue>,
    #[serde(default)]
    pub interpreter: Option<String>,
    #[serde(default = "default_instances")]
    pub instances: u32,
    #[serde(default = "default_autorestart")]
    pub autorestart: bool,
    #[serde(default)]
    pub watch: WatchValue,
    #[serde(default)]
    pub max_memory_restart: Option<MemoryValue>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub max_restarts: Option<u32>,
    #[serde(default)]
    pub restart_delay: Option<u64>,
    #[serde(default)]
    pub min_uptime: Option<u64>,
    #[serde(default)]
    pub kill_timeout: Option<u64>,
}

fn default_instances() -> u32 {
    1
}

fn default_autorestart() -> bool {
    true
}

impl AppEntry {
    /// Strictly decode one raw entry, naming the offending key on failure
    pub fn from_value(index: usize, value: serde_json::Value) -> Result<Self> {
        let object = value.as_object().ok_or_else(|| {
            WardenError::InvalidConfig(format!("apps[{}] must be a table/object", index))
        })?;

        let label = object
            .get("name")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("apps[{}]", index));

        if let Some(key) = object.keys().find(|k| !APP_KEYS.contains(&k.as_str())) {
            return Err(WardenError::UnknownConfigKey {
                app: label,
                key: key.clone(),
            });
        }

        for required in ["name", "script"] {
            if !object.contains_key(required) {
                return Err(WardenError::MissingConfigField(format!(
                    "{} ({})",
                    required, label
                )));
            }
        }

        serde_json::from_value(value)
            .map_err(|e| WardenError::ConfigError(format!("app '{}': {}", label, e)))
    }
}

/// A parsed ecosystem file: raw app entries plus supervisor settings
#[derive(Debug, Clone)]
pub struct EcosystemFile {
    /// Directory used as default working directory for every app
    pub base_dir: PathBuf,
    pub apps: Vec<serde_json::Value>,
    pub supervisor: SupervisorSettings,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEcosystem {
    #[serde(default)]
    apps: Vec<serde_json::Value>,
    #[serde(default)]
    supervisor: SupervisorSettings,
}

impl EcosystemFile {
    /// Load an ecosystem file (supports TOML and JSON)
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| WardenError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let base_dir = path
            .canonicalize()
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        match extension {
            "toml" => Self::from_toml_str(&contents, base_dir),
            "json" => Self::from_json_str(&contents, base_dir),
            _ => Err(WardenError::InvalidConfig(format!(
                "Unsupported file format: {}. Use .toml or .json",
                extension
            ))),
        }
    }

    pub fn from_json_str(contents: &str, base_dir: PathBuf) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(contents)
            .map_err(|e| WardenError::InvalidConfig(format!("Failed to parse JSON: {}", e)))?;
        Self::from_value(value, base_dir)
    }

    pub fn from_toml_str(contents: &str, base_dir: PathBuf) -> Result<Self> {
        let value: toml::Value = toml::from_str(contents)
            .map_err(|e| WardenError::InvalidConfig(format!("Failed to parse TOML: {}", e)))?;
        let value = serde_json::to_value(value)
            .map_err(|e| WardenError::InvalidConfig(format!("Failed to convert TOML: {}", e)))?;
        Self::from_value(value, base_dir)
    }

    fn from_value(value: serde_json::Value, base_dir: PathBuf) -> Result<Self> {
        let raw: RawEcosystem = serde_json::from_value(value)
            .map_err(|e| WardenError::InvalidConfig(e.to_string()))?;

        if raw.apps.is_empty() {
            return Err(WardenError::InvalidConfig(
                "No apps found in configuration file".to_string(),
            ));
        }

        raw.supervisor.validate()?;

        Ok(Self {
            base_dir,
            apps: raw.apps,
            supervisor: raw.supervisor,
        })
    }
}

/// Parse a human memory size ("1G", "512M", "300K", "1024") into bytes
pub fn parse_memory_size(input: &str) -> Result<u64> {
    let invalid = || WardenError::ConfigError(format!("Invalid memory size: '{}'", input));

    let normalized = input.trim().replace('_', "");
    let without_bytes = normalized.trim_end_matches(&['B', 'b'][..]);

    let (number_part, factor) = match without_bytes.chars().last() {
        Some(suffix) if suffix.is_ascii_alphabetic() => {
            let multiplier = match suffix.to_ascii_uppercase() {
                'K' => 1u64 << 10,
                'M' => 1u64 << 20,
                'G' => 1u64 << 30,
                'T' => 1u64 << 40,
                _ => return Err(invalid()),
            };
            (&without_bytes[..without_bytes.len() - 1], multiplier)
        }
        _ => (without_bytes, 1u64),
    };

    let value: u64 = number_part.trim().parse().map_err(|_| invalid())?;
    value.checked_mul(factor).ok_or_else(invalid)
}

/// Split a command line into arguments, honouring single and double quotes
pub fn split_args(line: &str) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            (Some(_), c) => current.push(c),
            (None, '"') | (None, '\'') => {
                quote = Some(c);
                in_token = true;
            }
            (None, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    in_token = true;
                }
            }
            (None, c) if c.is_whitespace() => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if quote.is_some() {
        return Err(WardenError::ConfigError(format!(
            "Unterminated quote in args: {}",
            line
        )));
    }
    if in_token {
        args.push(current);
    }

    Ok(args)
}

/// Expand `$VAR` and `${VAR}` references from the host environment
pub fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        if name.is_empty() {
            out.push('$');
            rest = after;
            continue;
        }

        out.push_str(&std::env::var(name).unwrap_or_default());
        rest = &after[consumed..];
    }

    out.push_str(rest);
    out
}
