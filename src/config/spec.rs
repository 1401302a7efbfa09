use crate::config::{
    expand_env, parse_memory_size, split_args, AppEntry, ArgsValue, MemoryValue,
    SupervisorSettings, WatchValue,
};
use crate::error::{Result, WardenError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Validated, immutable description of one managed application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Unique key of the application
    pub name: String,

    /// Entry point as written in the configuration
    pub script: String,

    /// Interpreter used to run `script`, `None` to execute it directly
    pub interpreter: Option<String>,

    pub args: Vec<String>,

    pub cwd: PathBuf,

    /// Overrides applied on top of the inherited host environment
    pub env: BTreeMap<String, String>,

    pub autorestart: bool,

    pub max_memory_bytes: Option<u64>,

    /// Paths polled for changes; empty disables watching
    pub watch_paths: BTreeSet<PathBuf>,

    pub instances: u32,

    pub max_restarts: Option<u32>,
    pub restart_delay_ms: Option<u64>,
    pub min_uptime_ms: Option<u64>,
    pub kill_timeout_ms: Option<u64>,
}

impl ProcessSpec {
    /// Validate a raw entry into a spec; relative paths resolve against `base_dir`
    pub fn from_entry(entry: AppEntry, base_dir: &Path) -> Result<Self> {
        let name = entry.name.trim().to_string();
        if name.is_empty() {
            return Err(WardenError::MissingConfigField("name".to_string()));
        }

        let script = expand_env(entry.script.trim());
        if script.is_empty() {
            return Err(WardenError::MissingConfigField(format!("script ({})", name)));
        }

        if entry.instances == 0 {
            return Err(WardenError::ConfigError(format!(
                "app '{}': instances must be at least 1",
                name
            )));
        }

        let max_memory_bytes = match entry.max_memory_restart {
            None => None,
            Some(MemoryValue::Bytes(bytes)) => Some(bytes),
            Some(MemoryValue::Text(text)) => Some(
                parse_memory_size(&text)
                    .map_err(|e| WardenError::ConfigError(format!("app '{}': {}", name, e)))?,
            ),
        };
        if max_memory_bytes == Some(0) {
            return Err(WardenError::ConfigError(format!(
                "app '{}': max_memory_restart must be greater than 0",
                name
            )));
        }

        let args = match entry.args {
            None => Vec::new(),
            Some(ArgsValue::Line(line)) => split_args(&expand_env(&line))
                .map_err(|e| WardenError::ConfigError(format!("app '{}': {}", name, e)))?,
            Some(ArgsValue::List(list)) => list.iter().map(|a| expand_env(a)).collect(),
        };

        let cwd = match entry.cwd {
            Some(cwd) => base_dir.join(expand_env(&cwd.to_string_lossy())),
            None => base_dir.to_path_buf(),
        };

        let interpreter = match entry.interpreter.as_deref().map(str::trim) {
            Some("none") => None,
            Some("") => {
                return Err(WardenError::ConfigError(format!(
                    "app '{}': interpreter must not be empty (use \"none\")",
                    name
                )))
            }
            Some(other) => Some(other.to_string()),
            None => infer_interpreter(&script).map(str::to_string),
        };

        let watch_paths = match entry.watch {
            WatchValue::Enabled(false) => BTreeSet::new(),
            WatchValue::Enabled(true) => BTreeSet::from([cwd.clone()]),
            WatchValue::Paths(paths) => paths.iter().map(|p| cwd.join(p)).collect(),
        };

        let env = entry
            .env
            .into_iter()
            .map(|(k, v)| (k, expand_env(&v)))
            .collect();

        Ok(Self {
            name,
            script,
            interpreter,
            args,
            cwd,
            env,
            autorestart: entry.autorestart,
            max_memory_bytes,
            watch_paths,
            instances: entry.instances,
            max_restarts: entry.max_restarts,
            restart_delay_ms: entry.restart_delay,
            min_uptime_ms: entry.min_uptime,
            kill_timeout_ms: entry.kill_timeout,
        })
    }

    /// Program and argument vector used to launch an instance
    pub fn command_line(&self) -> (String, Vec<String>) {
        match &self.interpreter {
            Some(interpreter) => {
                let mut args = Vec::with_capacity(self.args.len() + 1);
                args.push(self.script.clone());
                args.extend(self.args.iter().cloned());
                (interpreter.clone(), args)
            }
            None => (self.script.clone(), self.args.clone()),
        }
    }

    /// Grace period before a stopping instance is killed
    pub fn kill_timeout(&self, settings: &SupervisorSettings) -> Duration {
        Duration::from_millis(self.kill_timeout_ms.unwrap_or(settings.kill_timeout_ms))
    }
}

/// Pick an interpreter from the script extension, as PM2-style ecosystems expect
pub fn infer_interpreter(script: &str) -> Option<&'static str> {
    let extension = Path::new(script).extension()?.to_str()?;
    match extension {
        "js" | "mjs" | "cjs" => Some("node"),
        "py" => Some("python3"),
        "sh" => Some("bash"),
        "rb" => Some("ruby"),
        "php" => Some("php"),
        _ => None,
    }
}
