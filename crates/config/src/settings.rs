// Engine settings
// Loaded from ~/.config/scriptbox/settings.toml

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default wall-clock budget for one snippet run (milliseconds).
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Default instruction budget. Enough for any grading or aggregate snippet.
pub const DEFAULT_INSTRUCTION_LIMIT: u64 = 100_000_000;

/// Default Lua heap ceiling (64 MiB).
pub const DEFAULT_MEMORY_LIMIT: usize = 64 * 1024 * 1024;

/// Default cap on captured console entries per run.
pub const DEFAULT_MAX_LOG_ENTRIES: usize = 5_000;

/// Default cap on snippet source size (1 MiB).
pub const DEFAULT_MAX_CODE_BYTES: usize = 1024 * 1024;

/// Default worst-case step estimate allowed for one `string` pattern call.
pub const DEFAULT_PATTERN_WORK_LIMIT: u64 = 500_000_000;

/// Default number of abandoned workers that may still be running before
/// new runs are refused.
pub const DEFAULT_MAX_DETACHED_WORKERS: usize = 4;

/// Sandbox limits and binding behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Wall-clock timeout per run
    pub timeout_ms: u64,

    /// VM instruction budget per run
    pub instruction_limit: u64,

    /// Lua heap ceiling in bytes
    pub memory_limit_bytes: usize,

    /// Console entries kept per run; the rest are discarded with a notice
    pub max_log_entries: usize,

    /// Snippets longer than this are rejected before compilation
    pub max_code_bytes: usize,

    /// Reading an undefined global raises instead of yielding nil
    pub strict_globals: bool,

    /// `string.find/match/gmatch/gsub` calls whose worst-case backtracking
    /// estimate exceeds this many steps are refused before they start
    pub pattern_work_limit: u64,

    /// Workers past their deadline that are still running. At this count new
    /// runs are refused until one exits.
    pub max_detached_workers: usize,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            instruction_limit: DEFAULT_INSTRUCTION_LIMIT,
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT,
            max_log_entries: DEFAULT_MAX_LOG_ENTRIES,
            max_code_bytes: DEFAULT_MAX_CODE_BYTES,
            strict_globals: false,
            pattern_work_limit: DEFAULT_PATTERN_WORK_LIMIT,
            max_detached_workers: DEFAULT_MAX_DETACHED_WORKERS,
        }
    }
}

/// Capability allowlist defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilitySettings {
    /// Capabilities granted when a request does not name its own allowlist
    pub default: Vec<String>,
}

impl Default for CapabilitySettings {
    fn default() -> Self {
        Self {
            default: vec!["http".into(), "date".into(), "color".into()],
        }
    }
}

/// Policy for the `http` capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    /// Per-request timeout (further capped by the run deadline)
    pub timeout_ms: u64,

    /// Response bodies larger than this fail the call
    pub max_response_bytes: usize,

    /// Hosts snippets may reach. Empty = any host.
    pub allowed_hosts: Vec<String>,

    pub user_agent: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_response_bytes: 1024 * 1024,
            allowed_hosts: Vec::new(),
            user_agent: format!("scriptbox/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl HttpSettings {
    /// Returns true if `host` may be contacted under this policy.
    pub fn host_allowed(&self, host: &str) -> bool {
        if self.allowed_hosts.is_empty() {
            return true;
        }
        self.allowed_hosts
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(host))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub sandbox: SandboxSettings,
    pub capabilities: CapabilitySettings,
    pub http: HttpSettings,
}

impl Settings {
    /// Get the settings file path
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("scriptbox");
        config_dir.join("settings.toml")
    }

    /// Load settings from disk, falling back to defaults.
    ///
    /// A missing file is not an error. A malformed or invalid file is logged
    /// and replaced by defaults. Environment overrides apply in every case.
    pub fn load() -> Self {
        let path = Self::config_path();

        let mut settings = if path.exists() {
            match Self::load_from(&path) {
                Ok(settings) => settings,
                Err(e) => {
                    log::warn!("{}; using default settings", e);
                    Self::default()
                }
            }
        } else {
            Self::default()
        };

        settings.apply_env();
        settings
    }

    /// Load and validate settings from an explicit file.
    pub fn load_from(path: &Path) -> Result<Self, String> {
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("error reading {}: {}", path.display(), e))?;
        let settings = Self::from_toml(&contents)
            .map_err(|e| format!("error parsing {}: {}", path.display(), e))?;
        Ok(settings)
    }

    /// Parse and validate settings from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self, String> {
        let settings: Settings = toml::from_str(contents).map_err(|e| e.to_string())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject limits that would make every run fail.
    pub fn validate(&self) -> Result<(), String> {
        if self.sandbox.timeout_ms == 0 {
            return Err("sandbox.timeout_ms must be greater than 0".into());
        }
        if self.sandbox.instruction_limit == 0 {
            return Err("sandbox.instruction_limit must be greater than 0".into());
        }
        if self.sandbox.memory_limit_bytes < 1024 * 1024 {
            return Err("sandbox.memory_limit_bytes must be at least 1 MiB".into());
        }
        if self.sandbox.max_code_bytes == 0 {
            return Err("sandbox.max_code_bytes must be greater than 0".into());
        }
        if self.sandbox.pattern_work_limit == 0 {
            return Err("sandbox.pattern_work_limit must be greater than 0".into());
        }
        if self.sandbox.max_detached_workers == 0 {
            return Err("sandbox.max_detached_workers must be greater than 0".into());
        }
        if self.http.timeout_ms == 0 {
            return Err("http.timeout_ms must be greater than 0".into());
        }
        Ok(())
    }

    /// Apply `SCRIPTBOX_*` environment overrides.
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup("SCRIPTBOX_TIMEOUT_MS") {
            match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => self.sandbox.timeout_ms = ms,
                _ => log::warn!("ignoring SCRIPTBOX_TIMEOUT_MS={:?}", raw),
            }
        }
        if let Some(raw) = lookup("SCRIPTBOX_MEMORY_LIMIT") {
            match raw.trim().parse::<usize>() {
                Ok(bytes) if bytes >= 1024 * 1024 => self.sandbox.memory_limit_bytes = bytes,
                _ => log::warn!("ignoring SCRIPTBOX_MEMORY_LIMIT={:?}", raw),
            }
        }
        if let Some(raw) = lookup("SCRIPTBOX_STRICT_GLOBALS") {
            match raw.trim() {
                "1" | "true" | "yes" => self.sandbox.strict_globals = true,
                "0" | "false" | "no" => self.sandbox.strict_globals = false,
                _ => log::warn!("ignoring SCRIPTBOX_STRICT_GLOBALS={:?}", raw),
            }
        }
    }

    /// Get the config file path for display
    pub fn config_path_display() -> String {
        Self::config_path().to_string_lossy().to_string()
    }
}
