use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

use crate::governor::{DEFAULT_MAX_CALLS_PER_MINUTE, DEFAULT_MIN_INTERVAL_MS};

/// Get the config directory using platform-appropriate location.
///
/// - macOS: `~/Library/Application Support/dashboard-insight/`
/// - Linux: `~/.config/dashboard-insight/` (or `$XDG_CONFIG_HOME`)
/// - Windows: `%APPDATA%/dashboard-insight/`
///
/// Falls back to `~/.dashboard-insight/` if platform dir is unavailable.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("dashboard-insight"))
        .unwrap_or_else(fallback_dotdir)
}

fn fallback_dotdir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".dashboard-insight")
}

/// Load a JSON config file from `dir`, returning Default if missing or corrupt.
/// Logs a warning when the file exists but cannot be read or parsed,
/// so corrupt files are visible in logs instead of silently resetting state.
pub fn load_json_config_from<T: DeserializeOwned + Default>(dir: &Path, filename: &str) -> T {
    let path = dir.join(filename);
    if !path.exists() {
        return T::default();
    }
    let content = match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "could not read config");
            return T::default();
        }
    };
    match serde_json::from_str(&content) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "corrupt config, using defaults");
            T::default()
        }
    }
}

/// Save a JSON config file into `dir` atomically (temp file + rename).
/// Sets 0600 permissions on Unix.
pub fn save_json_config_to<T: Serialize>(dir: &Path, filename: &str, config: &T) -> Result<(), String> {
    let target = dir.join(filename);
    let parent = target.parent().unwrap_or(dir);
    std::fs::create_dir_all(parent)
        .map_err(|e| format!("Failed to create config directory: {e}"))?;

    let json = serde_json::to_string_pretty(config)
        .map_err(|e| format!("Failed to serialize config: {e}"))?;

    let temp = dir.join(format!("{}.tmp.{}", filename, std::process::id()));

    std::fs::write(&temp, &json)
        .map_err(|e| format!("Failed to write temp config: {e}"))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&temp, perms)
            .map_err(|e| format!("Failed to set config permissions: {e}"))?;
    }

    // Atomic rename: either the old file or new file exists, never partial
    std::fs::rename(&temp, &target)
        .map_err(|e| {
            let _ = std::fs::remove_file(&temp);
            format!("Failed to commit config: {e}")
        })?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Panel options
// ---------------------------------------------------------------------------

/// Per-panel options as edited in the panel's settings pane.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelOptions {
    /// Model identifier passed to the vision model client
    #[serde(default = "default_model")]
    pub model: String,
    /// Instruction sent alongside the screenshot
    #[serde(default = "default_prompt")]
    pub prompt: String,
    /// Environment variable that holds the API key (the key is never stored)
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Calls allowed per rolling minute (0 = always blocked)
    #[serde(default = "default_max_calls_per_minute")]
    pub max_calls_per_minute: u32,
    /// Minimum spacing between calls in milliseconds (0 = no spacing)
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    /// Caller-side timeout for one model call (0 = none)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_model() -> String {
    "gemini-1.5-flash".to_string()
}

fn default_prompt() -> String {
    "Summarize what this dashboard shows. Call out key trends, anomalies, and anything that needs attention."
        .to_string()
}

fn default_api_key_env() -> String {
    "GEMINI_API_KEY".to_string()
}

fn default_max_calls_per_minute() -> u32 {
    DEFAULT_MAX_CALLS_PER_MINUTE
}

fn default_min_interval_ms() -> u64 {
    DEFAULT_MIN_INTERVAL_MS
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for PanelOptions {
    fn default() -> Self {
        Self {
            model: default_model(),
            prompt: default_prompt(),
            api_key_env: default_api_key_env(),
            max_calls_per_minute: default_max_calls_per_minute(),
            min_interval_ms: default_min_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl PanelOptions {
    /// Reject options the panel cannot run with.
    ///
    /// A zero call budget is allowed: the governor fails closed and the panel
    /// keeps showing a rate-limited message.
    pub fn validate(&self) -> Result<(), String> {
        if self.model.trim().is_empty() {
            return Err("model is empty".into());
        }
        if self.prompt.trim().is_empty() {
            return Err("prompt is empty".into());
        }
        if !is_env_var_name(&self.api_key_env) {
            return Err(format!(
                "apiKeyEnv \"{}\" is not a valid environment variable name",
                self.api_key_env
            ));
        }
        if self.max_calls_per_minute == 0 {
            tracing::warn!("maxCallsPerMinute is 0, every analysis will be blocked");
        }
        Ok(())
    }
}

fn is_env_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ---------------------------------------------------------------------------
// Per-panel storage
// ---------------------------------------------------------------------------

/// Returns true if a relative path attempts to escape its root via `..`,
/// absolute components, or other shenanigans.
fn is_path_escape(relative: &str) -> bool {
    let path = Path::new(relative);

    if path.is_absolute() {
        return true;
    }

    for component in path.components() {
        match component {
            Component::ParentDir => return true,
            Component::RootDir | Component::Prefix(_) => return true,
            _ => {}
        }
    }

    false
}

/// Relative filename for a panel's options: `panels/{panel_id}.json`.
pub fn panel_options_filename(panel_id: &str) -> Result<String, String> {
    if panel_id.trim().is_empty() {
        return Err("panel id is empty".into());
    }
    if panel_id.contains('/') || panel_id.contains('\\') || is_path_escape(panel_id) {
        return Err(format!("panel id \"{panel_id}\" attempts path traversal"));
    }
    Ok(format!("panels/{panel_id}.json"))
}

pub fn load_panel_options_from(dir: &Path, panel_id: &str) -> Result<PanelOptions, String> {
    let filename = panel_options_filename(panel_id)?;
    Ok(load_json_config_from(dir, &filename))
}

pub fn save_panel_options_to(dir: &Path, panel_id: &str, options: &PanelOptions) -> Result<(), String> {
    options.validate()?;
    let filename = panel_options_filename(panel_id)?;
    save_json_config_to(dir, &filename, options)
}

/// Load a panel's options from the user config directory.
pub fn load_panel_options(panel_id: &str) -> Result<PanelOptions, String> {
    load_panel_options_from(&config_dir(), panel_id)
}

/// Validate and save a panel's options to the user config directory.
pub fn save_panel_options(panel_id: &str, options: &PanelOptions) -> Result<(), String> {
    save_panel_options_to(&config_dir(), panel_id, options)
}
