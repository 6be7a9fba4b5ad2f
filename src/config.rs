//! Reads the handful of plugin keys from the server's own `server.cfg`. The
//! format (`key value` lines, `#` comments) belongs to the host; unknown keys
//! are someone else's and get skipped without comment.

use std::path::Path;

use tracing::debug;

pub const CONFIG_FILE: &str = "server.cfg";

const KEY_SCRIPT: &str = "luascript";
const KEY_DEBUG: &str = "luadebug";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginConfig {
    /// Entry script evaluated at plugin start.
    pub script: String,
    /// Start with debug-level logging enabled.
    pub debug: bool,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            script: "main.lua".to_owned(),
            debug: false,
        }
    }
}

pub fn load(path: &Path) -> PluginConfig {
    match std::fs::read_to_string(path) {
        Ok(contents) => parse(&contents),
        Err(err) => {
            debug!("no config at {}: {err}, using defaults", path.display());
            PluginConfig::default()
        }
    }
}

fn parse(contents: &str) -> PluginConfig {
    let mut config = PluginConfig::default();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(char::is_whitespace) else {
            continue;
        };
        let value = value.trim();
        if key.eq_ignore_ascii_case(KEY_SCRIPT) {
            if !value.is_empty() {
                config.script = value.to_owned();
            }
        } else if key.eq_ignore_ascii_case(KEY_DEBUG) {
            config.debug = truthy(value);
        }
    }
    config
}

fn truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "yes" | "y" | "t" | "1"
    )
}
