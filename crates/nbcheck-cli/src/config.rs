use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const CONFIG_DIR: &str = ".nbcheck";
pub const CONFIG_FILE: &str = "config.yaml";
pub const DEFAULT_EXPERIMENT_SERVER: &str = "https://nbcheck.invalid/experiment";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub run: RunConfig,
    pub experiment: ExperimentConfig,
}

/// Defaults for `nbcheck run`; command-line flags win over these.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub order: Option<String>,
    pub timeout: Option<f64>,
    pub normalizations: Option<Vec<String>>,
    pub similarity: Option<Vec<String>>,
    pub kernel: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub id: String,
    pub enabled: bool,
    pub send_server: bool,
    pub server: String,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        ExperimentConfig {
            id: "<unset>".to_string(),
            enabled: false,
            send_server: false,
            server: DEFAULT_EXPERIMENT_SERVER.to_string(),
        }
    }
}

pub fn home_config_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(|h| PathBuf::from(h).join(CONFIG_DIR))
}

fn read_yaml(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path)?;
    let yaml: serde_yaml::Value = serde_yaml::from_str(&raw)?;
    Ok(serde_json::to_value(yaml)?)
}

/// Missing files are empty; unreadable ones are logged and treated as empty.
fn load_layer(dir: &Path) -> Value {
    let path = dir.join(CONFIG_FILE);
    if !path.is_file() {
        return Value::Null;
    }
    match read_yaml(&path) {
        Ok(value) => value,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring malformed config");
            Value::Null
        }
    }
}

/// Maps merge key by key; anything else in `over` replaces `base`.
pub fn merge(base: Value, over: Value) -> Value {
    match (base, over) {
        (Value::Object(mut base), Value::Object(over)) => {
            for (key, value) in over {
                let merged = match base.remove(&key) {
                    Some(existing) => merge(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (base, Value::Null) => base,
        (_, over) => over,
    }
}

impl Config {
    /// Home config overlaid by the project config in `project_root`.
    pub fn load(home: Option<&Path>, project_root: &Path) -> Config {
        let home_layer = home.map(load_layer).unwrap_or(Value::Null);
        let project_layer = load_layer(&project_root.join(CONFIG_DIR));
        let merged = merge(home_layer, project_layer);
        if merged.is_null() {
            return Config::default();
        }
        match serde_json::from_value(merged) {
            Ok(config) => config,
            Err(err) => {
                warn!(error = %err, "config does not match the expected shape, using defaults");
                Config::default()
            }
        }
    }
}
