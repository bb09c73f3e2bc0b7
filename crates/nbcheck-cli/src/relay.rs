//! Anonymized usage records: posted to the experiment server when enabled,
//! and always kept in a dated local log.

use crate::config::ExperimentConfig;
use anyhow::Result;
use chrono::{DateTime, Local};
use nbcheck_env::BatchSummary;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const FOLDER: &str = "experiment";
const POST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayRecord {
    pub header: &'static str,
    pub operation: String,
    pub exit_code: i32,
    /// sha256 of each notebook path; names never leave the machine.
    pub notebooks: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<BatchSummary>,
    pub version: &'static str,
    pub timestamp: String,
}

impl RelayRecord {
    pub fn new(operation: &str, exit_code: i32, notebooks: &[String], summary: Option<BatchSummary>) -> Self {
        RelayRecord {
            header: "CLI",
            operation: operation.to_string(),
            exit_code,
            notebooks: notebooks.iter().map(|p| anonymize(p)).collect(),
            summary,
            version: env!("CARGO_PKG_VERSION"),
            timestamp: Local::now().to_rfc3339(),
        }
    }
}

pub fn anonymize(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

fn post(record: &RelayRecord, config: &ExperimentConfig) -> Result<bool> {
    let client = reqwest::blocking::Client::builder().timeout(POST_TIMEOUT).build()?;
    let response = client
        .post(&config.server)
        .json(&json!({
            "mtype": FOLDER,
            "mtext": record,
            "mexperiment_id": config.id,
            "version": record.version,
        }))
        .send()?;
    if !response.status().is_success() {
        return Ok(false);
    }
    let body: Value = response.json()?;
    Ok(body.get("ok").and_then(Value::as_bool).unwrap_or(false))
}

pub fn log_path(home: &Path, folder: &str, now: DateTime<Local>) -> PathBuf {
    home.join(folder)
        .join(now.format("%Y%m").to_string())
        .join(format!("{}.log", now.format("%d")))
}

fn save_log(record: &RelayRecord, home: &Path, folder: &str) -> Result<PathBuf> {
    let path = log_path(home, folder, Local::now());
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    writeln!(file, "{}", serde_json::to_string(record)?)?;
    Ok(path)
}

/// Never fails the calling command; problems are only logged.
pub fn relay(record: &RelayRecord, config: &ExperimentConfig, home: Option<&Path>) -> Option<PathBuf> {
    let mut folder = FOLDER.to_string();
    if config.enabled && config.send_server {
        match post(record, config) {
            Ok(true) => folder = format!("sent_{}", FOLDER),
            Ok(false) => debug!(server = %config.server, "experiment server rejected record"),
            Err(err) => warn!(error = %err, "failed to send to server"),
        }
    }
    let home = home?;
    match save_log(record, home, &folder) {
        Ok(path) => Some(path),
        Err(err) => {
            warn!(error = %err, "failed to save usage log");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn paths_are_hashed() {
        let record = RelayRecord::new("run", 3, &["secret/analysis.ipynb".to_string()], None);
        assert_eq!(record.notebooks.len(), 1);
        assert_eq!(record.notebooks[0].len(), 64);
        assert!(!record.notebooks[0].contains("secret"));
        assert_eq!(record.notebooks[0], anonymize("secret/analysis.ipynb"));
    }

    #[test]
    fn log_path_is_dated() {
        let now = Local.with_ymd_and_hms(2024, 3, 7, 12, 0, 0).single().expect("valid date");
        assert_eq!(
            log_path(Path::new("/h"), "experiment", now),
            PathBuf::from("/h/experiment/202403/07.log")
        );
    }

    #[test]
    fn disabled_relay_appends_locally() {
        let home = std::env::temp_dir().join(format!(
            "nbcheck_relay_{}_{}",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        let record = RelayRecord::new(
            "env",
            0,
            &[],
            Some(BatchSummary {
                total: 2,
                ..Default::default()
            }),
        );
        let config = ExperimentConfig::default();
        let first = relay(&record, &config, Some(&home)).expect("saved");
        let second = relay(&record, &config, Some(&home)).expect("saved again");
        assert_eq!(first, second);
        assert!(first.starts_with(home.join("experiment")));
        let content = fs::read_to_string(&first).expect("log");
        let lines: Vec<Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["summary"]["total"], 2);
        assert_eq!(lines[0]["operation"], "env");
        let _ = fs::remove_dir_all(&home);
        assert_eq!(relay(&record, &config, None), None);
    }
}
