//! Result records shared by the in-process runner and the orchestrator that
//! reads them back out of a sandboxed subprocess.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Marks the start of the machine-readable payload on a `run -w ejson` stdout.
pub const RESULT_SEPARATOR: &str = "<<<<---julyntersep--->>>>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionStatus {
    NotRun,
    Skipped,
    Error,
    Run,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionFlag {
    Attempt,
    Loaded,
    Timeout,
    Exception,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiffFlag {
    Finished,
    SameResults,
    MismatchResults,
    SameNorm,
    MismatchNorm,
}

/// Why a comparison stage found old and new outputs different.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiffReason {
    Length,
    Keys,
    ValueMismatch,
}

impl DiffReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DiffReason::Length => "length",
            DiffReason::Keys => "keys",
            DiffReason::ValueMismatch => "value-mismatch",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailInfo {
    pub reason: Option<String>,
    pub msg: Option<String>,
}

impl FailInfo {
    pub fn new(reason: impl Into<String>, msg: impl Into<String>) -> Self {
        FailInfo {
            reason: Some(reason.into()),
            msg: Some(msg.into()),
        }
    }

    pub fn is_set(&self) -> bool {
        self.reason.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    processed: BTreeSet<ExecutionFlag>,
    pub cell_order: Vec<usize>,
    pub executed_cells: usize,
    pub duration: Option<f64>,
    pub last_cell: Option<usize>,
    pub timeout: Option<f64>,
}

impl Default for ExecutionResult {
    fn default() -> Self {
        ExecutionResult {
            status: ExecutionStatus::NotRun,
            processed: BTreeSet::new(),
            cell_order: Vec::new(),
            executed_cells: 0,
            duration: None,
            last_cell: None,
            timeout: None,
        }
    }
}

impl ExecutionResult {
    /// Flags only accumulate for the lifetime of a result.
    pub fn mark(&mut self, flag: ExecutionFlag) {
        self.processed.insert(flag);
    }

    pub fn has(&self, flag: ExecutionFlag) -> bool {
        self.processed.contains(&flag)
    }

    pub fn flags(&self) -> impl Iterator<Item = ExecutionFlag> + '_ {
        self.processed.iter().copied()
    }
}

/// One normalizer stage's verdict for one cell.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizerRecord {
    #[serde(rename = "_old_changes")]
    pub old_changes: usize,
    #[serde(rename = "_new_changes")]
    pub new_changes: usize,
    #[serde(rename = "_distinct", default, skip_serializing_if = "Option::is_none")]
    pub distinct: Option<usize>,
    #[serde(rename = "_equals")]
    pub equals: Option<bool>,
    #[serde(rename = "_reason")]
    pub reason: Option<DiffReason>,
    #[serde(rename = "_similar", default, skip_serializing_if = "Option::is_none")]
    pub similar: Option<f64>,
    #[serde(rename = "_timeout", default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellSimilarity {
    pub index: usize,
    pub stages: BTreeMap<String, NormalizerRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffResult {
    pub diff: String,
    pub diff_count: usize,
    pub diffnorm: String,
    pub diffnorm_count: usize,
    processed: BTreeSet<DiffFlag>,
    pub similarities: Vec<CellSimilarity>,
}

impl DiffResult {
    pub fn mark(&mut self, flag: DiffFlag) {
        self.processed.insert(flag);
    }

    pub fn has(&self, flag: DiffFlag) -> bool {
        self.processed.contains(&flag)
    }
}

/// Everything one `run` produces; also the JSON document emitted after
/// [`RESULT_SEPARATOR`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotebookReport {
    pub fail: FailInfo,
    pub execution: ExecutionResult,
    pub diff: DiffResult,
}

impl NotebookReport {
    /// Report for a notebook whose subprocess never produced a payload.
    pub fn synthesized_failure(reason: &str, msg: String) -> Self {
        let mut report = NotebookReport::default();
        report.execution.status = ExecutionStatus::Error;
        report.fail = FailInfo::new(reason, msg);
        report
    }

    /// Parses the payload that follows the last separator in `stdout`.
    pub fn from_stdout(stdout: &str) -> Option<Self> {
        let (_, payload) = stdout.rsplit_once(RESULT_SEPARATOR)?;
        serde_json::from_str(payload.trim()).ok()
    }

    pub fn to_ejson(&self) -> serde_json::Result<String> {
        Ok(format!("{}\n{}", RESULT_SEPARATOR, serde_json::to_string(self)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_serialize_as_kebab_case() {
        let mut execution = ExecutionResult::default();
        execution.mark(ExecutionFlag::Loaded);
        execution.mark(ExecutionFlag::Attempt);
        execution.mark(ExecutionFlag::Loaded);
        let value = serde_json::to_value(&execution).expect("serialize");
        assert_eq!(value["status"], "not-run");
        assert_eq!(value["processed"], serde_json::json!(["attempt", "loaded"]));

        let mut diff = DiffResult::default();
        diff.mark(DiffFlag::MismatchNorm);
        let value = serde_json::to_value(&diff).expect("serialize");
        assert_eq!(value["processed"], serde_json::json!(["mismatch-norm"]));
    }

    #[test]
    fn report_round_trips_through_ejson_stdout() {
        let mut report = NotebookReport::default();
        report.execution.status = ExecutionStatus::Run;
        report.execution.cell_order = vec![0, 2];
        report.diff.diff = "2".into();
        report.diff.diff_count = 1;
        let stdout = format!("Reading file\nUsing kernel python3\n{}\n", report.to_ejson().expect("ejson"));
        let parsed = NotebookReport::from_stdout(&stdout).expect("payload");
        assert_eq!(parsed, report);
    }

    #[test]
    fn stdout_without_separator_has_no_report() {
        assert!(NotebookReport::from_stdout("Traceback: boom").is_none());
        let garbled = format!("{}\n{{not json", RESULT_SEPARATOR);
        assert!(NotebookReport::from_stdout(&garbled).is_none());
    }

    #[test]
    fn record_uses_underscored_keys() {
        let record = NormalizerRecord {
            old_changes: 1,
            equals: Some(false),
            reason: Some(DiffReason::ValueMismatch),
            similar: Some(0.5),
            timeout: Some(false),
            ..Default::default()
        };
        let value = serde_json::to_value(&record).expect("serialize");
        assert_eq!(value["_old_changes"], 1);
        assert_eq!(value["_reason"], "value-mismatch");
        assert_eq!(value["_similar"], 0.5);
        assert!(value.get("_distinct").is_none());
    }
}
