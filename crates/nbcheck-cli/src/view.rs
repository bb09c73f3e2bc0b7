//! Human-readable rendering of run and batch results.

use nbcheck_core::{DiffFlag, ExecutionStatus, NotebookReport};
use nbcheck_env::summary::BatchSummary;
use nbcheck_env::BatchOutcome;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewOptions {
    pub hide_message: bool,
    pub skip_comparison: bool,
}

pub fn status_name(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::NotRun => "not-run",
        ExecutionStatus::Skipped => "skipped",
        ExecutionStatus::Error => "error",
        ExecutionStatus::Run => "run",
    }
}

pub fn simple_view(report: &NotebookReport, options: ViewOptions, spaces: usize) -> Vec<String> {
    let pad = " ".repeat(spaces);
    let execution = &report.execution;
    let mut lines = vec![
        format!("{}Status: {}", pad, status_name(execution.status)),
        format!(
            "{}Executed cells: {}/{}",
            pad,
            execution.executed_cells,
            execution.cell_order.len()
        ),
    ];
    if let Some(reason) = &report.fail.reason {
        lines.push(format!("{}Reason: {}", pad, reason));
        if !options.hide_message {
            if let Some(msg) = report.fail.msg.as_deref().filter(|m| !m.is_empty()) {
                lines.push(format!("{}Message: {}", pad, msg));
            }
        }
    }
    if !options.skip_comparison && report.diff.has(DiffFlag::Finished) {
        lines.push(format!(
            "{}Different cells before normalization: {} [{}]",
            pad, report.diff.diff_count, report.diff.diff
        ));
        lines.push(format!(
            "{}Different cells after normalization: {} [{}]",
            pad, report.diff.diffnorm_count, report.diff.diffnorm
        ));
    }
    lines
}

fn failure_lines(title: &str, reason: &str, msg: &str, options: ViewOptions) -> Vec<String> {
    let mut lines = vec![title.to_string(), format!("  Reason: {}", reason)];
    if !options.hide_message {
        lines.push(format!("  Message: {}", msg));
    }
    lines
}

pub fn batch_view(outcome: &BatchOutcome, prepare_only: bool, options: ViewOptions) -> Vec<String> {
    match outcome {
        BatchOutcome::PrepareFailed { reason, msg } => {
            failure_lines("Failed to prepare environment", reason, msg, options)
        }
        BatchOutcome::InstallFailed { reason, msg } => {
            failure_lines("Failed to install declared dependencies", reason, msg, options)
        }
        BatchOutcome::NoNotebooks if prepare_only => vec!["Environment prepared".to_string()],
        BatchOutcome::NoNotebooks => {
            vec!["Failed to run notebooks in a prepared environment: no notebooks".to_string()]
        }
        BatchOutcome::DryRun => vec!["Finished dry-run".to_string()],
        BatchOutcome::Notebooks(results) => {
            let mut lines = vec!["Report:".to_string()];
            for (name, report) in results {
                lines.push(format!("  {}", name));
                lines.extend(simple_view(report, options, 4));
            }
            let summary = BatchSummary::from_reports(results.iter().map(|(_, r)| r), options.skip_comparison);
            lines.push(String::new());
            lines.push("Summary:".to_string());
            lines.extend(summary.lines(options.skip_comparison).into_iter().map(|l| format!("  {}", l)));
            lines
        }
    }
}

pub fn outcome_to_json(outcome: &BatchOutcome) -> Value {
    match outcome {
        BatchOutcome::PrepareFailed { reason, msg } | BatchOutcome::InstallFailed { reason, msg } => json!({
            "fail": outcome.fail_code(),
            "reason": reason,
            "msg": msg,
        }),
        BatchOutcome::NoNotebooks => json!({
            "fail": outcome.fail_code(),
            "reason": nbcheck_env::orchestrator::REASON_NO_NOTEBOOKS,
            "msg": "prepared environment",
        }),
        BatchOutcome::DryRun => json!({ "fail": outcome.fail_code() }),
        BatchOutcome::Notebooks(results) => {
            let mut notebooks = Map::new();
            for (name, report) in results {
                notebooks.insert(name.clone(), serde_json::to_value(report).unwrap_or(Value::Null));
            }
            json!({ "notebooks": notebooks })
        }
    }
}
