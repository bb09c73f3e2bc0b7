//! Batch aggregation over per-notebook reports.

use crate::orchestrator::BatchOutcome;
use nbcheck_core::{DiffFlag, ExecutionFlag, ExecutionStatus, NotebookReport};
use serde::Serialize;

pub const EXIT_PREPARE_FAILED: i32 = 1;
pub const EXIT_INSTALL_FAILED: i32 = 2;
pub const EXIT_NOTEBOOK_FAILED: i32 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub skips: usize,
    pub fails: usize,
    /// Identical before any normalization.
    pub same: usize,
    /// Identical after the normalization chain.
    pub same_norm: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Skip,
    Fail,
    Pass,
}

/// A skipped notebook never reaches comparison, so it is classified before
/// the missing `finished` flag could count it as a failure.
pub fn verdict(report: &NotebookReport, skip_comparison: bool) -> Verdict {
    let execution = &report.execution;
    if matches!(execution.status, ExecutionStatus::Skipped | ExecutionStatus::NotRun) {
        return Verdict::Skip;
    }
    let has_error = execution.status == ExecutionStatus::Error
        || execution.has(ExecutionFlag::Timeout)
        || execution.has(ExecutionFlag::Exception)
        || (!skip_comparison && !report.diff.has(DiffFlag::Finished));
    if has_error {
        Verdict::Fail
    } else {
        Verdict::Pass
    }
}

impl BatchSummary {
    pub fn from_reports<'a>(
        reports: impl IntoIterator<Item = &'a NotebookReport>,
        skip_comparison: bool,
    ) -> Self {
        let mut summary = BatchSummary::default();
        for report in reports {
            summary.total += 1;
            match verdict(report, skip_comparison) {
                Verdict::Skip => summary.skips += 1,
                Verdict::Fail => summary.fails += 1,
                Verdict::Pass if !skip_comparison => {
                    if report.diff.diff_count == 0 {
                        summary.same += 1;
                    }
                    if report.diff.diffnorm_count == 0 {
                        summary.same_norm += 1;
                    }
                }
                Verdict::Pass => {}
            }
        }
        summary
    }

    pub fn lines(&self, skip_comparison: bool) -> Vec<String> {
        let mut lines = vec![format!(
            "Total: {} notebooks. Skips: {}; Fails: {}",
            self.total, self.skips, self.fails
        )];
        if !skip_comparison {
            lines.push(format!("Same results before normalizations: {} notebooks", self.same));
            lines.push(format!("Same results after normalization: {} notebooks", self.same_norm));
        }
        lines
    }
}

/// Process exit status for a finished batch.
pub fn exit_code(outcome: &BatchOutcome, skip_comparison: bool) -> i32 {
    match outcome {
        BatchOutcome::PrepareFailed { .. } => EXIT_PREPARE_FAILED,
        BatchOutcome::InstallFailed { .. } => EXIT_INSTALL_FAILED,
        BatchOutcome::NoNotebooks | BatchOutcome::DryRun => 0,
        BatchOutcome::Notebooks(results) => {
            let summary = BatchSummary::from_reports(results.iter().map(|(_, r)| r), skip_comparison);
            if summary.fails > 0 {
                EXIT_NOTEBOOK_FAILED
            } else {
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(diff_count: usize, diffnorm_count: usize) -> NotebookReport {
        let mut report = NotebookReport::default();
        report.execution.status = ExecutionStatus::Run;
        report.diff.mark(DiffFlag::Finished);
        report.diff.diff_count = diff_count;
        report.diff.diffnorm_count = diffnorm_count;
        report
    }

    #[test]
    fn counts_fails_skips_and_matches() {
        let mut skipped = NotebookReport::default();
        skipped.execution.status = ExecutionStatus::Skipped;
        let mut timed_out = finished(0, 0);
        timed_out.execution.mark(ExecutionFlag::Timeout);
        let crashed = NotebookReport::synthesized_failure("<Failed to run notebook>", String::new());

        let reports = vec![
            finished(0, 0),
            finished(2, 0),
            finished(3, 1),
            skipped,
            timed_out,
            crashed,
        ];
        let summary = BatchSummary::from_reports(&reports, false);
        assert_eq!(
            summary,
            BatchSummary {
                total: 6,
                skips: 1,
                fails: 2,
                same: 1,
                same_norm: 2,
            }
        );
        assert_eq!(
            summary.lines(false)[0],
            "Total: 6 notebooks. Skips: 1; Fails: 2"
        );
    }

    #[test]
    fn unfinished_comparison_only_fails_when_compared() {
        let mut report = NotebookReport::default();
        report.execution.status = ExecutionStatus::Run;
        assert_eq!(verdict(&report, false), Verdict::Fail);
        assert_eq!(verdict(&report, true), Verdict::Pass);
        let summary = BatchSummary::from_reports([&report], true);
        assert_eq!(summary.same, 0);
        assert_eq!(summary.lines(true).len(), 1);
    }

    #[test]
    fn exit_codes_follow_the_failing_phase() {
        let prepare = BatchOutcome::PrepareFailed {
            reason: "r".into(),
            msg: "m".into(),
        };
        let install = BatchOutcome::InstallFailed {
            reason: "r".into(),
            msg: "m".into(),
        };
        assert_eq!(exit_code(&prepare, false), 1);
        assert_eq!(exit_code(&install, false), 2);
        assert_eq!(exit_code(&BatchOutcome::NoNotebooks, false), 0);
        let passing = BatchOutcome::Notebooks(vec![("a.ipynb".into(), finished(1, 0))]);
        assert_eq!(exit_code(&passing, false), 0);
        let failing = BatchOutcome::Notebooks(vec![
            ("a.ipynb".into(), finished(0, 0)),
            ("b.ipynb".into(), NotebookReport::synthesized_failure("x", String::new())),
        ]);
        assert_eq!(exit_code(&failing, false), 3);
    }
}
