//! Cell-by-cell comparison of recorded outputs against fresh ones.
//!
//! Stages run as a chain: each one transforms the previous stage's outputs.
//! The head of the chain and every stage that actually changed something get
//! their own verdict; a stage that changed nothing inherits its parent's.

pub mod normalizers;
pub mod similarity;

use crate::error::Result;
use crate::fsutil::{atomic_write_bytes, ensure_dir};
use crate::notebook::Cell;
use crate::results::{CellSimilarity, DiffReason, NormalizerRecord};
use normalizers::{Outputs, StageRegistry};
use serde_json::Value;
use similarity::{similarity, DEFAULT_SIMILARITY_TIMEOUT};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub use normalizers::{DEFAULT_NORMALIZATION, DEFAULT_SIMILARITY};

/// One evaluated link of the chain.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub name: String,
    pub independent: bool,
    pub old: Outputs,
    pub new: Outputs,
    pub record: NormalizerRecord,
}

#[derive(Debug, Clone)]
pub struct CellComparison {
    pub index: usize,
    /// Verdict of the chain head on the raw outputs.
    pub original_equal: bool,
    /// Whether any stage of the chain judged the outputs equal.
    pub any_equal: bool,
    pub stages: Vec<StageOutcome>,
}

impl CellComparison {
    pub fn records(&self) -> BTreeMap<String, NormalizerRecord> {
        self.stages
            .iter()
            .map(|stage| (stage.name.clone(), stage.record.clone()))
            .collect()
    }

    pub fn similarity_entry(&self) -> CellSimilarity {
        CellSimilarity {
            index: self.index,
            stages: self.records(),
        }
    }

    /// Human-readable chain summary; dependents are indented under the stage
    /// whose verdict they share.
    pub fn summary_lines(&self) -> Vec<String> {
        self.stages
            .iter()
            .enumerate()
            .map(|(position, stage)| {
                let verdict = match (stage.record.equals, stage.record.reason) {
                    (Some(true), _) => "ok".to_string(),
                    (_, Some(reason)) => reason.as_str().to_string(),
                    _ => "?".to_string(),
                };
                let marker = if position == 0 || stage.independent {
                    ""
                } else {
                    "* "
                };
                format!("{}{} {}", marker, stage.name, verdict)
            })
            .collect()
    }
}

/// First difference between two output lists, if any.
pub fn verdict(old: &[Value], new: &[Value]) -> Option<DiffReason> {
    if old.len() != new.len() {
        return Some(DiffReason::Length);
    }
    let keys_differ = old.iter().zip(new).any(|(a, b)| match (a, b) {
        (Value::Object(a), Value::Object(b)) => {
            a.keys().collect::<BTreeSet<_>>() != b.keys().collect::<BTreeSet<_>>()
        }
        _ => false,
    });
    if keys_differ {
        return Some(DiffReason::Keys);
    }
    if old.iter().zip(new).any(|(a, b)| a != b) {
        return Some(DiffReason::ValueMismatch);
    }
    None
}

#[derive(Clone)]
pub struct ComparisonEngine {
    registry: StageRegistry,
    similarity_timeout: Duration,
}

impl Default for ComparisonEngine {
    fn default() -> Self {
        ComparisonEngine::new(StageRegistry::builtin())
    }
}

impl ComparisonEngine {
    pub fn new(registry: StageRegistry) -> Self {
        ComparisonEngine {
            registry,
            similarity_timeout: DEFAULT_SIMILARITY_TIMEOUT,
        }
    }

    pub fn with_similarity_timeout(mut self, timeout: Duration) -> Self {
        self.similarity_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    pub fn compare_cell(
        &self,
        index: usize,
        old_cell: &Cell,
        new_cell: &Cell,
        normalizations: &[String],
        similarity_stages: &[String],
    ) -> CellComparison {
        let mut stages: Vec<StageOutcome> = Vec::with_capacity(normalizations.len());
        for name in normalizations {
            let Some(mut stage) = self.registry.create(name) else {
                warn!(normalizer = %name, "unknown normalizer skipped");
                continue;
            };
            let (old, new) = match stages.last() {
                Some(prev) => stage.load(&prev.old, &prev.new),
                None => stage.load(old_cell.outputs(), new_cell.outputs()),
            };
            stages.push(StageOutcome {
                name: name.clone(),
                independent: stage.independent(),
                old,
                new,
                record: NormalizerRecord {
                    old_changes: stage.old_changes(),
                    new_changes: stage.new_changes(),
                    distinct: stage.distinct(),
                    ..Default::default()
                },
            });
        }

        let mut any_equal = false;
        for position in 0..stages.len() {
            if position != 0 && !stages[position].independent {
                continue;
            }
            let reason = verdict(&stages[position].old, &stages[position].new);
            if reason.is_none() {
                any_equal = true;
            }
            propagate(&mut stages, position, reason);
        }
        let original_equal = stages
            .first()
            .map(|head| head.record.equals == Some(true))
            .unwrap_or(true);
        if stages.is_empty() {
            any_equal = true;
        }

        for stage in stages.iter_mut() {
            if !similarity_stages.iter().any(|name| *name == stage.name) {
                continue;
            }
            let sim = similarity(&stage.old, &stage.new, self.similarity_timeout);
            stage.record.similar = Some(sim.ratio());
            stage.record.timeout = Some(sim.timed_out());
            if sim.timed_out() {
                warn!(cell = index, stage = %stage.name, "similarity timed out");
            }
        }

        debug!(cell = index, original_equal, any_equal, "cell compared");
        CellComparison {
            index,
            original_equal,
            any_equal,
            stages,
        }
    }
}

/// Writes the verdict and pushes it through the dependent stages that follow.
fn propagate(stages: &mut [StageOutcome], from: usize, reason: Option<DiffReason>) {
    for (offset, stage) in stages[from..].iter_mut().enumerate() {
        if offset != 0 && stage.independent {
            break;
        }
        stage.record.equals = Some(reason.is_none());
        stage.record.reason = reason;
    }
}

/// Dumps a mismatching cell: `out.<index>.json` with the per-stage records
/// and one text file per side for every stage that found a difference.
pub fn write_mismatch_report(dir: &Path, comparison: &CellComparison) -> Result<Vec<PathBuf>> {
    ensure_dir(dir)?;
    let index = comparison.index;
    let mut written = Vec::new();
    let records_path = dir.join(format!("out.{}.json", index));
    atomic_write_bytes(
        &records_path,
        &serde_json::to_vec_pretty(&comparison.records())?,
    )?;
    written.push(records_path);
    for stage in &comparison.stages {
        let Some(reason) = stage.record.reason else {
            continue;
        };
        for (side, outputs) in [("old", &stage.old), ("new", &stage.new)] {
            let path = dir.join(format!(
                "out.{}.{}.{}.{}.txt",
                index,
                side,
                stage.name,
                reason.as_str()
            ));
            atomic_write_bytes(&path, &serde_json::to_vec_pretty(outputs)?)?;
            written.push(path);
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutil::scratch_dir;
    use serde_json::json;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn default_chain() -> Vec<String> {
        names(DEFAULT_NORMALIZATION)
    }

    fn stdout(text: &str) -> Value {
        json!({"output_type": "stream", "name": "stdout", "text": text})
    }

    fn loaded_cell(outputs: Value) -> Cell {
        serde_json::from_value(json!({
            "cell_type": "code", "execution_count": 1, "metadata": {}, "source": "x",
            "outputs": outputs
        }))
        .expect("cell")
    }

    #[test]
    fn identical_cells_are_equal_everywhere() {
        let cell = loaded_cell(json!([{"output_type": "stream", "name": "stdout", "text": ["4", "2"]}]));
        let engine = ComparisonEngine::default();
        let result = engine.compare_cell(0, &cell, &cell, &default_chain(), &names(DEFAULT_SIMILARITY));
        assert!(result.original_equal);
        assert!(result.any_equal);
        for stage in &result.stages {
            assert_eq!(stage.record.equals, Some(true), "{}", stage.name);
            assert_eq!(stage.record.old_changes, 0, "{}", stage.name);
            assert_eq!(stage.record.new_changes, 0, "{}", stage.name);
        }
        let records = result.records();
        assert_eq!(records["execution_count"].similar, Some(1.0));
        assert_eq!(records["image"].timeout, Some(false));
    }

    #[test]
    fn saved_line_lists_match_fresh_text() {
        let saved = loaded_cell(json!([{"output_type": "stream", "name": "stdout", "text": ["a\n", "b\n"]}]));
        let fresh = Cell::code("x", Some(1), vec![stdout("a\nb\n")]);
        let engine = ComparisonEngine::default();
        let result = engine.compare_cell(0, &saved, &fresh, &default_chain(), &[]);
        assert!(result.original_equal);
        let records = result.records();
        assert_eq!(records["original"].reason, None);
        assert_eq!(records["encode"].old_changes, 0);
    }

    #[test]
    fn second_pass_through_default_chain_changes_nothing() {
        let outputs = vec![
            json!({"output_type": "stream", "name": "stdout", "text": ["x =  {'b': 3.14159, ", "'a': 1}\n"]}),
            json!({"output_type": "stream", "name": "stdout", "text": "at 0x7f3a2b1C started 12:00:01 on 2021-03-04\n"}),
            json!({"output_type": "stream", "name": "stderr", "text": "DeprecationWarning: old"}),
            json!({"output_type": "execute_result", "execution_count": 3, "metadata": {},
                "data": {"text/plain": "<Figure size 640x480 with 1 Axes>", "image/png": "iVBOR"}}),
            json!({"output_type": "error", "ename": "ValueError", "evalue": "bad",
                "traceback": ["File /usr/lib/python3/x.py:9, in f"]}),
        ];
        let cell = Cell::code("x", Some(1), outputs);
        let engine = ComparisonEngine::default();
        let first = engine.compare_cell(0, &cell, &cell, &default_chain(), &[]);
        let changed: Vec<&str> = first
            .stages
            .iter()
            .filter(|stage| stage.record.old_changes != 0)
            .map(|stage| stage.name.as_str())
            .collect();
        for name in ["encode", "execution_count", "stream", "setdict", "exception_path", "deprecated", "image"] {
            assert!(changed.contains(&name), "{} changed nothing on the first pass", name);
        }

        let normalized = first.stages.last().map(|stage| stage.old.clone()).expect("chain");
        let cell = Cell::code("x", Some(1), normalized);
        let second = engine.compare_cell(0, &cell, &cell, &default_chain(), &[]);
        assert_eq!(second.stages.len(), DEFAULT_NORMALIZATION.len());
        for stage in &second.stages {
            assert_eq!(stage.record.old_changes, 0, "{}", stage.name);
            assert_eq!(stage.record.new_changes, 0, "{}", stage.name);
            assert!(!stage.independent || stage.name == "original", "{}", stage.name);
        }
    }

    #[test]
    fn timestamp_difference_is_equal_after_time_stage() {
        let old = Cell::code("now()", Some(1), vec![stdout("started 12:00:01\n")]);
        let new = Cell::code("now()", Some(1), vec![stdout("started 13:45:09\n")]);
        let engine = ComparisonEngine::default();
        let result = engine.compare_cell(3, &old, &new, &default_chain(), &[]);
        assert!(!result.original_equal);
        assert!(result.any_equal);
        let records = result.records();
        assert_eq!(records["original"].reason, Some(DiffReason::ValueMismatch));
        assert_eq!(records["time"].equals, Some(true));
        assert_eq!(records["time"].old_changes, 1);
        assert_eq!(records["memory"].equals, Some(true), "dependent inherits time's verdict");
        assert_eq!(records["memory"].reason, None);
    }

    #[test]
    fn dependent_stage_inherits_mismatch() {
        let old = Cell::code("x", Some(1), vec![stdout("a\n")]);
        let new = Cell::code("x", Some(1), vec![stdout("b\n")]);
        let engine = ComparisonEngine::default();
        let result = engine.compare_cell(0, &old, &new, &names(&["original", "decimal"]), &[]);
        assert!(!result.stages[1].independent);
        assert_eq!(result.stages[1].record.equals, Some(false));
        assert_eq!(result.stages[1].record.reason, Some(DiffReason::ValueMismatch));
        assert!(!result.any_equal);
    }

    #[test]
    fn head_is_always_evaluated_even_without_changes() {
        let old = Cell::code("x", Some(1), vec![stdout("a"), stdout("b")]);
        let new = Cell::code("x", Some(1), vec![stdout("a")]);
        let engine = ComparisonEngine::default();
        let result = engine.compare_cell(0, &old, &new, &names(&["encode", "stream"]), &[]);
        assert_eq!(result.stages[0].record.reason, Some(DiffReason::Length));
        assert!(!result.original_equal);
        assert_eq!(result.stages[1].record.equals, Some(false), "stream merged one side only");
    }

    #[test]
    fn key_mismatch_precedes_value_mismatch() {
        let old = vec![json!({"output_type": "stream", "name": "stdout", "text": "a"})];
        let new = vec![json!({"output_type": "stream", "name": "stdout"})];
        assert_eq!(verdict(&old, &new), Some(DiffReason::Keys));
        assert_eq!(verdict(&old, &old), None);
        assert_eq!(verdict(&old, &[]), Some(DiffReason::Length));
    }

    #[test]
    fn unknown_normalizers_are_skipped() {
        let cell = Cell::code("x", Some(1), vec![]);
        let engine = ComparisonEngine::default();
        let result = engine.compare_cell(0, &cell, &cell, &names(&["original", "bogus", "image"]), &[]);
        let stage_names: Vec<&str> = result.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(stage_names, vec!["original", "image"]);
    }

    #[test]
    fn execution_count_stage_reports_distinct() {
        let old = Cell::code("1", Some(1), vec![json!({"output_type": "execute_result", "execution_count": 4, "data": {"text/plain": "1"}, "metadata": {}})]);
        let new = Cell::code("1", Some(1), vec![json!({"output_type": "execute_result", "execution_count": 1, "data": {"text/plain": "1"}, "metadata": {}})]);
        let engine = ComparisonEngine::default();
        let result = engine.compare_cell(0, &old, &new, &default_chain(), &[]);
        let records = result.records();
        assert_eq!(records["execution_count"].distinct, Some(1));
        assert_eq!(records["execution_count"].equals, Some(true));
        assert!(!result.original_equal);
        assert!(result.any_equal);
    }

    #[test]
    fn mismatch_report_writes_one_file_per_side_and_stage() {
        let old = Cell::code("x", Some(1), vec![stdout("a")]);
        let new = Cell::code("x", Some(1), vec![stdout("b")]);
        let engine = ComparisonEngine::default();
        let result = engine.compare_cell(7, &old, &new, &names(&["original", "whitespace"]), &[]);
        let dir = scratch_dir("mismatch_report");
        let written = write_mismatch_report(&dir, &result).expect("report");
        let files: Vec<String> = written
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        assert!(files.contains(&"out.7.json".to_string()));
        assert!(files.contains(&"out.7.old.original.value-mismatch.txt".to_string()));
        assert!(files.contains(&"out.7.new.whitespace.value-mismatch.txt".to_string()));
        assert_eq!(files.len(), 5);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn summary_marks_dependents() {
        let old = Cell::code("x", Some(1), vec![stdout("a")]);
        let new = Cell::code("x", Some(1), vec![stdout("b")]);
        let engine = ComparisonEngine::default();
        let result = engine.compare_cell(0, &old, &new, &names(&["original", "memory"]), &[]);
        assert_eq!(
            result.summary_lines(),
            vec!["original value-mismatch".to_string(), "* memory value-mismatch".to_string()]
        );
    }
}
