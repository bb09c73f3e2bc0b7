//! Token-level similarity between two output lists.

use serde_json::Value;
use similar::{capture_diff_slices_deadline, Algorithm, DiffOp};
use std::time::{Duration, Instant};

pub const DEFAULT_SIMILARITY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Similarity {
    Ratio(f64),
    TimedOut,
}

impl Similarity {
    pub fn ratio(self) -> f64 {
        match self {
            Similarity::Ratio(ratio) => ratio,
            Similarity::TimedOut => 0.0,
        }
    }

    pub fn timed_out(self) -> bool {
        matches!(self, Similarity::TimedOut)
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Flattens nested values into a comma-joined sequence with sorted object
/// keys, bracketing arrays and objects.
pub fn flatten(outputs: &[Value]) -> String {
    fn walk(value: &Value, parts: &mut Vec<String>) {
        match value {
            Value::Array(items) => {
                parts.push("[".into());
                for item in items {
                    walk(item, parts);
                }
                parts.push("]".into());
            }
            Value::Object(map) => {
                parts.push("{".into());
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                for key in keys {
                    parts.push(key.clone());
                    walk(&map[key], parts);
                }
                parts.push("}".into());
            }
            scalar => parts.push(scalar_text(scalar)),
        }
    }

    let mut parts = Vec::new();
    parts.push("[".to_string());
    for output in outputs {
        walk(output, &mut parts);
    }
    parts.push("]".to_string());
    parts.join(",")
}

/// Alphanumeric runs, plus every other character as its own token.
pub fn tokenize(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut run_start: Option<usize> = None;
    for (offset, ch) in text.char_indices() {
        if ch.is_ascii_alphanumeric() {
            run_start.get_or_insert(offset);
            continue;
        }
        if let Some(start) = run_start.take() {
            tokens.push(&text[start..offset]);
        }
        tokens.push(&text[offset..offset + ch.len_utf8()]);
    }
    if let Some(start) = run_start {
        tokens.push(&text[start..]);
    }
    tokens
}

/// `matches / (len_old + len_new - matches)` over two token sequences; 1.0
/// when both are empty. Gives up at `deadline`.
pub fn token_similarity(old: &[&str], new: &[&str], deadline: Instant) -> Similarity {
    let total = old.len() + new.len();
    if total == 0 {
        return Similarity::Ratio(1.0);
    }
    let ops = capture_diff_slices_deadline(Algorithm::Myers, old, new, Some(deadline));
    if Instant::now() >= deadline {
        return Similarity::TimedOut;
    }
    let matches: usize = ops
        .iter()
        .map(|op| match op {
            DiffOp::Equal { len, .. } => *len,
            _ => 0,
        })
        .sum();
    Similarity::Ratio(matches as f64 / (total - matches) as f64)
}

/// Similarity of the flattened, tokenized outputs. The cell is reported as
/// timed out once `timeout` has passed.
pub fn similarity(old: &[Value], new: &[Value], timeout: Duration) -> Similarity {
    let deadline = Instant::now() + timeout;
    let old_text = flatten(old);
    let new_text = flatten(new);
    token_similarity(&tokenize(&old_text), &tokenize(&new_text), deadline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flatten_sorts_keys_and_brackets_containers() {
        let flat = flatten(&[json!({"b": 1, "a": ["x", null]})]);
        assert_eq!(flat, "[,{,a,[,x,null,],b,1,},]");
    }

    #[test]
    fn tokenize_splits_alnum_runs_from_punctuation() {
        assert_eq!(tokenize("ab12, c!"), vec!["ab12", ",", " ", "c", "!"]);
        assert!(tokenize("").is_empty());
    }

    #[test]
    fn identical_outputs_are_fully_similar() {
        let outputs = vec![json!({"output_type": "stream", "name": "stdout", "text": "hello 42"})];
        let sim = similarity(&outputs, &outputs, DEFAULT_SIMILARITY_TIMEOUT);
        assert_eq!(sim, Similarity::Ratio(1.0));
    }

    #[test]
    fn partial_overlap_is_between_zero_and_one() {
        let old = vec![json!({"text": "alpha beta gamma"})];
        let new = vec![json!({"text": "alpha beta delta"})];
        let ratio = similarity(&old, &new, DEFAULT_SIMILARITY_TIMEOUT).ratio();
        assert!(ratio > 0.5 && ratio < 1.0, "ratio {}", ratio);
    }

    #[test]
    fn token_ratio_bounds() {
        let deadline = Instant::now() + DEFAULT_SIMILARITY_TIMEOUT;
        assert_eq!(token_similarity(&[], &[], deadline), Similarity::Ratio(1.0));
        assert_eq!(
            token_similarity(&["a", "b", "c"], &["x", "y"], deadline),
            Similarity::Ratio(0.0)
        );
        assert_eq!(
            token_similarity(&["a", "b"], &["a", "b"], deadline),
            Similarity::Ratio(1.0)
        );
        // one shared token out of 2 + 2: 1 / 3
        let Similarity::Ratio(ratio) = token_similarity(&["a", "b"], &["a", "c"], deadline) else {
            panic!("no deadline pressure here");
        };
        assert!((ratio - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn zero_budget_reports_timeout() {
        let old = vec![json!({"text": "a b c"})];
        let new = vec![json!({"text": "d e f"})];
        let sim = similarity(&old, &new, Duration::ZERO);
        assert!(sim.timed_out());
        assert_eq!(sim.ratio(), 0.0);
    }
}
