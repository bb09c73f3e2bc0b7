//! Which cells a re-execution visits, and in what order.

use crate::notebook::{Cell, Notebook};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

pub const SKIP_NO_NUMBERED_CELLS: &str = "No numbered cells";
pub const SKIP_REPEATED_NUMBERS: &str = "Repeated cell numbers";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OrderSelection {
    pub indices: Vec<usize>,
    pub skip_reason: Option<&'static str>,
}

impl OrderSelection {
    fn run(indices: Vec<usize>) -> Self {
        OrderSelection {
            indices,
            skip_reason: None,
        }
    }

    fn skip(reason: &'static str) -> Self {
        OrderSelection {
            indices: Vec::new(),
            skip_reason: Some(reason),
        }
    }
}

pub trait OrderStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn select_order(&self, notebook: &Notebook) -> OrderSelection;
}

/// Every cell, top to bottom, whether or not it was run before.
pub struct AllCells;

impl OrderStrategy for AllCells {
    fn name(&self) -> &'static str {
        "TopDown Order - All cells"
    }

    fn select_order(&self, notebook: &Notebook) -> OrderSelection {
        OrderSelection::run((0..notebook.cells.len()).collect())
    }
}

/// Cells that carry an execution count, top to bottom.
pub struct NumberedTopDown;

impl OrderStrategy for NumberedTopDown {
    fn name(&self) -> &'static str {
        "TopDown Order"
    }

    fn select_order(&self, notebook: &Notebook) -> OrderSelection {
        let indices: Vec<usize> = notebook
            .cells
            .iter()
            .enumerate()
            .filter(|(_, cell)| cell.execution_count().is_some())
            .map(|(index, _)| index)
            .collect();
        if indices.is_empty() {
            return OrderSelection::skip(SKIP_NO_NUMBERED_CELLS);
        }
        OrderSelection::run(indices)
    }
}

/// Cells that carry an execution count, replayed in that count's order.
pub struct ExecutionCountOrder;

impl OrderStrategy for ExecutionCountOrder {
    fn name(&self) -> &'static str {
        "ExecutionCount Order"
    }

    fn select_order(&self, notebook: &Notebook) -> OrderSelection {
        let mut numbered: Vec<(i64, usize)> = notebook
            .cells
            .iter()
            .enumerate()
            .filter_map(|(index, cell)| cell.execution_count().map(|count| (count, index)))
            .collect();
        if numbered.is_empty() {
            return OrderSelection::skip(SKIP_NO_NUMBERED_CELLS);
        }
        let distinct: BTreeSet<i64> = numbered.iter().map(|(count, _)| *count).collect();
        if distinct.len() != numbered.len() {
            return OrderSelection::skip(SKIP_REPEATED_NUMBERS);
        }
        numbered.sort_unstable();
        OrderSelection::run(numbered.into_iter().map(|(_, index)| index).collect())
    }
}

/// CLI-facing selector for the three strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionOrder {
    All,
    ExecutionCount,
    #[default]
    TopDown,
}

impl ExecutionOrder {
    pub fn strategy(self) -> Box<dyn OrderStrategy> {
        match self {
            ExecutionOrder::All => Box::new(AllCells),
            ExecutionOrder::ExecutionCount => Box::new(ExecutionCountOrder),
            ExecutionOrder::TopDown => Box::new(NumberedTopDown),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionOrder::All => "all",
            ExecutionOrder::ExecutionCount => "executioncount",
            ExecutionOrder::TopDown => "topdown",
        }
    }
}

impl fmt::Display for ExecutionOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "a" | "all" | "0" => Ok(ExecutionOrder::All),
            "e" | "ec" | "executioncount" | "1" => Ok(ExecutionOrder::ExecutionCount),
            "t" | "td" | "topdown" | "2" => Ok(ExecutionOrder::TopDown),
            other => Err(format!("unknown execution order: {}", other)),
        }
    }
}

/// Rewrites a cell right before it runs. Only ever applied to the working copy.
pub trait SafetyStrategy: Send + Sync {
    /// Returns true when the cell source was changed.
    fn fix(&self, cell: &mut Cell) -> bool;
}

pub struct NoSafety;

impl SafetyStrategy for NoSafety {
    fn fix(&self, _cell: &mut Cell) -> bool {
        false
    }
}

const DESTRUCTIVE_ESCAPES: &[&str] = &["!kill -9 -1", "!kill -KILL -1"];

/// Drops shell escapes that would take down every process of the user,
/// kernel included.
pub struct KillGuard;

impl SafetyStrategy for KillGuard {
    fn fix(&self, cell: &mut Cell) -> bool {
        if !cell.is_code() {
            return false;
        }
        let source = cell.source_text();
        if !DESTRUCTIVE_ESCAPES.iter().any(|p| source.contains(p)) {
            return false;
        }
        let mut fixed = source;
        for pattern in DESTRUCTIVE_ESCAPES {
            fixed = fixed.replace(pattern, "");
        }
        cell.source = crate::notebook::MultilineString::Single(fixed);
        true
    }
}

pub fn safety_strategy(unsafe_mode: bool) -> Box<dyn SafetyStrategy> {
    if unsafe_mode {
        Box::new(NoSafety)
    } else {
        Box::new(KillGuard)
    }
}
