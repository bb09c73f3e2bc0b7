//! nbformat v4 documents.
//!
//! Only the fields the executor and the comparison engine touch are typed;
//! everything else is carried through `extra` so that `save` writes back what
//! `load` read.

use crate::error::{Error, Result};
use crate::fsutil::atomic_write_bytes;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellType {
    Code,
    Markdown,
    Raw,
}

/// nbformat stores text either as one string or as a list of lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MultilineString {
    Single(String),
    Lines(Vec<String>),
}

impl Default for MultilineString {
    fn default() -> Self {
        MultilineString::Single(String::new())
    }
}

impl MultilineString {
    pub fn text(&self) -> String {
        match self {
            MultilineString::Single(s) => s.clone(),
            MultilineString::Lines(lines) => lines.concat(),
        }
    }
}

fn join_lines(value: &mut Value) {
    let Value::Array(lines) = value else {
        return;
    };
    if !lines.iter().all(Value::is_string) {
        return;
    }
    let joined: String = lines.iter().filter_map(Value::as_str).collect();
    *value = Value::String(joined);
}

fn is_json_mime(mime: &str) -> bool {
    mime == "application/json" || mime.ends_with("+json")
}

/// Joins stream `text` and mimebundle payloads stored as line lists, the way
/// nbformat readers do. JSON payloads are data, not text, and stay as they are.
pub fn rejoin_output(mut output: Value) -> Value {
    if let Some(obj) = output.as_object_mut() {
        if let Some(text) = obj.get_mut("text") {
            join_lines(text);
        }
        if let Some(Value::Object(data)) = obj.get_mut("data") {
            for (mime, payload) in data.iter_mut() {
                if !is_json_mime(mime) {
                    join_lines(payload);
                }
            }
        }
    }
    output
}

fn deserialize_outputs<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<Value>>, D::Error>
where
    D: Deserializer<'de>,
{
    let outputs = Option::<Vec<Value>>::deserialize(deserializer)?;
    Ok(outputs.map(|outputs| outputs.into_iter().map(rejoin_output).collect()))
}

/// Distinguishes an absent field from an explicit `null`.
fn deserialize_present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub cell_type: CellType,
    #[serde(default)]
    pub source: MultilineString,
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub execution_count: Option<Value>,
    #[serde(
        default,
        deserialize_with = "deserialize_outputs",
        skip_serializing_if = "Option::is_none"
    )]
    pub outputs: Option<Vec<Value>>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Cell {
    pub fn code(source: &str, execution_count: Option<i64>, outputs: Vec<Value>) -> Self {
        Cell {
            cell_type: CellType::Code,
            source: MultilineString::Single(source.to_string()),
            execution_count: Some(execution_count.map(Value::from).unwrap_or(Value::Null)),
            outputs: Some(outputs),
            metadata: Map::new(),
            extra: Map::new(),
        }
    }

    pub fn markdown(source: &str) -> Self {
        Cell {
            cell_type: CellType::Markdown,
            source: MultilineString::Single(source.to_string()),
            execution_count: None,
            outputs: None,
            metadata: Map::new(),
            extra: Map::new(),
        }
    }

    pub fn is_code(&self) -> bool {
        self.cell_type == CellType::Code
    }

    pub fn source_text(&self) -> String {
        self.source.text()
    }

    /// The recorded execution count, only when it is an integer.
    pub fn execution_count(&self) -> Option<i64> {
        self.execution_count.as_ref().and_then(Value::as_i64)
    }

    pub fn set_execution_count(&mut self, count: Option<i64>) {
        self.execution_count = Some(count.map(Value::from).unwrap_or(Value::Null));
    }

    pub fn outputs(&self) -> &[Value] {
        self.outputs.as_deref().unwrap_or(&[])
    }

    pub fn set_outputs(&mut self, outputs: Vec<Value>) {
        self.outputs = Some(outputs);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Stream,
    Error,
    DisplayData,
    ExecuteResult,
    Other,
}

impl OutputKind {
    pub fn of(output: &Value) -> Self {
        match output.get("output_type").and_then(Value::as_str) {
            Some("stream") => OutputKind::Stream,
            Some("error") => OutputKind::Error,
            Some("display_data") => OutputKind::DisplayData,
            Some("execute_result") => OutputKind::ExecuteResult,
            _ => OutputKind::Other,
        }
    }

    pub fn is_rich(self) -> bool {
        matches!(self, OutputKind::DisplayData | OutputKind::ExecuteResult)
    }
}

fn default_nbformat() -> u32 {
    4
}

fn default_nbformat_minor() -> u32 {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notebook {
    #[serde(default)]
    pub cells: Vec<Cell>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default = "default_nbformat")]
    pub nbformat: u32,
    #[serde(default = "default_nbformat_minor")]
    pub nbformat_minor: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Notebook {
    pub fn new(cells: Vec<Cell>) -> Self {
        Notebook {
            cells,
            metadata: Map::new(),
            nbformat: default_nbformat(),
            nbformat_minor: default_nbformat_minor(),
            extra: Map::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|source| Error::NotebookRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| Error::NotebookParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Serializes with nbformat's one-space indentation.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut bytes = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b" ");
        let mut ser = serde_json::Serializer::with_formatter(&mut bytes, formatter);
        self.serialize(&mut ser)?;
        bytes.push(b'\n');
        atomic_write_bytes(path, &bytes)
    }

    /// `metadata.kernelspec.name`, when declared.
    pub fn declared_kernel(&self) -> Option<&str> {
        self.metadata
            .get("kernelspec")
            .and_then(|k| k.get("name"))
            .and_then(Value::as_str)
    }
}

/// Read-only snapshot of a notebook taken right after loading.
#[derive(Debug, Clone)]
pub struct Baseline(Notebook);

impl Baseline {
    pub fn snapshot(notebook: &Notebook) -> Self {
        Baseline(notebook.clone())
    }

    pub fn cell(&self, index: usize) -> Option<&Cell> {
        self.0.cells.get(index)
    }

    pub fn len(&self) -> usize {
        self.0.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.cells.is_empty()
    }

    pub fn notebook(&self) -> &Notebook {
        &self.0
    }
}
