//! Normalizer stages and the name → constructor registry.
//!
//! A stage sees the previous stage's outputs, never the cell's originals, and
//! counts how many elements it altered on each side.

use crate::notebook::OutputKind;
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::OnceLock;

pub type Outputs = Vec<Value>;

pub const DEFAULT_NORMALIZATION: &[&str] = &[
    "original",
    "encode",
    "execution_count",
    "stream",
    "setdict",
    "dataframe",
    "exception_path",
    "deprecated",
    "whitespace",
    "decimal",
    "date",
    "time",
    "memory",
    "image",
];

pub const DEFAULT_SIMILARITY: &[&str] = &["execution_count", "image"];

pub trait Stage: Send {
    fn name(&self) -> &'static str;

    /// Transforms both sides and resets/records the change counters.
    fn load(&mut self, old: &[Value], new: &[Value]) -> (Outputs, Outputs);

    fn old_changes(&self) -> usize;

    fn new_changes(&self) -> usize;

    fn distinct(&self) -> Option<usize> {
        None
    }

    /// Whether this stage's outputs deserve their own verdict.
    fn independent(&self) -> bool {
        self.old_changes() != 0 || self.new_changes() != 0
    }
}

/// Per-side transformation; wrapped by [`Counted`] to become a [`Stage`].
pub trait Normalize: Send {
    fn normalize(&self, outputs: &[Value], changes: &mut usize) -> Outputs;
}

pub struct Counted<N> {
    name: &'static str,
    inner: N,
    old_changes: usize,
    new_changes: usize,
}

impl<N: Normalize> Counted<N> {
    pub fn new(name: &'static str, inner: N) -> Self {
        Counted {
            name,
            inner,
            old_changes: 0,
            new_changes: 0,
        }
    }
}

impl<N: Normalize> Stage for Counted<N> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn load(&mut self, old: &[Value], new: &[Value]) -> (Outputs, Outputs) {
        self.old_changes = 0;
        self.new_changes = 0;
        let old = self.inner.normalize(old, &mut self.old_changes);
        let new = self.inner.normalize(new, &mut self.new_changes);
        (old, new)
    }

    fn old_changes(&self) -> usize {
        self.old_changes
    }

    fn new_changes(&self) -> usize {
        self.new_changes
    }
}

/// Unmodified outputs. Always evaluated.
pub struct Original;

impl Stage for Original {
    fn name(&self) -> &'static str {
        "original"
    }

    fn load(&mut self, old: &[Value], new: &[Value]) -> (Outputs, Outputs) {
        (old.to_vec(), new.to_vec())
    }

    fn old_changes(&self) -> usize {
        0
    }

    fn new_changes(&self) -> usize {
        0
    }

    fn independent(&self) -> bool {
        true
    }
}

/// Drops `execution_count` from outputs. Independent only when the stripped
/// counts actually differed between the sides.
#[derive(Default)]
pub struct ExecutionCount {
    old_removed: usize,
    new_removed: usize,
    distinct: usize,
}

fn strip_execution_counts(outputs: &[Value]) -> (Outputs, Vec<Value>) {
    let mut counts = Vec::new();
    let stripped = outputs
        .iter()
        .map(|output| {
            let mut output = output.clone();
            if let Some(obj) = output.as_object_mut() {
                if let Some(count) = obj.remove("execution_count") {
                    counts.push(count);
                }
            }
            output
        })
        .collect();
    (stripped, counts)
}

impl Stage for ExecutionCount {
    fn name(&self) -> &'static str {
        "execution_count"
    }

    fn load(&mut self, old: &[Value], new: &[Value]) -> (Outputs, Outputs) {
        let (old, old_counts) = strip_execution_counts(old);
        let (new, new_counts) = strip_execution_counts(new);
        self.old_removed = old_counts.len();
        self.new_removed = new_counts.len();
        self.distinct = old_counts
            .iter()
            .zip(new_counts.iter())
            .filter(|(a, b)| a != b)
            .count()
            + old_counts.len().abs_diff(new_counts.len());
        (old, new)
    }

    fn old_changes(&self) -> usize {
        self.old_removed
    }

    fn new_changes(&self) -> usize {
        self.new_removed
    }

    fn distinct(&self) -> Option<usize> {
        Some(self.distinct)
    }

    fn independent(&self) -> bool {
        self.distinct != 0
    }
}

fn joined_lines(value: &Value) -> Option<String> {
    let lines = value.as_array()?;
    lines
        .iter()
        .map(|line| line.as_str())
        .collect::<Option<Vec<_>>>()
        .map(|parts| parts.concat())
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => joined_lines(other).unwrap_or_default(),
    }
}

/// Joins payloads stored as line lists into single text values.
pub struct Encode;

impl Normalize for Encode {
    fn normalize(&self, outputs: &[Value], changes: &mut usize) -> Outputs {
        let mut outputs = outputs.to_vec();
        for output in outputs.iter_mut() {
            let Some(obj) = output.as_object_mut() else {
                continue;
            };
            if let Some(text) = obj.get_mut("text") {
                if let Some(joined) = joined_lines(text) {
                    *text = Value::String(joined);
                    *changes += 1;
                }
            }
            if let Some(Value::Object(data)) = obj.get_mut("data") {
                for payload in data.values_mut() {
                    if let Some(joined) = joined_lines(payload) {
                        *payload = Value::String(joined);
                        *changes += 1;
                    }
                }
            }
        }
        outputs
    }
}

/// Merges adjacent chunks written to the same stream.
pub struct Stream;

impl Normalize for Stream {
    fn normalize(&self, outputs: &[Value], changes: &mut usize) -> Outputs {
        let mut merged: Outputs = Vec::with_capacity(outputs.len());
        for output in outputs {
            let continues_stream = OutputKind::of(output) == OutputKind::Stream
                && merged.last().is_some_and(|last| {
                    OutputKind::of(last) == OutputKind::Stream && last.get("name") == output.get("name")
                });
            if continues_stream {
                if let Some(Value::Object(last)) = merged.last_mut() {
                    let mut text = last.get("text").map(text_of).unwrap_or_default();
                    text.push_str(&output.get("text").map(text_of).unwrap_or_default());
                    last.insert("text".into(), Value::String(text));
                    *changes += 1;
                }
            } else {
                merged.push(output.clone());
            }
        }
        merged
    }
}

fn rich_data(output: &mut Value) -> Option<&mut Map<String, Value>> {
    if !OutputKind::of(output).is_rich() {
        return None;
    }
    output.get_mut("data").and_then(Value::as_object_mut)
}

/// Drops HTML renderings of dataframes that also have a plain-text form.
pub struct Dataframe;

impl Normalize for Dataframe {
    fn normalize(&self, outputs: &[Value], changes: &mut usize) -> Outputs {
        let mut outputs = outputs.to_vec();
        for output in outputs.iter_mut() {
            let Some(data) = rich_data(output) else {
                continue;
            };
            let is_dataframe = data
                .get("text/html")
                .map(|html| text_of(html).to_lowercase().contains("class=\"dataframe\""))
                .unwrap_or(false);
            if is_dataframe && data.contains_key("text/plain") {
                data.remove("text/html");
                *changes += 1;
            }
        }
        outputs
    }
}

fn mentions_deprecation(value: Option<&Value>) -> bool {
    let text = value.map(text_of).unwrap_or_default().to_lowercase();
    text.contains("deprecat") || text.contains("future")
}

/// Drops deprecation and future warnings.
pub struct Deprecated;

impl Normalize for Deprecated {
    fn normalize(&self, outputs: &[Value], changes: &mut usize) -> Outputs {
        outputs
            .iter()
            .filter(|output| {
                let warning = match OutputKind::of(output) {
                    OutputKind::Error => {
                        mentions_deprecation(output.get("ename"))
                            || mentions_deprecation(output.get("evalue"))
                    }
                    OutputKind::Stream => mentions_deprecation(output.get("text")),
                    _ => false,
                };
                if warning {
                    *changes += 1;
                }
                !warning
            })
            .cloned()
            .collect()
    }
}

const IMAGE_MIMES: &[&str] = &["image/jpeg", "image/png", "image/svg+xml"];

/// Drops image payloads and standardises figure placeholders.
pub struct Image;

impl Normalize for Image {
    fn normalize(&self, outputs: &[Value], changes: &mut usize) -> Outputs {
        let mut outputs = outputs.to_vec();
        for output in outputs.iter_mut() {
            if let Some(data) = rich_data(output) {
                for mime in IMAGE_MIMES {
                    if data.remove(*mime).is_some() {
                        *changes += 1;
                    }
                }
                let inline_svg = data
                    .get("text/html")
                    .map(|html| text_of(html).to_lowercase().contains("<svg"))
                    .unwrap_or(false);
                if inline_svg {
                    data.remove("text/html");
                    *changes += 1;
                }
                if let Some(plain) = data.get_mut("text/plain") {
                    let text = text_of(plain);
                    let placeholder = if text.starts_with("<matplotlib.figure")
                        || text.starts_with("<Figure size")
                    {
                        Some("<Figure>")
                    } else if text.starts_with("<matplotlib.text") || text.starts_with("Text(") {
                        Some("<Text>")
                    } else {
                        None
                    };
                    if let Some(placeholder) = placeholder {
                        *plain = Value::String(placeholder.to_string());
                        *changes += 1;
                    }
                }
            }
            let metadata = output.get_mut("metadata").and_then(Value::as_object_mut);
            if let Some(metadata) = metadata {
                if metadata.remove("needs_background").is_some() {
                    *changes += 1;
                }
            }
        }
        outputs
    }
}

/// Rewrites every string value of the outputs; one change per altered string.
pub trait Rewrite: Send {
    fn rewrite(&self, text: &str) -> String;
}

pub struct Text<R>(pub R);

fn rewrite_strings<R: Rewrite>(rewriter: &R, value: &mut Value, changes: &mut usize) {
    match value {
        Value::String(s) => {
            let rewritten = rewriter.rewrite(s);
            if rewritten != *s {
                *s = rewritten;
                *changes += 1;
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                rewrite_strings(rewriter, item, changes);
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                rewrite_strings(rewriter, item, changes);
            }
        }
        _ => {}
    }
}

impl<R: Rewrite> Normalize for Text<R> {
    fn normalize(&self, outputs: &[Value], changes: &mut usize) -> Outputs {
        let mut outputs = outputs.to_vec();
        for output in outputs.iter_mut() {
            rewrite_strings(&self.0, output, changes);
        }
        outputs
    }
}

macro_rules! cached_regex {
    ($name:ident, $pattern:expr) => {
        fn $name() -> &'static Regex {
            static CELL: OnceLock<Regex> = OnceLock::new();
            CELL.get_or_init(|| Regex::new($pattern).expect("static pattern"))
        }
    };
}

cached_regex!(whitespace_run, r"\s+");
cached_regex!(
    space_around_punct,
    r#"\s*([!$%^\&*()_|\~=`{}\[\]:";'<>?,/@#])\s*"#
);
cached_regex!(long_decimal, r"(\d\.\d\d)\d*");
cached_regex!(
    date_like,
    r"(?P<full>\w{3}, \d\d \w{3} \d{4}|\d{1,4}/\d{1,2}/\d{1,4}T?|\d{1,4}-\d{1,2}-\d{1,4}T?)|\d\d[/\-]\d\d"
);
cached_regex!(
    time_like,
    r"(?P<full>\d\d:\d\d:\d\d(?:\.\d+)?(?:[Zz]|[+\-]\d\d?:\d\d)?)|\d\d:\d\d"
);
cached_regex!(memory_address, r"at 0x[0-9A-Fa-f]*");
cached_regex!(windows_py_path, r"\w:\\.*?\.py:\d*");
cached_regex!(
    unix_py_path,
    r"/(?:bin|cdrom|etc|lib|mnt|prov|run|srv|sys|usr|boot|dev|home|lib64|media|opt|root|sbin|tmp|var|Applications|Library|System|Users)/.*?\.py:\d*"
);

pub struct Whitespace;

impl Rewrite for Whitespace {
    fn rewrite(&self, text: &str) -> String {
        let collapsed = whitespace_run().replace_all(text, " ");
        space_around_punct()
            .replace_all(&collapsed, "$1")
            .into_owned()
    }
}

/// Keeps two fractional digits.
pub struct Decimal;

impl Rewrite for Decimal {
    fn rewrite(&self, text: &str) -> String {
        if !text.contains('.') {
            return text.to_string();
        }
        long_decimal().replace_all(text, "$1").into_owned()
    }
}

pub struct Date;

impl Rewrite for Date {
    fn rewrite(&self, text: &str) -> String {
        date_like()
            .replace_all(text, |caps: &Captures| {
                if caps.name("full").is_some() {
                    "1970-01-01T"
                } else {
                    "01-01"
                }
            })
            .into_owned()
    }
}

pub struct Time;

impl Rewrite for Time {
    fn rewrite(&self, text: &str) -> String {
        if !text.contains(':') {
            return text.to_string();
        }
        time_like()
            .replace_all(text, |caps: &Captures| {
                if caps.name("full").is_some() {
                    "00:00:00"
                } else {
                    "00:00"
                }
            })
            .into_owned()
    }
}

pub struct Memory;

impl Rewrite for Memory {
    fn rewrite(&self, text: &str) -> String {
        if !text.contains("0x") {
            return text.to_string();
        }
        memory_address()
            .replace_all(text, "at 0x00000000")
            .into_owned()
    }
}

/// Redacts interpreter source paths inside tracebacks.
pub struct ExceptionPath;

impl Rewrite for ExceptionPath {
    fn rewrite(&self, text: &str) -> String {
        if !text.contains(".py:") {
            return text.to_string();
        }
        let text = windows_py_path().replace_all(text, "/python/path.py:0");
        unix_py_path()
            .replace_all(&text, "/python/path.py:0")
            .into_owned()
    }
}

/// Sorts the items of `{...}` renderings so set and dict ordering does not matter.
pub struct SetDict;

fn finish_item(frame: &mut [String]) {
    if let Some(item) = frame.last_mut() {
        let trimmed = item.trim();
        if trimmed.len() != item.len() {
            *item = trimmed.to_string();
        }
    }
}

fn close_frame(frames: &mut Vec<Vec<String>>, top: &mut String, end: &str) {
    let Some(mut items) = frames.pop() else {
        return;
    };
    finish_item(&mut items);
    items.sort();
    let rendered = format!("{{{}{}", items.join(","), end);
    match frames.last_mut().and_then(|frame| frame.last_mut()) {
        Some(parent_item) => parent_item.push_str(&rendered),
        None => top.push_str(&rendered),
    }
}

impl Rewrite for SetDict {
    fn rewrite(&self, text: &str) -> String {
        if !(text.contains('{') && text.contains('}')) {
            return text.to_string();
        }
        let mut top = String::with_capacity(text.len());
        let mut frames: Vec<Vec<String>> = Vec::new();
        for letter in text.chars() {
            match letter {
                '{' => frames.push(vec![String::new()]),
                '}' if !frames.is_empty() => close_frame(&mut frames, &mut top, "}"),
                ',' if !frames.is_empty() => {
                    if let Some(frame) = frames.last_mut() {
                        finish_item(frame);
                        frame.push(String::new());
                    }
                }
                _ => match frames.last_mut().and_then(|frame| frame.last_mut()) {
                    Some(item) => item.push(letter),
                    None => top.push(letter),
                },
            }
        }
        while !frames.is_empty() {
            close_frame(&mut frames, &mut top, "");
        }
        top
    }
}

pub type StageConstructor = fn() -> Box<dyn Stage>;

/// Name → stage constructor. New normalizers register here; the chain
/// algorithm only ever sees `dyn Stage`.
#[derive(Clone)]
pub struct StageRegistry {
    constructors: BTreeMap<&'static str, StageConstructor>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl StageRegistry {
    pub fn empty() -> Self {
        StageRegistry {
            constructors: BTreeMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("original", || Box::new(Original));
        registry.register("encode", || Box::new(Counted::new("encode", Encode)));
        registry.register("execution_count", || Box::<ExecutionCount>::default());
        registry.register("stream", || Box::new(Counted::new("stream", Stream)));
        registry.register("setdict", || Box::new(Counted::new("setdict", Text(SetDict))));
        registry.register("dataframe", || Box::new(Counted::new("dataframe", Dataframe)));
        registry.register("exception_path", || {
            Box::new(Counted::new("exception_path", Text(ExceptionPath)))
        });
        registry.register("deprecated", || Box::new(Counted::new("deprecated", Deprecated)));
        registry.register("whitespace", || {
            Box::new(Counted::new("whitespace", Text(Whitespace)))
        });
        registry.register("decimal", || Box::new(Counted::new("decimal", Text(Decimal))));
        registry.register("date", || Box::new(Counted::new("date", Text(Date))));
        registry.register("time", || Box::new(Counted::new("time", Text(Time))));
        registry.register("memory", || Box::new(Counted::new("memory", Text(Memory))));
        registry.register("image", || Box::new(Counted::new("image", Image)));
        registry
    }

    pub fn register(&mut self, name: &'static str, constructor: StageConstructor) {
        self.constructors.insert(name, constructor);
    }

    pub fn create(&self, name: &str) -> Option<Box<dyn Stage>> {
        self.constructors.get(name).map(|constructor| constructor())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.constructors.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run_stage(name: &str, old: Outputs, new: Outputs) -> (Box<dyn Stage>, Outputs, Outputs) {
        let mut stage = StageRegistry::builtin().create(name).expect("registered");
        let (old, new) = stage.load(&old, &new);
        (stage, old, new)
    }

    fn rewrite<R: Rewrite>(r: R, text: &str) -> String {
        r.rewrite(text)
    }

    #[test]
    fn builtin_registry_covers_default_chain() {
        let registry = StageRegistry::builtin();
        for name in DEFAULT_NORMALIZATION {
            assert!(registry.contains(name), "missing {}", name);
            assert_eq!(registry.create(name).expect("stage").name(), *name);
        }
        assert!(registry.create("nonexistent").is_none());
    }

    #[test]
    fn registry_accepts_custom_stage() {
        let mut registry = StageRegistry::empty();
        registry.register("upper", || Box::new(Counted::new("upper", Text(Upper))));
        let mut stage = registry.create("upper").expect("custom");
        let (old, _) = stage.load(&[json!({"text": "abc"})], &[]);
        assert_eq!(old[0]["text"], "ABC");
        assert_eq!(stage.old_changes(), 1);

        struct Upper;
        impl Rewrite for Upper {
            fn rewrite(&self, text: &str) -> String {
                text.to_uppercase()
            }
        }
    }

    #[test]
    fn encode_joins_line_lists() {
        let old = vec![json!({"output_type": "stream", "name": "stdout", "text": ["a\n", "b\n"]})];
        let new = vec![json!({"output_type": "stream", "name": "stdout", "text": "a\nb\n"})];
        let (stage, old, new) = run_stage("encode", old, new);
        assert_eq!(old, new);
        assert_eq!((stage.old_changes(), stage.new_changes()), (1, 0));
        assert!(stage.independent());
    }

    #[test]
    fn execution_count_counts_distinct_values() {
        let old = vec![json!({"output_type": "execute_result", "execution_count": 3, "data": {}})];
        let new = vec![json!({"output_type": "execute_result", "execution_count": 1, "data": {}})];
        let (stage, old, new) = run_stage("execution_count", old, new);
        assert_eq!(old, new);
        assert_eq!(stage.distinct(), Some(1));
        assert!(stage.independent());

        let same = vec![json!({"output_type": "execute_result", "execution_count": 2, "data": {}})];
        let (stage, _, _) = run_stage("execution_count", same.clone(), same);
        assert_eq!(stage.old_changes(), 1);
        assert!(!stage.independent(), "identical counts are not a normalization");
    }

    #[test]
    fn stream_merges_adjacent_chunks_of_same_stream() {
        let outputs = vec![
            json!({"output_type": "stream", "name": "stdout", "text": "a"}),
            json!({"output_type": "stream", "name": "stdout", "text": ["b", "c"]}),
            json!({"output_type": "stream", "name": "stderr", "text": "x"}),
            json!({"output_type": "stream", "name": "stdout", "text": "d"}),
        ];
        let (stage, old, _) = run_stage("stream", outputs, vec![]);
        assert_eq!(old.len(), 3);
        assert_eq!(old[0]["text"], "abc");
        assert_eq!(stage.old_changes(), 1);
    }

    #[test]
    fn dataframe_drops_html_only_with_plain_fallback() {
        let with_plain = json!({"output_type": "execute_result", "data": {
            "text/html": "<table class=\"dataframe\"></table>", "text/plain": "   a\n0  1"}});
        let html_only = json!({"output_type": "display_data", "data": {
            "text/html": "<table class=\"dataframe\"></table>"}});
        let (stage, old, _) = run_stage("dataframe", vec![with_plain, html_only], vec![]);
        assert!(old[0]["data"].get("text/html").is_none());
        assert!(old[1]["data"].get("text/html").is_some());
        assert_eq!(stage.old_changes(), 1);
    }

    #[test]
    fn deprecated_drops_warnings() {
        let outputs = vec![
            json!({"output_type": "stream", "name": "stderr", "text": "FutureWarning: soon"}),
            json!({"output_type": "error", "ename": "DeprecationWarning", "evalue": "x", "traceback": []}),
            json!({"output_type": "stream", "name": "stdout", "text": "42"}),
        ];
        let (stage, old, _) = run_stage("deprecated", outputs, vec![]);
        assert_eq!(old.len(), 1);
        assert_eq!(old[0]["text"], "42");
        assert_eq!(stage.old_changes(), 2);
    }

    #[test]
    fn image_strips_payloads_and_placeholders() {
        let output = json!({
            "output_type": "display_data",
            "data": {"image/png": "iVBOR", "text/plain": "<Figure size 640x480 with 1 Axes>"},
            "metadata": {"needs_background": "light"}
        });
        let (stage, old, _) = run_stage("image", vec![output], vec![]);
        assert_eq!(old[0]["data"], json!({"text/plain": "<Figure>"}));
        assert_eq!(old[0]["metadata"], json!({}));
        assert_eq!(stage.old_changes(), 3);
    }

    #[test]
    fn whitespace_collapses_runs_and_punctuation_spacing() {
        assert_eq!(rewrite(Whitespace, "a   b\t\nc"), "a b c");
        assert_eq!(rewrite(Whitespace, "f ( x , y )"), "f(x,y)");
    }

    #[test]
    fn decimal_truncates_to_two_digits() {
        assert_eq!(rewrite(Decimal, "pi=3.14159, e=2.71"), "pi=3.14, e=2.71");
        assert_eq!(rewrite(Decimal, "no dot 31415"), "no dot 31415");
    }

    #[test]
    fn date_and_time_become_sentinels() {
        assert_eq!(rewrite(Date, "run on 2021-03-04 done"), "run on 1970-01-01T done");
        assert_eq!(rewrite(Date, "Thu, 04 Mar 2021"), "1970-01-01T");
        assert_eq!(rewrite(Date, "week 03/04"), "week 01-01");
        assert_eq!(rewrite(Time, "at 12:34:56.789+01:00"), "at 00:00:00");
        assert_eq!(rewrite(Time, "at 12:34"), "at 00:00");
    }

    #[test]
    fn memory_addresses_are_redacted() {
        assert_eq!(
            rewrite(Memory, "<object at 0x7f3a2b1C>"),
            "<object at 0x00000000>"
        );
    }

    #[test]
    fn exception_paths_are_redacted() {
        assert_eq!(
            rewrite(ExceptionPath, "File /home/u/lib/site.py:12, in f"),
            "File /python/path.py:0, in f"
        );
        assert_eq!(
            rewrite(ExceptionPath, r"File C:\Users\u\mod.py:3"),
            "File /python/path.py:0"
        );
    }

    #[test]
    fn setdict_sorts_nested_items() {
        assert_eq!(rewrite(SetDict, "{'b': 1, 'a': {3, 1}}"), "{'a': {1,3},'b': 1}");
        assert_eq!(rewrite(SetDict, "{3, 2, 1"), "{3, 2, 1", "needs a closing brace somewhere");
        assert_eq!(rewrite(SetDict, "} {b, a"), "} {a,b", "unclosed frame is still sorted");
        assert_eq!(rewrite(SetDict, "} {b,a}"), "} {a,b}");
        assert_eq!(rewrite(SetDict, "no braces"), "no braces");
    }

    #[test]
    fn every_rewrite_is_idempotent() {
        let samples = [
            "  x =  {'b': 3.14159, 'a': 2021-03-04 12:00:01Z}  at 0xDEADbeef ",
            "File /usr/lib/python3/x.py:9 Thu, 04 Mar 2021 01/02",
            "{2, 1, {4, 3}",
            "12345-01-01 99:99:99.5-03:00",
        ];
        let rewriters: Vec<Box<dyn Fn(&str) -> String>> = vec![
            Box::new(|t| Whitespace.rewrite(t)),
            Box::new(|t| Decimal.rewrite(t)),
            Box::new(|t| Date.rewrite(t)),
            Box::new(|t| Time.rewrite(t)),
            Box::new(|t| Memory.rewrite(t)),
            Box::new(|t| ExceptionPath.rewrite(t)),
            Box::new(|t| SetDict.rewrite(t)),
        ];
        for sample in samples {
            for rewriter in &rewriters {
                let once = rewriter(sample);
                assert_eq!(rewriter(&once), once, "not idempotent on {:?}", sample);
            }
        }
    }
}
