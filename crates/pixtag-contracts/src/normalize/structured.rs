use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{fold_smart_quotes, repair_json};

pub const TITLE: &str = "Title";
pub const KEYWORDS: &str = "Keywords";
pub const SUMMARY: &str = "Summary";
pub const SUBJECT: &str = "Subject";

static FENCED_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)```(?:json)?\s*(.*?)\s*```").expect("fenced block pattern"));

/// Synthesized Title/Keywords/Summary/Subject object.
///
/// Unrecognized keys are carried along untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StructuredMetadata(Map<String, Value>);

impl StructuredMetadata {
    pub fn from_map(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn title(&self) -> Option<String> {
        self.text(TITLE)
    }

    pub fn summary(&self) -> Option<String> {
        self.text(SUMMARY)
    }

    /// Keywords in model order. A comma separated string is split.
    pub fn keywords(&self) -> Vec<String> {
        match self.0.get(KEYWORDS) {
            Some(Value::String(text)) => split_list(text),
            Some(value) => string_list(value),
            None => Vec::new(),
        }
    }

    /// Subjects in model order. A plain string stays a single entry.
    pub fn subject(&self) -> Vec<String> {
        self.0.get(SUBJECT).map(string_list).unwrap_or_default()
    }

    fn text(&self, key: &str) -> Option<String> {
        let text = match self.0.get(key)? {
            Value::String(text) => text.trim().to_string(),
            list @ Value::Array(_) => string_list(list).join(", "),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        (!text.is_empty()).then_some(text)
    }
}

fn string_list(value: &Value) -> Vec<String> {
    let items = match value {
        Value::Array(items) => items.iter().collect::<Vec<&Value>>(),
        other => vec![other],
    };
    items
        .into_iter()
        .filter_map(|item| match item {
            Value::String(text) => Some(text.trim().to_string()),
            Value::Number(number) => Some(number.to_string()),
            Value::Bool(flag) => Some(flag.to_string()),
            _ => None,
        })
        .filter(|text| !text.is_empty())
        .collect()
}

fn split_list(text: &str) -> Vec<String> {
    text.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Result of structured recovery: a mapping, or the text that could not be
/// turned into one.
#[derive(Debug, Clone, PartialEq)]
pub enum Recovered {
    Mapping(Map<String, Value>),
    Unparsed(String),
}

impl Recovered {
    pub fn is_mapping(&self) -> bool {
        matches!(self, Self::Mapping(_))
    }

    /// Unparsed text means "nothing to merge".
    pub fn into_metadata(self) -> StructuredMetadata {
        match self {
            Self::Mapping(fields) => StructuredMetadata::from_map(fields),
            Self::Unparsed(_) => StructuredMetadata::default(),
        }
    }
}

/// Where the candidate text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extraction {
    FencedBlock,
    BraceSpan,
    FencedBraceSpan,
    WholeText,
}

/// Parse attempts, tried in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStep {
    Strict,
    Cleaned,
    Repaired,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Recovery {
    pub result: Recovered,
    pub extraction: Extraction,
    pub step: Option<RecoveryStep>,
    pub misses: Vec<(RecoveryStep, String)>,
}

type Attempt = fn(&str) -> Result<Map<String, Value>, String>;

const ATTEMPTS: [(RecoveryStep, Attempt); 3] = [
    (RecoveryStep::Strict, parse_strict),
    (RecoveryStep::Cleaned, parse_cleaned),
    (RecoveryStep::Repaired, parse_repaired),
];

/// Narrows raw output to the text most likely to hold the object: the body
/// of a fenced block if present, then the span from the first `{` to the
/// last `}` (or to the end when the closing brace is missing).
pub fn extract_candidate(raw: &str) -> (Extraction, &str) {
    let (fenced, text) = match FENCED_BLOCK.captures(raw).and_then(|caps| caps.get(1)) {
        Some(body) => (true, body.as_str()),
        None => (false, raw),
    };
    let trimmed = text.trim();
    if fenced && (trimmed.starts_with('{') || !trimmed.contains('{')) {
        return (Extraction::FencedBlock, trimmed);
    }
    match brace_span(text) {
        Some(span) if fenced => (Extraction::FencedBraceSpan, span),
        Some(span) => (Extraction::BraceSpan, span),
        None => (Extraction::WholeText, raw),
    }
}

fn brace_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    match text.rfind('}') {
        Some(end) if end > start => Some(&text[start..=end]),
        _ => Some(&text[start..]),
    }
}

/// Runs extraction and then each parse attempt until one yields a mapping.
///
/// Output that already is a JSON object is taken as is, so fence markers
/// inside string values never narrow a well-formed object.
pub fn recover_structured(raw: &str) -> Recovery {
    if let Ok(fields) = parse_strict(raw) {
        return Recovery {
            result: Recovered::Mapping(fields),
            extraction: Extraction::WholeText,
            step: Some(RecoveryStep::Strict),
            misses: Vec::new(),
        };
    }
    let (extraction, candidate) = extract_candidate(raw);
    let mut misses = Vec::new();
    for (step, attempt) in ATTEMPTS {
        match attempt(candidate) {
            Ok(fields) => {
                return Recovery {
                    result: Recovered::Mapping(fields),
                    extraction,
                    step: Some(step),
                    misses,
                };
            }
            Err(reason) => misses.push((step, reason)),
        }
    }
    Recovery {
        result: Recovered::Unparsed(clean(candidate)),
        extraction,
        step: None,
        misses,
    }
}

pub fn normalize_structured(raw: &str) -> Recovered {
    recover_structured(raw).result
}

/// Mappings are canonicalized through a serialize/parse round trip; strings
/// go through [`normalize_structured`].
pub fn normalize_structured_value(value: &Value) -> Recovered {
    match value {
        Value::Object(_) => match serde_json::to_string(value)
            .ok()
            .and_then(|text| serde_json::from_str::<Map<String, Value>>(&text).ok())
        {
            Some(fields) => Recovered::Mapping(fields),
            None => Recovered::Unparsed(value.to_string()),
        },
        Value::String(text) => normalize_structured(text),
        Value::Null => Recovered::Unparsed(String::new()),
        other => normalize_structured(&other.to_string()),
    }
}

fn clean(text: &str) -> String {
    fold_smart_quotes(&text.replace(['\n', '\r'], " "))
}

fn parse_object(text: &str) -> Result<Map<String, Value>, String> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(other) => Err(format!("parsed a non-object value ({})", type_name(&other))),
        Err(err) => Err(err.to_string()),
    }
}

fn parse_strict(candidate: &str) -> Result<Map<String, Value>, String> {
    parse_object(candidate.trim())
}

fn parse_cleaned(candidate: &str) -> Result<Map<String, Value>, String> {
    parse_object(clean(candidate).trim())
}

fn parse_repaired(candidate: &str) -> Result<Map<String, Value>, String> {
    parse_object(&repair_json(&clean(candidate)))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
