use serde_json::Value;

use super::fold_smart_quotes;

/// Flattens a caption to one line and cuts it after the last period.
///
/// Anything after the final `.` is treated as a sentence the service was cut
/// off in the middle of. Text without a period is kept whole.
pub fn normalize_caption(raw: &str) -> String {
    let single_line: String = raw.chars().filter(|ch| !matches!(ch, '\n' | '\r')).collect();
    let cleaned = fold_smart_quotes(&single_line).replace("\\\\", "");
    match cleaned.rfind('.') {
        Some(idx) => cleaned[..=idx].to_string(),
        None => cleaned,
    }
}

/// Same as [`normalize_caption`] for arbitrary JSON values; mappings are
/// serialized first.
pub fn normalize_caption_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => normalize_caption(text),
        other => normalize_caption(&serde_json::to_string(other).unwrap_or_default()),
    }
}
