//! Recovery of captions and structured metadata from free-form model output.

mod caption;
mod repair;
mod structured;

pub use caption::{normalize_caption, normalize_caption_value};
pub use repair::repair_json;
pub use structured::{
    extract_candidate, normalize_structured, normalize_structured_value, recover_structured,
    Extraction, Recovered, Recovery, RecoveryStep, StructuredMetadata, KEYWORDS, SUBJECT,
    SUMMARY, TITLE,
};

/// Folds typographic double and single quotes to their ASCII forms.
pub fn fold_smart_quotes(text: &str) -> String {
    text.chars()
        .map(|ch| match ch {
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' | '\u{2033}' => '"',
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' | '\u{2032}' => '\'',
            other => other,
        })
        .collect()
}
