#[derive(Debug, Clone, Copy)]
enum Frame {
    Object { expect_key: bool },
    Array,
}

impl Frame {
    fn closer(self) -> char {
        match self {
            Self::Object { .. } => '}',
            Self::Array => ']',
        }
    }
}

/// Best-effort rewrite of almost-JSON into JSON.
///
/// Handles what language models commonly emit: trailing commas, unquoted
/// keys and bare-word values, single-quoted strings, unescaped quotes inside
/// strings, Python literals and output cut off before the closing brackets.
/// Text before the first `{`/`[` and after the root value closes is dropped.
/// The result is not guaranteed to parse.
pub fn repair_json(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len() + 8);
    let mut stack: Vec<Frame> = Vec::new();
    let mut started = false;
    let mut pending_key = false;
    let mut idx = 0;

    while idx < chars.len() {
        let ch = chars[idx];
        if stack.is_empty() {
            if started {
                break;
            }
            if ch == '{' || ch == '[' {
                started = true;
            } else {
                idx += 1;
                continue;
            }
        }

        match ch {
            '{' => {
                out.push('{');
                stack.push(Frame::Object { expect_key: true });
                idx += 1;
            }
            '[' => {
                out.push('[');
                stack.push(Frame::Array);
                idx += 1;
            }
            '}' | ']' => {
                if stack.iter().any(|frame| frame.closer() == ch) {
                    while let Some(frame) = stack.pop() {
                        close_frame(&mut out, frame, &mut pending_key);
                        if frame.closer() == ch {
                            break;
                        }
                    }
                }
                idx += 1;
            }
            ',' => {
                match out.trim_end().chars().last() {
                    Some(',') | Some('{') | Some('[') => {}
                    Some(':') => out.push_str("null,"),
                    _ => {
                        if pending_key {
                            out.push_str(":null");
                            pending_key = false;
                        }
                        out.push(',');
                    }
                }
                if let Some(Frame::Object { expect_key }) = stack.last_mut() {
                    *expect_key = true;
                }
                idx += 1;
            }
            ':' => {
                if let Some(Frame::Object { expect_key }) = stack.last_mut() {
                    *expect_key = false;
                }
                pending_key = false;
                out.push(':');
                idx += 1;
            }
            '"' | '\'' => {
                let is_key = expecting_key(&stack);
                idx = read_string(&chars, idx, &mut out);
                pending_key = is_key;
            }
            ch if ch.is_whitespace() => {
                out.push(ch);
                idx += 1;
            }
            _ => {
                let is_key = expecting_key(&stack);
                let (token, next) = read_bare(&chars, idx, is_key);
                if is_key {
                    push_quoted(&mut out, &token);
                    pending_key = true;
                } else {
                    out.push_str(&bare_value(&token));
                }
                idx = next;
            }
        }
    }

    while let Some(frame) = stack.pop() {
        close_frame(&mut out, frame, &mut pending_key);
    }
    out
}

fn expecting_key(stack: &[Frame]) -> bool {
    matches!(stack.last(), Some(Frame::Object { expect_key: true }))
}

fn close_frame(out: &mut String, frame: Frame, pending_key: &mut bool) {
    if *pending_key {
        out.push_str(":null");
        *pending_key = false;
    }
    let trimmed_len = out.trim_end().len();
    if out[..trimmed_len].ends_with(',') {
        out.truncate(trimmed_len - 1);
    } else if out[..trimmed_len].ends_with(':') {
        out.truncate(trimmed_len);
        out.push_str("null");
    }
    out.push(frame.closer());
}

/// Copies a quoted string starting at `start` into `out` as a JSON string
/// and returns the index after it. A quote only terminates the string when
/// the next non-space character is structural or the input ends.
fn read_string(chars: &[char], start: usize, out: &mut String) -> usize {
    let quote = chars[start];
    let mut idx = start + 1;
    out.push('"');
    while idx < chars.len() {
        let ch = chars[idx];
        if ch == '\\' {
            match chars.get(idx + 1) {
                Some(next) if "\"\\/bfnrtu".contains(*next) => {
                    out.push('\\');
                    out.push(*next);
                }
                Some('\'') => out.push('\''),
                Some(next) => {
                    out.push_str("\\\\");
                    out.push(*next);
                }
                None => {}
            }
            idx += 2;
            continue;
        }
        if ch == quote {
            let next = chars[idx + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, None | Some(',') | Some('}') | Some(']') | Some(':')) {
                out.push('"');
                return idx + 1;
            }
        }
        match ch {
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
        idx += 1;
    }
    out.push('"');
    idx
}

fn read_bare(chars: &[char], start: usize, is_key: bool) -> (String, usize) {
    let mut idx = start;
    while idx < chars.len() {
        let ch = chars[idx];
        let stop = matches!(ch, ',' | '}' | ']' | '{' | '[' | '"') || (is_key && ch == ':');
        if stop {
            break;
        }
        idx += 1;
    }
    let token: String = chars[start..idx].iter().collect();
    (token.trim().to_string(), idx)
}

fn bare_value(token: &str) -> String {
    match token {
        "true" | "false" | "null" => token.to_string(),
        "True" => "true".to_string(),
        "False" => "false".to_string(),
        "None" | "undefined" => "null".to_string(),
        _ => {
            let is_number = serde_json::from_str::<serde_json::Value>(token)
                .map(|value| value.is_number())
                .unwrap_or(false);
            if is_number {
                token.to_string()
            } else {
                let mut quoted = String::new();
                push_quoted(&mut quoted, token);
                quoted
            }
        }
    }
}

fn push_quoted(out: &mut String, text: &str) {
    out.push_str(&serde_json::Value::String(text.to_string()).to_string());
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::repair_json;

    fn parse(raw: &str) -> Value {
        serde_json::from_str(&repair_json(raw)).unwrap_or(Value::Null)
    }

    #[test]
    fn removes_trailing_commas() {
        assert_eq!(parse(r#"{"a": [1, 2,], "b": 3,}"#), json!({"a": [1, 2], "b": 3}));
    }

    #[test]
    fn escapes_inner_quotes() {
        assert_eq!(
            parse(r#"{"Title": "A "Test"", "Keywords": ["a","b",],}"#),
            json!({"Title": "A \"Test\"", "Keywords": ["a", "b"]})
        );
    }

    #[test]
    fn quotes_bare_keys_and_values() {
        assert_eq!(
            parse("{Title: 'Sunset', Keywords: [beach, sea,], Subject: nature"),
            json!({"Title": "Sunset", "Keywords": ["beach", "sea"], "Subject": "nature"})
        );
    }

    #[test]
    fn maps_python_literals_and_numbers() {
        assert_eq!(
            parse("{'ok': True, 'none': None, 'n': 4.5, 'no': False}"),
            json!({"ok": true, "none": null, "n": 4.5, "no": false})
        );
    }

    #[test]
    fn closes_truncated_structures() {
        assert_eq!(parse(r#"{"a": {"b": [1, 2"#), json!({"a": {"b": [1, 2]}}));
        assert_eq!(parse(r#"{"a": "#), json!({"a": null}));
        assert_eq!(parse(r#"{"a""#), json!({"a": null}));
    }

    #[test]
    fn drops_prose_around_the_root() {
        assert_eq!(
            parse(r#"Here you go: {"a": 1} and more {"b": 2}"#),
            json!({"a": 1})
        );
    }

    #[test]
    fn mismatched_closer_closes_inner_frames() {
        assert_eq!(parse(r#"{"a": [1, 2}"#), json!({"a": [1, 2]}));
    }

    #[test]
    fn apostrophes_inside_single_quoted_strings_survive() {
        assert_eq!(parse("{'t': 'it's fine'}"), json!({"t": "it's fine"}));
    }

    #[test]
    fn text_without_brackets_yields_nothing() {
        assert_eq!(repair_json("no json here"), "");
    }
}
