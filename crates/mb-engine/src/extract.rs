//! Extraction of a JSON object from model output.
//!
//! Models wrap JSON in prose, code fences, or trailing commentary. The
//! extractor runs an ordered cascade of strategies and stops at the first
//! one that yields a parseable object: direct parse, fenced block, outermost
//! braces, balanced-brace scan.

use serde_json::Value;

use mb_core::VisionAnalysis;

/// Extract and deserialize an analysis object, or `None` when no strategy
/// produces one.
pub fn extract_analysis(text: &str) -> Option<VisionAnalysis> {
    extract_object(text).and_then(|v| serde_json::from_value(v).ok())
}

pub fn extract_object(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    direct(trimmed)
        .or_else(|| fenced(trimmed))
        .or_else(|| outermost_braces(trimmed))
        .or_else(|| balanced_scan(trimmed))
}

fn direct(text: &str) -> Option<Value> {
    serde_json::from_str::<Value>(text)
        .ok()
        .filter(Value::is_object)
}

/// Content of the first ``` fence, with an optional language tag.
fn fenced(text: &str) -> Option<Value> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after[body_start..];
    let end = body.find("```")?;
    direct(body[..end].trim())
}

/// Slice between the first `{` and the last `}`.
fn outermost_braces(text: &str) -> Option<Value> {
    let open = text.find('{')?;
    let close = text.rfind('}')?;
    if close <= open {
        return None;
    }
    direct(&text[open..=close])
}

/// Try every `{` as a candidate start: scan forward to its balanced close
/// (tracking string literals and escapes so braces inside values do not
/// miscount) and return the first region that parses.
fn balanced_scan(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    for begin in (0..bytes.len()).filter(|&i| bytes[i] == b'{') {
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (i, &b) in bytes.iter().enumerate().skip(begin) {
            if in_string {
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    in_string = false;
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        if let Some(value) = direct(&text[begin..=i]) {
                            return Some(value);
                        }
                        break; // unparseable region; try the next start
                    }
                }
                _ => {}
            }
        }
    }
    None
}
