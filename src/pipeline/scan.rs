//! Escape-aware scanning over a JSON document that may be cut off anywhere.
//!
//! Every function here treats "the buffer ended" as a normal outcome rather
//! than an error. Errors are reserved for bytes that can never become valid
//! JSON at that position.

use std::collections::HashMap;

use crate::error::{PipelineError, PipelineResult};

/// A string value decoded from a possibly truncated buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PartialString {
    pub text: String,
    pub closed: bool,
    /// Just past the closing quote when `closed`, otherwise the first byte
    /// that was not decoded yet.
    pub end: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Element {
    pub start: usize,
    pub end: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ArrayScan {
    pub elements: Vec<Element>,
    pub closed: bool,
}

/// Decodes the string literal whose opening quote is at `quote`.
pub(crate) fn read_string(buf: &str, quote: usize) -> PipelineResult<PartialString> {
    if buf.as_bytes().get(quote) != Some(&b'"') {
        return Err(PipelineError::extraction(format!(
            "expected a string at offset {quote}"
        )));
    }
    decode_from(buf, quote + 1)
}

/// Decodes string content starting at `start` (just inside the quotes).
///
/// Decoding stops before an escape sequence or surrogate pair that is cut
/// off, so the text of a partial read is always a prefix of the final value.
pub(crate) fn decode_from(buf: &str, start: usize) -> PipelineResult<PartialString> {
    let bytes = buf.as_bytes();
    let mut text = String::new();
    let mut i = start;

    while i < bytes.len() {
        let run_end = bytes[i..]
            .iter()
            .position(|b| *b == b'"' || *b == b'\\')
            .map_or(bytes.len(), |offset| i + offset);
        text.push_str(&buf[i..run_end]);
        i = run_end;
        if i >= bytes.len() {
            break;
        }

        if bytes[i] == b'"' {
            return Ok(PartialString {
                text,
                closed: true,
                end: i + 1,
            });
        }

        let Some(&escape) = bytes.get(i + 1) else {
            break;
        };
        let simple = match escape {
            b'"' => Some('"'),
            b'\\' => Some('\\'),
            b'/' => Some('/'),
            b'b' => Some('\u{8}'),
            b'f' => Some('\u{c}'),
            b'n' => Some('\n'),
            b'r' => Some('\r'),
            b't' => Some('\t'),
            b'u' => None,
            other => {
                return Err(PipelineError::extraction(format!(
                    "invalid escape '\\{}' at offset {i}",
                    other as char
                )))
            }
        };
        if let Some(ch) = simple {
            text.push(ch);
            i += 2;
            continue;
        }

        let Some(code) = hex4(bytes, i + 2)? else {
            break;
        };
        match code {
            0xD800..=0xDBFF => match low_surrogate(bytes, i + 6)? {
                LowSurrogate::Truncated => break,
                LowSurrogate::Missing => {
                    text.push(char::REPLACEMENT_CHARACTER);
                    i += 6;
                }
                LowSurrogate::Found(low) => {
                    let combined = 0x10000 + ((code - 0xD800) << 10) + (low - 0xDC00);
                    text.push(char::from_u32(combined).unwrap_or(char::REPLACEMENT_CHARACTER));
                    i += 12;
                }
            },
            0xDC00..=0xDFFF => {
                text.push(char::REPLACEMENT_CHARACTER);
                i += 6;
            }
            _ => {
                text.push(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
                i += 6;
            }
        }
    }

    Ok(PartialString {
        text,
        closed: false,
        end: i.min(bytes.len()),
    })
}

enum LowSurrogate {
    Truncated,
    Missing,
    Found(u32),
}

fn low_surrogate(bytes: &[u8], at: usize) -> PipelineResult<LowSurrogate> {
    match (bytes.get(at), bytes.get(at + 1)) {
        (None, _) | (Some(b'\\'), None) => return Ok(LowSurrogate::Truncated),
        (Some(b'\\'), Some(b'u')) => {}
        _ => return Ok(LowSurrogate::Missing),
    }
    match hex4(bytes, at + 2)? {
        None => Ok(LowSurrogate::Truncated),
        Some(low @ 0xDC00..=0xDFFF) => Ok(LowSurrogate::Found(low)),
        Some(_) => Ok(LowSurrogate::Missing),
    }
}

/// `Ok(None)` when fewer than four hex digits have arrived.
fn hex4(bytes: &[u8], at: usize) -> PipelineResult<Option<u32>> {
    let available = bytes.len().saturating_sub(at).min(4);
    let digits = &bytes[at.min(bytes.len())..at.min(bytes.len()) + available];
    let mut value = 0u32;
    for (offset, digit) in digits.iter().enumerate() {
        let nibble = (*digit as char).to_digit(16).ok_or_else(|| {
            PipelineError::extraction(format!(
                "invalid unicode escape digit at offset {}",
                at + offset
            ))
        })?;
        value = (value << 4) | nibble;
    }
    Ok((available == 4).then_some(value))
}

pub(crate) fn skip_ws(bytes: &[u8], mut i: usize) -> usize {
    while matches!(bytes.get(i), Some(b' ' | b'\t' | b'\r' | b'\n')) {
        i += 1;
    }
    i
}

/// End of the string literal starting at `quote`, if it has closed.
pub(crate) fn skip_string(bytes: &[u8], quote: usize) -> Option<usize> {
    let mut i = quote + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return Some(i + 1),
            _ => i += 1,
        }
    }
    None
}

/// End of the value starting at `i`, or `None` while it is still growing.
pub(crate) fn skip_value(bytes: &[u8], i: usize) -> PipelineResult<Option<usize>> {
    match bytes.get(i) {
        None => Ok(None),
        Some(b'"') => Ok(skip_string(bytes, i)),
        Some(b'{' | b'[') => {
            let mut depth = 0usize;
            let mut j = i;
            while j < bytes.len() {
                match bytes[j] {
                    b'"' => match skip_string(bytes, j) {
                        Some(end) => {
                            j = end;
                            continue;
                        }
                        None => return Ok(None),
                    },
                    b'{' | b'[' => depth += 1,
                    b'}' | b']' => {
                        depth = depth.saturating_sub(1);
                        if depth == 0 {
                            return Ok(Some(j + 1));
                        }
                    }
                    _ => {}
                }
                j += 1;
            }
            Ok(None)
        }
        Some(&first) => {
            let mut j = i;
            while j < bytes.len()
                && !matches!(bytes[j], b',' | b'}' | b']' | b' ' | b'\t' | b'\r' | b'\n')
            {
                j += 1;
            }
            if j == i {
                Err(unexpected(first, i, "value"))
            } else if j == bytes.len() {
                Ok(None)
            } else {
                Ok(Some(j))
            }
        }
    }
}

enum MemberStep<'a> {
    Pending,
    Closed,
    Member { key: &'a str, value: usize },
}

/// Reads the next `"key": ` header at or after `i`, skipping separators.
fn member_header(buf: &str, mut i: usize) -> PipelineResult<MemberStep<'_>> {
    let bytes = buf.as_bytes();
    loop {
        i = skip_ws(bytes, i);
        match bytes.get(i) {
            None => return Ok(MemberStep::Pending),
            Some(b'}') => return Ok(MemberStep::Closed),
            Some(b',') => i += 1,
            Some(b'"') => {
                let Some(key_end) = skip_string(bytes, i) else {
                    return Ok(MemberStep::Pending);
                };
                let key = &buf[i + 1..key_end - 1];
                let mut j = skip_ws(bytes, key_end);
                match bytes.get(j) {
                    None => return Ok(MemberStep::Pending),
                    Some(b':') => j += 1,
                    Some(&other) => return Err(unexpected(other, j, "object")),
                }
                j = skip_ws(bytes, j);
                if j >= bytes.len() {
                    return Ok(MemberStep::Pending);
                }
                return Ok(MemberStep::Member { key, value: j });
            }
            Some(&other) => return Err(unexpected(other, i, "object")),
        }
    }
}

/// Start of `key`'s value inside the object opening at `obj_start`.
pub(crate) fn find_member(buf: &str, obj_start: usize, key: &str) -> PipelineResult<Option<usize>> {
    let bytes = buf.as_bytes();
    if bytes.get(obj_start) != Some(&b'{') {
        return Err(PipelineError::extraction(format!(
            "expected an object at offset {obj_start}"
        )));
    }

    let mut i = obj_start + 1;
    loop {
        match member_header(buf, i)? {
            MemberStep::Pending | MemberStep::Closed => return Ok(None),
            MemberStep::Member { key: found, value } => {
                if found == key {
                    return Ok(Some(value));
                }
                match skip_value(bytes, value)? {
                    Some(end) => i = end,
                    None => return Ok(None),
                }
            }
        }
    }
}

/// Elements of an array, starting just after `[` or just after an element.
pub(crate) fn array_elements(buf: &str, from: usize) -> PipelineResult<ArrayScan> {
    let bytes = buf.as_bytes();
    let mut elements = Vec::new();
    let mut i = from;
    loop {
        i = skip_ws(bytes, i);
        match bytes.get(i) {
            None => {
                return Ok(ArrayScan {
                    elements,
                    closed: false,
                })
            }
            Some(b']') => {
                return Ok(ArrayScan {
                    elements,
                    closed: true,
                })
            }
            Some(b',') => i += 1,
            Some(_) => {
                let end = skip_value(bytes, i)?;
                elements.push(Element { start: i, end });
                match end {
                    Some(next) => i = next,
                    None => {
                        return Ok(ArrayScan {
                            elements,
                            closed: false,
                        })
                    }
                }
            }
        }
    }
}

/// Complete string entries of the array opening at `arr_start`, and whether
/// the array itself has closed. Non-string entries are ignored.
pub(crate) fn read_string_array(
    buf: &str,
    arr_start: usize,
) -> PipelineResult<(Vec<String>, bool)> {
    if buf.as_bytes().get(arr_start) != Some(&b'[') {
        return Err(PipelineError::extraction(format!(
            "expected an array at offset {arr_start}"
        )));
    }

    let scan = array_elements(buf, arr_start + 1)?;
    let mut values = Vec::with_capacity(scan.elements.len());
    for element in &scan.elements {
        if buf.as_bytes()[element.start] != b'"' {
            continue;
        }
        let value = read_string(buf, element.start)?;
        if !value.closed {
            break;
        }
        values.push(value.text);
    }
    Ok((values, scan.closed))
}

/// Top-level keys of one object, discovered incrementally as the buffer grows.
#[derive(Debug, Default)]
pub(crate) struct MemberIndex {
    resume: Option<usize>,
    members: HashMap<String, usize>,
}

impl MemberIndex {
    /// Walks members not yet indexed. Values already skipped are never revisited.
    pub(crate) fn update(&mut self, buf: &str, obj_start: usize) -> PipelineResult<()> {
        let bytes = buf.as_bytes();
        let mut i = self.resume.unwrap_or(obj_start + 1);
        loop {
            match member_header(buf, i)? {
                MemberStep::Pending | MemberStep::Closed => return Ok(()),
                MemberStep::Member { key, value } => {
                    self.members.entry(key.to_string()).or_insert(value);
                    match skip_value(bytes, value)? {
                        Some(end) => {
                            i = end;
                            self.resume = Some(end);
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<usize> {
        self.members.get(key).copied()
    }
}

fn unexpected(byte: u8, offset: usize, context: &str) -> PipelineError {
    PipelineError::extraction(format!(
        "unexpected '{}' at offset {offset} inside {context}",
        byte as char
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unterminated_string_decodes_prefix() {
        let value = read_string(r#""What's your bud"#, 0).unwrap();
        assert_eq!(value.text, "What's your bud");
        assert!(!value.closed);
    }

    #[test]
    fn test_escapes_and_surrogate_pairs_decode_like_serde() {
        let raw = r#""line\nquote\" slash\/ tab\t é 😀""#;
        let expected: String = serde_json::from_str(raw).unwrap();
        let value = read_string(raw, 0).unwrap();
        assert!(value.closed);
        assert_eq!(value.end, raw.len());
        assert_eq!(value.text, expected);
    }

    #[test]
    fn test_cut_escape_is_held_back() {
        for raw in [r#""ab\"#, r#""ab\u00"#, r#""ab\ud83d"#, r#""ab\ud83d\"#, r#""ab\ud83d\ude"#] {
            let value = read_string(raw, 0).unwrap();
            assert_eq!(value.text, "ab", "input {raw}");
            assert!(!value.closed);
            assert_eq!(value.end, 3, "input {raw}");
        }
    }

    #[test]
    fn test_invalid_escape_is_an_extraction_error() {
        assert!(matches!(
            read_string(r#""bad \q""#, 0),
            Err(PipelineError::Extraction(_))
        ));
    }

    #[test]
    fn test_skip_value_reports_growing_values() {
        let bytes = br#"{"a":[1,"]",{"b":2}]} "#;
        assert_eq!(skip_value(bytes, 0).unwrap(), Some(bytes.len() - 1));
        assert_eq!(skip_value(b"[1,2", 0).unwrap(), None);
        assert_eq!(skip_value(b"123", 0).unwrap(), None);
        assert_eq!(skip_value(b"123,", 0).unwrap(), Some(3));
    }

    #[test]
    fn test_find_member_skips_nested_decoys() {
        let buf = r#"{"meta":{"message":"decoy"},"note":"\"message\": x","message":"real"}"#;
        let value = find_member(buf, 0, "message").unwrap().expect("member");
        assert_eq!(read_string(buf, value).unwrap().text, "real");
    }

    #[test]
    fn test_find_member_waits_for_partial_key() {
        assert_eq!(find_member(r#"{"slot_name":"a","mess"#, 0, "message").unwrap(), None);
        assert_eq!(find_member(r#"{"message""#, 0, "message").unwrap(), None);
        assert_eq!(find_member(r#"{"message": "#, 0, "message").unwrap(), None);
        assert_eq!(find_member(r#"{"message": "x"#, 0, "message").unwrap(), Some(12));
    }

    #[test]
    fn test_read_string_array_growth() {
        let (values, closed) = read_string_array(r#"["Under 500","500-10"#, 0).unwrap();
        assert_eq!(values, vec!["Under 500"]);
        assert!(!closed);

        let (values, closed) = read_string_array(r#"["Under 500", "500-1000"]"#, 0).unwrap();
        assert_eq!(values, vec!["Under 500", "500-1000"]);
        assert!(closed);
    }

    #[test]
    fn test_member_index_resumes_after_complete_values() {
        let mut index = MemberIndex::default();
        let partial = r#"{"ask_slots":[{"slot_name":"a"}],"simple_resp"#;
        index.update(partial, 0).unwrap();
        assert_eq!(index.get("ask_slots"), Some(13));
        assert_eq!(index.get("simple_response"), None);

        let full = format!("{partial}onse\":{{\"message\":\"hi\"}}}}");
        index.update(&full, 0).unwrap();
        let at = index.get("simple_response").expect("indexed");
        assert_eq!(&full[at..at + 1], "{");
    }
}
