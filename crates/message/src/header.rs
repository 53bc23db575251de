/*
 * SPDX-FileCopyrightText: 2020 Fannst B.V. <hello@fannst.nl>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! line splitting, header unfolding/folding, `key: value` parsing and
//! `;`-separated parameter parsing.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Lowercased for lookup; invariant "header keys never contain `:`".
    pub name: String,
    /// Case preserved, already unfolded.
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    /// A line without `:` was found outside a continuation.
    MissingColon(String),
    LineTooLong(usize),
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderError::MissingColon(line) => {
                write!(f, "malformed header line (no ':'): {line:?}")
            }
            HeaderError::LineTooLong(len) => write!(f, "header line exceeds 998 octets: {len}"),
        }
    }
}

impl std::error::Error for HeaderError {}

/// RFC 5322 hard cap: a header line (unfolded) longer than this is
/// rejected.
pub const MAX_HEADER_LINE: usize = 998;

/// Splits `data` on CRLF. A trailing CR on a line is consumed; a bare LF
/// not preceded by CR is still accepted and treated as a line terminator.
pub fn split_lines(data: &[u8]) -> Vec<&[u8]> {
    let mut lines = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < data.len() {
        if data[i] == b'\n' {
            let end = if i > start && data[i - 1] == b'\r' {
                i - 1
            } else {
                i
            };
            lines.push(&data[start..end]);
            start = i + 1;
        }
        i += 1;
    }
    if start < data.len() {
        lines.push(&data[start..]);
    }
    lines
}

/// Parses the header block (everything before the first blank line),
/// returning parsed headers and the byte offset of the body (just past
/// the blank-line terminator).
pub fn parse_headers(data: &[u8]) -> Result<(Vec<Header>, usize), HeaderError> {
    let lines = split_lines(data);
    let mut headers = Vec::new();
    let mut unfolded: Vec<String> = Vec::new();
    let mut consumed = 0usize;
    let mut body_offset = data.len();

    for (idx, line) in lines.iter().enumerate() {
        consumed += line.len() + 2; // + CRLF, adjusted below for bare LF
        if line.is_empty() {
            body_offset = offset_of_line(data, idx + 1);
            break;
        }
        if line.len() > MAX_HEADER_LINE {
            return Err(HeaderError::LineTooLong(line.len()));
        }
        let is_continuation = matches!(line.first(), Some(b' ') | Some(b'\t'));
        let text = String::from_utf8_lossy(line).into_owned();
        if is_continuation && !unfolded.is_empty() {
            let folded = unfolded.last_mut().unwrap();
            if folded.trim_end().ends_with(';') {
                // a single SP is inserted at the join point when the
                // previous value ended with ';'; the continuation's own
                // leading whitespace is dropped so exactly one SP remains.
                folded.push(' ');
                folded.push_str(text.trim_start_matches([' ', '\t']));
            } else {
                // Otherwise the continuation is appended as-is, including
                // its leading folding whitespace.
                folded.push_str(&text);
            }
        } else {
            unfolded.push(text);
        }
        if idx + 1 == lines.len() {
            body_offset = data.len();
        }
    }
    let _ = consumed;

    for raw in unfolded {
        let colon = raw
        .find(':')
        .ok_or_else(|| HeaderError::MissingColon(raw.clone()))?;
        let name = raw[..colon].trim().to_ascii_lowercase();
        let value = raw[colon + 1..].trim().to_string();
        headers.push(Header { name, value });
    }

    Ok((headers, body_offset))
}

fn offset_of_line(data: &[u8], line_index: usize) -> usize {
    let mut count = 0usize;
    let mut i = 0usize;
    while i < data.len() {
        if data[i] == b'\n' {
            count += 1;
            if count == line_index {
                return i + 1;
            }
        }
        i += 1;
    }
    data.len()
}

/// A `;`-separated parameter list, as found on `Content-Type` /
/// `Content-Disposition` values: `value; k1=v1; k2="v with spaces"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedParameters {
    pub value: String,
    pub params: Vec<(String, String)>,
}

pub fn parse_parameters(header_value: &str) -> ParsedParameters {
    let parts = split_top_level(header_value, ';');
    let mut iter = parts.into_iter();
    let value = iter.next().unwrap_or_default().trim().to_string();
    let mut params = Vec::new();
    for part in iter {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some(eq) = part.find('=') {
            let key = part[..eq].trim().to_ascii_lowercase();
            let mut val = part[eq + 1..].trim();
            if val.starts_with('"') && val.ends_with('"') && val.len() >= 2 {
                val = &val[1..val.len() - 1];
            }
            params.push((key, val.to_string()));
        }
    }
    ParsedParameters { value, params }
}

impl ParsedParameters {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
    }
}

/// Splits on `sep` at the top level only: a `sep` inside a double-quoted
/// span is not a separator.
fn split_top_level(input: &str, sep: char) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in input.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            c if c == sep && !in_quotes => {
                out.push(std::mem::take(&mut current));
            }
            c => current.push(c),
        }
    }
    out.push(current);
    out
}

/// Outbound header folding: wraps `name: value` to at most `max_len`
/// octets per line (recommended 78), never exceeding the RFC 5322 hard cap
/// of 998, preferring to break at `;` boundaries, else the last space
/// before the cap, never inside a quoted string.
pub fn fold_header(name: &str, value: &str, max_len: usize) -> String {
    let max_len = max_len.min(MAX_HEADER_LINE);
    let mut out = String::new();
    out.push_str(name);
    out.push_str(": ");

    let mut line_len = out.len();
    let mut in_quotes = false;
    let chars: Vec<char> = value.chars().collect();
    let mut i = 0;
    let mut last_break_point: Option<usize> = None; // index into `out`

    while i < chars.len() {
        let c = chars[i];
        if c == '"' {
            in_quotes = !in_quotes;
        }
        out.push(c);
        line_len += 1;

        if !in_quotes && (c == ';' || c == ' ') {
            last_break_point = Some(out.len());
        }

        if line_len >= max_len && i + 1 < chars.len() {
            if let Some(bp) = last_break_point.take() {
                out.insert_str(bp, "\r\n ");
                line_len = out.len() - bp - 3;
            } else {
                out.push_str("\r\n ");
                line_len = 1;
            }
        }
        i += 1;
    }
    out.push_str("\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_crlf_lines() {
        let lines = split_lines(b"a\r\nb\r\nc");
        assert_eq!(lines, vec![b"a".as_slice(), b"b".as_slice(), b"c".as_slice()]);
    }

    #[test]
    fn splits_bare_lf_too() {
        let lines = split_lines(b"a\nb\r\nc");
        assert_eq!(lines, vec![b"a".as_slice(), b"b".as_slice(), b"c".as_slice()]);
    }

    #[test]
    fn unfolds_continuation_after_semicolon_with_single_space() {
        let data = b"Content-Type: text/plain;\r\n charset=utf-8\r\n\r\nbody";
        let (headers, offset) = parse_headers(data).unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].name, "content-type");
        assert_eq!(headers[0].value, "text/plain; charset=utf-8");
        assert_eq!(&data[offset..], b"body");
    }

    #[test]
    fn rejects_line_without_colon() {
        let data = b"Not-A-Header-Line\r\n\r\nbody";
        assert!(parse_headers(data).is_err());
    }

    #[test]
    fn header_keys_are_lowercased_values_preserve_case() {
        let data = b"Subject: Hello World\r\n\r\n";
        let (headers, _) = parse_headers(data).unwrap();
        assert_eq!(headers[0].name, "subject");
        assert_eq!(headers[0].value, "Hello World");
    }

    #[test]
    fn parses_quoted_parameter_with_spaces() {
        let parsed = parse_parameters(r#"multipart/mixed; boundary="a b c""#);
        assert_eq!(parsed.value, "multipart/mixed");
        assert_eq!(parsed.get("boundary"), Some("a b c"));
    }

    #[test]
    fn header_line_998_accepted_999_rejected() {
        let ok_line = format!("X-Long: {}\r\n\r\n", "a".repeat(990));
        assert!(parse_headers(ok_line.as_bytes()).is_ok());

        let bad_line = format!("X-Long: {}\r\n\r\n", "a".repeat(991));
        assert!(parse_headers(bad_line.as_bytes()).is_err());
    }

    #[test]
    fn fold_header_never_exceeds_hard_cap() {
        let value = "a".repeat(2000);
        let folded = fold_header("X-Test", &value, 78);
        for line in folded.split("\r\n") {
            assert!(line.len() <= MAX_HEADER_LINE);
        }
    }

    #[test]
    fn fold_header_breaks_at_semicolon() {
        let folded = fold_header(
            "Content-Type",
            "multipart/mixed; boundary=abcdefghijklmnopqrstuvwxyz0123456789",
            40,
        );
        assert!(folded.contains("\r\n "));
    }
}
