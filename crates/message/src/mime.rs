/*
 * SPDX-FileCopyrightText: 2020 Fannst B.V. <hello@fannst.nl>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! `MimeMessage`: a recursive leaf/multipart tree, built by decomposing
//! `multipart/*` bodies at their boundary delimiters.

use crate::decode::TransferEncoding;
use crate::header::{self, Header, HeaderError, ParsedParameters};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MimeMessage {
    /// A non-multipart part: decoded body bytes plus its own headers.
    Leaf {
        headers: Vec<Header>,
        content_type: String,
        body: Vec<u8>,
    },
    /// A `multipart/*` part: its own headers plus the decomposed children.
    /// Preamble and epilogue text around the boundary delimiters are
    /// discarded.
    Multipart {
        headers: Vec<Header>,
        content_type: String,
        boundary: String,
        children: Vec<MimeMessage>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MimeError {
    Header(HeaderError),
    /// `multipart/*` declared without a `boundary` parameter.
    MissingBoundary,
}

impl std::fmt::Display for MimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MimeError::Header(e) => write!(f, "{e}"),
            MimeError::MissingBoundary => write!(f, "multipart part without a boundary parameter"),
        }
    }
}

impl std::error::Error for MimeError {}

impl From<HeaderError> for MimeError {
    fn from(e: HeaderError) -> Self {
        MimeError::Header(e)
    }
}

impl MimeMessage {
    pub fn headers(&self) -> &[Header] {
        match self {
            MimeMessage::Leaf { headers, .. } => headers,
            MimeMessage::Multipart { headers, .. } => headers,
        }
    }

    pub fn content_type(&self) -> &str {
        match self {
            MimeMessage::Leaf { content_type, .. } => content_type,
            MimeMessage::Multipart { content_type, .. } => content_type,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers()
        .iter()
        .find(|h| h.name == name)
        .map(|h| h.value.as_str())
    }

    /// Parses a full RFC 5322 message (headers + body) into its MIME tree.
    pub fn parse(data: &[u8]) -> Result<Self, MimeError> {
        let (headers, body_offset) = header::parse_headers(data)?;
        let body = &data[body_offset..];
        Self::from_parts(headers, body)
    }

    fn from_parts(headers: Vec<Header>, body: &[u8]) -> Result<Self, MimeError> {
        let content_type_header = headers
        .iter()
        .find(|h| h.name == "content-type")
        .map(|h| h.value.as_str())
        .unwrap_or("text/plain");
        let parsed_ct = header::parse_parameters(content_type_header);
        let content_type = parsed_ct.value.to_ascii_lowercase();

        if let Some(subtype) = content_type.strip_prefix("multipart/") {
            let _ = subtype;
            let boundary = parsed_ct
            .get("boundary")
            .ok_or(MimeError::MissingBoundary)?
            .to_string();
            let children = split_multipart(body, &boundary)
            .into_iter()
            .map(Self::parse)
            .collect::<Result<Vec<_>, _>>()?;
            return Ok(MimeMessage::Multipart {
                    headers,
                    content_type,
                    boundary,
                    children,
            });
        }

        let encoding = headers
        .iter()
        .find(|h| h.name == "content-transfer-encoding")
        .map(|h| TransferEncoding::parse(&h.value))
        .unwrap_or(TransferEncoding::SevenBit);
        let decoded = encoding.decode(body);

        Ok(MimeMessage::Leaf {
                headers,
                content_type,
                body: decoded,
        })
    }

    /// Depth-first iterator over every leaf part.
    pub fn leaves(&self) -> Vec<&MimeMessage> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a MimeMessage>) {
        match self {
            MimeMessage::Leaf { .. } => out.push(self),
            MimeMessage::Multipart { children, .. } => {
                for child in children {
                    child.collect_leaves(out);
                }
            }
        }
    }
}

/// Splits a multipart body at `--boundary` delimiter lines, discarding the
/// preamble (before the first delimiter) and epilogue (after the closing
/// `--boundary--` delimiter).
fn split_multipart<'a>(body: &'a [u8], boundary: &str) -> Vec<&'a [u8]> {
    let delim = format!("--{boundary}");
    let delim_bytes = delim.as_bytes();
    let mut parts = Vec::new();

    let mut search_from = 0usize;
    let mut part_start: Option<usize> = None;

    loop {
        let Some(rel) = find_subslice(&body[search_from..], delim_bytes) else {
            break;
        };
        let delim_pos = search_from + rel;

        // A real delimiter line starts either at offset 0 or right after a
        // preceding CRLF; reject a bare substring match mid-content.
        let line_start = if delim_pos == 0 {
            0
        } else if delim_pos >= 2 && &body[delim_pos - 2..delim_pos] == b"\r\n" {
            delim_pos - 2
        } else {
            search_from = delim_pos + delim_bytes.len();
            continue;
        };

        let after_delim = delim_pos + delim_bytes.len();
        let is_closing = body[after_delim..].starts_with(b"--");
        let content_after = if is_closing {
            after_delim + 2
        } else {
            after_delim
        };

        if let Some(start) = part_start {
            let end = line_start;
            parts.push(&body[start..end]);
        }

        if is_closing {
            break;
        }

        // Skip the CRLF (or nothing, at end of delimiter line) before the
        // next part's content begins.
        let skip = if body[content_after..].starts_with(b"\r\n") {
            content_after + 2
        } else {
            content_after
        };
        part_start = Some(skip);
        search_from = skip;
    }

    parts
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_leaf_message() {
        let data = b"Content-Type: text/plain\r\n\r\nhello world";
        let msg = MimeMessage::parse(data).unwrap();
        match msg {
            MimeMessage::Leaf { body, content_type, .. } => {
                assert_eq!(content_type, "text/plain");
                assert_eq!(body, b"hello world");
            }
            _ => panic!("expected leaf"),
        }
    }

    #[test]
    fn decomposes_multipart_mixed_into_children() {
        let data = concat!(
            "Content-Type: multipart/mixed; boundary=XYZ\r\n",
            "\r\n",
            "preamble text, discarded\r\n",
            "--XYZ\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "first part\r\n",
            "--XYZ\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<p>second part</p>\r\n",
            "--XYZ--\r\n",
            "epilogue, also discarded\r\n",
        );
        let msg = MimeMessage::parse(data.as_bytes()).unwrap();
        match msg {
            MimeMessage::Multipart { children, boundary, .. } => {
                assert_eq!(boundary, "XYZ");
                assert_eq!(children.len(), 2);
                assert_eq!(children[0].content_type(), "text/plain");
                assert_eq!(children[1].content_type(), "text/html");
            }
            _ => panic!("expected multipart"),
        }
    }

    #[test]
    fn missing_boundary_is_an_error() {
        let data = b"Content-Type: multipart/mixed\r\n\r\nbody";
        assert_eq!(MimeMessage::parse(data).unwrap_err(), MimeError::MissingBoundary);
    }

    #[test]
    fn nested_multipart_recurses() {
        let data = concat!(
            "Content-Type: multipart/mixed; boundary=OUTER\r\n",
            "\r\n",
            "--OUTER\r\n",
            "Content-Type: multipart/alternative; boundary=INNER\r\n",
            "\r\n",
            "--INNER\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "plain\r\n",
            "--INNER\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "html\r\n",
            "--INNER--\r\n",
            "--OUTER--\r\n",
        );
        let msg = MimeMessage::parse(data.as_bytes()).unwrap();
        assert_eq!(msg.leaves().len(), 2);
    }

    #[test]
    fn quoted_printable_leaf_is_decoded() {
        let data = concat!(
            "Content-Type: text/plain\r\n",
            "Content-Transfer-Encoding: quoted-printable\r\n",
            "\r\n",
            "Caf=C3=A9",
        );
        let msg = MimeMessage::parse(data.as_bytes()).unwrap();
        match msg {
            MimeMessage::Leaf { body, .. } => assert_eq!(body, "Café".as_bytes()),
            _ => panic!("expected leaf"),
        }
    }
}
