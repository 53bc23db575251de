/*
 * SPDX-FileCopyrightText: 2020 Fannst B.V. <hello@fannst.nl>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Command parsing and response formatting. A `Command` is the tagged
//! variant the session driver matches on exhaustively; nothing below knows
//! about session state.

use std::fmt::Write as _;

/// A parsed client command line. `Other` carries the raw verb for the
/// "unknown verb" 502 path; it is never itself a recognized command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo { domain: String },
    Ehlo { domain: String },
    StartTls,
    Auth { mechanism: String, initial: Option<String> },
    MailFrom { address: String, params: Vec<String> },
    RcptTo { address: String, params: Vec<String> },
    Data,
    Quit,
    Help,
    Noop,
    Rset,
    Su,
    Fcapa,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    Empty,
    MissingColon,
    MissingAngleAddr,
}

/// Parses a single CRLF-stripped command line. The verb is the
/// case-insensitive token up to the first space or `:`.
pub fn parse_command(line: &str) -> Result<Command, ParseError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Err(ParseError::Empty);
    }

    let verb_end = line
        .find(|c: char| c == ' ' || c == ':')
        .unwrap_or(line.len());
    let verb = line[..verb_end].to_ascii_uppercase();
    let rest = line[verb_end..].trim_start_matches(':').trim();

    Ok(match verb.as_str() {
        "HELO" => Command::Helo { domain: rest.to_string() },
        "EHLO" => Command::Ehlo { domain: rest.to_string() },
        "STARTTLS" => Command::StartTls,
        "AUTH" => {
            let mut parts = rest.splitn(2, ' ');
            let mechanism = parts.next().unwrap_or_default().to_ascii_uppercase();
            let initial = parts.next().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
            Command::Auth { mechanism, initial }
        }
        "MAIL" => {
            if !line[verb_end..].trim_start().to_ascii_uppercase().starts_with("FROM") {
                return Ok(Command::Other(line.to_string()));
            }
            let (address, params) = parse_path_and_params(line, "FROM")?;
            Command::MailFrom { address, params }
        }
        "RCPT" => {
            if !line[verb_end..].trim_start().to_ascii_uppercase().starts_with("TO") {
                return Ok(Command::Other(line.to_string()));
            }
            let (address, params) = parse_path_and_params(line, "TO")?;
            Command::RcptTo { address, params }
        }
        "DATA" => Command::Data,
        "QUIT" => Command::Quit,
        "HELP" => Command::Help,
        "NOOP" => Command::Noop,
        "RSET" => Command::Rset,
        "SU" => Command::Su,
        "FCAPA" => Command::Fcapa,
        _ => Command::Other(line.to_string()),
    })
}

/// Extracts the angle-addr and trailing ESMTP parameters from a
/// `MAIL FROM:<addr> PARAM=val` / `RCPT TO:<addr> PARAM=val` line. `keyword`
/// is `"FROM"` or `"TO"`; the colon after it is mandatory per RFC 5321.
fn parse_path_and_params(line: &str, keyword: &str) -> Result<(String, Vec<String>), ParseError> {
    let upper = line.to_ascii_uppercase();
    let keyword_pos = upper.find(keyword).ok_or(ParseError::MissingColon)?;
    let after_keyword = &line[keyword_pos + keyword.len()..];
    let after_colon = after_keyword.strip_prefix(':').ok_or(ParseError::MissingColon)?;

    let open = after_colon.find('<').ok_or(ParseError::MissingAngleAddr)?;
    let close = after_colon[open..].find('>').map(|p| p + open).ok_or(ParseError::MissingAngleAddr)?;
    let address = after_colon[open + 1..close].trim().to_string();

    let params: Vec<String> = after_colon[close + 1..]
        .split_whitespace()
        .map(|s| s.to_string())
        .collect();

    Ok((address, params))
}

/// `<3-digit code><SP|-><text>\r\n`. Every response line written to the
/// peer goes through this so dashes/terminators never drift.
pub fn format_single(code: u16, text: &str) -> String {
    format!("{code} {text}\r\n")
}

/// Multi-line response: `-` on every line but the last, which uses a space.
/// `lines` must be non-empty.
pub fn format_multi(code: u16, lines: &[String]) -> String {
    let mut out = String::new();
    let last = lines.len().saturating_sub(1);
    for (i, line) in lines.iter().enumerate() {
        let sep = if i == last { ' ' } else { '-' };
        let _ = writeln!(out, "{code}{sep}{line}\r");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ehlo() {
        assert_eq!(
            parse_command("EHLO client.example").unwrap(),
            Command::Ehlo { domain: "client.example".to_string() }
        );
    }

    #[test]
    fn parses_mail_from_with_params() {
        let cmd = parse_command("MAIL FROM:<alice@ex.com> SIZE=1024 BODY=8BITMIME").unwrap();
        assert_eq!(
            cmd,
            Command::MailFrom {
                address: "alice@ex.com".to_string(),
                params: vec!["SIZE=1024".to_string(), "BODY=8BITMIME".to_string()],
            }
        );
    }

    #[test]
    fn parses_rcpt_to_case_insensitive_keyword() {
        let cmd = parse_command("rcpt to:<bob@ex.com>").unwrap();
        assert_eq!(cmd, Command::RcptTo { address: "bob@ex.com".to_string(), params: vec![] });
    }

    #[test]
    fn mail_from_without_colon_is_rejected() {
        assert_eq!(parse_command("MAIL FROM<alice@ex.com>"), Err(ParseError::MissingColon));
    }

    #[test]
    fn mail_from_without_angle_addr_is_rejected() {
        assert_eq!(parse_command("MAIL FROM:alice@ex.com"), Err(ParseError::MissingAngleAddr));
    }

    #[test]
    fn parses_auth_plain_with_initial_response() {
        let cmd = parse_command("AUTH PLAIN AGFsaWNlAHB3").unwrap();
        assert_eq!(
            cmd,
            Command::Auth { mechanism: "PLAIN".to_string(), initial: Some("AGFsaWNlAHB3".to_string()) }
        );
    }

    #[test]
    fn unknown_verb_is_other() {
        assert_eq!(parse_command("BOGUS").unwrap(), Command::Other("BOGUS".to_string()));
    }

    #[test]
    fn format_single_line_response() {
        assert_eq!(format_single(250, "OK"), "250 OK\r\n");
    }

    #[test]
    fn format_multi_line_response_dashes_all_but_last() {
        let lines = vec!["ex.com".to_string(), "STARTTLS".to_string(), "SIZE 1024".to_string()];
        let formatted = format_multi(250, &lines);
        assert_eq!(formatted, "250-ex.com\r\n250-STARTTLS\r\n250 SIZE 1024\r\n");
    }
}
