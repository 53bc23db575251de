/*
 * SPDX-FileCopyrightText: 2020 Fannst B.V. <hello@fannst.nl>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Outbound SMTP client: delivers one message to one destination host,
//! trying its MX targets (falling back to the host's own A/AAAA record
//! when it publishes no MX) in preference order until one accepts or all
//! refuse.

use std::{net::IpAddr, time::Duration};

use rand::seq::SliceRandom;
use rustls_pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use dns::Resolver;
use utils::Conn;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);
const DATA_TIMEOUT: Duration = Duration::from_secs(600);

/// Builds the outbound `STARTTLS` connector used for relay and bounce
/// delivery, trusting the Mozilla root set shipped by `webpki-roots`. A peer
/// with an invalid or expired certificate simply fails the handshake in
/// [`deliver_to_target`], which falls back to the next MX target rather than
/// delivering in the clear.
pub fn client_tls_connector() -> TlsConnector {
    let mut roots = tokio_rustls::rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = tokio_rustls::rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(std::sync::Arc::new(config))
}

#[derive(Debug, Clone)]
pub struct DeliveryTarget {
    pub host: String,
    pub ip: IpAddr,
}

#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub target: String,
    pub accepted: bool,
    pub permanent_failure: bool,
    pub response: String,
}

#[derive(Debug, Clone)]
pub struct PeerCapabilities {
    pub starttls: bool,
    pub eightbitmime: bool,
    pub pipelining: bool,
    pub size: Option<usize>,
}

impl PeerCapabilities {
    fn from_ehlo_lines(lines: &[String]) -> Self {
        let mut caps = PeerCapabilities { starttls: false, eightbitmime: false, pipelining: false, size: None };
        for line in lines {
            let upper = line.to_ascii_uppercase();
            if upper == "STARTTLS" {
                caps.starttls = true;
            } else if upper == "8BITMIME" {
                caps.eightbitmime = true;
            } else if upper == "PIPELINING" {
                caps.pipelining = true;
            } else if let Some(rest) = upper.strip_prefix("SIZE") {
                caps.size = rest.trim().parse().ok();
            }
        }
        caps
    }
}

/// Resolves the deliverable targets for `domain`: its MX hosts in
/// preference order, each expanded to its A/AAAA addresses, or (if it
/// publishes no MX record) the domain itself as an implicit MX.
pub async fn resolve_targets(resolver: &Resolver, domain: &str) -> Vec<DeliveryTarget> {
    let mut targets = Vec::new();
    let hosts: Vec<String> = match resolver.query_mx(domain).await {
        Ok(records) if !records.is_empty() => shuffle_within_preference(records),
        _ => vec![domain.to_string()],
    };

    for host in hosts {
        if let Ok(ips) = resolver.query_ip(&host).await {
            for ip in ips {
                targets.push(DeliveryTarget { host: host.clone(), ip });
            }
        }
    }
    targets
}

/// MX hosts sharing the lowest preference value are tried in random order
/// (RFC 5321 §5.1); hosts at a higher preference value always come after
/// every host at a lower one.
fn shuffle_within_preference(mut records: Vec<dns::MxRecord>) -> Vec<String> {
    records.sort_by_key(|r| r.preference);
    let mut rng = rand::thread_rng();
    let mut out = Vec::with_capacity(records.len());
    let mut i = 0;
    while i < records.len() {
        let mut j = i + 1;
        while j < records.len() && records[j].preference == records[i].preference {
            j += 1;
        }
        let mut tier: Vec<String> = records[i..j].iter().map(|r| r.host.clone()).collect();
        tier.shuffle(&mut rng);
        out.extend(tier);
        i = j;
    }
    out
}

/// Drives one complete SMTP client conversation against `target`: connect,
/// read banner, `EHLO`, opportunistic `STARTTLS`, `MAIL`/`RCPT`/`DATA`,
/// `QUIT`. Each step that can fail independently is captured in the
/// returned [`DeliveryOutcome`] rather than propagated, so the caller can
/// move on to the next target.
pub async fn deliver_to_target(
    target: &DeliveryTarget,
    helo_domain: &str,
    sender: &str,
    recipients: &[String],
    raw_message: &[u8],
    tls_connector: Option<&TlsConnector>,
) -> DeliveryOutcome {
    let fail = |text: String, permanent: bool| DeliveryOutcome {
        target: target.host.clone(),
        accepted: false,
        permanent_failure: permanent,
        response: text,
    };

    let socket = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((target.ip, 25))).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => return fail(format!("connection failed: {e}"), false),
        Err(_) => return fail("connection timed out".to_string(), false),
    };
    let mut conn = Conn::plain(socket, COMMAND_TIMEOUT);

    if let Err(e) = read_response(&mut conn, &[220]).await {
        return fail(e, false);
    }

    let ehlo_lines = match send_ehlo(&mut conn, helo_domain).await {
        Ok(lines) => lines,
        Err(e) => return fail(e, false),
    };
    let caps = PeerCapabilities::from_ehlo_lines(&ehlo_lines);

    if caps.starttls {
        if let Some(connector) = tls_connector {
            if conn.write_all(b"STARTTLS\r\n").await.is_err() {
                return fail("connection lost during STARTTLS".to_string(), false);
            }
            if let Err(e) = read_response(&mut conn, &[220]).await {
                return fail(e, false);
            }
            let Ok(server_name) = ServerName::try_from(target.host.clone()) else {
                return fail("invalid server name for TLS".to_string(), false);
            };
            if conn.upgrade_client(connector, server_name).await.is_err() {
                return fail("TLS handshake failed".to_string(), false);
            }
            if let Err(e) = send_ehlo(&mut conn, helo_domain).await {
                return fail(e, false);
            }
        }
    }

    if conn.write_all(format!("MAIL FROM:<{sender}>\r\n").as_bytes()).await.is_err() {
        return fail("connection lost sending MAIL FROM".to_string(), false);
    }
    if let Err(e) = read_response(&mut conn, &[250]).await {
        return fail(e, false);
    }

    let mut any_rcpt_accepted = false;
    for rcpt in recipients {
        if conn.write_all(format!("RCPT TO:<{rcpt}>\r\n").as_bytes()).await.is_err() {
            return fail("connection lost sending RCPT TO".to_string(), false);
        }
        if read_response(&mut conn, &[250, 251]).await.is_ok() {
            any_rcpt_accepted = true;
        }
    }
    if !any_rcpt_accepted {
        let _ = conn.write_all(b"QUIT\r\n").await;
        return fail("no recipients accepted".to_string(), true);
    }

    if conn.write_all(b"DATA\r\n").await.is_err() {
        return fail("connection lost sending DATA".to_string(), false);
    }
    if let Err(e) = read_response(&mut conn, &[354]).await {
        return fail(e, false);
    }

    let stuffed = stuff_dots(raw_message);
    conn.timeout = DATA_TIMEOUT;
    if conn.write_all(&stuffed).await.is_err() || conn.write_all(b"\r\n.\r\n").await.is_err() {
        return fail("connection lost sending message body".to_string(), false);
    }
    conn.timeout = COMMAND_TIMEOUT;

    let response = match read_response(&mut conn, &[250]).await {
        Ok(text) => text,
        Err(e) => return fail(e, e.starts_with("5")),
    };

    let _ = conn.write_all(b"QUIT\r\n").await;

    DeliveryOutcome { target: target.host.clone(), accepted: true, permanent_failure: false, response }
}

async fn send_ehlo(conn: &mut Conn, helo_domain: &str) -> Result<Vec<String>, String> {
    if conn.write_all(format!("EHLO {helo_domain}\r\n").as_bytes()).await.is_err() {
        return Err("connection lost sending EHLO".to_string());
    }
    read_multiline_response(conn, &[250]).await
}

/// Reads one response, accepting it only if its status code is in
/// `expected`; otherwise returns the full text as an `Err` so the caller
/// can classify 4xx (transient) vs 5xx (permanent) failures.
async fn read_response(conn: &mut Conn, expected: &[u16]) -> Result<String, String> {
    let lines = read_multiline_response(conn, expected).await?;
    Ok(lines.join(" "))
}

async fn read_multiline_response(conn: &mut Conn, expected: &[u16]) -> Result<Vec<String>, String> {
    let mut lines = Vec::new();
    loop {
        let raw = conn
        .read_to_delim(b"\r\n", 4096)
        .await
        .map_err(|e| format!("read failed: {e}"))?;
        let line = String::from_utf8_lossy(&raw).into_owned();
        if line.len() < 4 {
            return Err(format!("malformed response line: {line}"));
        }
        let code: u16 = line[..3].parse().map_err(|_| format!("malformed response code: {line}"))?;
        let continues = line.as_bytes().get(3) == Some(&b'-');
        lines.push(line[4.min(line.len())..].to_string());
        if !continues {
            if !expected.contains(&code) {
                return Err(format!("{code} {}", lines.join(" ")));
            }
            return Ok(lines);
        }
    }
}

/// Client-side dot-stuffing: any line starting with `.` gets a second `.`
/// prepended so the terminator scan on the receiving end never mistakes it
/// for end-of-message.
fn stuff_dots(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut at_line_start = true;
    for &byte in body {
        if at_line_start && byte == b'.' {
            out.push(b'.');
        }
        out.push(byte);
        at_line_start = byte == b'\n';
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ehlo_capabilities_parsed_from_response_lines() {
        let lines = vec!["mail.example.com".to_string(), "STARTTLS".to_string(), "SIZE 10485760".to_string(), "8BITMIME".to_string()];
        let caps = PeerCapabilities::from_ehlo_lines(&lines);
        assert!(caps.starttls);
        assert!(caps.eightbitmime);
        assert_eq!(caps.size, Some(10485760));
    }

    #[test]
    fn shuffle_within_preference_keeps_lower_preference_tier_first() {
        let records = vec![
            dns::MxRecord { preference: 20, host: "backup.example.com".to_string() },
            dns::MxRecord { preference: 10, host: "primary-a.example.com".to_string() },
            dns::MxRecord { preference: 10, host: "primary-b.example.com".to_string() },
        ];
        let hosts = shuffle_within_preference(records);
        assert_eq!(hosts.len(), 3);
        assert_eq!(hosts[2], "backup.example.com");
        assert!(hosts[..2].contains(&"primary-a.example.com".to_string()));
        assert!(hosts[..2].contains(&"primary-b.example.com".to_string()));
    }

    #[test]
    fn stuff_dots_doubles_leading_dot() {
        let body = b".leading\r\nplain\r\n..already\r\n";
        assert_eq!(stuff_dots(body), b"..leading\r\nplain\r\n...already\r\n".to_vec());
    }

    #[test]
    fn stuff_then_unstuff_round_trips() {
        let body = b".leading dot\r\nplain line\r\n..two dots\r\n";
        let stuffed = stuff_dots(body);
        let unstuffed = crate::session::unstuff_dots(&stuffed);
        assert_eq!(unstuffed, body.to_vec());
    }
}
