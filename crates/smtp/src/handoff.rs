/*
 * SPDX-FileCopyrightText: 2020 Fannst B.V. <hello@fannst.nl>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! `SessionHandoff`: everything the storage and relay workers need about a
//! fully-received message, detached from the session that received it so
//! the session can move on (or close) without waiting on either worker.

use std::net::IpAddr;

use common::FannstFlags;

/// One local mailbox the storage worker must write a copy into.
#[derive(Debug, Clone)]
pub struct LocalTarget {
    pub domain: String,
    pub mailbox: String,
    pub owner_id: String,
    pub bucket: u64,
    pub sender_display: String,
}

/// The per-mechanism outcome summary attached as an `Authentication-Results`
/// style header and used by the bounce template.
#[derive(Debug, Clone, Default)]
pub struct AuthResultsSummary {
    pub spf: String,
    pub dkim: String,
    pub dmarc: String,
    pub su: Option<String>,
    pub auth: Option<String>,
}

impl AuthResultsSummary {
    /// Renders `spf=pass dkim=pass dmarc=pass` (omitting absent mechanisms),
    /// the form prepended in the `Received:` annotation.
    pub fn render(&self) -> String {
        let mut parts = vec![format!("spf={}", self.spf), format!("dkim={}", self.dkim), format!("dmarc={}", self.dmarc)];
        if let Some(su) = &self.su {
            parts.push(format!("su={su}"));
        }
        if let Some(auth) = &self.auth {
            parts.push(format!("auth={auth}"));
        }
        parts.join(" ")
    }
}

/// A message that has cleared the server session's DATA state and is ready
/// for the storage and relay workers. Constructed once, by value, so
/// ownership moves cleanly onto the worker queue.
#[derive(Debug, Clone)]
pub struct SessionHandoff {
    pub message_id: String,
    pub raw_message: Vec<u8>,
    pub sender: String,
    pub sender_domain: String,
    pub local_targets: Vec<LocalTarget>,
    pub remote_targets: Vec<String>,
    pub authenticated_as: Option<String>,
    pub flags: FannstFlags,
    pub remote_ip: IpAddr,
    pub listener_id: u16,
    pub auth_results: AuthResultsSummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_omits_absent_optional_mechanisms() {
        let summary = AuthResultsSummary {
            spf: "pass".into(),
            dkim: "pass".into(),
            dmarc: "pass".into(),
            su: None,
            auth: None,
        };
        assert_eq!(summary.render(), "spf=pass dkim=pass dmarc=pass");
    }

    #[test]
    fn render_includes_su_when_granted() {
        let summary = AuthResultsSummary {
            spf: "pass".into(),
            dkim: "neutral".into(),
            dmarc: "none".into(),
            su: Some("pass".into()),
            auth: Some("alice@ex.com".into()),
        };
        assert_eq!(summary.render(), "spf=pass dkim=neutral dmarc=none su=pass auth=alice@ex.com");
    }
}
