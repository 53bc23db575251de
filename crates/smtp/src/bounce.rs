/*
 * SPDX-FileCopyrightText: 2020 Fannst B.V. <hello@fannst.nl>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Delivery-failure notifications. A bounce is itself an email, sent from
//! `bounce_sender` back to the original sender; [`build`] produces its raw
//! RFC 5322 bytes, ready to hand to the same client session used for
//! ordinary relay.
//!
//! Loop prevention lives in the caller
//! ([`crate::workers::maybe_bounce`]): a message whose sender already *is*
//! the bounce address never reaches this module.

/// Builds a plain-text bounce notification addressed to `original_sender`,
/// listing the recipients that could not be delivered to and the reason.
pub fn build(bounce_sender: &str, original_sender: &str, failed_recipients: &[&str], reason: &str, original_message_id: &str) -> Vec<u8> {
    let date = chrono::Utc::now().to_rfc2822();
    let recipient_list = failed_recipients.join(", ");

    let body = format!(
        "This is the mail delivery system at {bounce_sender}.\r\n\r\n\
         Your message could not be delivered to the following recipient(s):\r\n\r\n\
         {recipient_list}\r\n\r\n\
         Reason: {reason}\r\n\r\n\
         This is an automatically generated message; do not reply.\r\n"
    );

    let mut out = String::new();
    out.push_str(&format!("From: Mail Delivery System <{bounce_sender}>\r\n"));
    out.push_str(&format!("To: <{original_sender}>\r\n"));
    out.push_str("Subject: Undelivered Mail Returned to Sender\r\n");
    out.push_str(&format!("Date: {date}\r\n"));
    out.push_str(&format!("In-Reply-To: <{original_message_id}>\r\n"));
    out.push_str("Auto-Submitted: auto-replied\r\n");
    out.push_str("Content-Type: text/plain; charset=utf-8\r\n");
    out.push_str("\r\n");
    out.push_str(&body);

    out.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_includes_reason_and_failed_recipients() {
        let raw = build("mailer-daemon@example.com", "alice@elsewhere.example", &["bob@remote.example"], "connection refused", "abc-1");
        let text = String::from_utf8(raw).unwrap();
        assert!(text.contains("bob@remote.example"));
        assert!(text.contains("connection refused"));
        assert!(text.contains("Auto-Submitted: auto-replied"));
        assert!(text.starts_with("From: Mail Delivery System <mailer-daemon@example.com>"));
    }

    #[test]
    fn build_is_addressed_to_the_original_sender() {
        let raw = build("mailer-daemon@example.com", "alice@elsewhere.example", &[], "timeout", "xyz-2");
        let text = String::from_utf8(raw).unwrap();
        assert!(text.contains("To: <alice@elsewhere.example>\r\n"));
    }
}
