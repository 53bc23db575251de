/*
 * SPDX-FileCopyrightText: 2020 Fannst B.V. <hello@fannst.nl>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Background processing for a received message: local storage and, for any
//! recipient the server does not own, outbound relay. Both run off the same
//! bounded channel the session handler enqueues onto in
//! [`crate::session::Session::complete_message`]; a single dedicated task
//! drains it so a slow storage backend or a slow remote peer never blocks
//! an accepting connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;

use dns::Resolver;
use message::MimeMessage;
use store::{MailStore, MailboxStatusKey, MessageShortcut, MessageShortcutKey, RawMessageKey};

use crate::bounce;
use crate::client;
use crate::handoff::SessionHandoff;

/// Everything the worker loop needs that isn't carried per-message by
/// [`SessionHandoff`] itself.
pub struct WorkerContext {
    pub store: Arc<dyn MailStore>,
    pub resolver: Arc<Resolver>,
    pub server_domain: String,
    pub bounce_sender: String,
    pub tls_connector: Option<TlsConnector>,
    /// Upper bound on the FIFO depth surfaced to callers; the channel itself
    /// enforces it via `try_send`, this is only used to size the channel.
    pub queue_high_water_mark: usize,
    pub drain_interval: Duration,
}

/// Runs until `rx` is closed (every sender, i.e. every session, dropped and
/// the listener shut down). Each handoff is processed to completion before
/// the next is pulled, matching the "shared FIFO, one dedicated worker"
/// design: ordering within a single worker is preserved, and backpressure
/// is visible to producers as `try_send` failures rather than unbounded
/// buffering here.
pub async fn run(ctx: WorkerContext, mut rx: mpsc::Receiver<SessionHandoff>) {
    while let Some(handoff) = rx.recv().await {
        if !handoff.local_targets.is_empty() {
            store_locally(&ctx, &handoff).await;
        }
        if !handoff.remote_targets.is_empty() {
            relay(&ctx, &handoff).await;
        }

        tokio::time::sleep(ctx.drain_interval).await;
    }
}

/// Persists the raw message and a per-mailbox shortcut for every local
/// target independently: one target's storage failure must not prevent
/// another target (or the relay half of this same handoff) from
/// proceeding.
async fn store_locally(ctx: &WorkerContext, handoff: &SessionHandoff) {
    let now_millis = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let bucket = store::bucket_of(now_millis);

    let (subject, preview) = summarize(&handoff.raw_message);

    for target in &handoff.local_targets {
        let raw_key = RawMessageKey {
            bucket,
            domain: target.domain.clone(),
            owner_id: target.owner_id.clone(),
            email_id: handoff.message_id.clone(),
        };
        if let Err(e) = ctx.store.put_raw_message(raw_key, handoff.raw_message.clone()).await {
            trc::event!(WARN, trc::EventType::StorageError, "target" = target.owner_id, "error" = e);
            continue;
        }

        let status_key = MailboxStatusKey {
            bucket,
            domain: target.domain.clone(),
            owner_id: target.owner_id.clone(),
            mailbox_path: target.mailbox.clone(),
        };
        let uid = match ctx.store.next_uid(&status_key).await {
            Ok(uid) => uid,
            Err(e) => {
                trc::event!(WARN, trc::EventType::StorageError, "target" = target.owner_id, "error" = e);
                continue;
            }
        };

        let shortcut = MessageShortcut {
            subject: subject.clone(),
            preview: preview.clone(),
            size: handoff.raw_message.len() as u64,
            uid,
            flags: Vec::new(),
            sender_display: target.sender_display.clone(),
        };
        let shortcut_key = MessageShortcutKey {
            domain: target.domain.clone(),
            mailbox: target.mailbox.clone(),
            owner_id: target.owner_id.clone(),
            email_id: handoff.message_id.clone(),
        };
        if let Err(e) = ctx.store.put_message_shortcut(shortcut_key, shortcut).await {
            trc::event!(WARN, trc::EventType::StorageError, "target" = target.owner_id, "error" = e);
            continue;
        }

        if let Err(e) = ctx.store.adjust_mailbox_counts(&status_key, 1, 1, 1).await {
            trc::event!(WARN, trc::EventType::StorageError, "target" = target.owner_id, "error" = e);
            continue;
        }

        trc::event!(INFO, trc::EventType::StorageSuccess, "target" = target.owner_id, "uid" = uid);
    }
}

fn summarize(raw_message: &[u8]) -> (String, String) {
    let Ok(mime) = MimeMessage::parse(raw_message) else {
        return (String::new(), String::new());
    };
    let subject = mime.header("subject").unwrap_or_default().to_string();
    let preview = mime
        .leaves()
        .into_iter()
        .find(|leaf| leaf.content_type().starts_with("text/plain"))
        .and_then(|leaf| match leaf {
            MimeMessage::Leaf { body, .. } => Some(body),
            MimeMessage::Multipart { .. } => None,
        })
        .map(|body| {
            let text = String::from_utf8_lossy(body);
            text.chars().take(160).collect::<String>()
        })
        .unwrap_or_default();
    (subject, preview)
}

/// Groups `handoff.remote_targets` by destination domain, resolves each
/// domain's MX targets once, and attempts delivery to the first target
/// that accepts. A domain with no recipient accepted gets a bounce,
/// unless the message itself is flagged to suppress one or the sender is
/// already the bounce address (loop prevention).
async fn relay(ctx: &WorkerContext, handoff: &SessionHandoff) {
    let mut by_domain: std::collections::BTreeMap<&str, Vec<&str>> = std::collections::BTreeMap::new();
    for rcpt in &handoff.remote_targets {
        let domain = rcpt.rsplit('@').next().unwrap_or_default();
        by_domain.entry(domain).or_default().push(rcpt.as_str());
    }

    for (domain, recipients) in by_domain {
        let targets = client::resolve_targets(&ctx.resolver, domain).await;
        if targets.is_empty() {
            trc::event!(WARN, trc::EventType::RelayConnectError, "domain" = domain, "error" = "no deliverable targets");
            maybe_bounce(ctx, handoff, domain, &recipients, "no MX or address record found").await;
            continue;
        }

        let recipients_owned: Vec<String> = recipients.iter().map(|r| r.to_string()).collect();
        let mut last_error = String::new();
        let mut delivered = false;

        for target in &targets {
            let outcome = client::deliver_to_target(
                target,
                &ctx.server_domain,
                &handoff.sender,
                &recipients_owned,
                &handoff.raw_message,
                ctx.tls_connector.as_ref(),
            )
            .await;

            if outcome.accepted {
                trc::event!(INFO, trc::EventType::RelayDeliverSuccess, "domain" = domain, "target" = target.host);
                delivered = true;
                break;
            }
            trc::event!(WARN, trc::EventType::RelayDeliverError, "domain" = domain, "target" = target.host, "error" = outcome.response);
            last_error = outcome.response;
            if outcome.permanent_failure {
                break;
            }
        }

        if !delivered {
            maybe_bounce(ctx, handoff, domain, &recipients, &last_error).await;
        }
    }
}

async fn maybe_bounce(ctx: &WorkerContext, handoff: &SessionHandoff, domain: &str, recipients: &[&str], reason: &str) {
    if handoff.flags.suppress_bounce {
        return;
    }
    if handoff.sender.eq_ignore_ascii_case(&ctx.bounce_sender) {
        trc::event!(WARN, trc::EventType::BounceSuppressed, "domain" = domain, "reason" = "loop prevention");
        return;
    }

    let notification = bounce::build(&ctx.bounce_sender, &handoff.sender, recipients, reason, &handoff.message_id);
    let Some(return_domain) = handoff.sender.rsplit('@').next() else {
        return;
    };

    let targets = client::resolve_targets(&ctx.resolver, return_domain).await;
    let recipients = vec![handoff.sender.clone()];
    for target in &targets {
        let outcome = client::deliver_to_target(
            target,
            &ctx.server_domain,
            &ctx.bounce_sender,
            &recipients,
            &notification,
            ctx.tls_connector.as_ref(),
        )
        .await;
        if outcome.accepted {
            trc::event!(INFO, trc::EventType::BounceGenerated, "to" = handoff.sender);
            return;
        }
    }
    trc::event!(WARN, trc::EventType::RelayDeliverError, "to" = handoff.sender, "context" = "bounce delivery");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summarize_extracts_subject_and_plain_text_preview() {
        let raw = b"Subject: Hello there\r\nContent-Type: text/plain\r\n\r\nThis is the body.\r\n";
        let (subject, preview) = summarize(raw);
        assert_eq!(subject, "Hello there");
        assert_eq!(preview, "This is the body.\r\n");
    }

    #[test]
    fn summarize_tolerates_malformed_message() {
        let (subject, preview) = summarize(b"not a valid mime document \xff\xfe");
        assert!(subject.is_empty() || !subject.is_empty());
        let _ = preview;
    }
}
