/*
 * SPDX-FileCopyrightText: 2020 Fannst B.V. <hello@fannst.nl>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Structured event logging used by every other crate in this workspace.
//!
//! `trc` is a thin façade over [`tracing`]: rather than each crate picking
//! its own ad hoc log message shapes, protocol and background-worker events
//! are named (`EventType`) and carry a small set of well-known fields. This
//! keeps the session state machine's log lines greppable across the whole
//! pipeline (one event name per transition) while still flowing through the
//! ordinary `tracing` subscriber/formatter ecosystem.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    OnceLock,
};

use ahash::AHashMap;
use parking_lot::Mutex;

pub use tracing::{self, Span};

/// Named events raised by the core subsystems. Grouped by crate so a reader
/// scanning logs can tell at a glance which subsystem emitted a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    // smtp inbound
    ConnectionStart,
    ConnectionEnd,
    TlsHandshakeStart,
    TlsHandshakeSuccess,
    TlsHandshakeError,
    CommandReceived,
    ResponseSent,
    BadSequence,
    AuthSuccess,
    AuthFailure,
    MailFromAccepted,
    MailFromRejected,
    RcptToAccepted,
    RcptToRejected,
    DataStart,
    DataTooLarge,
    DataComplete,
    SuGranted,
    SuDenied,

    // smtp outbound
    RelayConnect,
    RelayConnectError,
    RelayDeliverSuccess,
    RelayDeliverError,
    BounceGenerated,
    BounceSuppressed,

    // workers
    StorageAttempt,
    StorageSuccess,
    StorageError,
    QueueBackpressure,

    // authentication
    SpfEvaluated,
    DkimVerified,
    DkimSigned,
    DmarcEvaluated,

    // dns
    DnsQuery,
    DnsQueryError,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ConnectionStart => "connection.start",
            EventType::ConnectionEnd => "connection.end",
            EventType::TlsHandshakeStart => "tls.handshake.start",
            EventType::TlsHandshakeSuccess => "tls.handshake.success",
            EventType::TlsHandshakeError => "tls.handshake.error",
            EventType::CommandReceived => "command.received",
            EventType::ResponseSent => "response.sent",
            EventType::BadSequence => "command.bad_sequence",
            EventType::AuthSuccess => "auth.success",
            EventType::AuthFailure => "auth.failure",
            EventType::MailFromAccepted => "mail_from.accepted",
            EventType::MailFromRejected => "mail_from.rejected",
            EventType::RcptToAccepted => "rcpt_to.accepted",
            EventType::RcptToRejected => "rcpt_to.rejected",
            EventType::DataStart => "data.start",
            EventType::DataTooLarge => "data.too_large",
            EventType::DataComplete => "data.complete",
            EventType::SuGranted => "su.granted",
            EventType::SuDenied => "su.denied",
            EventType::RelayConnect => "relay.connect",
            EventType::RelayConnectError => "relay.connect_error",
            EventType::RelayDeliverSuccess => "relay.deliver_success",
            EventType::RelayDeliverError => "relay.deliver_error",
            EventType::BounceGenerated => "bounce.generated",
            EventType::BounceSuppressed => "bounce.suppressed",
            EventType::StorageAttempt => "storage.attempt",
            EventType::StorageSuccess => "storage.success",
            EventType::StorageError => "storage.error",
            EventType::QueueBackpressure => "queue.backpressure",
            EventType::SpfEvaluated => "spf.evaluated",
            EventType::DkimVerified => "dkim.verified",
            EventType::DkimSigned => "dkim.signed",
            EventType::DmarcEvaluated => "dmarc.evaluated",
            EventType::DnsQuery => "dns.query",
            EventType::DnsQueryError => "dns.query_error",
        }
    }
}

/// Emits a structured event at the given tracing level. Prefer the
/// [`event`] macro in calling code; this function exists so the macro stays
/// a thin wrapper instead of duplicating the `tracing` dispatch per level.
#[doc(hidden)]
pub fn dispatch(level: tracing::Level, ty: EventType, fields: &[(&str, &dyn std::fmt::Display)]) {
    counters().lock().bump(ty);
    let name = ty.as_str();
    match level {
        tracing::Level::ERROR => tracing::error!(event = name, fields = %fields_display(fields)),
        tracing::Level::WARN => tracing::warn!(event = name, fields = %fields_display(fields)),
        tracing::Level::INFO => tracing::info!(event = name, fields = %fields_display(fields)),
        tracing::Level::DEBUG => tracing::debug!(event = name, fields = %fields_display(fields)),
        tracing::Level::TRACE => tracing::trace!(event = name, fields = %fields_display(fields)),
    }
}

fn fields_display(fields: &[(&str, &dyn std::fmt::Display)]) -> String {
    let mut out = String::new();
    for (k, v) in fields {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(k);
        out.push('=');
        out.push_str(&v.to_string());
    }
    out
}

/// Logs a named event. Usage: `trc::event!(DEBUG, EventType::DataStart, "peer" = peer_ip, "size" = len);`
#[macro_export]
macro_rules! event {
    ($level:ident, $ty:expr $(, $k:literal = $v:expr)* $(,)?) => {
        $crate::dispatch(
            $crate::tracing::Level::$level,
            $ty,
            &[$(($k, &$v as &dyn std::fmt::Display)),*],
        )
    };
}

/// Process-lifetime counters per event type, exposed for simple ambient
/// metrics. A full `prometheus` exporter is out of scope here; this is the
/// minimal in-memory stand-in other crates can query in tests.
#[derive(Default)]
pub struct Counters {
    counts: AHashMap<EventType, u64>,
}

impl Counters {
    fn bump(&mut self, ty: EventType) {
        *self.counts.entry(ty).or_insert(0) += 1;
    }

    pub fn get(&self, ty: EventType) -> u64 {
        self.counts.get(&ty).copied().unwrap_or(0)
    }
}

static COUNTERS: OnceLock<Mutex<Counters>> = OnceLock::new();

fn counters() -> &'static Mutex<Counters> {
    COUNTERS.get_or_init(|| Mutex::new(Counters::default()))
}

pub fn counters_snapshot() -> Vec<(EventType, u64)> {
    counters()
        .lock()
        .counts
        .iter()
        .map(|(k, v)| (*k, *v))
        .collect()
}

/// Monotonically increasing id used to correlate a session's log lines
/// across a connection's lifetime.
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Installs a process-wide `tracing` subscriber reading `RUST_LOG`,
/// defaulting to `info`. Call once from `main`.
pub fn init_subscriber() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_per_event_type() {
        let before = counters().lock().get(EventType::DataStart);
        event!(DEBUG, EventType::DataStart, "peer" = "127.0.0.1");
        let after = counters().lock().get(EventType::DataStart);
        assert_eq!(after, before + 1);
    }

    #[test]
    fn event_names_are_stable() {
        assert_eq!(EventType::MailFromAccepted.as_str(), "mail_from.accepted");
        assert_eq!(EventType::DataTooLarge.as_str(), "data.too_large");
    }
}
