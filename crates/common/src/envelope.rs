/*
 * SPDX-FileCopyrightText: 2020 Fannst B.V. <hello@fannst.nl>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The envelope view a session, a throttle key, or an expanded bounce
//! template all read from. Implemented once by the server session and once
//! by the outbound client conversation, so throttling and logging code
//! never need to know which side of a connection produced a given message.

use std::{borrow::Cow, net::IpAddr};

/// Named fields a caller can pull out of an [`Envelope`] without matching on
/// a concrete session type. Used to build throttle keys and to expand the
/// bounce-notification template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKey {
    Recipient,
    RecipientDomain,
    Sender,
    SenderDomain,
    HeloDomain,
    AuthenticatedAs,
    Listener,
    RemoteIp,
}

pub trait Envelope {
    fn remote_ip(&self) -> IpAddr;
    fn sender_domain(&self) -> &str;
    fn sender(&self) -> &str;
    fn rcpt_domain(&self) -> &str;
    fn rcpt(&self) -> &str;
    fn helo_domain(&self) -> &str;
    fn authenticated_as(&self) -> &str;
    fn listener_id(&self) -> u16;

    #[inline(always)]
    fn key_to_string(&self, key: &EnvelopeKey) -> Cow<'_, str> {
        match key {
            EnvelopeKey::Recipient => self.rcpt().into(),
            EnvelopeKey::RecipientDomain => self.rcpt_domain().into(),
            EnvelopeKey::Sender => self.sender().into(),
            EnvelopeKey::SenderDomain => self.sender_domain().into(),
            EnvelopeKey::HeloDomain => self.helo_domain().into(),
            EnvelopeKey::AuthenticatedAs => self.authenticated_as().into(),
            EnvelopeKey::Listener => self.listener_id().to_string().into(),
            EnvelopeKey::RemoteIp => self.remote_ip().to_string().into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    struct FakeEnvelope;

    impl Envelope for FakeEnvelope {
        fn remote_ip(&self) -> IpAddr {
            IpAddr::V4(Ipv4Addr::new(203, 0, 113, 4))
        }
        fn sender_domain(&self) -> &str {
            "example.com"
        }
        fn sender(&self) -> &str {
            "alice@example.com"
        }
        fn rcpt_domain(&self) -> &str {
            "ex.org"
        }
        fn rcpt(&self) -> &str {
            "bob@ex.org"
        }
        fn helo_domain(&self) -> &str {
            "mail.example.com"
        }
        fn authenticated_as(&self) -> &str {
            "alice@example.com"
        }
        fn listener_id(&self) -> u16 {
            25
        }
    }

    #[test]
    fn key_to_string_dispatches_every_variant() {
        let env = FakeEnvelope;
        assert_eq!(env.key_to_string(&EnvelopeKey::Sender), "alice@example.com");
        assert_eq!(env.key_to_string(&EnvelopeKey::RecipientDomain), "ex.org");
        assert_eq!(env.key_to_string(&EnvelopeKey::RemoteIp), "203.0.113.4");
        assert_eq!(env.key_to_string(&EnvelopeKey::Listener), "25");
    }
}
