/*
 * SPDX-FileCopyrightText: 2020 Fannst B.V. <hello@fannst.nl>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Configuration, the envelope model, `X-Fannst-Flags` parsing, and
//! per-key throttling shared by the inbound and outbound SMTP crates.

pub mod config;
pub mod envelope;
pub mod flags;
pub mod throttle;

pub use config::{Configuration, DkimSigner, MailAuthConfig, QueueConfig, SessionConfig, VerifyStrategy};
pub use envelope::{Envelope, EnvelopeKey};
pub use flags::FannstFlags;
pub use throttle::Limiter;
