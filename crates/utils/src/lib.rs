/*
 * SPDX-FileCopyrightText: 2020 Fannst B.V. <hello@fannst.nl>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Framed byte transport shared by every SMTP role: a
//! bounded read-to-delimiter, a plain write, and an in-place TLS upgrade.
//!
//! This is deliberately the lowest layer in the workspace — it knows
//! nothing about SMTP syntax, only about bytes and deadlines. The session
//! state machines in `smtp` build their command/response codec on top of
//! [`Conn::read_to_delim`] and [`Conn::write_all`].

pub mod listener;
pub mod net;

pub use net::{Conn, Error};
