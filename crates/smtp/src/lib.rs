/*
 * SPDX-FileCopyrightText: 2020 Fannst B.V. <hello@fannst.nl>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! ESMTP server and client session state machines, the wire codec they
//! share, and the storage/relay background workers that process a message
//! after a session hands it off.

pub mod bounce;
pub mod client;
pub mod codec;
pub mod handoff;
pub mod session;
pub mod workers;

pub use handoff::SessionHandoff;
pub use session::{Session, SessionParameters};
pub use workers::WorkerContext;
