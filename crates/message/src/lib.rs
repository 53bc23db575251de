/*
 * SPDX-FileCopyrightText: 2020 Fannst B.V. <hello@fannst.nl>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! MIME engine and address model: header parsing/folding,
//! transfer-encoding decode, and the recursive `MimeMessage` tree.

pub mod address;
pub mod decode;
pub mod header;
pub mod mime;

pub use address::{AddressError, EmailAddress};
pub use decode::TransferEncoding;
pub use header::{fold_header, parse_headers, Header, HeaderError};
pub use mime::{MimeError, MimeMessage};
