/*
 * SPDX-FileCopyrightText: 2020 Fannst B.V. <hello@fannst.nl>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! SPF, DKIM and DMARC evaluation.

pub mod canon;
pub mod crypto;
pub mod dkim;
pub mod dmarc;
pub mod spf;

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    MissingParameters,
    Base64,
    Crypto(String),
    UnsupportedAlgorithm,
    UnsupportedCanonicalization,
    FailedBodyHashMatch,
    FailedVerification,
    RevokedPublicKey,
    DnsError(String),
    DnsRecordNotFound,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MissingParameters => write!(f, "missing required tag"),
            Error::Base64 => write!(f, "base64 decode error"),
            Error::Crypto(e) => write!(f, "cryptography error: {e}"),
            Error::UnsupportedAlgorithm => write!(f, "unsupported signature algorithm"),
            Error::UnsupportedCanonicalization => write!(f, "unsupported canonicalization"),
            Error::FailedBodyHashMatch => write!(f, "body hash does not match bh= tag"),
            Error::FailedVerification => write!(f, "signature verification failed"),
            Error::RevokedPublicKey => write!(f, "public key has been revoked"),
            Error::DnsError(e) => write!(f, "dns error: {e}"),
            Error::DnsRecordNotFound => write!(f, "dkim dns record not found"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
