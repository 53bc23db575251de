/*
 * SPDX-FileCopyrightText: 2020 Fannst B.V. <hello@fannst.nl>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Signing/verifying key abstraction for DKIM: `rsa-sha1` and
//! `rsa-sha256`, the two algorithms `DkimSignature.a` is allowed to name.

use rsa::{
    pkcs1::DecodeRsaPrivateKey,
    pkcs1v15::{SigningKey as RsaSigningKeyInner, VerifyingKey as RsaVerifyingKeyInner},
    pkcs8::DecodePublicKey,
    signature::{SignatureEncoding, Signer as RsaSigner, Verifier as RsaVerifier},
    RsaPrivateKey, RsaPublicKey,
};
use sha1::Sha1;
use sha2::Sha256;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    RsaSha1,
    RsaSha256,
}

impl Algorithm {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "rsa-sha1" => Some(Algorithm::RsaSha1),
            "rsa-sha256" => Some(Algorithm::RsaSha256),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::RsaSha1 => "rsa-sha1",
            Algorithm::RsaSha256 => "rsa-sha256",
        }
    }

    pub fn hash(&self, data: &[u8]) -> Vec<u8> {
        use sha1::Digest as Sha1Digest;
        use sha2::Digest as Sha2Digest;
        match self {
            Algorithm::RsaSha1 => Sha1::digest(data).to_vec(),
            Algorithm::RsaSha256 => Sha256::digest(data).to_vec(),
        }
    }
}

pub struct SigningKey {
    inner: RsaPrivateKey,
    algorithm: Algorithm,
}

impl SigningKey {
    pub fn from_rsa_pkcs1_pem(pem: &str, algorithm: Algorithm) -> Result<Self> {
        let inner = RsaPrivateKey::from_pkcs1_pem(pem).map_err(|e| Error::Crypto(e.to_string()))?;
        Ok(SigningKey { inner, algorithm })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Derives the corresponding public key, for tests and for operators
    /// publishing a fresh DKIM DNS record.
    pub fn to_verifying_key(&self) -> VerifyingKey {
        VerifyingKey {
            inner: self.inner.to_public_key(),
        }
    }

    /// Signs the already-canonicalized header stream.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self.algorithm {
            Algorithm::RsaSha1 => {
                let signing_key = RsaSigningKeyInner::<Sha1>::new(self.inner.clone());
                let signature = signing_key
                    .try_sign(data)
                    .map_err(|e| Error::Crypto(e.to_string()))?;
                Ok(signature.to_vec())
            }
            Algorithm::RsaSha256 => {
                let signing_key = RsaSigningKeyInner::<Sha256>::new(self.inner.clone());
                let signature = signing_key
                    .try_sign(data)
                    .map_err(|e| Error::Crypto(e.to_string()))?;
                Ok(signature.to_vec())
            }
        }
    }
}

pub struct VerifyingKey {
    inner: RsaPublicKey,
}

impl VerifyingKey {
    /// Parses the `p=` tag of a DKIM DNS TXT record: a base64 DER-encoded
    /// SubjectPublicKeyInfo, with a PKCS#1 fallback for older records.
    pub fn from_public_key_der(der: &[u8]) -> Result<Self> {
        let inner = RsaPublicKey::from_public_key_der(der)
            .or_else(|_| rsa::pkcs1::DecodeRsaPublicKey::from_pkcs1_der(der))
            .map_err(|e| Error::Crypto(e.to_string()))?;
        Ok(VerifyingKey { inner })
    }

    pub fn verify(&self, algorithm: Algorithm, data: &[u8], signature: &[u8]) -> Result<()> {
        match algorithm {
            Algorithm::RsaSha1 => {
                let verifying_key = RsaVerifyingKeyInner::<Sha1>::new(self.inner.clone());
                let sig =
                    rsa::pkcs1v15::Signature::try_from(signature).map_err(|_| Error::FailedVerification)?;
                verifying_key
                    .verify(data, &sig)
                    .map_err(|_| Error::FailedVerification)
            }
            Algorithm::RsaSha256 => {
                let verifying_key = RsaVerifyingKeyInner::<Sha256>::new(self.inner.clone());
                let sig =
                    rsa::pkcs1v15::Signature::try_from(signature).map_err(|_| Error::FailedVerification)?;
                verifying_key
                    .verify(data, &sig)
                    .map_err(|_| Error::FailedVerification)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY_PEM: &str = include_str!("../testdata/rsa_test_key.pem");

    #[test]
    fn signs_and_verifies_round_trip() {
        let signing = SigningKey::from_rsa_pkcs1_pem(TEST_KEY_PEM, Algorithm::RsaSha256).unwrap();
        let signature = signing.sign(b"hello dkim").unwrap();

        signing
            .to_verifying_key()
            .verify(Algorithm::RsaSha256, b"hello dkim", &signature)
            .unwrap();
    }

    #[test]
    fn verification_fails_on_tampered_data() {
        let signing = SigningKey::from_rsa_pkcs1_pem(TEST_KEY_PEM, Algorithm::RsaSha256).unwrap();
        let signature = signing.sign(b"hello dkim").unwrap();

        assert!(signing
            .to_verifying_key()
            .verify(Algorithm::RsaSha256, b"tampered", &signature)
            .is_err());
    }
}
