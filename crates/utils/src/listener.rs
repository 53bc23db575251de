/*
 * SPDX-FileCopyrightText: 2020 Fannst B.V. <hello@fannst.nl>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Listener bring-up shared by the plain and implicit-TLS acceptors.

use std::{
    io,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::{rustls, TlsAcceptor};

/// Which role a listener plays, used only to select the advertised
/// capability set and whether `STARTTLS` is offered at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerProtocol {
    /// Port 25/587-style: plain text, `STARTTLS` available.
    SmtpStartTls,
    /// Port 465-style: implicit TLS, no `STARTTLS`.
    SmtpImplicitTls,
}

/// Static, immutable per-listener configuration. One instance is shared
/// (via `Arc`) across every connection accepted on that listener.
pub struct ServerInstance {
    pub id: String,
    pub listener_id: u16,
    pub protocol: ServerProtocol,
    pub hostname: String,
    pub max_message_size: usize,
    pub tls_acceptor: Option<TlsAcceptor>,
    pub limiter: ConcurrencyLimiter,
}

impl ServerInstance {
    pub fn is_implicit_tls(&self) -> bool {
        matches!(self.protocol, ServerProtocol::SmtpImplicitTls)
    }

    pub fn offers_starttls(&self) -> bool {
        matches!(self.protocol, ServerProtocol::SmtpStartTls) && self.tls_acceptor.is_some()
    }
}

/// Bounds the number of concurrently accepted connections on one listener;
/// exceeding it is this crate's half of the backpressure contract (the
/// other half, queue-depth backpressure, lives in `smtp::queue`).
#[derive(Default)]
pub struct ConcurrencyLimiter {
    max: usize,
    current: Arc<AtomicUsize>,
}

impl Clone for ConcurrencyLimiter {
    fn clone(&self) -> Self {
        ConcurrencyLimiter { max: self.max, current: self.current.clone() }
    }
}

impl ConcurrencyLimiter {
    pub fn new(max: usize) -> Self {
        ConcurrencyLimiter {
            max,
            current: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Attempts to reserve a slot; returns `None` if the listener is at
    /// capacity. The returned guard releases the slot on drop. Does not
    /// require its own `Arc` wrapper: the counter itself is reference
    /// counted, so a [`ServerInstance`] can embed this by value and every
    /// accepted connection still shares the same count.
    pub fn try_acquire(&self) -> Option<InFlight> {
        if self.max == 0 {
            return Some(InFlight { current: None });
        }
        let mut current = self.current.load(Ordering::Acquire);
        loop {
            if current >= self.max {
                return None;
            }
            match self.current.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(InFlight {
                        current: Some(self.current.clone()),
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.current.load(Ordering::Acquire) > 0
    }
}

/// RAII guard releasing a [`ConcurrencyLimiter`] slot on drop.
pub struct InFlight {
    current: Option<Arc<AtomicUsize>>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(current) = &self.current {
            current.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Loads a PEM certificate chain + private key from disk, the shape
/// consumed by the `TLS cert/key paths` entry in the environment-
/// variable table.
pub fn load_tls_acceptor(
    cert_path: &Path,
    key_path: &Path,
) -> io::Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    let bytes = std::fs::read(path)?;
    rustls_pemfile::certs(&mut bytes.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn load_key(path: &Path) -> io::Result<PrivateKeyDer<'static>> {
    let bytes = std::fs::read(path)?;
    rustls_pemfile::private_key(&mut bytes.as_slice())?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no private key found"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limiter_rejects_past_capacity() {
        let limiter = Arc::new(ConcurrencyLimiter::new(1));
        let first = limiter.try_acquire();
        assert!(first.is_some());
        assert!(limiter.try_acquire().is_none());
        drop(first);
        assert!(limiter.try_acquire().is_some());
    }

    #[test]
    fn limiter_zero_means_unbounded() {
        let limiter = Arc::new(ConcurrencyLimiter::new(0));
        let _a = limiter.try_acquire().unwrap();
        let _b = limiter.try_acquire().unwrap();
    }
}
