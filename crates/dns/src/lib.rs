/*
 * SPDX-FileCopyrightText: 2020 Fannst B.V. <hello@fannst.nl>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Blocking-shaped (but `async`) stub DNS queries for the record types
//! email authentication needs. Every query returns a distinct error
//! kind so SPF/DKIM/DMARC can map `ServFail`/`Timeout` to temporary
//! outcomes and `NxDomain` to permanent ones.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use hickory_resolver::{
    config::{ResolverConfig, ResolverOpts},
    error::{ResolveError, ResolveErrorKind},
    TokioAsyncResolver,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    ServFail,
    NxDomain,
    Timeout,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ServFail => write!(f, "server failure"),
            Error::NxDomain => write!(f, "domain does not exist"),
            Error::Timeout => write!(f, "query timed out"),
        }
    }
}

impl std::error::Error for Error {}

impl From<ResolveError> for Error {
    fn from(err: ResolveError) -> Self {
        match err.kind() {
            ResolveErrorKind::NoRecordsFound { .. } => Error::NxDomain,
            ResolveErrorKind::Timeout => Error::Timeout,
            _ => Error::ServFail,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A single MX record: `preference` ascending is more preferred (lower
/// number wins).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    pub preference: u16,
    pub host: String,
}

/// Thin wrapper over a stub resolver. Cheap to clone (the underlying
/// `TokioAsyncResolver` is reference-counted internally).
#[derive(Clone)]
pub struct Resolver {
    inner: TokioAsyncResolver,
}

impl Resolver {
    /// Builds a resolver from the system's configured nameservers
    /// (`/etc/resolv.conf` on Unix).
    pub fn new_system() -> Result<Self> {
        let (cfg, opts) =
        hickory_resolver::system_conf::read_system_conf().map_err(|_| Error::ServFail)?;
        Ok(Resolver {
                inner: TokioAsyncResolver::tokio(cfg, opts),
        })
    }

    /// Builds a resolver against a fixed set of nameservers, primarily
    /// useful for tests and for operators without a usable system config.
    pub fn new_cloudflare() -> Self {
        Resolver {
            inner: TokioAsyncResolver::tokio(ResolverConfig::cloudflare_tls(), ResolverOpts::default()),
        }
    }

    /// MX records sorted ascending by preference.
    pub async fn query_mx(&self, name: &str) -> Result<Vec<MxRecord>> {
        let lookup = self.inner.mx_lookup(name).await?;
        let mut records: Vec<MxRecord> = lookup
        .iter()
        .map(|mx| MxRecord {
                preference: mx.preference(),
                host: mx.exchange().to_utf8().trim_end_matches('.').to_string(),
        })
        .collect();
        records.sort_by_key(|r| r.preference);
        Ok(records)
    }

    pub async fn query_a(&self, name: &str) -> Result<Vec<Ipv4Addr>> {
        let lookup = self.inner.ipv4_lookup(name).await?;
        Ok(lookup.iter().map(|r| r.0).collect())
    }

    pub async fn query_aaaa(&self, name: &str) -> Result<Vec<Ipv6Addr>> {
        let lookup = self.inner.ipv6_lookup(name).await?;
        Ok(lookup.iter().map(|r| r.0).collect())
    }

    /// Resolves both families, A first then AAAA, used where SPF/relay
    /// logic doesn't care about the family.
    pub async fn query_ip(&self, name: &str) -> Result<Vec<IpAddr>> {
        let mut out = Vec::new();
        if let Ok(v4) = self.query_a(name).await {
            out.extend(v4.into_iter().map(IpAddr::V4));
        }
        if let Ok(v6) = self.query_aaaa(name).await {
            out.extend(v6.into_iter().map(IpAddr::V6));
        }
        if out.is_empty() {
            return Err(Error::NxDomain);
        }
        Ok(out)
    }

    /// TXT strings decoded and printable-ASCII filtered (control
    /// bytes introduced by on-wire chunking are stripped).
    pub async fn query_txt(&self, name: &str) -> Result<Vec<String>> {
        let lookup = self.inner.txt_lookup(name).await?;
        Ok(lookup
            .iter()
            .map(|record| {
                    record
                    .txt_data()
                    .iter()
                    .flat_map(|chunk| chunk.iter().copied())
                    .filter(|b| b.is_ascii_graphic() || *b == b' ')
                    .map(|b| b as char)
                    .collect::<String>()
            })
            .collect())
    }

    /// Reverse DNS (PTR) lookup, used by `iprev`/`ptr:` SPF mechanisms.
    pub async fn reverse_lookup(&self, ip: IpAddr) -> Result<Vec<String>> {
        let lookup = self.inner.reverse_lookup(ip).await?;
        let names: Vec<String> = lookup
        .iter()
        .map(|name| name.to_utf8().trim_end_matches('.').to_string())
        .collect();
        if names.is_empty() {
            Err(Error::NxDomain)
        } else {
            Ok(names)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mx_records_sort_ascending_by_preference() {
        let mut records = vec![
            MxRecord { preference: 20, host: "b.example.com".into() },
            MxRecord { preference: 10, host: "a.example.com".into() },
        ];
        records.sort_by_key(|r| r.preference);
        assert_eq!(records[0].host, "a.example.com");
    }

    #[test]
    fn error_from_resolve_error_maps_nxdomain() {
        // ResolveErrorKind isn't publicly constructible for NoRecordsFound
        // without its full field set; this is covered transitively by the
        // `From` impl compiling and by integration tests in `authentication`.
    }
}
