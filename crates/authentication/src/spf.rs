/*
 * SPDX-FileCopyrightText: 2020 Fannst B.V. <hello@fannst.nl>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! SPF evaluation (RFC 7208).

use std::net::IpAddr;

use dns::Resolver;

/// RFC 7208 at most 10 DNS-requiring mechanisms/modifiers per
/// evaluation.
const MAX_DNS_LOOKUPS: u32 = 10;
/// RFC 7208 `mx`/`ptr` each limit to 10 returned hosts internally.
const MAX_MX_OR_PTR_HOSTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qualifier {
    Pass,
    Fail,
    SoftFail,
    Neutral,
}

impl Qualifier {
    fn from_prefix(c: Option<char>) -> Self {
        match c {
            Some('-') => Qualifier::Fail,
            Some('~') => Qualifier::SoftFail,
            Some('?') => Qualifier::Neutral,
            _ => Qualifier::Pass,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mechanism {
    All,
    Ip4(std::net::Ipv4Addr, u8),
    Ip6(std::net::Ipv6Addr, u8),
    A { domain: Option<String>, mask: Option<u8> },
    Mx { domain: Option<String>, mask: Option<u8> },
    Ptr { domain: Option<String> },
    Include(String),
    Exists(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpfTerm {
    pub qualifier: Qualifier,
    pub mechanism: Mechanism,
}

/// `SpfRecord`: the parsed `v=spf1 ...` mechanism list plus an optional
/// `redirect=` modifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpfRecord {
    pub terms: Vec<SpfTerm>,
    pub redirect: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfResult {
    Pass,
    Fail,
    SoftFail,
    Neutral,
    None,
    TempError,
    PermError,
}

impl SpfRecord {
    /// Parses a `v=spf1 ...` TXT record value. The first non-whitespace
    /// token must be `v=spf1`.
    pub fn parse(record: &str) -> Option<Self> {
        let mut tokens = record.split_whitespace();
        if tokens.next()?.to_ascii_lowercase() != "v=spf1" {
            return None;
        }

        let mut terms = Vec::new();
        let mut redirect = None;
        for token in tokens {
            if let Some(value) = token.strip_prefix("redirect=") {
                redirect = Some(value.to_string());
                continue;
            }
            if token.contains('=') && !token.starts_with("ip4") && !token.starts_with("ip6") {
                // Unknown modifier (e.g. `exp=`): ignored per RFC 7208.
                continue;
            }
            let mut chars = token.chars();
            let first = chars.clone().next();
            let qualifier = if matches!(first, Some('+') | Some('-') | Some('~') | Some('?')) {
                chars.next();
                Qualifier::from_prefix(first)
            } else {
                Qualifier::Pass
            };
            let rest: String = chars.collect();
            let mechanism = parse_mechanism(&rest)?;
            terms.push(SpfTerm { qualifier, mechanism });
        }

        Some(SpfRecord { terms, redirect })
    }
}

fn parse_mechanism(token: &str) -> Option<Mechanism> {
    let lower = token.to_ascii_lowercase();
    if lower == "all" {
        return Some(Mechanism::All);
    }
    if let Some(rest) = lower.strip_prefix("ip4:") {
        let (addr, mask) = split_cidr(rest);
        return Some(Mechanism::Ip4(addr.parse().ok()?, mask.unwrap_or(32)));
    }
    if let Some(rest) = lower.strip_prefix("ip6:") {
        let (addr, mask) = split_cidr(rest);
        return Some(Mechanism::Ip6(addr.parse().ok()?, mask.unwrap_or(128)));
    }
    if let Some(rest) = lower.strip_prefix("a") {
        let (domain, mask) = parse_domain_mask(rest)?;
        return Some(Mechanism::A { domain, mask });
    }
    if let Some(rest) = lower.strip_prefix("mx") {
        let (domain, mask) = parse_domain_mask(rest)?;
        return Some(Mechanism::Mx { domain, mask });
    }
    if let Some(rest) = lower.strip_prefix("ptr") {
        let (domain, _) = parse_domain_mask(rest)?;
        return Some(Mechanism::Ptr { domain });
    }
    if let Some(rest) = lower.strip_prefix("include:") {
        return Some(Mechanism::Include(rest.to_string()));
    }
    if let Some(rest) = lower.strip_prefix("exists:") {
        return Some(Mechanism::Exists(rest.to_string()));
    }
    None
}

/// Parses the optional `[:<domain>][/mask]` suffix shared by `a` and `mx`.
fn parse_domain_mask(rest: &str) -> Option<(Option<String>, Option<u8>)> {
    if rest.is_empty() {
        return Some((None, None));
    }
    let rest = rest.strip_prefix(':').unwrap_or(rest);
    match rest.split_once('/') {
        Some((domain, mask)) => {
            let domain = if domain.is_empty() { None } else { Some(domain.to_string()) };
            Some((domain, mask.parse().ok()))
        }
        None => {
            if let Some(mask) = rest.strip_prefix('/') {
                Some((None, mask.parse().ok()))
            } else if rest.is_empty() {
                Some((None, None))
            } else {
                Some((Some(rest.to_string()), None))
            }
        }
    }
}

fn split_cidr(value: &str) -> (&str, Option<u8>) {
    match value.split_once('/') {
        Some((addr, mask)) => (addr, mask.parse().ok()),
        None => (value, None),
    }
}

fn ipv4_matches(candidate: std::net::Ipv4Addr, network: std::net::Ipv4Addr, mask: u8) -> bool {
    if mask == 0 {
        return true;
    }
    let shift = 32 - mask.min(32) as u32;
    let candidate_bits = u32::from(candidate) >> shift;
    let network_bits = u32::from(network) >> shift;
    candidate_bits == network_bits
}

fn ipv6_matches(candidate: std::net::Ipv6Addr, network: std::net::Ipv6Addr, mask: u8) -> bool {
    if mask == 0 {
        return true;
    }
    let shift = 128 - mask.min(128) as u32;
    let candidate_bits = u128::from(candidate) >> shift;
    let network_bits = u128::from(network) >> shift;
    candidate_bits == network_bits
}

fn ip_matches_masked(peer: IpAddr, network: IpAddr, mask: u8) -> bool {
    match (peer, network) {
        (IpAddr::V4(p), IpAddr::V4(n)) => ipv4_matches(p, n, mask),
        (IpAddr::V6(p), IpAddr::V6(n)) => ipv6_matches(p, n, mask),
        _ => false,
    }
}

pub struct Evaluator<'a> {
    resolver: &'a Resolver,
    lookups_used: u32,
}

impl<'a> Evaluator<'a> {
    pub fn new(resolver: &'a Resolver) -> Self {
        Evaluator { resolver, lookups_used: 0 }
    }

    fn charge_lookup(&mut self) -> Result<(), SpfResult> {
        self.lookups_used += 1;
        if self.lookups_used > MAX_DNS_LOOKUPS {
            Err(SpfResult::PermError)
        } else {
            Ok(())
        }
    }

    /// Evaluates the SPF policy for `domain` against `peer_ip`.
    pub async fn evaluate(&mut self, domain: &str, peer_ip: IpAddr) -> SpfResult {
        let txts = match self.resolver.query_txt(domain).await {
            Ok(records) => records,
            Err(dns::Error::NxDomain) => return SpfResult::None,
            Err(_) => return SpfResult::TempError,
        };

        let spf_records: Vec<SpfRecord> = txts
        .iter()
        .filter(|t| t.trim_start().to_ascii_lowercase().starts_with("v=spf1"))
        .filter_map(|t| SpfRecord::parse(t))
        .collect();

        match spf_records.len() {
            0 => SpfResult::None,
            1 => self.evaluate_record(&spf_records[0], domain, peer_ip).await,
            _ => SpfResult::PermError,
        }
    }

    async fn evaluate_record(&mut self, record: &SpfRecord, domain: &str, peer_ip: IpAddr) -> SpfResult {
        for term in &record.terms {
            match self.matches(&term.mechanism, domain, peer_ip).await {
                Ok(true) => return qualifier_to_result(term.qualifier),
                Ok(false) => continue,
                Err(result) => return result,
            }
        }

        if let Some(redirect_domain) = &record.redirect {
            if self.charge_lookup().is_err() {
                return SpfResult::PermError;
            }
            // step 4: redirect re-evaluates at the target domain, not
            // a recursion bump against the 10-lookup budget beyond its own
            // charge.
            return Box::pin(self.evaluate(redirect_domain, peer_ip)).await;
        }

        SpfResult::Neutral
    }

    async fn matches(&mut self, mechanism: &Mechanism, domain: &str, peer_ip: IpAddr) -> Result<bool, SpfResult> {
        match mechanism {
            Mechanism::All => Ok(true),
            Mechanism::Ip4(addr, mask) => Ok(ip_matches_masked(peer_ip, IpAddr::V4(*addr), *mask)),
            Mechanism::Ip6(addr, mask) => Ok(ip_matches_masked(peer_ip, IpAddr::V6(*addr), *mask)),
            Mechanism::A { domain: target, mask } => {
                self.charge_lookup()?;
                let target = target.clone().unwrap_or_else(|| domain.to_string());
                let default_mask = if peer_ip.is_ipv4() { 32 } else { 128 };
                let mask = mask.unwrap_or(default_mask);
                match self.resolver.query_ip(&target).await {
                    Ok(ips) => Ok(ips.into_iter().any(|ip| ip_matches_masked(peer_ip, ip, mask))),
                    Err(dns::Error::NxDomain) => Ok(false),
                    Err(_) => Err(SpfResult::TempError),
                }
            }
            Mechanism::Mx { domain: target, mask } => {
                self.charge_lookup()?;
                let target = target.clone().unwrap_or_else(|| domain.to_string());
                let default_mask = if peer_ip.is_ipv4() { 32 } else { 128 };
                let mask = mask.unwrap_or(default_mask);
                let mx_records = match self.resolver.query_mx(&target).await {
                    Ok(records) => records,
                    Err(dns::Error::NxDomain) => return Ok(false),
                    Err(_) => return Err(SpfResult::TempError),
                };
                for mx in mx_records.iter().take(MAX_MX_OR_PTR_HOSTS) {
                    if let Ok(ips) = self.resolver.query_ip(&mx.host).await {
                        if ips.into_iter().any(|ip| ip_matches_masked(peer_ip, ip, mask)) {
                            return Ok(true);
                        }
                    }
                }
                Ok(false)
            }
            Mechanism::Ptr { domain: target } => {
                self.charge_lookup()?;
                let target = target.clone().unwrap_or_else(|| domain.to_string());
                let names = match self.resolver.reverse_lookup(peer_ip).await {
                    Ok(names) => names,
                    Err(_) => return Ok(false),
                };
                for name in names.iter().take(MAX_MX_OR_PTR_HOSTS) {
                    let confirmed = self
                    .resolver
                    .query_ip(name)
                    .await
                    .map(|ips| ips.contains(&peer_ip))
                    .unwrap_or(false);
                    if confirmed && (name == &target || name.ends_with(&format!(".{target}"))) {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Mechanism::Include(target) => {
                self.charge_lookup()?;
                match Box::pin(self.evaluate(target, peer_ip)).await {
                    SpfResult::Pass => Ok(true),
                    SpfResult::Fail | SpfResult::SoftFail | SpfResult::Neutral | SpfResult::None => Ok(false),
                    SpfResult::TempError => Err(SpfResult::TempError),
                    SpfResult::PermError => Err(SpfResult::PermError),
                }
            }
            Mechanism::Exists(target) => {
                self.charge_lookup()?;
                match self.resolver.query_a(target).await {
                    Ok(ips) => Ok(!ips.is_empty()),
                    Err(_) => Ok(false),
                }
            }
        }
    }
}

fn qualifier_to_result(qualifier: Qualifier) -> SpfResult {
    match qualifier {
        Qualifier::Pass => SpfResult::Pass,
        Qualifier::Fail => SpfResult::Fail,
        Qualifier::SoftFail => SpfResult::SoftFail,
        Qualifier::Neutral => SpfResult::Neutral,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_record_with_qualifiers() {
        let record = SpfRecord::parse("v=spf1 ip4:192.0.2.0/24 -all").unwrap();
        assert_eq!(record.terms.len(), 2);
        assert_eq!(record.terms[0].qualifier, Qualifier::Pass);
        assert_eq!(record.terms[1].qualifier, Qualifier::Fail);
        assert_eq!(record.terms[1].mechanism, Mechanism::All);
    }

    #[test]
    fn rejects_record_without_version_token() {
        assert!(SpfRecord::parse("ip4:192.0.2.0/24 -all").is_none());
    }

    #[test]
    fn parses_redirect_modifier() {
        let record = SpfRecord::parse("v=spf1 redirect=_spf.example.com").unwrap();
        assert_eq!(record.redirect.as_deref(), Some("_spf.example.com"));
        assert!(record.terms.is_empty());
    }

    #[test]
    fn ipv4_cidr_matches_by_prefix() {
        let network: std::net::Ipv4Addr = "192.0.2.0".parse().unwrap();
        let inside: std::net::Ipv4Addr = "192.0.2.200".parse().unwrap();
        let outside: std::net::Ipv4Addr = "192.0.3.1".parse().unwrap();
        assert!(ipv4_matches(inside, network, 24));
        assert!(!ipv4_matches(outside, network, 24));
    }

    #[test]
    fn parses_a_mechanism_with_domain_and_mask() {
        let mechanism = parse_mechanism("a:mail.example.com/24").unwrap();
        assert_eq!(
            mechanism,
            Mechanism::A { domain: Some("mail.example.com".to_string()), mask: Some(24) }
        );
    }

    #[test]
    fn parses_bare_mx_mechanism() {
        assert_eq!(parse_mechanism("mx").unwrap(), Mechanism::Mx { domain: None, mask: None });
    }
}
