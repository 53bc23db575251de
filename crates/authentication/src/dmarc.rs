/*
 * SPDX-FileCopyrightText: 2020 Fannst B.V. <hello@fannst.nl>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! DMARC evaluation (RFC 7489).

use dns::Resolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    None,
    Quarantine,
    Reject,
}

impl Policy {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Policy::None),
            "quarantine" => Some(Policy::Quarantine),
            "reject" => Some(Policy::Reject),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    Relaxed,
    Strict,
}

impl Alignment {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "r" => Some(Alignment::Relaxed),
            "s" => Some(Alignment::Strict),
            _ => None,
        }
    }
}

/// `DmarcRecord`: the parsed `_dmarc.<domain>` TXT record tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmarcRecord {
    pub policy: Policy,
    pub subdomain_policy: Option<Policy>,
    pub dkim_alignment: Alignment,
    pub spf_alignment: Alignment,
    pub pct: u8,
}

impl DmarcRecord {
    pub fn parse(txt: &str) -> Option<Self> {
        let mut saw_version = false;
        let mut policy = None;
        let mut subdomain_policy = None;
        let mut dkim_alignment = Alignment::Relaxed;
        let mut spf_alignment = Alignment::Relaxed;
        let mut pct = 100u8;

        for tag in txt.split(';') {
            let tag = tag.trim();
            let Some((key, val)) = tag.split_once('=') else {
                continue;
            };
            let val = val.trim();
            match key.trim() {
                "v" if val.eq_ignore_ascii_case("DMARC1") => saw_version = true,
                "p" => policy = Policy::parse(val),
                "sp" => subdomain_policy = Policy::parse(val),
                "adkim" => dkim_alignment = Alignment::parse(val).unwrap_or(Alignment::Relaxed),
                "aspf" => spf_alignment = Alignment::parse(val).unwrap_or(Alignment::Relaxed),
                "pct" => pct = val.parse().unwrap_or(100),
                _ => {}
            }
        }

        if !saw_version {
            return None;
        }

        Some(DmarcRecord {
                policy: policy?,
                subdomain_policy,
                dkim_alignment,
                spf_alignment,
                pct,
        })
    }

    /// The policy applied to a message from `from_domain` when it fails
    /// DMARC: `sp=` for subdomains of the record's own domain, `p=`
    /// otherwise.
    pub fn effective_policy(&self, record_domain: &str, from_domain: &str) -> Policy {
        if from_domain.eq_ignore_ascii_case(record_domain) {
            self.policy
        } else {
            self.subdomain_policy.unwrap_or(self.policy)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmarcResult {
    Pass,
    Fail,
    TempError,
    PermError,
    None,
}

/// Returns the organizational domain: the registrable domain formed from
/// the last two labels (a simplification of the Public Suffix List lookup
/// RFC 7489 specifies; adequate for evaluating alignment against
/// typical two-label TLDs).
pub fn organizational_domain(domain: &str) -> String {
    let labels: Vec<&str> = domain.trim_end_matches('.').split('.').collect();
    if labels.len() <= 2 {
        domain.trim_end_matches('.').to_ascii_lowercase()
    } else {
        labels[labels.len() - 2..].join(".").to_ascii_lowercase()
    }
}

fn is_aligned(alignment: Alignment, authenticated_domain: &str, header_domain: &str) -> bool {
    let authenticated_domain = authenticated_domain.to_ascii_lowercase();
    let header_domain = header_domain.to_ascii_lowercase();
    match alignment {
        Alignment::Strict => authenticated_domain == header_domain,
        Alignment::Relaxed => {
            organizational_domain(&authenticated_domain) == organizational_domain(&header_domain)
        }
    }
}

pub struct DmarcEvaluation {
    pub result: DmarcResult,
    pub policy: Option<Policy>,
    pub record: Option<DmarcRecord>,
}

/// fetches `_dmarc.<from_domain>`, falling back to the organizational
/// domain's record when `from_domain` has none of its own, computes SPF/DKIM
/// alignment against `from_domain`, and applies the resulting policy.
pub async fn evaluate(
    resolver: &Resolver,
    from_domain: &str,
    spf_pass: bool,
    spf_domain: &str,
    dkim_pass_domains: &[String],
) -> DmarcEvaluation {
    let (record_domain, record) = match lookup_record(resolver, from_domain).await {
        Ok(Some(found)) => found,
        Ok(None) => return DmarcEvaluation { result: DmarcResult::None, policy: None, record: None },
        Err(()) => return DmarcEvaluation { result: DmarcResult::TempError, policy: None, record: None },
    };

    let spf_aligned = spf_pass && is_aligned(record.spf_alignment, spf_domain, from_domain);
    let dkim_aligned = dkim_pass_domains
        .iter()
        .any(|d| is_aligned(record.dkim_alignment, d, from_domain));

    if spf_aligned || dkim_aligned {
        return DmarcEvaluation {
            policy: Some(record.policy),
            result: DmarcResult::Pass,
            record: Some(record),
        };
    }

    let policy = record.effective_policy(&record_domain, from_domain);
    DmarcEvaluation { result: DmarcResult::Fail, policy: Some(policy), record: Some(record) }
}

/// Looks up the `_dmarc` record for `from_domain`, falling back to the
/// organizational domain's record (and thus its `sp=` tag) when
/// `from_domain` publishes none of its own, per RFC 7489 §6.6.3's tree walk
/// for subdomain senders. Returns the domain the record was actually found
/// at, so the caller can tell whether `sp=` governs.
async fn lookup_record(
    resolver: &Resolver,
    from_domain: &str,
) -> Result<Option<(String, DmarcRecord)>, ()> {
    if let Some(record) = query_record(resolver, from_domain).await? {
        return Ok(Some((from_domain.to_string(), record)));
    }

    let org_domain = organizational_domain(from_domain);
    if org_domain.eq_ignore_ascii_case(from_domain) {
        return Ok(None);
    }
    Ok(query_record(resolver, &org_domain).await?.map(|record| (org_domain, record)))
}

async fn query_record(resolver: &Resolver, domain: &str) -> Result<Option<DmarcRecord>, ()> {
    let lookup_name = format!("_dmarc.{domain}");
    match resolver.query_txt(&lookup_name).await {
        Ok(records) => Ok(records.iter().find_map(|t| DmarcRecord::parse(t))),
        Err(dns::Error::NxDomain) => Ok(None),
        Err(_) => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_record() {
        let record = DmarcRecord::parse("v=DMARC1; p=reject; sp=quarantine; adkim=s; aspf=r; pct=50").unwrap();
        assert_eq!(record.policy, Policy::Reject);
        assert_eq!(record.subdomain_policy, Some(Policy::Quarantine));
        assert_eq!(record.dkim_alignment, Alignment::Strict);
        assert_eq!(record.spf_alignment, Alignment::Relaxed);
        assert_eq!(record.pct, 50);
    }

    #[test]
    fn rejects_record_missing_version() {
        assert!(DmarcRecord::parse("p=reject").is_none());
    }

    #[test]
    fn organizational_domain_strips_subdomain_labels() {
        assert_eq!(organizational_domain("mail.corp.example.com"), "example.com");
        assert_eq!(organizational_domain("example.com"), "example.com");
    }

    #[test]
    fn relaxed_alignment_matches_same_organizational_domain() {
        assert!(is_aligned(Alignment::Relaxed, "news.example.com", "example.com"));
        assert!(!is_aligned(Alignment::Strict, "news.example.com", "example.com"));
    }

    #[test]
    fn effective_policy_uses_subdomain_policy_for_subdomains() {
        let record = DmarcRecord::parse("v=DMARC1; p=reject; sp=none").unwrap();
        assert_eq!(record.effective_policy("example.com", "sub.example.com"), Policy::None);
        assert_eq!(record.effective_policy("example.com", "example.com"), Policy::Reject);
    }
}
