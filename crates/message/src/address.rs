/*
 * SPDX-FileCopyrightText: 2020 Fannst B.V. <hello@fannst.nl>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! `EmailAddress`: a pair of optional display name and required
//! `local@domain`, parsed from `"Name" <addr>`, `Name <addr>`, or a bare
//! `addr`, and comma-separated lists of the same.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAddress {
    pub display_name: Option<String>,
    pub local: String,
    pub domain: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// More or less than exactly one `@` in the address part.
    InvalidAt,
    /// `<`/`>` bracket pair unbalanced.
    UnbalancedBrackets,
    Empty,
}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressError::InvalidAt => write!(f, "address must contain exactly one '@'"),
            AddressError::UnbalancedBrackets => write!(f, "unbalanced '<'/'>' in address"),
            AddressError::Empty => write!(f, "empty address"),
        }
    }
}

impl std::error::Error for AddressError {}

impl EmailAddress {
    pub fn new(display_name: Option<String>, address: &str) -> Result<Self, AddressError> {
        let (local, domain) = split_at_sign(address)?;
        Ok(EmailAddress {
                display_name,
                local,
                domain,
        })
    }

    /// Parses a single `"Name" <local@domain>` / `Name <local@domain>` /
    /// bare `local@domain` entry.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(AddressError::Empty);
        }

        match (input.find('<'), input.rfind('>')) {
            (Some(open), Some(close)) if open < close => {
                let name_part = input[..open].trim();
                let addr_part = &input[open + 1..close];
                let display_name = unquote(name_part);
                EmailAddress::new(display_name, addr_part.trim())
            }
            (None, None) => EmailAddress::new(None, input),
            _ => Err(AddressError::UnbalancedBrackets),
        }
    }

    /// Parses a comma-separated address list. A comma inside a quoted
    /// display name or inside `<...>` is not a separator.
    pub fn parse_list(input: &str) -> Result<Vec<Self>, AddressError> {
        split_list(input)
        .into_iter()
        .filter(|entry| !entry.trim().is_empty())
        .map(|entry| EmailAddress::parse(&entry))
        .collect()
    }

    pub fn address(&self) -> String {
        format!("{}@{}", self.local, self.domain)
    }

    /// Serializes back to `"Name" <local@domain>` (or bare `local@domain`
    /// when there's no display name), the inverse of [`Self::parse`].
    pub fn to_address_string(&self) -> String {
        match &self.display_name {
            Some(name) if !name.is_empty() => format!("\"{}\" <{}>", name, self.address()),
            _ => self.address(),
        }
    }

    pub fn serialize_list(addresses: &[Self]) -> String {
        addresses
        .iter()
        .map(Self::to_address_string)
        .collect::<Vec<_>>()
        .join(", ")
    }
}

fn unquote(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let unquoted = s.strip_prefix('"').and_then(|s| s.strip_suffix('"')).unwrap_or(s);
    Some(unquoted.to_string())
}

fn split_at_sign(address: &str) -> Result<(String, String), AddressError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(AddressError::Empty);
    }
    let mut parts = address.splitn(2, '@');
    let local = parts.next().unwrap_or_default();
    let domain = match parts.next() {
        Some(d) if !d.contains('@') => d,
        _ => return Err(AddressError::InvalidAt),
    };
    if local.is_empty() || domain.is_empty() {
        return Err(AddressError::InvalidAt);
    }
    Ok((local.to_string(), domain.to_string()))
}

fn split_list(input: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth_angle = 0i32;
    let mut in_quotes = false;
    let mut current = String::new();

    for c in input.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '<' if !in_quotes => {
                depth_angle += 1;
                current.push(c);
            }
            '>' if !in_quotes => {
                depth_angle -= 1;
                current.push(c);
            }
            ',' if !in_quotes && depth_angle <= 0 => {
                out.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        out.push(current);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_address() {
        let addr = EmailAddress::parse("bob@example.com").unwrap();
        assert_eq!(addr.local, "bob");
        assert_eq!(addr.domain, "example.com");
        assert!(addr.display_name.is_none());
    }

    #[test]
    fn parses_quoted_display_name() {
        let addr = EmailAddress::parse("\"Bob Smith\" <bob@example.com>").unwrap();
        assert_eq!(addr.display_name.as_deref(), Some("Bob Smith"));
        assert_eq!(addr.address(), "bob@example.com");
    }

    #[test]
    fn parses_unquoted_display_name() {
        let addr = EmailAddress::parse("Bob Smith <bob@example.com>").unwrap();
        assert_eq!(addr.display_name.as_deref(), Some("Bob Smith"));
    }

    #[test]
    fn rejects_missing_at_sign() {
        assert_eq!(EmailAddress::parse("<bob>").unwrap_err(), AddressError::InvalidAt);
    }

    #[test]
    fn rejects_double_at_sign() {
        assert_eq!(
            EmailAddress::parse("bob@example@com").unwrap_err(),
            AddressError::InvalidAt
        );
    }

    #[test]
    fn rejects_unbalanced_brackets() {
        assert_eq!(
            EmailAddress::parse("Bob <bob@example.com").unwrap_err(),
            AddressError::UnbalancedBrackets
        );
    }

    #[test]
    fn list_round_trips_membership() {
        let list =
        EmailAddress::parse_list("\"A, B\" <a@x.com>, c@y.com, \"D\" <d@z.com>").unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].address(), "a@x.com");
        assert_eq!(list[1].address(), "c@y.com");
        assert_eq!(list[2].address(), "d@z.com");

        let serialized = EmailAddress::serialize_list(&list);
        let reparsed = EmailAddress::parse_list(&serialized).unwrap();
        let original_set: std::collections::HashSet<_> =
        list.iter().map(EmailAddress::address).collect();
        let reparsed_set: std::collections::HashSet<_> =
        reparsed.iter().map(EmailAddress::address).collect();
        assert_eq!(original_set, reparsed_set);
    }
}
