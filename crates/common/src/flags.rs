/*
 * SPDX-FileCopyrightText: 2020 Fannst B.V. <hello@fannst.nl>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Parses the `X-Fannst-Flags` header the server consumes (and strips from
//! storage/relay consideration) after a message is fully received: e.g.
//! `X-Fannst-Flags: db=nstore; mailer=nerror`.

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FannstFlags {
    /// `db=nstore`: skip the "Sent" mailbox copy for an authenticated sender.
    pub skip_sent_copy: bool,
    /// `mailer=nerror`: suppress bounce generation on relay failure.
    pub suppress_bounce: bool,
}

impl FannstFlags {
    /// Groups are `;`-separated `key=value` pairs; a value may itself carry
    /// further `:`-separated sub-flags (e.g. `db=nstore:quiet`).
    pub fn parse(value: &str) -> Self {
        let mut flags = FannstFlags::default();
        for group in value.split(';') {
            let group = group.trim();
            let Some((key, rest)) = group.split_once('=') else {
                continue;
            };
            let subflags: Vec<&str> = rest.split(':').map(str::trim).collect();
            match key.trim().to_ascii_lowercase().as_str() {
                "db" if subflags.iter().any(|s| s.eq_ignore_ascii_case("nstore")) => {
                    flags.skip_sent_copy = true;
                }
                "mailer" if subflags.iter().any(|s| s.eq_ignore_ascii_case("nerror")) => {
                    flags.suppress_bounce = true;
                }
                _ => {}
            }
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_groups() {
        let flags = FannstFlags::parse("db=nstore; mailer=nerror");
        assert!(flags.skip_sent_copy);
        assert!(flags.suppress_bounce);
    }

    #[test]
    fn unknown_group_is_ignored() {
        let flags = FannstFlags::parse("foo=bar");
        assert_eq!(flags, FannstFlags::default());
    }

    #[test]
    fn single_group_leaves_other_flag_false() {
        let flags = FannstFlags::parse("db=nstore");
        assert!(flags.skip_sent_copy);
        assert!(!flags.suppress_bounce);
    }

    #[test]
    fn subflag_among_several_still_matches() {
        let flags = FannstFlags::parse("db=quiet:nstore");
        assert!(flags.skip_sent_copy);
    }
}
