/*
 * SPDX-FileCopyrightText: 2020 Fannst B.V. <hello@fannst.nl>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Per-key sliding-window rate limiting, used to bound things like
//! connections or messages per sender domain independently of the
//! listener-wide [`utils::listener::ConcurrencyLimiter`].

use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

struct Window {
    started_at: Instant,
    count: u32,
}

/// A single named limit: at most `max` events per `period`, counted per key.
pub struct Limiter {
    max: u32,
    period: Duration,
    windows: DashMap<String, Mutex<Window>>,
}

impl Limiter {
    pub fn new(max: u32, period: Duration) -> Self {
        Limiter {
            max,
            period,
            windows: DashMap::new(),
        }
    }

    /// Returns `true` if the event for `key` is allowed under the limit,
    /// recording it. A new window starts once `period` has elapsed since the
    /// key's last window began.
    pub fn is_allowed(&self, key: &str) -> bool {
        let entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(Window { started_at: Instant::now(), count: 0 }));
        let mut window = entry.lock();
        if window.started_at.elapsed() >= self.period {
            window.started_at = Instant::now();
            window.count = 0;
        }
        if window.count >= self.max {
            false
        } else {
            window.count += 1;
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_max_then_rejects() {
        let limiter = Limiter::new(2, Duration::from_secs(60));
        assert!(limiter.is_allowed("a"));
        assert!(limiter.is_allowed("a"));
        assert!(!limiter.is_allowed("a"));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = Limiter::new(1, Duration::from_secs(60));
        assert!(limiter.is_allowed("a"));
        assert!(limiter.is_allowed("b"));
        assert!(!limiter.is_allowed("a"));
    }
}
