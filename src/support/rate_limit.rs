//-
// Copyright (c) 2024, the Wingmap authors
//
// This file is part of Wingmap.
//
// Wingmap is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Wingmap is distributed  in the hope that  it will be useful,  but WITHOUT
// ANY WARRANTY; without  even the implied warranty of  MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Wingmap. If not, see <http://www.gnu.org/licenses/>.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::support::system_config::LoginThrottleConfig;

/// A sliding-window login throttle keyed by `(username, remote address)`.
///
/// The window is evaluated before any database access so that an attacker
/// hammering one account cannot translate into storage load. Entries
/// recorded for a key survive connection drops; idle keys are discarded
/// once their window has fully drained.
pub struct LoginThrottle {
    window: Duration,
    max_attempts: usize,
    attempts: Mutex<HashMap<String, Vec<Instant>>>,
}

impl LoginThrottle {
    pub fn new(config: &LoginThrottleConfig) -> Self {
        Self {
            window: Duration::from_secs(config.window_secs),
            max_attempts: config.max_attempts as usize,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Record an attempt for `username` from `addr` and return whether the
    /// attempt is permitted.
    ///
    /// Rejected attempts still count towards the window.
    pub fn check(&self, username: &str, addr: IpAddr) -> bool {
        self.check_at(username, addr, Instant::now())
    }

    fn check_at(&self, username: &str, addr: IpAddr, now: Instant) -> bool {
        let key = format!("{}:{}", username, addr);
        let mut attempts = self.attempts.lock().unwrap();

        // Opportunistically drop keys whose whole window has drained, so
        // the map doesn't grow without bound across many usernames.
        attempts.retain(|_, times| {
            times.last().is_some_and(|&t| now - t < self.window)
        });

        let times = attempts.entry(key).or_default();
        times.retain(|&t| now - t < self.window);
        times.push(now);
        times.len() <= self.max_attempts
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn throttle(max_attempts: u32) -> LoginThrottle {
        LoginThrottle::new(&LoginThrottleConfig {
            window_secs: 60,
            max_attempts,
        })
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([192, 0, 2, last])
    }

    #[test]
    fn allows_up_to_cap_then_rejects() {
        let throttle = throttle(3);
        let start = Instant::now();

        assert!(throttle.check_at("azure", ip(1), start));
        assert!(throttle.check_at("azure", ip(1), start));
        assert!(throttle.check_at("azure", ip(1), start));
        assert!(!throttle.check_at("azure", ip(1), start));
        assert!(!throttle.check_at("azure", ip(1), start));
    }

    #[test]
    fn distinct_keys_do_not_interfere() {
        let throttle = throttle(1);
        let start = Instant::now();

        assert!(throttle.check_at("azure", ip(1), start));
        assert!(throttle.check_at("azure", ip(2), start));
        assert!(throttle.check_at("byron", ip(1), start));
        assert!(!throttle.check_at("azure", ip(1), start));
    }

    #[test]
    fn window_slides() {
        let throttle = throttle(2);
        let start = Instant::now();

        assert!(throttle.check_at("azure", ip(1), start));
        assert!(throttle.check_at(
            "azure",
            ip(1),
            start + Duration::from_secs(30)
        ));
        assert!(!throttle.check_at(
            "azure",
            ip(1),
            start + Duration::from_secs(45)
        ));
        // Only the rejected 45s attempt is still inside the window here.
        assert!(throttle.check_at(
            "azure",
            ip(1),
            start + Duration::from_secs(95)
        ));
    }
}
