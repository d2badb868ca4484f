//! Connection rate limiting and abuse state
//!
//! All maps live on the `AccessControl` instance owned by the broadcast
//! layer; nothing here is global, so engines under test never interfere.
//! Abuse state is keyed by source address, not by connection, and survives
//! disconnects.

use crate::config::EngineConfig;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Why an admission attempt was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDenied {
    /// Address is serving a temporary ban.
    Banned,
    /// Too many new connections from this address within the window.
    RateLimited,
}

/// Per-address admission and ban bookkeeping.
pub struct AccessControl {
    window: Duration,
    max_connections_per_window: usize,
    ban_duration: Duration,
    connections: HashMap<IpAddr, VecDeque<Instant>>,
    bans: HashMap<IpAddr, Instant>,
}

impl AccessControl {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            window: Duration::from_secs(config.rate_window_secs),
            max_connections_per_window: config.max_connections_per_window,
            ban_duration: Duration::from_secs(config.ban_secs),
            connections: HashMap::new(),
            bans: HashMap::new(),
        }
    }

    /// Check and record one connection attempt from `addr`.
    pub fn admit(&mut self, addr: IpAddr, now: Instant) -> Result<(), AdmissionDenied> {
        if let Some(&until) = self.bans.get(&addr) {
            if now < until {
                return Err(AdmissionDenied::Banned);
            }
            self.bans.remove(&addr);
        }

        let stamps = self.connections.entry(addr).or_default();
        while stamps.front().is_some_and(|&t| now - t > self.window) {
            stamps.pop_front();
        }
        if stamps.len() >= self.max_connections_per_window {
            return Err(AdmissionDenied::RateLimited);
        }
        stamps.push_back(now);
        Ok(())
    }

    /// Ban `addr` for the configured duration.
    pub fn ban(&mut self, addr: IpAddr, now: Instant) {
        self.bans.insert(addr, now + self.ban_duration);
    }

    pub fn is_banned(&self, addr: IpAddr, now: Instant) -> bool {
        self.bans.get(&addr).is_some_and(|&until| now < until)
    }

    /// Drop expired bans and stale connection windows. Called from the
    /// broadcast layer's periodic sweep.
    pub fn sweep(&mut self, now: Instant) {
        self.bans.retain(|_, &mut until| now < until);
        self.connections.retain(|_, stamps| {
            while stamps.front().is_some_and(|&t| now - t > self.window) {
                stamps.pop_front();
            }
            !stamps.is_empty()
        });
    }
}

/// What the message throttle decided for one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleVerdict {
    Allow,
    /// Over the rate ceiling: drop the message silently.
    Drop,
    /// Violation threshold reached: close the connection and ban the source.
    CloseAndBan,
}

/// Per-connection sliding window of message timestamps plus the violation
/// counter that escalates to a ban.
pub struct MessageThrottle {
    window: Duration,
    max_messages: usize,
    violation_limit: u32,
    stamps: VecDeque<Instant>,
    violations: u32,
}

impl MessageThrottle {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            window: Duration::from_secs(config.rate_window_secs),
            max_messages: config.max_messages_per_window,
            violation_limit: config.violation_limit,
            stamps: VecDeque::new(),
            violations: 0,
        }
    }

    pub fn violations(&self) -> u32 {
        self.violations
    }

    /// Record one inbound message and decide its fate.
    pub fn check(&mut self, now: Instant) -> ThrottleVerdict {
        while self.stamps.front().is_some_and(|&t| now - t > self.window) {
            self.stamps.pop_front();
        }

        if self.stamps.len() < self.max_messages {
            self.stamps.push_back(now);
            return ThrottleVerdict::Allow;
        }

        self.violations += 1;
        if self.violations >= self.violation_limit {
            ThrottleVerdict::CloseAndBan
        } else {
            ThrottleVerdict::Drop
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EngineConfig {
        EngineConfig {
            rate_window_secs: 10,
            max_connections_per_window: 3,
            max_messages_per_window: 5,
            violation_limit: 3,
            ban_secs: 60,
            ..EngineConfig::default()
        }
    }

    fn addr() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    #[test]
    fn test_admit_within_limit() {
        let mut ac = AccessControl::new(&config());
        let now = Instant::now();
        for _ in 0..3 {
            assert!(ac.admit(addr(), now).is_ok());
        }
        assert_eq!(ac.admit(addr(), now), Err(AdmissionDenied::RateLimited));
    }

    #[test]
    fn test_admit_window_slides() {
        let mut ac = AccessControl::new(&config());
        let start = Instant::now();
        for _ in 0..3 {
            assert!(ac.admit(addr(), start).is_ok());
        }
        // After the window passes the old attempts no longer count
        let later = start + Duration::from_secs(11);
        assert!(ac.admit(addr(), later).is_ok());
    }

    #[test]
    fn test_ban_blocks_until_expiry() {
        let mut ac = AccessControl::new(&config());
        let now = Instant::now();
        ac.ban(addr(), now);
        assert_eq!(ac.admit(addr(), now), Err(AdmissionDenied::Banned));
        assert_eq!(
            ac.admit(addr(), now + Duration::from_secs(59)),
            Err(AdmissionDenied::Banned)
        );
        assert!(ac.admit(addr(), now + Duration::from_secs(61)).is_ok());
    }

    #[test]
    fn test_ban_is_per_address() {
        let mut ac = AccessControl::new(&config());
        let now = Instant::now();
        ac.ban(addr(), now);
        let other: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(ac.admit(other, now).is_ok());
    }

    #[test]
    fn test_sweep_collects_expired_state() {
        let mut ac = AccessControl::new(&config());
        let now = Instant::now();
        ac.admit(addr(), now).unwrap();
        ac.ban(addr(), now);

        ac.sweep(now + Duration::from_secs(120));
        assert!(ac.bans.is_empty());
        assert!(ac.connections.is_empty());
    }

    #[test]
    fn test_throttle_allows_then_drops_then_bans() {
        let mut throttle = MessageThrottle::new(&config());
        let now = Instant::now();

        for _ in 0..5 {
            assert_eq!(throttle.check(now), ThrottleVerdict::Allow);
        }
        // Violations 1 and 2 drop; violation 3 hits the limit
        assert_eq!(throttle.check(now), ThrottleVerdict::Drop);
        assert_eq!(throttle.check(now), ThrottleVerdict::Drop);
        assert_eq!(throttle.check(now), ThrottleVerdict::CloseAndBan);
        assert_eq!(throttle.violations(), 3);
    }

    #[test]
    fn test_throttle_window_slides() {
        let mut throttle = MessageThrottle::new(&config());
        let start = Instant::now();
        for _ in 0..5 {
            assert_eq!(throttle.check(start), ThrottleVerdict::Allow);
        }
        let later = start + Duration::from_secs(11);
        assert_eq!(throttle.check(later), ThrottleVerdict::Allow);
    }
}
