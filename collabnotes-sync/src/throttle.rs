//! Per-address connection throttling.
//!
//! Applied before the WebSocket handshake: connection attempts from the same
//! address must be spaced at least `min_interval` apart, and an address that
//! keeps violating the spacing gets banned for `ban_duration`. Established
//! connections are never affected; this guard only gates new attempts.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Throttle configuration.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Minimum spacing between attempts from one address
    pub min_interval: Duration,
    /// Violations tolerated before the address is banned
    pub max_violations: u32,
    /// How long a ban lasts
    pub ban_duration: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_violations: 3,
            ban_duration: Duration::from_secs(30),
        }
    }
}

/// Outcome of a throttle check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    /// Attempt may proceed
    Allow,
    /// Attempt came too soon after the previous one
    Throttled,
    /// Address is inside a ban window
    Banned,
}

impl ThrottleDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, ThrottleDecision::Allow)
    }
}

#[derive(Debug)]
struct AttemptState {
    last_attempt: Instant,
    violations: u32,
    banned_until: Option<Instant>,
}

/// Tracks connection attempts per originating address.
pub struct ConnectionThrottle {
    config: ThrottleConfig,
    state: Mutex<HashMap<IpAddr, AttemptState>>,
}

/// Opportunistic pruning kicks in above this many tracked addresses.
const PRUNE_THRESHOLD: usize = 1024;

impl ConnectionThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Record a connection attempt and decide whether to admit it.
    pub async fn check(&self, addr: IpAddr) -> ThrottleDecision {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        if state.len() > PRUNE_THRESHOLD {
            self.prune(&mut state, now);
        }

        let entry = match state.get_mut(&addr) {
            Some(entry) => entry,
            None => {
                state.insert(
                    addr,
                    AttemptState {
                        last_attempt: now,
                        violations: 0,
                        banned_until: None,
                    },
                );
                return ThrottleDecision::Allow;
            }
        };

        if let Some(banned_until) = entry.banned_until {
            if now < banned_until {
                return ThrottleDecision::Banned;
            }
            entry.banned_until = None;
            entry.violations = 0;
        }

        let elapsed = now.duration_since(entry.last_attempt);
        entry.last_attempt = now;

        if elapsed < self.config.min_interval {
            entry.violations += 1;
            if entry.violations >= self.config.max_violations {
                entry.banned_until = Some(now + self.config.ban_duration);
                log::warn!(
                    "Banning {addr} for {:?} after {} throttle violations",
                    self.config.ban_duration,
                    entry.violations
                );
                return ThrottleDecision::Banned;
            }
            return ThrottleDecision::Throttled;
        }

        entry.violations = 0;
        ThrottleDecision::Allow
    }

    /// Number of addresses currently tracked.
    pub async fn tracked_addresses(&self) -> usize {
        self.state.lock().await.len()
    }

    /// Drop state for addresses that are idle and not banned.
    fn prune(&self, state: &mut HashMap<IpAddr, AttemptState>, now: Instant) {
        let idle_cutoff = self.config.min_interval + self.config.ban_duration;
        state.retain(|_, entry| {
            if let Some(banned_until) = entry.banned_until {
                if now < banned_until {
                    return true;
                }
            }
            now.duration_since(entry.last_attempt) < idle_cutoff
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(last_octet: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet))
    }

    fn strict_config() -> ThrottleConfig {
        ThrottleConfig {
            min_interval: Duration::from_secs(3600),
            max_violations: 3,
            ban_duration: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn test_first_attempt_allowed() {
        let throttle = ConnectionThrottle::new(strict_config());
        assert_eq!(throttle.check(addr(1)).await, ThrottleDecision::Allow);
    }

    #[tokio::test]
    async fn test_rapid_attempts_throttled() {
        let throttle = ConnectionThrottle::new(strict_config());
        assert_eq!(throttle.check(addr(1)).await, ThrottleDecision::Allow);
        assert_eq!(throttle.check(addr(1)).await, ThrottleDecision::Throttled);
        assert_eq!(throttle.check(addr(1)).await, ThrottleDecision::Throttled);
    }

    #[tokio::test]
    async fn test_repeated_violations_ban() {
        let throttle = ConnectionThrottle::new(strict_config());
        throttle.check(addr(1)).await;
        throttle.check(addr(1)).await; // violation 1
        throttle.check(addr(1)).await; // violation 2
        assert_eq!(throttle.check(addr(1)).await, ThrottleDecision::Banned); // violation 3 → ban
        assert_eq!(throttle.check(addr(1)).await, ThrottleDecision::Banned);
    }

    #[tokio::test]
    async fn test_addresses_tracked_independently() {
        let throttle = ConnectionThrottle::new(strict_config());
        throttle.check(addr(1)).await;
        assert_eq!(throttle.check(addr(1)).await, ThrottleDecision::Throttled);
        // A different address is unaffected
        assert_eq!(throttle.check(addr(2)).await, ThrottleDecision::Allow);
        assert_eq!(throttle.tracked_addresses().await, 2);
    }

    #[tokio::test]
    async fn test_spaced_attempts_allowed() {
        let throttle = ConnectionThrottle::new(ThrottleConfig {
            min_interval: Duration::from_millis(10),
            max_violations: 3,
            ban_duration: Duration::from_secs(3600),
        });
        assert_eq!(throttle.check(addr(1)).await, ThrottleDecision::Allow);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(throttle.check(addr(1)).await, ThrottleDecision::Allow);
    }

    #[tokio::test]
    async fn test_ban_expires() {
        let throttle = ConnectionThrottle::new(ThrottleConfig {
            min_interval: Duration::from_millis(50),
            max_violations: 1,
            ban_duration: Duration::from_millis(20),
        });
        throttle.check(addr(1)).await;
        assert_eq!(throttle.check(addr(1)).await, ThrottleDecision::Banned);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(throttle.check(addr(1)).await, ThrottleDecision::Allow);
    }

    #[tokio::test]
    async fn test_decision_is_allowed() {
        assert!(ThrottleDecision::Allow.is_allowed());
        assert!(!ThrottleDecision::Throttled.is_allowed());
        assert!(!ThrottleDecision::Banned.is_allowed());
    }
}
