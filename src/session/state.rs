//! Mutable bookkeeping for one session, kept as plain data with pure
//! transitions so the policy can be exercised without a network.

use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RuntimeOptions;
use crate::provider::ProviderProfile;
use crate::types::ConnectionState;

/// Consecutive failed probes that turn a "connected" session into a zombie.
pub const ZOMBIE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry { attempt: u32, delay: Duration },
    GiveUp { attempts: u32 },
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    Degraded(u32),
    Zombie,
}

#[derive(Debug, Default, Clone)]
pub struct HealthState {
    pub consecutive_failures: u32,
    pub last_probe: Option<Instant>,
}

impl HealthState {
    pub fn record(&mut self, ok: bool) -> HealthVerdict {
        self.last_probe = Some(Instant::now());
        if ok {
            self.consecutive_failures = 0;
            return HealthVerdict::Healthy;
        }
        self.consecutive_failures += 1;
        if self.consecutive_failures >= ZOMBIE_THRESHOLD {
            HealthVerdict::Zombie
        } else {
            HealthVerdict::Degraded(self.consecutive_failures)
        }
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.last_probe = None;
    }
}

#[derive(Debug, Default, Clone)]
pub struct SessionState {
    pub connection: ConnectionState,
    pub reconnect_attempts: u32,
    pub health: HealthState,
    pub last_error: Option<String>,
}

impl SessionState {
    /// Count this failure and decide whether another attempt is allowed.
    /// `max_reconnect_attempts` bounds the number of failed cycles in a row.
    pub fn plan_reconnect(
        &mut self,
        options: &RuntimeOptions,
        profile: &ProviderProfile,
    ) -> ReconnectDecision {
        if !options.auto_reconnect {
            return ReconnectDecision::Disabled;
        }
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        if self.reconnect_attempts >= options.max_reconnect_attempts {
            return ReconnectDecision::GiveUp {
                attempts: self.reconnect_attempts,
            };
        }
        ReconnectDecision::Retry {
            attempt: self.reconnect_attempts,
            delay: profile.reconnect_delay(self.reconnect_attempts, options.reconnect_interval),
        }
    }

    pub fn on_connected(&mut self) {
        self.connection = ConnectionState::Connected;
        self.reconnect_attempts = 0;
        self.health.reset();
        self.last_error = None;
    }

    pub fn is_active(&self) -> bool {
        self.connection != ConnectionState::Disconnected
    }
}

/// What the listener loops know about push delivery on the current
/// connection. Reset on every connect. `delivered` survives reconnects as
/// long as the mailbox keeps its UIDVALIDITY; `skipped` is per connection.
#[derive(Debug, Default, Clone)]
pub struct ListenerState {
    pub push_active: bool,
    pub poll_active: bool,
    pub push_notifications: u64,
    pub push_failures: u32,
    pub last_push: Option<Instant>,
    pub last_exists: Option<u32>,
    pub scans_coalesced: u64,
    pub uid_validity: Option<u32>,
    pub delivered: HashSet<u32>,
    /// Oversized, unparsable or empty messages left unseen on the server.
    pub skipped: HashSet<u32>,
}

impl ListenerState {
    pub fn reset_connection(&mut self, exists: u32, uid_validity: Option<u32>) {
        self.push_active = false;
        self.poll_active = false;
        self.push_notifications = 0;
        self.push_failures = 0;
        self.last_push = None;
        self.last_exists = Some(exists);
        self.scans_coalesced = 0;
        self.skipped.clear();
        if uid_validity != self.uid_validity {
            // UIDs from the old validity epoch may be reused for new mail.
            self.delivered.clear();
            self.uid_validity = uid_validity;
        }
    }

    /// Whether a UID from an unseen search still needs fetching.
    pub fn needs_fetch(&self, uid: u32) -> bool {
        !self.delivered.contains(&uid) && !self.skipped.contains(&uid)
    }

    /// Record an EXISTS count; true when the mailbox grew.
    pub fn observe_exists(&mut self, exists: u32) -> bool {
        let grew = self.last_exists.map_or(true, |prev| exists > prev);
        self.last_exists = Some(exists);
        grew
    }

    pub fn record_push(&mut self) {
        self.push_notifications += 1;
        self.push_failures = 0;
        self.last_push = Some(Instant::now());
    }

    /// Poll should not trust IDLE alone when it has been quiet this long.
    pub fn push_stale(&self, window: Duration) -> bool {
        !self.push_active || self.last_push.map_or(true, |t| t.elapsed() >= window)
    }
}
