//! Per-provider capability records.
//!
//! Providers differ in how long they tolerate IDLE, whether they silently drop
//! quiet connections, how trustworthy their push notifications are, and what
//! their error text looks like. All of that is data here; the session and the
//! resolver only consult it through the small functions on [`ProviderProfile`].

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::Duration;

use crate::errors::WatchError;
use crate::types::AccountCredentials;

/// Default ceiling for the exponential reconnect backoff.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenStrategy {
    /// IDLE loop only.
    IdleOnly,
    /// Poll loop only.
    PollOnly,
    /// IDLE and poll loops side by side.
    Hybrid,
    /// IDLE loop, plus a poll loop once IDLE has kept failing past a grace delay.
    IdleWithFallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    Exponential { multiplier: u32, cap: Duration },
    Fixed(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFeatures {
    pub supports_idle: bool,
    pub heartbeat_required: bool,
    pub heartbeat_interval: Duration,
    pub strategy: ListenStrategy,
    pub poll_interval: Duration,
    /// 0..=100; how far IDLE notifications can be trusted on their own.
    pub push_reliability: u8,
    /// IDLE must be re-issued after this long even without news.
    pub max_idle: Duration,
    /// Used by [`ListenStrategy::IdleWithFallback`] before judging IDLE.
    pub fallback_grace: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPreference {
    pub preferred_prefixes: &'static [&'static str],
    pub blocked_prefixes: &'static [&'static str],
    /// Extra lookups when no preferred prefix showed up.
    pub dns_retries: u32,
    pub dns_retry_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorPattern {
    pub pattern: &'static str,
    pub message: &'static str,
    pub retryable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProfile {
    pub name: &'static str,
    pub domains: &'static [&'static str],
    pub host_suffixes: &'static [&'static str],
    pub features: ProviderFeatures,
    pub reconnect: ReconnectPolicy,
    pub connect_timeout: Duration,
    pub auth_timeout: Duration,
    pub address: AddressPreference,
    pub error_patterns: &'static [ErrorPattern],
    /// Server refuses clients that skip the `ID` command.
    pub requires_identity: bool,
    pub max_connections: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorClass {
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressChoice {
    pub addr: Ipv4Addr,
    pub is_preferred: bool,
}

const FAKE_IP_RANGES: &[&str] = &["198.18.", "198.19.", "0."];

const EXPONENTIAL: ReconnectPolicy = ReconnectPolicy::Exponential {
    multiplier: 2,
    cap: MAX_RECONNECT_DELAY,
};

const DEFAULT_ADDRESS: AddressPreference = AddressPreference {
    preferred_prefixes: &[],
    blocked_prefixes: FAKE_IP_RANGES,
    dns_retries: 0,
    dns_retry_delay: Duration::from_secs(1),
};

pub static GENERIC: ProviderProfile = ProviderProfile {
    name: "generic",
    domains: &[],
    host_suffixes: &[],
    features: ProviderFeatures {
        supports_idle: true,
        heartbeat_required: false,
        heartbeat_interval: Duration::from_secs(300),
        strategy: ListenStrategy::Hybrid,
        poll_interval: Duration::from_secs(120),
        push_reliability: 60,
        max_idle: Duration::from_secs(25 * 60),
        fallback_grace: Duration::from_secs(120),
    },
    reconnect: EXPONENTIAL,
    connect_timeout: Duration::from_secs(30),
    auth_timeout: Duration::from_secs(30),
    address: DEFAULT_ADDRESS,
    error_patterns: &[],
    requires_identity: false,
    max_connections: 10,
};

static PROVIDERS: &[ProviderProfile] = &[
    ProviderProfile {
        name: "gmail",
        domains: &["gmail.com", "googlemail.com"],
        host_suffixes: &["imap.gmail.com"],
        features: ProviderFeatures {
            supports_idle: true,
            heartbeat_required: false,
            heartbeat_interval: Duration::from_secs(300),
            strategy: ListenStrategy::Hybrid,
            poll_interval: Duration::from_secs(120),
            push_reliability: 90,
            // Gmail ends IDLE at ~29 minutes.
            max_idle: Duration::from_secs(25 * 60),
            fallback_grace: Duration::from_secs(120),
        },
        reconnect: EXPONENTIAL,
        connect_timeout: Duration::from_secs(30),
        auth_timeout: Duration::from_secs(30),
        address: AddressPreference {
            preferred_prefixes: &[
                "142.250.", "142.251.", "172.217.", "172.253.", "74.125.", "64.233.", "108.177.",
                "173.194.", "209.85.",
            ],
            blocked_prefixes: FAKE_IP_RANGES,
            dns_retries: 2,
            dns_retry_delay: Duration::from_secs(1),
        },
        error_patterns: &[
            ErrorPattern {
                pattern: r"web login required|webalert|application-specific password",
                message: "Gmail requires an app password or a web sign-in confirmation",
                retryable: false,
            },
            ErrorPattern {
                pattern: r"too many simultaneous connections",
                message: "Gmail connection limit reached; close other mail clients",
                retryable: true,
            },
        ],
        requires_identity: false,
        max_connections: 15,
    },
    ProviderProfile {
        name: "outlook",
        domains: &["outlook.com", "hotmail.com", "live.com", "msn.com"],
        host_suffixes: &["outlook.office365.com", "office365.com", "outlook.com"],
        features: ProviderFeatures {
            supports_idle: true,
            // Drops quiet connections well before the IDLE window ends.
            heartbeat_required: true,
            heartbeat_interval: Duration::from_secs(120),
            strategy: ListenStrategy::Hybrid,
            poll_interval: Duration::from_secs(60),
            push_reliability: 70,
            max_idle: Duration::from_secs(10 * 60),
            fallback_grace: Duration::from_secs(120),
        },
        reconnect: EXPONENTIAL,
        connect_timeout: Duration::from_secs(45),
        auth_timeout: Duration::from_secs(45),
        address: DEFAULT_ADDRESS,
        error_patterns: &[
            ErrorPattern {
                pattern: r"authenticate failed|login failed",
                message: "Outlook rejected the login; basic auth may be disabled, use xoauth2",
                retryable: false,
            },
            ErrorPattern {
                pattern: r"user is authenticated but not connected",
                message: "Outlook mailbox is not ready yet",
                retryable: true,
            },
        ],
        requires_identity: false,
        max_connections: 16,
    },
    ProviderProfile {
        name: "yahoo",
        domains: &["yahoo.com", "ymail.com", "aol.com"],
        host_suffixes: &["imap.mail.yahoo.com", "imap.aol.com"],
        features: ProviderFeatures {
            supports_idle: true,
            heartbeat_required: false,
            heartbeat_interval: Duration::from_secs(300),
            strategy: ListenStrategy::Hybrid,
            poll_interval: Duration::from_secs(120),
            push_reliability: 75,
            max_idle: Duration::from_secs(15 * 60),
            fallback_grace: Duration::from_secs(120),
        },
        reconnect: EXPONENTIAL,
        connect_timeout: Duration::from_secs(30),
        auth_timeout: Duration::from_secs(30),
        address: DEFAULT_ADDRESS,
        error_patterns: &[],
        requires_identity: false,
        max_connections: 5,
    },
    ProviderProfile {
        name: "icloud",
        domains: &["icloud.com", "me.com", "mac.com"],
        host_suffixes: &["imap.mail.me.com"],
        features: ProviderFeatures {
            supports_idle: true,
            heartbeat_required: false,
            heartbeat_interval: Duration::from_secs(300),
            strategy: ListenStrategy::IdleOnly,
            poll_interval: Duration::from_secs(300),
            push_reliability: 95,
            max_idle: Duration::from_secs(25 * 60),
            fallback_grace: Duration::from_secs(120),
        },
        reconnect: EXPONENTIAL,
        connect_timeout: Duration::from_secs(30),
        auth_timeout: Duration::from_secs(30),
        address: DEFAULT_ADDRESS,
        error_patterns: &[],
        requires_identity: false,
        max_connections: 10,
    },
    ProviderProfile {
        name: "qq",
        domains: &["qq.com", "foxmail.com"],
        host_suffixes: &["imap.qq.com", "imap.exmail.qq.com"],
        features: ProviderFeatures {
            supports_idle: true,
            heartbeat_required: true,
            heartbeat_interval: Duration::from_secs(180),
            strategy: ListenStrategy::IdleWithFallback,
            poll_interval: Duration::from_secs(90),
            push_reliability: 50,
            max_idle: Duration::from_secs(10 * 60),
            fallback_grace: Duration::from_secs(60),
        },
        reconnect: EXPONENTIAL,
        connect_timeout: Duration::from_secs(20),
        auth_timeout: Duration::from_secs(20),
        address: DEFAULT_ADDRESS,
        error_patterns: &[ErrorPattern {
            pattern: r"system busy|login frequency",
            message: "QQ Mail is throttling logins; backing off",
            retryable: true,
        }],
        requires_identity: false,
        max_connections: 5,
    },
    ProviderProfile {
        name: "netease",
        domains: &["163.com", "126.com", "yeah.net", "vip.163.com"],
        host_suffixes: &["imap.163.com", "imap.126.com", "imap.yeah.net"],
        features: ProviderFeatures {
            supports_idle: false,
            heartbeat_required: true,
            heartbeat_interval: Duration::from_secs(120),
            strategy: ListenStrategy::PollOnly,
            poll_interval: Duration::from_secs(60),
            push_reliability: 30,
            max_idle: Duration::from_secs(10 * 60),
            fallback_grace: Duration::from_secs(60),
        },
        reconnect: ReconnectPolicy::Fixed(Duration::from_secs(30)),
        connect_timeout: Duration::from_secs(20),
        auth_timeout: Duration::from_secs(20),
        address: DEFAULT_ADDRESS,
        error_patterns: &[ErrorPattern {
            pattern: r"unsafe login",
            message: "NetEase rejected the login as unsafe; enable IMAP and use an authorization code",
            retryable: false,
        }],
        requires_identity: true,
        max_connections: 5,
    },
];

/// Ordered generic mappings; the first match wins.
static GENERIC_PATTERNS: &[ErrorPattern] = &[
    ErrorPattern {
        pattern: r"authenticationfailed|authentication failed|invalid credentials|login failed|incorrect password|\[auth\]",
        message: "Authentication failed; check the address and password",
        retryable: false,
    },
    ErrorPattern {
        pattern: r"failed to lookup|name resolution|no such host|nxdomain|dns",
        message: "Could not resolve the mail server hostname",
        retryable: true,
    },
    ErrorPattern {
        pattern: r"timed out|timeout",
        message: "Connection to the mail server timed out",
        retryable: true,
    },
    ErrorPattern {
        pattern: r"connection reset|broken pipe|connection aborted|unexpected eof|connection lost",
        message: "The mail server closed the connection",
        retryable: true,
    },
    ErrorPattern {
        pattern: r"connection refused",
        message: "The mail server refused the connection",
        retryable: true,
    },
    ErrorPattern {
        pattern: r"unreachable",
        message: "The mail server is unreachable from this network",
        retryable: true,
    },
    ErrorPattern {
        pattern: r"too many|rate limit|throttl",
        message: "The mail server is rate limiting this account",
        retryable: true,
    },
    ErrorPattern {
        pattern: r"certificate|invalid peer|unknownissuer",
        message: "The mail server's TLS certificate could not be verified",
        retryable: false,
    },
];

static GENERIC_COMPILED: Lazy<Vec<(Regex, ErrorPattern)>> =
    Lazy::new(|| GENERIC_PATTERNS.iter().filter_map(compile).collect());

/// Provider patterns, compiled on first use. `None` marks a bad pattern.
static PROVIDER_COMPILED: Lazy<Mutex<HashMap<&'static str, Option<Regex>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn cached_pattern(pattern: &'static str) -> Option<Regex> {
    let mut cache = PROVIDER_COMPILED
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    cache
        .entry(pattern)
        .or_insert_with(|| RegexBuilder::new(pattern).case_insensitive(true).build().ok())
        .clone()
}

fn compile(p: &ErrorPattern) -> Option<(Regex, ErrorPattern)> {
    RegexBuilder::new(p.pattern)
        .case_insensitive(true)
        .build()
        .ok()
        .map(|re| (re, *p))
}

/// Pick the capability record for an account: address domain first, then host.
pub fn profile_for(credentials: &AccountCredentials) -> &'static ProviderProfile {
    if let Some(domain) = credentials.domain() {
        if let Some(p) = PROVIDERS.iter().find(|p| p.domains.contains(&domain.as_str())) {
            return p;
        }
    }
    let host = credentials.host.trim().to_ascii_lowercase();
    PROVIDERS
        .iter()
        .find(|p| {
            p.host_suffixes
                .iter()
                .any(|s| host == *s || host.ends_with(&format!(".{s}")))
        })
        .unwrap_or(&GENERIC)
}

pub fn profile_by_name(name: &str) -> Option<&'static ProviderProfile> {
    if name == GENERIC.name {
        return Some(&GENERIC);
    }
    PROVIDERS.iter().find(|p| p.name == name)
}

impl ProviderProfile {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn reconnect_delay(&self, attempt: u32, base: Duration) -> Duration {
        match self.reconnect {
            ReconnectPolicy::Exponential { multiplier, cap } => {
                let factor = multiplier.max(1).saturating_pow(attempt.saturating_sub(1));
                base.saturating_mul(factor).min(cap)
            }
            ReconnectPolicy::Fixed(delay) => delay,
        }
    }

    /// Provider patterns first, then the generic table. Unmatched text is
    /// assumed to be transient.
    pub fn classify_message(&self, text: &str) -> ErrorClass {
        for p in self.error_patterns {
            if let Some(re) = cached_pattern(p.pattern) {
                if re.is_match(text) {
                    return ErrorClass {
                        message: p.message.to_string(),
                        retryable: p.retryable,
                    };
                }
            }
        }
        for (re, p) in GENERIC_COMPILED.iter() {
            if re.is_match(text) {
                return ErrorClass {
                    message: p.message.to_string(),
                    retryable: p.retryable,
                };
            }
        }
        ErrorClass {
            message: text.to_string(),
            retryable: true,
        }
    }

    pub fn classify(&self, err: &WatchError) -> ErrorClass {
        match err {
            WatchError::Auth(text) => {
                let class = self.classify_message(text);
                ErrorClass {
                    message: if class.message == *text {
                        err.to_string()
                    } else {
                        class.message
                    },
                    retryable: false,
                }
            }
            other if !other.is_retryable() => ErrorClass {
                message: other.to_string(),
                retryable: false,
            },
            other => self.classify_message(&other.to_string()),
        }
    }

    /// Preferred prefix wins, then the first address outside the blocked
    /// ranges, then whatever came first.
    pub fn select_address(&self, candidates: &[Ipv4Addr]) -> Option<AddressChoice> {
        let rendered: Vec<String> = candidates.iter().map(|a| a.to_string()).collect();

        if let Some(i) = rendered.iter().position(|a| self.is_preferred(a)) {
            return Some(AddressChoice {
                addr: candidates[i],
                is_preferred: true,
            });
        }
        let blocked = |a: &String| {
            self.address
                .blocked_prefixes
                .iter()
                .any(|p| a.starts_with(p))
        };
        if let Some(i) = rendered.iter().position(|a| !blocked(a)) {
            return Some(AddressChoice {
                addr: candidates[i],
                is_preferred: false,
            });
        }
        candidates.first().map(|addr| AddressChoice {
            addr: *addr,
            is_preferred: false,
        })
    }

    /// Whether a lookup result is good enough to stop retrying DNS.
    pub fn is_satisfactory(&self, candidates: &[Ipv4Addr]) -> bool {
        if candidates.is_empty() {
            return false;
        }
        self.address.preferred_prefixes.is_empty()
            || candidates.iter().any(|a| self.is_preferred(&a.to_string()))
    }

    fn is_preferred(&self, addr: &str) -> bool {
        self.address
            .preferred_prefixes
            .iter()
            .any(|p| addr.starts_with(p))
    }

    /// A provider that needs a heartbeat dictates the health-check cadence.
    pub fn health_interval(&self, configured: Duration) -> Duration {
        if self.features.heartbeat_required {
            self.features.heartbeat_interval
        } else {
            configured
        }
    }

    pub fn health_check_forced(&self) -> bool {
        self.features.heartbeat_required
    }

    pub fn push_is_unreliable(&self) -> bool {
        self.features.push_reliability < 50
    }

    /// Poll cadence, halved (never below 15s) when IDLE cannot be trusted.
    pub fn effective_poll_interval(&self) -> Duration {
        let base = self.features.poll_interval;
        if self.push_is_unreliable() {
            (base / 2).max(Duration::from_secs(15))
        } else {
            base
        }
    }

    pub fn needs_identity(&self, credentials: &AccountCredentials) -> bool {
        self.requires_identity || credentials.announce_identity
    }
}
