use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthMechanism {
    /// Plain `LOGIN` with a password or app password.
    #[default]
    Login,
    /// `AUTHENTICATE XOAUTH2`; the secret is an OAuth access token.
    Xoauth2,
}

/// Everything needed to reach and log into one mailbox. Never mutated while a
/// session owns it: a change means a new session.
#[derive(Clone, PartialEq, Eq)]
pub struct AccountCredentials {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub address: String,
    pub secret: String,
    pub auth: AuthMechanism,
    pub proxy: Option<String>,
    pub announce_identity: bool,
}

impl AccountCredentials {
    /// Domain part of the account address, lowercased.
    pub fn domain(&self) -> Option<String> {
        self.address
            .rsplit_once('@')
            .map(|(_, domain)| domain.trim().to_ascii_lowercase())
            .filter(|d| !d.is_empty())
    }
}

// Keep the secret out of logs.
impl fmt::Debug for AccountCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secure", &self.secure)
            .field("address", &self.address)
            .field("auth", &self.auth)
            .field("proxy", &self.proxy.as_ref().map(|_| "<set>"))
            .field("announce_identity", &self.announce_identity)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// One state transition as reported to the status callback.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct StatusEvent {
    pub state: ConnectionState,
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(state: ConnectionState, message: Option<String>) -> Self {
        Self {
            state,
            message,
            at: Utc::now(),
        }
    }
}
