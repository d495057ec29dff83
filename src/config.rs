use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

/// Public STUN servers used when nothing else is configured.
pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("at least two distinct STUN servers are required, got {0}")]
    NotEnoughStunServers(usize),

    #[error("unsupported ICE server url: {0}")]
    UnsupportedUrl(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
        }
    }
}

/// Peer-connection configuration. STUN only, no relay servers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RtcConfig {
    pub ice_servers: Vec<IceServer>,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_SERVERS.iter().map(|u| IceServer::stun(*u)).collect(),
        }
    }
}

impl RtcConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut distinct = HashSet::new();
        for url in self.ice_servers.iter().flat_map(|s| s.urls.iter()) {
            if !url.starts_with("stun:") {
                return Err(ConfigError::UnsupportedUrl(url.clone()));
            }
            distinct.insert(url.as_str());
        }
        if distinct.len() < 2 {
            return Err(ConfigError::NotEnoughStunServers(distinct.len()));
        }
        Ok(())
    }
}

/// Timing and network settings of a call controller.
#[derive(Clone, Debug)]
pub struct CallConfig {
    /// How long an outgoing call rings before it is marked missed.
    pub ring_timeout: Duration,
    /// How long a session may sit in `connecting` before it is given up.
    /// `None` waits forever.
    pub connect_timeout: Option<Duration>,
    /// Time a `disconnected` connection gets to recover before the call is
    /// ended. Zero ends it immediately.
    pub disconnect_grace: Duration,
    pub duration_tick: Duration,
    pub rtc: RtcConfig,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(30),
            connect_timeout: Some(Duration::from_secs(30)),
            disconnect_grace: Duration::ZERO,
            duration_tick: Duration::from_secs(1),
            rtc: RtcConfig::default(),
        }
    }
}

impl CallConfig {
    pub fn with_ring_timeout(mut self, timeout: Duration) -> Self {
        self.ring_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_disconnect_grace(mut self, grace: Duration) -> Self {
        self.disconnect_grace = grace;
        self
    }

    pub fn with_rtc(mut self, rtc: RtcConfig) -> Self {
        self.rtc = rtc;
        self
    }
}
