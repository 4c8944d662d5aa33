use std::time::Duration;

use tracing::warn;

use crate::decision::DecisionConfig;
use crate::types::Profiles;

/// Configuration for a topology node.
///
/// Every field has a default. Tests and the simulator usually shorten the
/// timeouts through the builder methods:
///
/// ```rust
/// use std::time::Duration;
/// use tws_topology::TopologyConfig;
///
/// let config = TopologyConfig::new()
///     .protocol_timeout(Duration::from_millis(200))
///     .marshal_chunk_size(16);
/// assert_eq!(config.marshal_chunk_size, 16);
/// ```
#[derive(Debug, Clone)]
pub struct TopologyConfig {
    /// How long a handset reconnect stays suspended while multipoint audio plays.
    pub handset_audio_wait: Duration,
    /// Handover re-attempts after a veto or timeout.
    pub handover_max_retries: u8,
    /// Delay before a handover re-attempt.
    pub handover_retry_delay: Duration,
    /// Wait bound for each peer handover message.
    pub protocol_timeout: Duration,
    pub find_role_timeout: Duration,
    /// Bound on any other service confirmation.
    pub confirm_timeout: Duration,
    /// Buffer size handed to `marshal`; one peer message per chunk.
    pub marshal_chunk_size: usize,
    /// Multipoint limit.
    pub max_handsets: usize,
    pub auto_connect_profiles: Profiles,
    /// Act on handover requests.
    pub dynamic_handover: bool,
    /// Thresholds for the handover decider.
    pub decision: DecisionConfig,
    pub command_buffer: usize,
    pub event_buffer: usize,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyConfig {
    pub fn new() -> Self {
        Self {
            handset_audio_wait: Duration::from_secs(30),
            handover_max_retries: 3,
            handover_retry_delay: Duration::from_millis(200),
            protocol_timeout: Duration::from_millis(2000),
            find_role_timeout: Duration::from_secs(5),
            confirm_timeout: Duration::from_secs(10),
            marshal_chunk_size: 128,
            max_handsets: 2,
            auto_connect_profiles: Profiles::HFP | Profiles::A2DP,
            dynamic_handover: true,
            decision: DecisionConfig::default(),
            command_buffer: 64,
            event_buffer: 256,
        }
    }

    /// Defaults overridden by `TWS_HANDOVER_MAX_RETRIES` and
    /// `TWS_MARSHAL_CHUNK` when they are set and parse.
    pub fn from_env() -> Self {
        let mut config = Self::new();
        if let Some(retries) = env_parse::<u8>("TWS_HANDOVER_MAX_RETRIES") {
            config.handover_max_retries = retries;
        }
        if let Some(chunk) = env_parse::<usize>("TWS_MARSHAL_CHUNK") {
            config = config.marshal_chunk_size(chunk);
        }
        config
    }

    pub fn handover_max_retries(mut self, retries: u8) -> Self {
        self.handover_max_retries = retries;
        self
    }

    pub fn handover_retry_delay(mut self, delay: Duration) -> Self {
        self.handover_retry_delay = delay;
        self
    }

    pub fn protocol_timeout(mut self, timeout: Duration) -> Self {
        self.protocol_timeout = timeout;
        self
    }

    pub fn confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    pub fn find_role_timeout(mut self, timeout: Duration) -> Self {
        self.find_role_timeout = timeout;
        self
    }

    pub fn handset_audio_wait(mut self, wait: Duration) -> Self {
        self.handset_audio_wait = wait;
        self
    }

    /// Set the marshal buffer size. Clamped to at least one byte.
    pub fn marshal_chunk_size(mut self, bytes: usize) -> Self {
        self.marshal_chunk_size = bytes.max(1);
        self
    }

    pub fn max_handsets(mut self, max: usize) -> Self {
        self.max_handsets = max;
        self
    }

    pub fn auto_connect_profiles(mut self, profiles: Profiles) -> Self {
        self.auto_connect_profiles = profiles;
        self
    }

    pub fn dynamic_handover(mut self, enabled: bool) -> Self {
        self.dynamic_handover = enabled;
        self
    }

    pub fn decision(mut self, decision: DecisionConfig) -> Self {
        self.decision = decision;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}
