//! Node configuration subsections.
//!
//! All the `node.*` configuration parameters: resource limits, handshake
//! timing, neighbor liveness, admission filter windows, routing weights,
//! retransmission and internal buffers.

use serde::{Deserialize, Serialize};

use super::IdentityConfig;
use crate::reliable::RetransmitSchedule;
use crate::routing::RoutingPolicy;

// ============================================================================
// Node Configuration Subsections
// ============================================================================

/// Resource limits (`node.limits.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Max neighbor connections, handshaking included (`node.limits.max_neighbors`).
    #[serde(default = "LimitsConfig::default_max_neighbors")]
    pub max_neighbors: usize,
    /// Max outstanding waits (`node.limits.max_pending_requests`).
    #[serde(default = "LimitsConfig::default_max_pending_requests")]
    pub max_pending_requests: usize,
    /// Max multi-hop requests handled concurrently (`node.limits.max_routed_requests`).
    #[serde(default = "LimitsConfig::default_max_routed_requests")]
    pub max_routed_requests: usize,
    /// Max cached responses (`node.limits.responder_cache_size`).
    #[serde(default = "LimitsConfig::default_responder_cache_size")]
    pub responder_cache_size: usize,
    /// Token regeneration attempts on collision (`node.limits.token_attempts`).
    #[serde(default = "LimitsConfig::default_token_attempts")]
    pub token_attempts: usize,
    /// Requester ephemeral keys remembered for reuse detection
    /// (`node.limits.max_recent_ephemeral_keys`).
    #[serde(default = "LimitsConfig::default_max_recent_ephemeral_keys")]
    pub max_recent_ephemeral_keys: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_neighbors: 32,
            max_pending_requests: 4096,
            max_routed_requests: 1024,
            responder_cache_size: 4096,
            token_attempts: 100,
            max_recent_ephemeral_keys: 16_384,
        }
    }
}

impl LimitsConfig {
    fn default_max_neighbors() -> usize { 32 }
    fn default_max_pending_requests() -> usize { 4096 }
    fn default_max_routed_requests() -> usize { 1024 }
    fn default_responder_cache_size() -> usize { 4096 }
    fn default_token_attempts() -> usize { 100 }
    fn default_max_recent_ephemeral_keys() -> usize { 16_384 }
}

/// Handshake timing and routing bounds (`node.handshake.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeConfig {
    /// End-to-end deadline of a REGISTER flow in ms (`node.handshake.registration_timeout_ms`).
    #[serde(default = "HandshakeConfig::default_registration_timeout_ms")]
    pub registration_timeout_ms: u64,
    /// End-to-end deadline of an INVITE flow in ms (`node.handshake.invite_timeout_ms`).
    #[serde(default = "HandshakeConfig::default_invite_timeout_ms")]
    pub invite_timeout_ms: u64,
    /// Deadline for one hop to acknowledge with NPACK in ms (`node.handshake.hop_timeout_ms`).
    #[serde(default = "HandshakeConfig::default_hop_timeout_ms")]
    pub hop_timeout_ms: u64,
    /// Initial REGISTER hop budget (`node.handshake.hop_budget`).
    #[serde(default = "HandshakeConfig::default_hop_budget")]
    pub hop_budget: u8,
    /// Initial INVITE hop budget (`node.handshake.invite_hop_budget`).
    #[serde(default = "HandshakeConfig::default_invite_hop_budget")]
    pub invite_hop_budget: u8,
    /// Next hops a proxy tries before reporting route-unavailable
    /// (`node.handshake.max_proxy_attempts`).
    #[serde(default = "HandshakeConfig::default_max_proxy_attempts")]
    pub max_proxy_attempts: usize,
    /// How long answered requests are replayed from cache in ms
    /// (`node.handshake.responder_retention_ms`).
    #[serde(default = "HandshakeConfig::default_responder_retention_ms")]
    pub responder_retention_ms: u64,
    /// How long a requester ephemeral key stays blacklisted in ms
    /// (`node.handshake.ephemeral_key_retention_ms`).
    #[serde(default = "HandshakeConfig::default_ephemeral_key_retention_ms")]
    pub ephemeral_key_retention_ms: u64,
    /// Nonces tried per proof-of-work search (`node.handshake.pow_max_attempts`).
    #[serde(default = "HandshakeConfig::default_pow_max_attempts")]
    pub pow_max_attempts: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            registration_timeout_ms: 30_000,
            invite_timeout_ms: 20_000,
            hop_timeout_ms: 5_000,
            hop_budget: 8,
            invite_hop_budget: 16,
            max_proxy_attempts: 3,
            responder_retention_ms: 30_000,
            ephemeral_key_retention_ms: 300_000,
            pow_max_attempts: crate::admission::POW_MAX_ATTEMPTS,
        }
    }
}

impl HandshakeConfig {
    fn default_registration_timeout_ms() -> u64 { 30_000 }
    fn default_invite_timeout_ms() -> u64 { 20_000 }
    fn default_hop_timeout_ms() -> u64 { 5_000 }
    fn default_hop_budget() -> u8 { 8 }
    fn default_invite_hop_budget() -> u8 { 16 }
    fn default_max_proxy_attempts() -> usize { 3 }
    fn default_responder_retention_ms() -> u64 { 30_000 }
    fn default_ephemeral_key_retention_ms() -> u64 { 300_000 }
    fn default_pow_max_attempts() -> u64 { crate::admission::POW_MAX_ATTEMPTS }
}

/// Neighbor liveness (`node.liveness.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// RTT assumed before the first PONG in ms (`node.liveness.initial_rtt_ms`).
    #[serde(default = "LivenessConfig::default_initial_rtt_ms")]
    pub initial_rtt_ms: u64,
    /// Idle time before a ping, as a multiple of RTT (`node.liveness.rtt_multiplier`).
    #[serde(default = "LivenessConfig::default_rtt_multiplier")]
    pub rtt_multiplier: u64,
    /// Lower bound on the ping interval in ms (`node.liveness.min_ping_interval_ms`).
    #[serde(default = "LivenessConfig::default_min_ping_interval_ms")]
    pub min_ping_interval_ms: u64,
    /// Upper bound on the ping interval in ms (`node.liveness.max_ping_interval_ms`).
    #[serde(default = "LivenessConfig::default_max_ping_interval_ms")]
    pub max_ping_interval_ms: u64,
    /// Silence after which a neighbor is disposed in ms (`node.liveness.neighbor_timeout_ms`).
    #[serde(default = "LivenessConfig::default_neighbor_timeout_ms")]
    pub neighbor_timeout_ms: u64,
    /// Delay between a teardown request and disposal in ms (`node.liveness.teardown_grace_ms`).
    #[serde(default = "LivenessConfig::default_teardown_grace_ms")]
    pub teardown_grace_ms: u64,
    /// Delay before a disposed token's slot is reused in ms (`node.liveness.disposal_grace_ms`).
    #[serde(default = "LivenessConfig::default_disposal_grace_ms")]
    pub disposal_grace_ms: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            initial_rtt_ms: 500,
            rtt_multiplier: 20,
            min_ping_interval_ms: 2_000,
            max_ping_interval_ms: 15_000,
            neighbor_timeout_ms: 45_000,
            teardown_grace_ms: 2_000,
            disposal_grace_ms: 10_000,
        }
    }
}

impl LivenessConfig {
    fn default_initial_rtt_ms() -> u64 { 500 }
    fn default_rtt_multiplier() -> u64 { 20 }
    fn default_min_ping_interval_ms() -> u64 { 2_000 }
    fn default_max_ping_interval_ms() -> u64 { 15_000 }
    fn default_neighbor_timeout_ms() -> u64 { 45_000 }
    fn default_teardown_grace_ms() -> u64 { 2_000 }
    fn default_disposal_grace_ms() -> u64 { 10_000 }
}

/// Proof-of-work admission windows (`node.admission.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Accepted clock skew in seconds (`node.admission.timestamp_tolerance_secs`).
    #[serde(default = "AdmissionConfig::default_timestamp_tolerance_secs")]
    pub timestamp_tolerance_secs: u32,
    /// How long a PoW1 nonce stays in the replay set (`node.admission.nonce_retention_secs`).
    #[serde(default = "AdmissionConfig::default_nonce_retention_secs")]
    pub nonce_retention_secs: u64,
    /// Replay set size cap (`node.admission.max_recent_nonces`).
    #[serde(default = "AdmissionConfig::default_max_recent_nonces")]
    pub max_recent_nonces: usize,
    /// Challenge table rotation period (`node.admission.challenge_period_secs`).
    #[serde(default = "AdmissionConfig::default_challenge_period_secs")]
    pub challenge_period_secs: u64,
    /// Challenges per table before an early rotation (`node.admission.max_challenges`).
    #[serde(default = "AdmissionConfig::default_max_challenges")]
    pub max_challenges: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            timestamp_tolerance_secs: 120,
            nonce_retention_secs: 300,
            max_recent_nonces: 65_536,
            challenge_period_secs: 60,
            max_challenges: 16_384,
        }
    }
}

impl AdmissionConfig {
    fn default_timestamp_tolerance_secs() -> u32 { 120 }
    fn default_nonce_retention_secs() -> u64 { 300 }
    fn default_max_recent_nonces() -> usize { 65_536 }
    fn default_challenge_period_secs() -> u64 { 60 }
    fn default_max_challenges() -> usize { 16_384 }
}

/// Internal buffers (`node.buffers.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuffersConfig {
    /// Transport→Node packet channel capacity (`node.buffers.packet_channel`).
    #[serde(default = "BuffersConfig::default_packet_channel")]
    pub packet_channel: usize,
    /// Handle→Node command channel capacity (`node.buffers.command_channel`).
    #[serde(default = "BuffersConfig::default_command_channel")]
    pub command_channel: usize,
    /// Event broadcast capacity (`node.buffers.event_channel`).
    #[serde(default = "BuffersConfig::default_event_channel")]
    pub event_channel: usize,
}

impl Default for BuffersConfig {
    fn default() -> Self {
        Self {
            packet_channel: 1024,
            command_channel: 64,
            event_channel: 256,
        }
    }
}

impl BuffersConfig {
    fn default_packet_channel() -> usize { 1024 }
    fn default_command_channel() -> usize { 64 }
    fn default_event_channel() -> usize { 256 }
}

// ============================================================================
// Node Configuration (Root)
// ============================================================================

/// Node configuration (`node.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Identity configuration (`node.identity.*`).
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Engine tick period in ms (`node.tick_interval_ms`).
    #[serde(default = "NodeConfig::default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Wall clock resync period in seconds (`node.clock_resync_secs`).
    #[serde(default = "NodeConfig::default_clock_resync_secs")]
    pub clock_resync_secs: u64,

    /// Resource limits (`node.limits.*`).
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Retransmission schedule (`node.retransmit.*`).
    #[serde(default)]
    pub retransmit: RetransmitSchedule,

    /// Handshake timing (`node.handshake.*`).
    #[serde(default)]
    pub handshake: HandshakeConfig,

    /// Neighbor liveness (`node.liveness.*`).
    #[serde(default)]
    pub liveness: LivenessConfig,

    /// Admission filter (`node.admission.*`).
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Routing weights (`node.routing.*`).
    #[serde(default)]
    pub routing: RoutingPolicy,

    /// Internal buffers (`node.buffers.*`).
    #[serde(default)]
    pub buffers: BuffersConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            tick_interval_ms: 100,
            clock_resync_secs: 10,
            limits: LimitsConfig::default(),
            retransmit: RetransmitSchedule::default(),
            handshake: HandshakeConfig::default(),
            liveness: LivenessConfig::default(),
            admission: AdmissionConfig::default(),
            routing: RoutingPolicy::default(),
            buffers: BuffersConfig::default(),
        }
    }
}

impl NodeConfig {
    fn default_tick_interval_ms() -> u64 { 100 }
    fn default_clock_resync_secs() -> u64 { 10 }
}
