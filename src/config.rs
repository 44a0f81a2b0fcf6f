/// Consecutive, in-order RTP packets required before a newly observed sender
/// is considered valid (RFC 3550 probation).
pub const DEFAULT_PROBATION: u32 = 2;

/// Largest permissible forward sequence jump, in packets (RFC 3550 A.1).
pub const DEFAULT_MAX_DROPOUT: u16 = 3000;

/// Largest backward sequence distance still treated as reordering rather
/// than a restart (RFC 3550 A.1).
pub const DEFAULT_MAX_MISORDER: u16 = 100;

/// Packets buffered while a source is on probation; the oldest is dropped
/// beyond this.
pub const DEFAULT_MAX_PROBATION_QUEUE: usize = 32;

/// Fixed lower-layer overhead (UDP/IPv4) counted on top of every datagram
/// for bandwidth accounting, in bytes.
pub const DEFAULT_HEADER_OVERHEAD: usize = 28;

/// Default target session bandwidth, in bits per second.
pub const DEFAULT_BANDWIDTH: f64 = 64000.0;

/// Fraction of the session bandwidth granted to RTCP.
pub const DEFAULT_RTCP_FRACTION: f64 = 0.05;

/// Session tunables. `SessionConfig::default()` matches the RFC 3550
/// recommended values.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Consecutive packets required before a new RTP source validates.
    pub probation: u32,
    /// Forward sequence window accepted as an ordinary gap.
    pub max_dropout: u16,
    /// Backward sequence window accepted as reordering.
    pub max_misorder: u16,
    /// Probation queue capacity.
    pub max_probation_queue: usize,
    /// Lower-layer header overhead added to every datagram size.
    pub header_overhead: usize,
    /// Target session bandwidth in bits per second.
    pub bandwidth: f64,
    /// Target RTCP bandwidth in bits per second.
    pub rtcp_bandwidth: f64,
    /// Seed for the session-owned SSRC generator. `None` seeds from entropy;
    /// fixing it makes SSRC allocation deterministic for tests.
    pub ssrc_seed: Option<u64>,
    /// Bound on the retry-until-unique SSRC allocation loop.
    pub max_ssrc_retries: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            probation: DEFAULT_PROBATION,
            max_dropout: DEFAULT_MAX_DROPOUT,
            max_misorder: DEFAULT_MAX_MISORDER,
            max_probation_queue: DEFAULT_MAX_PROBATION_QUEUE,
            header_overhead: DEFAULT_HEADER_OVERHEAD,
            bandwidth: DEFAULT_BANDWIDTH,
            rtcp_bandwidth: DEFAULT_BANDWIDTH * DEFAULT_RTCP_FRACTION,
            ssrc_seed: None,
            max_ssrc_retries: 1024,
        }
    }
}
