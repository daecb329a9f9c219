//! Compile-time defaults and the per-stack configuration record.

use std::time::Duration;

/// Capacity of the private mailbox created for each blocking user call.
///
/// Must be a power of two.
pub const MSG_QUEUE_SIZE: usize = 8;

/// Time in milliseconds a connection may sit idle inside a blocking call
/// before the call is aborted.
pub const CONNECTION_TIMEOUT_MS: u64 = 120_000;

/// Maximum Segment Lifetime (`MSL`) in milliseconds.
///
/// A connection stays in TIME_WAIT for twice this duration.
pub const MSL_MS: u64 = 30_000;

/// Initial Retransmission Timeout (`RTO`) in milliseconds, used until the
/// first round-trip measurement.
pub const RTO_INITIAL_MS: u64 = 3_000;

/// Lower clamp for the retransmission timeout in milliseconds.
pub const RTO_MIN_MS: u64 = 1_000;

/// Upper clamp for the retransmission timeout in milliseconds.
pub const RTO_MAX_MS: u64 = 120_000;

/// Shortest allowed interval between zero-window probes in milliseconds.
pub const PROBE_LOWER_BOUND_MS: u64 = 1_000;

/// Longest allowed interval between zero-window probes in milliseconds.
pub const PROBE_UPPER_BOUND_MS: u64 = 60_000;

/// The maximum retry limit for retransmissions before giving up on the
/// connection.
pub const RETRIES_MAX: usize = 5;

/// Maximum Segment Size assumed when the peer did not send an MSS option.
///
/// Matches a 1280-byte minimum MTU minus 40 bytes of network header and
/// 20 bytes of TCP header.
pub const MSS_DEFAULT: u16 = 1220;

/// Size in bytes of one receive buffer.
pub const RCV_BUF_SIZE: usize = 4096;

/// Number of receive buffers held by the pool.
pub const RCV_POOL_SIZE: usize = 4;

/// Tunables of one stack instance.
///
/// `Config::default()` mirrors the module-level constants; tests and
/// constrained deployments override individual fields.
#[derive(Debug, Clone)]
pub struct Config {
    /// Idle timeout aborting blocked user calls.
    pub connection_timeout: Duration,
    /// Maximum Segment Lifetime; TIME_WAIT lasts twice this.
    pub msl: Duration,
    /// Retransmission timeout before the first RTT measurement.
    pub rto_initial: Duration,
    /// Lower clamp applied to the computed retransmission timeout.
    pub rto_min: Duration,
    /// Upper clamp applied to the computed retransmission timeout.
    pub rto_max: Duration,
    /// Lower clamp for the zero-window probe backoff.
    pub probe_lower_bound: Duration,
    /// Upper clamp for the zero-window probe backoff.
    pub probe_upper_bound: Duration,
    /// Retransmission attempts before the connection is torn down.
    pub retries_max: usize,
    /// Maximum segment size announced to and assumed of the peer.
    pub mss: u16,
    /// Size in bytes of each leased receive buffer.
    pub rcv_buf_size: usize,
    /// Number of receive buffers in the pool.
    pub rcv_buffers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_millis(CONNECTION_TIMEOUT_MS),
            msl: Duration::from_millis(MSL_MS),
            rto_initial: Duration::from_millis(RTO_INITIAL_MS),
            rto_min: Duration::from_millis(RTO_MIN_MS),
            rto_max: Duration::from_millis(RTO_MAX_MS),
            probe_lower_bound: Duration::from_millis(PROBE_LOWER_BOUND_MS),
            probe_upper_bound: Duration::from_millis(PROBE_UPPER_BOUND_MS),
            retries_max: RETRIES_MAX,
            mss: MSS_DEFAULT,
            rcv_buf_size: RCV_BUF_SIZE,
            rcv_buffers: RCV_POOL_SIZE,
        }
    }
}
