//! Error types surfaced by the TCP stack, split between errors returned to
//! callers of the user API and errors raised while parsing TCP segments.

use thiserror::Error;

/// A convenience wrapper around `Result` for `tcp_stack::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Set of errors returned by the blocking user API.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// An open call was issued on a TCB that is not in the CLOSED state.
    #[error("connection is already open")]
    AlreadyConnected,
    /// A send or receive call was issued on a TCB without an established
    /// connection.
    #[error("connection is not established")]
    NotConnected,
    /// All receive buffers of the pool are leased to other connections.
    #[error("all receive buffers are in use")]
    NoBuffer,
    /// A passive open requested a local port another TCB is bound to.
    #[error("local port is already in use")]
    AddrInUse,
    /// The peer answered the connection attempt with a reset.
    #[error("connection refused by peer")]
    ConnRefused,
    /// The peer reset an established connection.
    #[error("connection reset by peer")]
    ConnReset,
    /// The connection timed out while a send or receive call was blocked.
    #[error("connection aborted due to timeout")]
    ConnAborted,
    /// The user-specified timeout of a call expired.
    #[error("user timeout expired")]
    TimedOut,
    /// A non-blocking receive found no buffered data.
    #[error("no data available, try again later")]
    WouldBlock,
    /// A malformed endpoint or an otherwise invalid argument was passed.
    #[error("invalid argument")]
    InvalidArg,
    /// The address family of an endpoint is not supported by the stack.
    #[error("address family not supported")]
    FamilyUnsupported,
}

/// Error occurred while trying to parse a TCP segment.
///
/// Parse errors never reach the user API; segments failing to parse are
/// dropped by the event loop.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    /// Input buffer is shorter than a minimal TCP header.
    #[error("segment of {provided} bytes is shorter than the minimal header of {min} bytes")]
    InvalidBufferLength {
        /// Number of bytes handed to the parser.
        provided: usize,
        /// Minimal number of bytes of a valid header.
        min: usize,
    },
    /// Invalid TCP data offset (must be within `5..=15`).
    #[error("invalid data offset: {provided} (valid range: {min}..={max})")]
    InvalidDataOffset {
        /// Data offset found in the segment.
        provided: u8,
        /// Minimal valid data offset.
        min: u8,
        /// Maximal valid data offset.
        max: u8,
    },
    /// Fewer bytes in the buffer than advertised by the data offset.
    #[error(
        "segment of {provided} bytes is shorter than indicated by data offset: {expected} bytes"
    )]
    HeaderLengthMismatch {
        /// Number of bytes handed to the parser.
        provided: usize,
        /// Header length in bytes derived from the data offset.
        expected: usize,
    },
    /// An option's length octet is zero, truncated, or runs past the header.
    #[error("malformed option (kind {kind}) in TCP header")]
    MalformedOption {
        /// Option kind whose length was inconsistent.
        kind: u8,
    },
}
