//! Construction and serialization of TCP segments.

use crate::protocol::headers::TcpHeader;

/// Fully constructed TCP segment, ready to hand to the network layer.
#[derive(Debug, Clone)]
pub struct TcpSegment {
    /// TCP header of the segment.
    pub hdr: TcpHeader,
    /// Payload of the segment.
    pub payload: Vec<u8>,
}

impl TcpSegment {
    /// Creates a new TCP segment from a header and payload.
    pub fn new(hdr: TcpHeader, payload: &[u8]) -> Self {
        Self {
            hdr,
            payload: payload.into(),
        }
    }

    /// Number of sequence numbers the segment occupies, counting SYN and
    /// FIN.
    pub fn seq_len(&self) -> u32 {
        self.payload.len() as u32
            + if self.hdr.syn() { 1 } else { 0 }
            + if self.hdr.fin() { 1 } else { 0 }
    }

    /// Returns the memory representation of the segment as a vector of
    /// bytes in big-endian (network) byte order.
    pub fn to_be_bytes(&self) -> Vec<u8> {
        let (raw_header, nbytes) = self.hdr.to_be_bytes();

        let mut buf = Vec::with_capacity(nbytes + self.payload.len());
        buf.extend_from_slice(&raw_header[..nbytes]);
        buf.extend_from_slice(&self.payload);

        buf
    }
}
