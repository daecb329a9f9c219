use std::net::Ipv6Addr;

use crate::error::ParseError;

/// Upper-layer protocol number of TCP in the network-layer pseudo-header.
const PROTO_TCP: u8 = 6;

/// TCP Segment Header.
///
/// RFC 793 (3.1)
///
/// ```text
///   0                   1                   2                   3
///     0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |          Source Port          |       Destination Port        |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |                        Sequence Number                        |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |                    Acknowledgment Number                      |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |  Data |           |U|A|P|R|S|F|                               |
///    | Offset| Reserved  |R|C|S|S|Y|I|            Window             |
///    |       |           |G|K|H|T|N|N|                               |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |           Checksum            |         Urgent Pointer        |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |                    Options                    |    Padding    |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |                             data                              |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    /// The source port number.
    src_port: u16,
    /// The destination port number.
    dst_port: u16,
    /// The sequence number of the first data octet in this segment (except
    /// when SYN is present, where it is the initial sequence number).
    seq_number: u32,
    /// If the ACK control bit is set this field contains the next sequence
    /// number the sender of the segment is expecting to receive.
    ack_number: u32,
    /// Data offset (4 bits, header length in 32-bit words), reserved bits,
    /// and the URG/ACK/PSH/RST/SYN/FIN control bits.
    offset_and_control_bits: u16,
    /// The number of data octets the sender of this segment is willing to
    /// accept, beginning with the one indicated in the acknowledgment field.
    window: u16,
    /// One's complement checksum over the pseudo-header, header and text.
    checksum: u16,
    /// Urgent pointer, carried but not interpreted by this stack.
    urgent_pointer: u16,
    /// Options at the end of the header; only MSS (kind 2) is interpreted.
    options: TcpOptions,
}

impl TcpHeader {
    /// Minimum length of a TCP header in bytes.
    pub const MIN_HEADER_LEN: usize = 20;

    /// Maximum length of a TCP header in bytes (data offset 15).
    pub const MAX_HEADER_LEN: usize = 60;

    /// Minimum data offset of a TCP header.
    pub const MIN_DATA_OFFSET: u8 = 5;

    /// Maximum data offset of a TCP header.
    pub const MAX_DATA_OFFSET: u8 = 15;

    /// Creates a new TCP header with the specified ports, sequence number
    /// and window size, and defaults for the remaining fields.
    pub fn new(src_port: u16, dst_port: u16, seq_number: u32, window: u16) -> Self {
        Self {
            src_port,
            dst_port,
            seq_number,
            window,
            ..Default::default()
        }
    }

    /// Returns the `source port` field of the TCP header.
    pub fn src_port(&self) -> u16 {
        self.src_port
    }

    /// Returns the `destination port` field of the TCP header.
    pub fn dst_port(&self) -> u16 {
        self.dst_port
    }

    /// Returns the `sequence number` field of the TCP header.
    pub fn seq_number(&self) -> u32 {
        self.seq_number
    }

    /// Returns the `acknowledgment number` field of the TCP header.
    pub fn ack_number(&self) -> u32 {
        self.ack_number
    }

    /// Sets the `acknowledgment number` field of the TCP header.
    pub fn set_ack_number(&mut self, ack: u32) {
        self.ack_number = ack;
    }

    /// Returns the `data offset` field, the header length in 32-bit words.
    pub fn data_offset(&self) -> u8 {
        // Stored in the higher 4 bits.
        (self.offset_and_control_bits >> 12) as u8
    }

    /// Returns `true` if the URG control bit is set.
    pub fn urg(&self) -> bool {
        (self.offset_and_control_bits >> 5) & 1 == 1
    }

    /// Returns `true` if the ACK control bit is set.
    pub fn ack(&self) -> bool {
        (self.offset_and_control_bits >> 4) & 1 == 1
    }

    /// Sets the ACK control bit.
    pub fn set_ack(&mut self) {
        self.offset_and_control_bits |= 1 << 4;
    }

    /// Returns `true` if the PSH control bit is set.
    pub fn psh(&self) -> bool {
        (self.offset_and_control_bits >> 3) & 1 == 1
    }

    /// Sets the PSH control bit.
    pub fn set_psh(&mut self) {
        self.offset_and_control_bits |= 1 << 3;
    }

    /// Returns `true` if the RST control bit is set.
    pub fn rst(&self) -> bool {
        (self.offset_and_control_bits >> 2) & 1 == 1
    }

    /// Sets the RST control bit.
    pub fn set_rst(&mut self) {
        self.offset_and_control_bits |= 1 << 2;
    }

    /// Returns `true` if the SYN control bit is set.
    pub fn syn(&self) -> bool {
        (self.offset_and_control_bits >> 1) & 1 == 1
    }

    /// Sets the SYN control bit.
    pub fn set_syn(&mut self) {
        self.offset_and_control_bits |= 1 << 1;
    }

    /// Returns `true` if the FIN control bit is set.
    pub fn fin(&self) -> bool {
        self.offset_and_control_bits & 1 == 1
    }

    /// Sets the FIN control bit.
    pub fn set_fin(&mut self) {
        self.offset_and_control_bits |= 1;
    }

    /// Returns the `window` field of the TCP header.
    pub fn window(&self) -> u16 {
        self.window
    }

    /// Returns the `checksum` field of the TCP header.
    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    /// Computes and updates the `checksum` field for the TCP header.
    pub fn set_checksum(&mut self, src: &Ipv6Addr, dst: &Ipv6Addr, payload: &[u8]) {
        self.checksum = self.compute_checksum(src, dst, payload);
    }

    /// Returns `true` if the TCP header checksum is valid.
    pub fn is_valid_checksum(&self, src: &Ipv6Addr, dst: &Ipv6Addr, payload: &[u8]) -> bool {
        self.checksum == self.compute_checksum(src, dst, payload)
    }

    /// Returns the `urgent pointer` field of the TCP header.
    pub fn urgent_pointer(&self) -> u16 {
        self.urgent_pointer
    }

    /// Returns the `options` field of the TCP header.
    pub fn options(&self) -> TcpOptions {
        self.options
    }

    /// Appends the Maximum Segment Size (MSS) option with the provided
    /// value, growing the data offset accordingly.
    pub fn set_option_mss(&mut self, mss: u16) {
        if self.options.set_mss(mss) {
            let new_data_offset =
                ((TcpOptions::MSS_LEN >> 2) as u16) + (self.data_offset() as u16);

            // Clear the previous data offset, keeping the values of the
            // reserved and control bits.
            self.offset_and_control_bits &= 0x0FFF;
            self.offset_and_control_bits |= new_data_offset << 12;
        }
    }

    /// Returns the length of the TCP header in bytes, including options.
    pub fn header_len(&self) -> usize {
        Self::MIN_HEADER_LEN + self.options.len()
    }

    /// Returns the computed checksum of the TCP header.
    ///
    /// The checksum is the 16-bit one's complement of the one's complement
    /// sum of all 16-bit words in the pseudo-header, TCP header and payload,
    /// with the checksum field read as zero. The pseudo-header is the
    /// network layer's:
    ///
    /// ```text
    ///        +--------+--------+--------+--------+
    ///        |                                   |
    ///        +        Source Address (16)        +
    ///        |                                   |
    ///        +--------+--------+--------+--------+
    ///        |                                   |
    ///        +      Destination Address (16)     +
    ///        |                                   |
    ///        +--------+--------+--------+--------+
    ///        |         Upper-Layer Length        |
    ///        +--------+--------+--------+--------+
    ///        |          zero            |  PTCL  |
    ///        +--------+--------+--------+--------+
    /// ```
    pub fn compute_checksum(&self, src: &Ipv6Addr, dst: &Ipv6Addr, payload: &[u8]) -> u16 {
        let mut pseudo_header = [0u8; 40];

        pseudo_header[0..16].copy_from_slice(&src.octets());
        pseudo_header[16..32].copy_from_slice(&dst.octets());

        let tcp_len = (self.header_len() + payload.len()) as u32;
        pseudo_header[32..36].copy_from_slice(&tcp_len.to_be_bytes());
        pseudo_header[39] = PROTO_TCP;

        let (mut raw_header, nbytes) = self.to_be_bytes();

        // Checksum field must be 0 for computation.
        raw_header[16] = 0x00;
        raw_header[17] = 0x00;

        let mut checksum_iter = pseudo_header
            .iter()
            .chain(raw_header[..nbytes].iter())
            .chain(payload.iter());

        let mut sum = 0u32;

        loop {
            let word = match (checksum_iter.next(), checksum_iter.next()) {
                (Some(h), Some(l)) => u16::from_be_bytes([*h, *l]),
                // An odd trailing octet is padded on the right with zeros.
                (Some(h), None) => u16::from_be_bytes([*h, 0x00]),
                _ => break,
            };

            sum += word as u32;
        }

        // Fold the carries back into the lower 16 bits.
        while sum > 0xFFFF {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }

        !(sum as u16)
    }

    /// Returns the memory representation of the TCP header as a byte array
    /// in big-endian (network) byte order.
    ///
    /// A buffer of size `TcpHeader::MAX_HEADER_LEN` is used as the byte
    /// array, so the number of bytes written is also returned.
    #[allow(clippy::wrong_self_convention)]
    pub fn to_be_bytes(&self) -> ([u8; Self::MAX_HEADER_LEN], usize) {
        let mut raw_header = [0u8; Self::MAX_HEADER_LEN];
        let size = self.header_len();

        raw_header[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        raw_header[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        raw_header[4..8].copy_from_slice(&self.seq_number.to_be_bytes());
        raw_header[8..12].copy_from_slice(&self.ack_number.to_be_bytes());
        raw_header[12..14].copy_from_slice(&self.offset_and_control_bits.to_be_bytes());
        raw_header[14..16].copy_from_slice(&self.window.to_be_bytes());
        raw_header[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        raw_header[18..20].copy_from_slice(&self.urgent_pointer.to_be_bytes());

        raw_header[20..size].copy_from_slice(self.options.as_slice());

        (raw_header, size)
    }
}

impl TryFrom<&[u8]> for TcpHeader {
    type Error = ParseError;

    fn try_from(header_raw: &[u8]) -> Result<Self, Self::Error> {
        if header_raw.len() < Self::MIN_HEADER_LEN {
            return Err(ParseError::InvalidBufferLength {
                provided: header_raw.len(),
                min: Self::MIN_HEADER_LEN,
            });
        }

        let offset_and_control_bits = u16::from_be_bytes([header_raw[12], header_raw[13]]);
        let data_offset = (offset_and_control_bits >> 12) as u8;

        if data_offset < Self::MIN_DATA_OFFSET {
            return Err(ParseError::InvalidDataOffset {
                provided: data_offset,
                min: Self::MIN_DATA_OFFSET,
                max: Self::MAX_DATA_OFFSET,
            });
        }

        let header_len = (data_offset as usize) << 2;

        // There are fewer bytes in the buffer than advertised by the data
        // offset.
        if header_len > header_raw.len() {
            return Err(ParseError::HeaderLengthMismatch {
                provided: header_raw.len(),
                expected: header_len,
            });
        }

        Ok(Self {
            src_port: u16::from_be_bytes([header_raw[0], header_raw[1]]),
            dst_port: u16::from_be_bytes([header_raw[2], header_raw[3]]),
            seq_number: u32::from_be_bytes([
                header_raw[4],
                header_raw[5],
                header_raw[6],
                header_raw[7],
            ]),
            ack_number: u32::from_be_bytes([
                header_raw[8],
                header_raw[9],
                header_raw[10],
                header_raw[11],
            ]),
            offset_and_control_bits,
            window: u16::from_be_bytes([header_raw[14], header_raw[15]]),
            checksum: u16::from_be_bytes([header_raw[16], header_raw[17]]),
            urgent_pointer: u16::from_be_bytes([header_raw[18], header_raw[19]]),
            options: TcpOptions::try_from(&header_raw[Self::MIN_HEADER_LEN..header_len])?,
        })
    }
}

impl Default for TcpHeader {
    fn default() -> Self {
        Self {
            src_port: 0,
            dst_port: 0,
            seq_number: 0,
            ack_number: 0,
            // Data offset = 5, reserved bits and control bits cleared.
            offset_and_control_bits: 0b0101_000000_000000,
            window: 0,
            checksum: 0,
            urgent_pointer: 0,
            options: Default::default(),
        }
    }
}

/// Option kinds recognized while walking the options area.
///
/// RFC 793 (3.1)
///
/// ```text
///      Kind     Length    Meaning
///      ----     ------    -------
///       0         -       End of option list.
///       1         -       No-Operation.
///       2         4       Maximum Segment Size.
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OptionKind {
    /// End of option list.
    Eol,
    /// No-operation, used for alignment padding.
    Nop,
    /// Maximum Segment Size.
    Mss,
    /// Any other option; skipped by its length octet.
    Unknown(u8),
}

impl From<u8> for OptionKind {
    fn from(kind: u8) -> Self {
        match kind {
            0 => OptionKind::Eol,
            1 => OptionKind::Nop,
            2 => OptionKind::Mss,
            other => OptionKind::Unknown(other),
        }
    }
}

/// Options within a TCP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpOptions {
    /// The total number of bytes occupying the buffer.
    len: usize,
    /// Fixed-size array of raw option bytes.
    buf: [u8; Self::MAX_OPTIONS_LEN],
}

impl TcpOptions {
    /// Maximum length of TCP options in bytes.
    pub const MAX_OPTIONS_LEN: usize = 40;

    /// Length of the MSS option in bytes.
    pub const MSS_LEN: usize = 4;

    /// Creates new, empty TCP options.
    pub fn new() -> Self {
        Self {
            len: 0,
            buf: [0u8; Self::MAX_OPTIONS_LEN],
        }
    }

    /// Returns the Maximum Segment Size (MSS) value from the TCP options,
    /// if present. Unknown options are skipped by their length octet.
    pub fn mss(&self) -> Option<u16> {
        let opts = self.as_slice();
        let mut at = 0;

        while at < opts.len() {
            match OptionKind::from(opts[at]) {
                OptionKind::Eol => return None,
                OptionKind::Nop => at += 1,
                OptionKind::Mss => {
                    // RFC 793 (3.1)
                    //
                    // ```text
                    //          1        2        3         4
                    //        +--------+--------+---------+--------+
                    //        |00000010|00000100|   max seg size   |
                    //        +--------+--------+---------+--------+
                    // ```
                    if at + Self::MSS_LEN > opts.len() || opts[at + 1] != Self::MSS_LEN as u8 {
                        return None;
                    }
                    return Some(u16::from_be_bytes([opts[at + 2], opts[at + 3]]));
                }
                OptionKind::Unknown(_) => {
                    if at + 1 >= opts.len() {
                        return None;
                    }
                    let len = opts[at + 1] as usize;
                    if len < 2 {
                        return None;
                    }
                    at += len;
                }
            }
        }

        None
    }

    /// Appends the Maximum Segment Size (MSS) option, returning `true` if
    /// the options buffer changed.
    fn set_mss(&mut self, mss: u16) -> bool {
        // Skip appending if an MSS is already present or would not fit.
        if self.mss().is_some() || self.len + Self::MSS_LEN > Self::MAX_OPTIONS_LEN {
            return false;
        }

        self.buf[self.len] = 2;
        self.buf[self.len + 1] = Self::MSS_LEN as u8;
        self.buf[self.len + 2..self.len + 4].copy_from_slice(&mss.to_be_bytes());
        self.len += Self::MSS_LEN;

        true
    }

    /// Returns the length of the TCP options in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the TCP options contain no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the raw option bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<&[u8]> for TcpOptions {
    type Error = ParseError;

    fn try_from(opts_raw: &[u8]) -> Result<Self, Self::Error> {
        // Validate the kind/length structure up front so later walks cannot
        // run past the buffer.
        let mut at = 0;
        while at < opts_raw.len() {
            match OptionKind::from(opts_raw[at]) {
                OptionKind::Eol => break,
                OptionKind::Nop => at += 1,
                kind => {
                    if at + 1 >= opts_raw.len() {
                        return Err(ParseError::MalformedOption { kind: opts_raw[at] });
                    }
                    let len = opts_raw[at + 1] as usize;
                    if len < 2 || at + len > opts_raw.len() {
                        return Err(ParseError::MalformedOption { kind: opts_raw[at] });
                    }
                    if kind == OptionKind::Mss && len != Self::MSS_LEN {
                        return Err(ParseError::MalformedOption { kind: opts_raw[at] });
                    }
                    at += len;
                }
            }
        }

        let mut options = Self::new();
        options.buf[..opts_raw.len()].copy_from_slice(opts_raw);
        options.len = opts_raw.len();

        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn addrs() -> (Ipv6Addr, Ipv6Addr) {
        (
            "fe80::1".parse().unwrap(),
            "fe80::2".parse().unwrap(),
        )
    }

    proptest! {
        #[test]
        fn tcp_header_parsing_no_panic(
            header_bytes in prop::collection::vec(any::<u8>(), 0..TcpHeader::MAX_HEADER_LEN),
        ) {
            if let Ok(header) = TcpHeader::try_from(&header_bytes[..]) {
                let (bytes, nbytes) = header.to_be_bytes();
                let header_parsed = TcpHeader::try_from(&bytes[..nbytes]).unwrap();
                prop_assert_eq!(header, header_parsed);
            }
        }

        #[test]
        fn tcp_header_encode_decode_round_trip(
            src_port in any::<u16>(),
            dst_port in any::<u16>(),
            seq in any::<u32>(),
            ack in any::<u32>(),
            window in any::<u16>(),
            mss in 1u16..,
            payload in prop::collection::vec(any::<u8>(), 0..64),
        ) {
            let (src, dst) = addrs();

            let mut header = TcpHeader::new(src_port, dst_port, seq, window);
            header.set_ack_number(ack);
            header.set_ack();
            header.set_psh();
            header.set_option_mss(mss);
            header.set_checksum(&src, &dst, &payload);

            let (bytes, nbytes) = header.to_be_bytes();
            let parsed = TcpHeader::try_from(&bytes[..nbytes]).unwrap();

            prop_assert_eq!(parsed, header);
            prop_assert!(parsed.is_valid_checksum(&src, &dst, &payload));
        }
    }

    #[test]
    fn tcp_header_basic_valid() {
        let header_bytes: [u8; 20] = [
            0x1f, 0x90, 0x00, 0x50, 0x00, 0x00, 0x00, 0x2a, 0x00, 0x00, 0x00, 0x07, 0x50, 0x18,
            0x10, 0x00, 0xbe, 0xef, 0x00, 0x00,
        ];

        let header = TcpHeader::try_from(&header_bytes[..]).unwrap();

        assert_eq!(header.src_port(), 8080);
        assert_eq!(header.dst_port(), 80);
        assert_eq!(header.seq_number(), 42);
        assert_eq!(header.ack_number(), 7);
        assert_eq!(header.data_offset(), 5);
        assert!(header.ack());
        assert!(header.psh());
        assert!(!header.syn());
        assert!(!header.fin());
        assert!(!header.rst());
        assert!(!header.urg());
        assert_eq!(header.window(), 4096);
        assert_eq!(header.checksum(), 0xBEEF);
    }

    #[test]
    fn tcp_header_flag_bit_isolation_valid() {
        for bit in 0..6 {
            let mut header_bytes: [u8; 20] = [0; 20];
            header_bytes[12] = 0x50;
            header_bytes[13] = 1 << bit;

            let header = TcpHeader::try_from(&header_bytes[..]).unwrap();

            assert_eq!(header.fin(), bit == 0, "FIN failed for bit {bit}");
            assert_eq!(header.syn(), bit == 1, "SYN failed for bit {bit}");
            assert_eq!(header.rst(), bit == 2, "RST failed for bit {bit}");
            assert_eq!(header.psh(), bit == 3, "PSH failed for bit {bit}");
            assert_eq!(header.ack(), bit == 4, "ACK failed for bit {bit}");
            assert_eq!(header.urg(), bit == 5, "URG failed for bit {bit}");
        }
    }

    #[test]
    fn tcp_header_mss_option_valid() {
        let mut header = TcpHeader::new(1, 2, 0, 0);
        header.set_option_mss(1220);

        assert_eq!(header.data_offset(), 6);
        assert_eq!(header.header_len(), 24);

        let (bytes, nbytes) = header.to_be_bytes();
        let parsed = TcpHeader::try_from(&bytes[..nbytes]).unwrap();

        assert_eq!(parsed.options().mss(), Some(1220));
    }

    #[test]
    fn tcp_header_unknown_option_skipped() {
        // NOP, window scale (kind 3, len 3), then MSS of 1400.
        let mut header_bytes = [0u8; 28];
        header_bytes[12] = 0x70;
        header_bytes[20..28].copy_from_slice(&[1, 3, 3, 7, 2, 4, 0x05, 0x78]);

        let header = TcpHeader::try_from(&header_bytes[..]).unwrap();

        assert_eq!(header.data_offset(), 7);
        assert_eq!(header.options().mss(), Some(1400));
    }

    #[test]
    fn tcp_header_data_offset_invalid() {
        let mut header_bytes = [0u8; 20];
        header_bytes[12] = 0x40;

        assert_eq!(
            TcpHeader::try_from(&header_bytes[..]),
            Err(ParseError::InvalidDataOffset {
                provided: 4,
                min: TcpHeader::MIN_DATA_OFFSET,
                max: TcpHeader::MAX_DATA_OFFSET,
            })
        );
    }

    #[test]
    fn tcp_header_buffer_length_invalid() {
        let header_bytes = [0u8; 12];

        assert!(TcpHeader::try_from(&header_bytes[..]).is_err());
    }

    #[test]
    fn tcp_header_truncated_options_invalid() {
        // Data offset of 6 words but only 20 bytes of header.
        let mut header_bytes = [0u8; 20];
        header_bytes[12] = 0x60;

        assert_eq!(
            TcpHeader::try_from(&header_bytes[..]),
            Err(ParseError::HeaderLengthMismatch {
                provided: 20,
                expected: 24,
            })
        );
    }

    #[test]
    fn tcp_header_malformed_option_length_invalid() {
        // An unknown option whose length octet runs past the header.
        let mut header_bytes = [0u8; 24];
        header_bytes[12] = 0x60;
        header_bytes[20..24].copy_from_slice(&[42, 9, 0, 0]);

        assert_eq!(
            TcpHeader::try_from(&header_bytes[..]),
            Err(ParseError::MalformedOption { kind: 42 })
        );
    }

    #[test]
    fn tcp_header_checksum_detects_corruption() {
        let (src, dst) = addrs();
        let payload = [1, 2, 3, 4, 5];

        let mut header = TcpHeader::new(1000, 2000, 99, 512);
        header.set_checksum(&src, &dst, &payload);

        assert!(header.is_valid_checksum(&src, &dst, &payload));
        assert!(!header.is_valid_checksum(&src, &dst, &[1, 2, 3, 4, 6]));
        assert!(!header.is_valid_checksum(&dst, &src, &payload));
    }
}
