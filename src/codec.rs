//! Packet framing for stream and datagram connections.
//!
//! Two wire formats are supported:
//!
//! ```text
//! Stream packet (header_size = 1..=4, default 2):
//! +----------------------+---------------------+
//! | length (BE, N bytes) | payload (length)    |
//! +----------------------+---------------------+
//!
//! Datagram packet (fixed 7 byte header):
//! +-------------------+-------------------+-----------+
//! | total_len (3, BE) | checksum (4, BE)  | payload   |
//! +-------------------+-------------------+-----------+
//! ```
//!
//! The stream `length` counts payload bytes only. The datagram `total_len`
//! includes the header, and `checksum` is the wrapping sum of all payload
//! bytes.
//!
//! Both decoders work on a [`BytesMut`] reassembly buffer that is appended to
//! by the connection and split from the front as whole packets are found.

use bytes::{Buf, Bytes, BytesMut};

use crate::connection::RetryPolicy;
use crate::error::{NetError, Result};

/// Default stream packet header size in bytes.
pub const PKG_HEADER_SIZE_DEFAULT: usize = 2;

/// Largest stream packet header size in bytes.
pub const PKG_HEADER_SIZE_MAX: usize = 4;

/// Hard limit for the configurable maximum payload size.
pub const MAX_DATA_SIZE_LIMIT: usize = 0xFF_FFFF;

/// Datagram packet header size: 3 length bytes plus 4 checksum bytes.
pub const DATAGRAM_HEADER_SIZE: usize = 7;

/// Maximum datagram packet size, header included.
pub const DATAGRAM_MAX_PACKET_SIZE: usize = 0xFF_FFFF;

/// Options for the stream packet codec.
///
/// Values are validated on construction, so an instance always holds a
/// header size in `1..=4` and a maximum data size that the header can express.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PkgOptions {
    header_size: usize,
    max_data_size: usize,
    retry: Option<RetryPolicy>,
}

impl Default for PkgOptions {
    fn default() -> Self {
        Self {
            header_size: PKG_HEADER_SIZE_DEFAULT,
            max_data_size: max_data_size_for(PKG_HEADER_SIZE_DEFAULT),
            retry: None,
        }
    }
}

impl PkgOptions {
    /// Create options for the given header size.
    ///
    /// The maximum data size defaults to the largest length the header can
    /// express, capped at [`MAX_DATA_SIZE_LIMIT`].
    pub fn new(header_size: usize) -> Result<Self> {
        if !(1..=PKG_HEADER_SIZE_MAX).contains(&header_size) {
            return Err(NetError::InvalidHeaderSize(header_size));
        }
        Ok(Self {
            header_size,
            max_data_size: max_data_size_for(header_size),
            retry: None,
        })
    }

    /// Set the maximum payload size.
    pub fn with_max_data_size(mut self, size: usize) -> Result<Self> {
        let limit = max_data_size_for(self.header_size);
        if size > limit {
            return Err(NetError::InvalidMaxDataSize { size, limit });
        }
        self.max_data_size = size;
        Ok(self)
    }

    /// Set the retry policy used for the underlying send and receive calls.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Header size in bytes.
    pub fn header_size(&self) -> usize {
        self.header_size
    }

    /// Maximum payload size in bytes.
    pub fn max_data_size(&self) -> usize {
        self.max_data_size
    }

    /// Retry policy, if any.
    pub fn retry(&self) -> Option<RetryPolicy> {
        self.retry
    }
}

fn max_data_size_for(header_size: usize) -> usize {
    let capacity = (1u64 << (8 * header_size as u32)) - 1;
    (capacity as usize).min(MAX_DATA_SIZE_LIMIT)
}

/// Decode a big-endian length of 1 to 4 bytes, zero-extended to 32 bits.
pub fn decode_length(header: &[u8]) -> usize {
    debug_assert!(header.len() <= PKG_HEADER_SIZE_MAX);
    let mut word = [0u8; PKG_HEADER_SIZE_MAX];
    word[PKG_HEADER_SIZE_MAX - header.len()..].copy_from_slice(header);
    u32::from_be_bytes(word) as usize
}

/// Encode a stream packet.
///
/// The length is built as a 4-byte big-endian word and only its low
/// `header_size` bytes go on the wire.
pub fn encode_stream_packet(data: &[u8], options: &PkgOptions) -> Result<Vec<u8>> {
    if data.len() > options.max_data_size {
        return Err(NetError::PayloadTooLarge {
            size: data.len(),
            max: options.max_data_size,
        });
    }

    let length = (data.len() as u32).to_be_bytes();
    let mut packet = Vec::with_capacity(options.header_size + data.len());
    packet.extend_from_slice(&length[PKG_HEADER_SIZE_MAX - options.header_size..]);
    packet.extend_from_slice(data);
    Ok(packet)
}

/// Try to take one stream packet from the front of `buffer`.
///
/// Returns `Ok(None)` when more bytes are needed. A declared length above the
/// maximum clears the whole buffer and fails the read.
pub fn try_extract_stream_packet(
    buffer: &mut BytesMut,
    options: &PkgOptions,
) -> Result<Option<Bytes>> {
    let header_size = options.header_size;
    if buffer.len() < header_size {
        return Ok(None);
    }

    let length = decode_length(&buffer[..header_size]);
    if length > options.max_data_size {
        buffer.clear();
        return Err(NetError::InvalidPacketLength {
            length,
            max: options.max_data_size,
        });
    }

    if buffer.len() < header_size + length {
        return Ok(None);
    }

    buffer.advance(header_size);
    Ok(Some(buffer.split_to(length).freeze()))
}

/// Additive checksum: the sum of all bytes in a wrapping `u32`.
pub fn checksum(data: &[u8]) -> u32 {
    data.iter()
        .fold(0u32, |sum, &byte| sum.wrapping_add(u32::from(byte)))
}

/// Encode a datagram packet.
pub fn encode_datagram_packet(data: &[u8]) -> Result<Vec<u8>> {
    let total = DATAGRAM_HEADER_SIZE + data.len();
    if total > DATAGRAM_MAX_PACKET_SIZE {
        return Err(NetError::PayloadTooLarge {
            size: data.len(),
            max: DATAGRAM_MAX_PACKET_SIZE - DATAGRAM_HEADER_SIZE,
        });
    }

    let mut packet = Vec::with_capacity(total);
    packet.extend_from_slice(&(total as u32).to_be_bytes()[1..]);
    packet.extend_from_slice(&checksum(data).to_be_bytes());
    packet.extend_from_slice(data);
    Ok(packet)
}

/// Try to take one datagram packet from the front of `buffer`.
///
/// Invalid lengths and checksum mismatches drop a single byte and decoding
/// restarts at the next offset. Returns `None` when more bytes are needed.
pub fn try_extract_datagram_packet(buffer: &mut BytesMut) -> Option<Bytes> {
    while buffer.len() >= DATAGRAM_HEADER_SIZE {
        let total = decode_length(&buffer[..3]);
        if total < DATAGRAM_HEADER_SIZE || total > DATAGRAM_MAX_PACKET_SIZE {
            buffer.advance(1);
            continue;
        }
        if buffer.len() < total {
            return None;
        }

        let expected = u32::from_be_bytes([buffer[3], buffer[4], buffer[5], buffer[6]]);
        if checksum(&buffer[DATAGRAM_HEADER_SIZE..total]) != expected {
            buffer.advance(1);
            continue;
        }

        buffer.advance(DATAGRAM_HEADER_SIZE);
        return Some(buffer.split_to(total - DATAGRAM_HEADER_SIZE).freeze());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_defaults() {
        let options = PkgOptions::default();
        assert_eq!(options.header_size(), 2);
        assert_eq!(options.max_data_size(), 0xFFFF);
        assert!(options.retry().is_none());

        assert_eq!(PkgOptions::new(1).unwrap().max_data_size(), 0xFF);
        assert_eq!(PkgOptions::new(3).unwrap().max_data_size(), 0xFF_FFFF);
        assert_eq!(PkgOptions::new(4).unwrap().max_data_size(), 0xFF_FFFF);
    }

    #[test]
    fn test_options_validation() {
        assert!(matches!(
            PkgOptions::new(0),
            Err(NetError::InvalidHeaderSize(0))
        ));
        assert!(matches!(
            PkgOptions::new(5),
            Err(NetError::InvalidHeaderSize(5))
        ));

        let err = PkgOptions::new(4)
            .unwrap()
            .with_max_data_size(MAX_DATA_SIZE_LIMIT + 1)
            .unwrap_err();
        assert!(matches!(err, NetError::InvalidMaxDataSize { .. }));

        // A one byte header cannot describe 256 bytes.
        assert!(PkgOptions::new(1).unwrap().with_max_data_size(256).is_err());
        assert_eq!(
            PkgOptions::new(1)
                .unwrap()
                .with_max_data_size(100)
                .unwrap()
                .max_data_size(),
            100
        );
    }

    #[test]
    fn test_encode_stream_header_widths() {
        let data = [0xAAu8; 0x0102];
        for header_size in 2..=4 {
            let options = PkgOptions::new(header_size).unwrap();
            let packet = encode_stream_packet(&data, &options).unwrap();
            assert_eq!(packet.len(), header_size + data.len());
            assert_eq!(decode_length(&packet[..header_size]), 0x0102);
            assert_eq!(&packet[header_size - 2..header_size], &[0x01, 0x02]);
        }

        let options = PkgOptions::new(1).unwrap();
        let packet = encode_stream_packet(b"abc", &options).unwrap();
        assert_eq!(packet, vec![3, b'a', b'b', b'c']);
    }

    #[test]
    fn test_encode_stream_oversize() {
        let options = PkgOptions::new(1).unwrap();
        let err = encode_stream_packet(&[0u8; 256], &options).unwrap_err();
        assert!(matches!(
            err,
            NetError::PayloadTooLarge { size: 256, max: 255 }
        ));
    }

    #[test]
    fn test_extract_stream_partial() {
        let options = PkgOptions::default();
        let packet = encode_stream_packet(b"hello", &options).unwrap();

        let mut buffer = BytesMut::new();
        for (i, byte) in packet.iter().enumerate() {
            buffer.extend_from_slice(&[*byte]);
            let result = try_extract_stream_packet(&mut buffer, &options).unwrap();
            if i + 1 < packet.len() {
                assert!(result.is_none());
            } else {
                assert_eq!(result.unwrap().as_ref(), b"hello");
            }
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_extract_stream_multiple_and_empty() {
        let options = PkgOptions::new(3).unwrap();
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&encode_stream_packet(b"first", &options).unwrap());
        buffer.extend_from_slice(&encode_stream_packet(b"", &options).unwrap());
        buffer.extend_from_slice(&encode_stream_packet(b"second", &options).unwrap());
        buffer.extend_from_slice(&[0, 0]);

        let first = try_extract_stream_packet(&mut buffer, &options).unwrap();
        assert_eq!(first.unwrap().as_ref(), b"first");
        let empty = try_extract_stream_packet(&mut buffer, &options).unwrap();
        assert!(empty.unwrap().is_empty());
        let second = try_extract_stream_packet(&mut buffer, &options).unwrap();
        assert_eq!(second.unwrap().as_ref(), b"second");
        assert!(try_extract_stream_packet(&mut buffer, &options).unwrap().is_none());
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_extract_stream_corrupt_header_clears_buffer() {
        let options = PkgOptions::new(2).unwrap().with_max_data_size(10).unwrap();
        let mut buffer = BytesMut::from(&[0x00u8, 0x20, 1, 2, 3][..]);

        let err = try_extract_stream_packet(&mut buffer, &options).unwrap_err();
        assert!(matches!(
            err,
            NetError::InvalidPacketLength { length: 0x20, max: 10 }
        ));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_checksum() {
        assert_eq!(checksum(b""), 0);
        assert_eq!(checksum(&[1, 2, 3]), 6);
        assert_eq!(checksum(&[0xFF; 4]), 0x3FC);
    }

    #[test]
    fn test_encode_datagram_layout() {
        let packet = encode_datagram_packet(b"hello").unwrap();
        assert_eq!(&packet[..3], &[0, 0, 12]);
        assert_eq!(&packet[3..7], &checksum(b"hello").to_be_bytes());
        assert_eq!(&packet[7..], b"hello");
    }

    #[test]
    fn test_encode_datagram_oversize() {
        let data = vec![0u8; DATAGRAM_MAX_PACKET_SIZE - DATAGRAM_HEADER_SIZE + 1];
        assert!(matches!(
            encode_datagram_packet(&data),
            Err(NetError::PayloadTooLarge { .. })
        ));

        let data = vec![0u8; DATAGRAM_MAX_PACKET_SIZE - DATAGRAM_HEADER_SIZE];
        assert_eq!(
            encode_datagram_packet(&data).unwrap().len(),
            DATAGRAM_MAX_PACKET_SIZE
        );
    }

    #[test]
    fn test_extract_datagram_resync() {
        let mut buffer = BytesMut::from(&[0u8, 0, 0, 0, 0][..]);
        buffer.extend_from_slice(&encode_datagram_packet(b"payload").unwrap());

        let packet = try_extract_datagram_packet(&mut buffer).unwrap();
        assert_eq!(packet.as_ref(), b"payload");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_extract_datagram_bad_checksum_is_dropped() {
        let mut packet = encode_datagram_packet(b"hello").unwrap();
        packet[8] ^= 0x01;
        let mut buffer = BytesMut::from(&packet[..]);

        assert!(try_extract_datagram_packet(&mut buffer).is_none());
        // The frame start was skipped; nothing decodes to the corrupted payload.
        assert!(buffer.len() < packet.len());
    }

    #[test]
    fn test_extract_datagram_waits_for_more() {
        let packet = encode_datagram_packet(b"split me").unwrap();
        let mut buffer = BytesMut::from(&packet[..9]);
        assert!(try_extract_datagram_packet(&mut buffer).is_none());
        assert_eq!(buffer.len(), 9);

        buffer.extend_from_slice(&packet[9..]);
        assert_eq!(
            try_extract_datagram_packet(&mut buffer).unwrap().as_ref(),
            b"split me"
        );
    }
}
