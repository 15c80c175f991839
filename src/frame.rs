//! Framed message encoding over a [`Transport`].
//!
//! Every message is a fixed header followed by the payload:
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬─────────────────────┐
//! │    Magic     │ Payload size │ Payload CRC  │       Payload       │
//! │   (4 bytes)  │   (4 bytes)  │   (4 bytes)  │     (variable)      │
//! └──────────────┴──────────────┴──────────────┴─────────────────────┘
//! ```
//!
//! Integers are written little-endian. A reader that sees the byte-swapped
//! magic decodes the rest of that message big-endian, so peers with the other
//! byte order interoperate. Empty payloads are invalid in both directions.

use bytes::{BufMut, BytesMut};
use tracing::error;

use crate::archive::PayloadReader;
use crate::error::{NetError, NetResult};
use crate::protocol::{HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::transport::Transport;

/// Frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: u32,
    pub payload_size: u32,
    pub payload_crc: u32,
}

impl MessageHeader {
    /// Header for `payload`. Rejects empty and oversized payloads.
    pub fn for_payload(magic: u32, payload: &[u8]) -> NetResult<Self> {
        if payload.is_empty() {
            return Err(NetError::EmptyPayload);
        }
        let size = u32::try_from(payload.len()).unwrap_or(u32::MAX);
        if size > MAX_PAYLOAD_SIZE {
            return Err(NetError::PayloadTooLarge {
                size,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self {
            magic,
            payload_size: size,
            payload_crc: crc32fast::hash(payload),
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.magic);
        buf.put_u32_le(self.payload_size);
        buf.put_u32_le(self.payload_crc);
    }

    /// Decodes and validates a header. Returns the header and whether the
    /// sender used the opposite byte order.
    pub fn decode(raw: &[u8; HEADER_SIZE], expected_magic: u32) -> NetResult<(Self, bool)> {
        let field = |i: usize| [raw[i], raw[i + 1], raw[i + 2], raw[i + 3]];
        let magic = u32::from_le_bytes(field(0));
        let swapped = if magic == expected_magic {
            false
        } else if magic.swap_bytes() == expected_magic {
            true
        } else {
            return Err(NetError::InvalidMagic {
                expected: expected_magic,
                actual: magic,
            });
        };
        let read = |i: usize| {
            if swapped {
                u32::from_be_bytes(field(i))
            } else {
                u32::from_le_bytes(field(i))
            }
        };
        let header = Self {
            magic: expected_magic,
            payload_size: read(4),
            payload_crc: read(8),
        };
        if header.payload_size == 0 {
            return Err(NetError::EmptyPayload);
        }
        if header.payload_size > MAX_PAYLOAD_SIZE {
            return Err(NetError::PayloadTooLarge {
                size: header.payload_size,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok((header, swapped))
    }
}

/// A received, CRC-verified payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub bytes: Vec<u8>,
    /// Sender used the opposite byte order; integer fields must be read swapped.
    pub swapped: bool,
}

impl Payload {
    pub fn reader(&self) -> PayloadReader<'_> {
        PayloadReader::new(&self.bytes, self.swapped)
    }
}

/// Build the wire bytes for one message.
pub fn encode_message(magic: u32, payload: &[u8]) -> NetResult<BytesMut> {
    let header = MessageHeader::for_payload(magic, payload)?;
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    header.encode(&mut buf);
    buf.put_slice(payload);
    Ok(buf)
}

/// Frame `payload` and write it as one logical send.
pub fn send<T: Transport + ?Sized>(payload: &[u8], transport: &mut T) -> NetResult<()> {
    let message = encode_message(transport.magic(), payload)?;
    transport.send(&message)
}

/// Read one message, validating magic, size and CRC.
pub fn receive<T: Transport + ?Sized>(transport: &mut T) -> NetResult<Payload> {
    let mut raw = [0u8; HEADER_SIZE];
    transport.receive(&mut raw)?;
    let (header, swapped) = match MessageHeader::decode(&raw, transport.magic()) {
        Ok(decoded) => decoded,
        Err(e) => {
            error!("rejecting message header: {}", e);
            return Err(e);
        }
    };

    let mut bytes = vec![0u8; header.payload_size as usize];
    transport.receive(&mut bytes)?;

    let actual = crc32fast::hash(&bytes);
    if actual != header.payload_crc {
        error!(
            expected = header.payload_crc,
            actual, "payload crc mismatch; connection presumed corrupted"
        );
        return Err(NetError::ChecksumMismatch {
            expected: header.payload_crc,
            actual,
        });
    }
    Ok(Payload { bytes, swapped })
}

pub fn send_and_receive<T: Transport + ?Sized>(
    payload: &[u8],
    transport: &mut T,
) -> NetResult<Payload> {
    send(payload, transport)?;
    receive(transport)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::TCP_MAGIC;
    use std::collections::VecDeque;

    /// In-memory loopback: everything sent becomes receivable.
    #[derive(Default)]
    pub(crate) struct Loopback {
        pub(crate) bytes: VecDeque<u8>,
    }

    impl Transport for Loopback {
        fn receive(&mut self, buf: &mut [u8]) -> NetResult<()> {
            if self.bytes.len() < buf.len() {
                return Err(NetError::ConnectionClosed);
            }
            for b in buf.iter_mut() {
                *b = self.bytes.pop_front().unwrap();
            }
            Ok(())
        }
        fn send(&mut self, buf: &[u8]) -> NetResult<()> {
            self.bytes.extend(buf);
            Ok(())
        }
        fn magic(&self) -> u32 {
            TCP_MAGIC
        }
    }

    #[test]
    fn round_trip_preserves_payload() {
        let mut lo = Loopback::default();
        for payload in [vec![7u8], b"hello world".to_vec(), (0..=255u8).cycle().take(70_000).collect()] {
            send(&payload, &mut lo).unwrap();
            let got = receive(&mut lo).unwrap();
            assert_eq!(got.bytes, payload);
            assert!(!got.swapped);
        }
        assert!(lo.bytes.is_empty());
    }

    #[test]
    fn empty_payload_is_refused_on_send() {
        let mut lo = Loopback::default();
        assert!(matches!(send(&[], &mut lo), Err(NetError::EmptyPayload)));
        assert!(lo.bytes.is_empty());
    }

    #[test]
    fn empty_payload_is_rejected_on_receive() {
        let mut lo = Loopback::default();
        lo.bytes.extend(TCP_MAGIC.to_le_bytes());
        lo.bytes.extend(0u32.to_le_bytes());
        lo.bytes.extend(0u32.to_le_bytes());
        assert!(matches!(receive(&mut lo), Err(NetError::EmptyPayload)));
    }

    #[test]
    fn any_single_byte_corruption_is_detected() {
        let payload = b"cooked package bytes".to_vec();
        let wire = encode_message(TCP_MAGIC, &payload).unwrap();
        for i in HEADER_SIZE..wire.len() {
            let mut corrupted = wire.to_vec();
            corrupted[i] ^= 0x5A;
            let mut lo = Loopback {
                bytes: corrupted.into(),
            };
            assert!(
                matches!(receive(&mut lo), Err(NetError::ChecksumMismatch { .. })),
                "corruption at byte {} went unnoticed",
                i
            );
        }
    }

    #[test]
    fn byte_swapped_header_is_accepted() {
        let payload = b"big endian peer".to_vec();
        let mut lo = Loopback::default();
        lo.bytes.extend(TCP_MAGIC.to_be_bytes());
        lo.bytes.extend((payload.len() as u32).to_be_bytes());
        lo.bytes.extend(crc32fast::hash(&payload).to_be_bytes());
        lo.bytes.extend(&payload);
        let got = receive(&mut lo).unwrap();
        assert_eq!(got.bytes, payload);
        assert!(got.swapped);
    }

    #[test]
    fn unknown_magic_is_rejected() {
        let mut lo = Loopback::default();
        lo.bytes.extend(0xDEAD_BEEFu32.to_le_bytes());
        lo.bytes.extend(4u32.to_le_bytes());
        lo.bytes.extend(0u32.to_le_bytes());
        lo.bytes.extend([1, 2, 3, 4]);
        let err = receive(&mut lo).unwrap_err();
        assert!(matches!(err, NetError::InvalidMagic { actual: 0xDEAD_BEEF, .. }));
        assert!(err.is_integrity());
    }

    #[test]
    fn truncated_payload_is_a_transport_error() {
        let wire = encode_message(TCP_MAGIC, b"abcdef").unwrap();
        let mut lo = Loopback {
            bytes: wire[..wire.len() - 2].to_vec().into(),
        };
        assert!(matches!(receive(&mut lo), Err(NetError::ConnectionClosed)));
    }

    #[test]
    fn oversized_header_is_rejected_before_allocating() {
        let mut raw = [0u8; HEADER_SIZE];
        raw[0..4].copy_from_slice(&TCP_MAGIC.to_le_bytes());
        raw[4..8].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            MessageHeader::decode(&raw, TCP_MAGIC),
            Err(NetError::PayloadTooLarge { .. })
        ));
    }
}
