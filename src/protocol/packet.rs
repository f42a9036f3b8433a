//! Packet framing for the transfer protocol.
//!
//! Wire format: all integers are little-endian.
//! Frame format: len:u32 | type:u8 | payload
//!
//! `len` counts the type byte plus the payload, so an empty payload is
//! encoded with `len == 1`.

use crate::error::{Result, TransferError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix.
pub const LENGTH_LEN: usize = 4;

/// Length prefix plus type byte.
pub const HEADER_LEN: usize = LENGTH_LEN + 1;

/// Default content chunk size for Binary packets (64KB)
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Default maximum frame size (16MB) - prevents OOM from malicious/corrupted frames
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

// =============================================================================
// Packet Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Success = 0x00,
    Error = 0x01,
    Metadata = 0x02,
    Binary = 0x03,
}

impl PacketType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Self::Success),
            0x01 => Some(Self::Error),
            0x02 => Some(Self::Metadata),
            0x03 => Some(Self::Binary),
            _ => None,
        }
    }
}

// =============================================================================
// Packet
// =============================================================================

/// A single framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(packet_type: PacketType, payload: impl Into<Bytes>) -> Self {
        Self {
            packet_type,
            payload: payload.into(),
        }
    }

    pub fn success() -> Self {
        Self::new(PacketType::Success, Bytes::new())
    }

    pub fn error(message: &str) -> Self {
        Self::new(PacketType::Error, Bytes::copy_from_slice(message.as_bytes()))
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(PacketType::Binary, data)
    }

    /// Serialize `value` as a JSON Metadata packet.
    pub fn metadata<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let json = serde_json::to_vec(value)?;
        Ok(Self::new(PacketType::Metadata, json))
    }

    /// Deserialize the JSON payload of a Metadata packet.
    pub fn parse_metadata<T: DeserializeOwned>(&self) -> Result<T> {
        if self.packet_type != PacketType::Metadata {
            return Err(TransferError::protocol(format!(
                "expected Metadata packet, got {:?}",
                self.packet_type
            )));
        }
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// The diagnostic carried by an Error packet.
    pub fn error_message(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Value of the length prefix for this packet.
    pub fn wire_len(&self) -> u32 {
        (self.payload.len() + 1) as u32
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u32_le(self.wire_len());
        buf.put_u8(self.packet_type as u8);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

fn check_length(len: u32, max_frame_size: u32) -> Result<()> {
    if len == 0 {
        return Err(TransferError::protocol("frame length 0 has no room for a type byte"));
    }
    if len > max_frame_size {
        return Err(TransferError::FrameTooLarge {
            len,
            max: max_frame_size,
        });
    }
    Ok(())
}

// =============================================================================
// Streaming decoder
// =============================================================================

#[derive(Debug)]
enum DecodeState {
    Length { buf: [u8; LENGTH_LEN], filled: usize },
    Type { len: u32 },
    Payload {
        packet_type: PacketType,
        payload: BytesMut,
        remaining: usize,
    },
}

impl DecodeState {
    fn start() -> Self {
        Self::Length {
            buf: [0; LENGTH_LEN],
            filled: 0,
        }
    }
}

/// Incremental packet decoder.
///
/// Feed it whatever bytes the connection produced; it consumes what belongs
/// to the current frame, remembers how far into the header or payload it
/// got, and yields a [`Packet`] once the declared length is satisfied.
#[derive(Debug)]
pub struct PacketDecoder {
    max_frame_size: u32,
    state: DecodeState,
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl PacketDecoder {
    pub fn new(max_frame_size: u32) -> Self {
        Self {
            max_frame_size,
            state: DecodeState::start(),
        }
    }

    /// True when no bytes of a frame have been consumed yet.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, DecodeState::Length { filled: 0, .. })
    }

    /// Consume bytes from `src`, returning a packet once one is complete.
    ///
    /// Bytes past the end of the completed frame stay in `src`.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        let max = self.max_frame_size;
        loop {
            match &mut self.state {
                DecodeState::Length { buf, filled } => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let n = (LENGTH_LEN - *filled).min(src.len());
                    buf[*filled..*filled + n].copy_from_slice(&src[..n]);
                    src.advance(n);
                    *filled += n;
                    if *filled == LENGTH_LEN {
                        let len = u32::from_le_bytes(*buf);
                        if let Err(e) = check_length(len, max) {
                            self.state = DecodeState::start();
                            return Err(e);
                        }
                        self.state = DecodeState::Type { len };
                    }
                }
                DecodeState::Type { len } => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let payload_len = (*len - 1) as usize;
                    let byte = src.get_u8();
                    let Some(packet_type) = PacketType::from_u8(byte) else {
                        self.state = DecodeState::start();
                        return Err(TransferError::protocol(format!(
                            "unknown packet type 0x{:02x}",
                            byte
                        )));
                    };
                    if payload_len == 0 {
                        self.state = DecodeState::start();
                        return Ok(Some(Packet::new(packet_type, Bytes::new())));
                    }
                    // Whole payload already buffered: hand it out without copying.
                    if src.len() >= payload_len {
                        self.state = DecodeState::start();
                        let payload = src.split_to(payload_len).freeze();
                        return Ok(Some(Packet::new(packet_type, payload)));
                    }
                    self.state = DecodeState::Payload {
                        packet_type,
                        payload: BytesMut::with_capacity(payload_len),
                        remaining: payload_len,
                    };
                }
                DecodeState::Payload {
                    packet_type,
                    payload,
                    remaining,
                } => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let n = (*remaining).min(src.len());
                    payload.extend_from_slice(&src[..n]);
                    src.advance(n);
                    *remaining -= n;
                    if *remaining == 0 {
                        let packet = Packet::new(*packet_type, std::mem::take(payload).freeze());
                        self.state = DecodeState::start();
                        return Ok(Some(packet));
                    }
                }
            }
        }
    }
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Read a single packet from the stream.
pub async fn read_packet<R: AsyncRead + Unpin>(r: &mut R, max_frame_size: u32) -> Result<Packet> {
    let len = r.read_u32_le().await?;
    check_length(len, max_frame_size)?;

    let byte = r.read_u8().await?;
    let packet_type = PacketType::from_u8(byte)
        .ok_or_else(|| TransferError::protocol(format!("unknown packet type 0x{:02x}", byte)))?;

    let mut payload = vec![0u8; len as usize - 1];
    r.read_exact(&mut payload).await?;

    Ok(Packet::new(packet_type, payload))
}

/// Write a packet to the stream and flush it.
pub async fn write_packet<W: AsyncWrite + Unpin>(w: &mut W, packet: &Packet) -> Result<()> {
    w.write_all(&packet.encode()).await?;
    w.flush().await?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn decode_all(decoder: &mut PacketDecoder, bytes: &[u8]) -> Vec<Packet> {
        let mut src = BytesMut::from(bytes);
        let mut out = Vec::new();
        while let Some(packet) = decoder.decode(&mut src).unwrap() {
            out.push(packet);
        }
        assert!(src.is_empty());
        out
    }

    #[test]
    fn test_encode_layout() {
        let encoded = Packet::binary(vec![0xAA, 0xBB]).encode();
        assert_eq!(encoded.as_ref(), &[3, 0, 0, 0, 3, 0xAA, 0xBB]);

        let success = Packet::success().encode();
        assert_eq!(success.as_ref(), &[1, 0, 0, 0, 0]);
    }

    #[test]
    fn test_roundtrip_payload_sizes() {
        for len in [0usize, 1, CHUNK_SIZE + 17] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let packet = Packet::binary(payload.clone());
            let mut decoder = PacketDecoder::default();
            let decoded = decode_all(&mut decoder, &packet.encode());
            assert_eq!(decoded.len(), 1);
            assert_eq!(decoded[0].packet_type, PacketType::Binary);
            assert_eq!(decoded[0].payload.as_ref(), payload.as_slice());
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let packet = Packet::error("remote failure");
        let encoded = packet.encode();
        let mut decoder = PacketDecoder::default();
        let mut src = BytesMut::new();

        for (i, byte) in encoded.iter().enumerate() {
            src.put_u8(*byte);
            let result = decoder.decode(&mut src).unwrap();
            if i + 1 < encoded.len() {
                assert!(result.is_none(), "completed early at byte {}", i);
                assert!(!decoder.is_idle());
            } else {
                assert_eq!(result, Some(packet.clone()));
            }
        }
        assert!(decoder.is_idle());
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut stream = BytesMut::new();
        stream.extend_from_slice(&Packet::success().encode());
        stream.extend_from_slice(&Packet::binary(vec![1, 2, 3]).encode());
        stream.extend_from_slice(&Packet::error("x").encode());

        let mut decoder = PacketDecoder::default();
        let decoded = decode_all(&mut decoder, &stream);
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0].packet_type, PacketType::Success);
        assert_eq!(decoded[1].payload.as_ref(), &[1, 2, 3]);
        assert_eq!(decoded[2].error_message(), "x");
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut decoder = PacketDecoder::default();
        let mut src = BytesMut::from(&[0xFF, 0xFF, 0xFF, 0xFF][..]);
        match decoder.decode(&mut src) {
            Err(TransferError::FrameTooLarge { len, max }) => {
                assert_eq!(len, u32::MAX);
                assert_eq!(max, MAX_FRAME_SIZE);
            }
            other => panic!("Expected FrameTooLarge, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_length_rejected() {
        let mut decoder = PacketDecoder::default();
        let mut src = BytesMut::from(&[0, 0, 0, 0][..]);
        assert!(matches!(
            decoder.decode(&mut src),
            Err(TransferError::Protocol(_))
        ));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut decoder = PacketDecoder::default();
        let mut src = BytesMut::from(&[1, 0, 0, 0, 0x7F][..]);
        assert!(matches!(
            decoder.decode(&mut src),
            Err(TransferError::Protocol(_))
        ));
    }

    #[test]
    fn test_metadata_json() {
        let packet = Packet::metadata(&json!({"name": "laptop", "count": "2"})).unwrap();
        assert_eq!(packet.packet_type, PacketType::Metadata);

        let value: serde_json::Value = packet.parse_metadata().unwrap();
        assert_eq!(value["name"], "laptop");
        assert_eq!(value["count"], "2");

        let binary = Packet::binary(vec![b'{', b'}']);
        assert!(binary.parse_metadata::<serde_json::Value>().is_err());
    }

    #[test]
    fn test_packet_type_from_u8() {
        assert_eq!(PacketType::from_u8(0), Some(PacketType::Success));
        assert_eq!(PacketType::from_u8(3), Some(PacketType::Binary));
        assert_eq!(PacketType::from_u8(4), None);
    }

    #[tokio::test]
    async fn test_read_write_packet() {
        let (mut a, mut b) = tokio::io::duplex(8);
        let packet = Packet::binary(vec![7u8; 100]);
        let expected = packet.clone();

        let writer = tokio::spawn(async move { write_packet(&mut a, &packet).await });
        let read = read_packet(&mut b, MAX_FRAME_SIZE).await.unwrap();
        writer.await.unwrap().unwrap();

        assert_eq!(read, expected);
    }

    #[tokio::test]
    async fn test_read_packet_rejects_oversized() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0x00, 0x00, 0x10, 0x00]).await.unwrap();
        let result = read_packet(&mut b, 1024).await;
        assert!(matches!(result, Err(TransferError::FrameTooLarge { .. })));
    }

    proptest! {
        #[test]
        fn prop_fragmented_delivery_matches_whole(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..300), 1..5),
            cuts in prop::collection::vec(1usize..64, 1..64),
        ) {
            let mut stream = BytesMut::new();
            let packets: Vec<Packet> = payloads.into_iter().map(Packet::binary).collect();
            for packet in &packets {
                stream.extend_from_slice(&packet.encode());
            }

            let mut decoder = PacketDecoder::default();
            let mut decoded = Vec::new();
            let mut src = BytesMut::new();
            let mut offset = 0;
            let mut cut = cuts.iter().cycle();
            while offset < stream.len() {
                let end = (offset + cut.next().copied().unwrap_or(1)).min(stream.len());
                src.extend_from_slice(&stream[offset..end]);
                offset = end;
                while let Some(packet) = decoder.decode(&mut src).unwrap() {
                    decoded.push(packet);
                }
            }

            prop_assert_eq!(decoded, packets);
            prop_assert!(decoder.is_idle());
        }
    }
}
