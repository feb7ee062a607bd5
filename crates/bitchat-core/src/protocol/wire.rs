//! Binary wire format for BitChat packets
//!
//! Implements the versioned framing with optional compression, padding,
//! signing, and routing trace. The format is byte-exact: every
//! implementation must interoperate with the others.
//!
//! ```text
//! v1 header (14 B): ver(1) type(1) ttl(1) ts(8) flags(1) payload_len(2)
//! v2 header (16 B): ver(1) type(1) ttl(1) ts(8) flags(1) payload_len(4)
//! ```
//!
//! followed by sender_id(8), recipient_id(8, HAS_RECIPIENT), route
//! (v2 + HAS_ROUTE: count(1) + N x 8), the payload area (when
//! IS_COMPRESSED: original-size field of 2/4 B + zlib bytes), and
//! signature(64, HAS_SIGNATURE). All integers are big-endian.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression as ZlibCompression;

use crate::errors::{BitchatError, PacketError, Result};
use crate::protocol::packet::{
    BitchatPacket, MessageType, PacketFlags, HEADER_SIZE_V1, HEADER_SIZE_V2, MAX_PAYLOAD_SIZE,
    PROTOCOL_VERSION_1, PROTOCOL_VERSION_2,
};
use crate::types::{PeerId, Timestamp, Ttl};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Standard padding block sizes for traffic analysis resistance
pub const PADDING_BLOCK_SIZES: &[usize] = &[256, 512, 1024, 2048];

/// Reservation added before block selection so an AEAD tag never pushes a
/// frame over its block
pub const CIPHER_TAG_RESERVATION: usize = 16;

/// Payloads at or below this size are never compressed
pub const COMPRESSION_THRESHOLD: usize = 256;

/// Decompression expansion ratio above which a frame is rejected as a bomb
pub const MAX_DECOMPRESSION_RATIO: u64 = 50_000;

/// Size of an Ed25519 signature
pub const SIGNATURE_SIZE: usize = 64;

/// Size of a PeerId on the wire
pub const PEER_ID_SIZE: usize = 8;

// ----------------------------------------------------------------------------
// Wire Format Codec
// ----------------------------------------------------------------------------

/// Binary wire format encoder/decoder for [`BitchatPacket`]
pub struct WireFormat;

impl WireFormat {
    /// Encode a packet without compression or padding
    pub fn encode(packet: &BitchatPacket) -> Result<Vec<u8>> {
        Self::encode_with_options(packet, false, false)
    }

    /// Encode a packet, optionally compressing the payload and padding the
    /// frame to a standard block size.
    pub fn encode_with_options(
        packet: &BitchatPacket,
        compress: bool,
        pad: bool,
    ) -> Result<Vec<u8>> {
        packet.validate()?;

        // Build the payload area first so the header can carry its length.
        let mut flags = packet.flags();
        let payload_area = if compress && Compression::should_compress(&packet.payload) {
            match Compression::compress(&packet.payload)? {
                Some(deflated) => {
                    flags = flags.with(PacketFlags::IS_COMPRESSED);
                    let mut area = Vec::with_capacity(deflated.len() + 4);
                    match packet.version {
                        PROTOCOL_VERSION_1 => {
                            area.extend_from_slice(&(packet.payload.len() as u16).to_be_bytes())
                        }
                        _ => area.extend_from_slice(&(packet.payload.len() as u32).to_be_bytes()),
                    }
                    area.extend_from_slice(&deflated);
                    area
                }
                None => packet.payload.clone(),
            }
        } else {
            packet.payload.clone()
        };

        if packet.version == PROTOCOL_VERSION_1 && payload_area.len() > u16::MAX as usize {
            return Err(BitchatError::InvalidPacket(PacketError::PayloadTooLarge {
                actual: payload_area.len(),
                max: u16::MAX as usize,
            }));
        }

        let header_size = match packet.version {
            PROTOCOL_VERSION_1 => HEADER_SIZE_V1,
            _ => HEADER_SIZE_V2,
        };
        let mut bytes = Vec::with_capacity(header_size + PEER_ID_SIZE + payload_area.len());

        // Header
        bytes.push(packet.version);
        bytes.push(packet.message_type.as_u8());
        bytes.push(packet.ttl.value());
        bytes.extend_from_slice(&packet.timestamp.as_millis().to_be_bytes());
        bytes.push(flags.as_u8());
        match packet.version {
            PROTOCOL_VERSION_1 => {
                bytes.extend_from_slice(&(payload_area.len() as u16).to_be_bytes())
            }
            _ => bytes.extend_from_slice(&(payload_area.len() as u32).to_be_bytes()),
        }

        // Sender, recipient, route
        bytes.extend_from_slice(packet.sender_id.as_bytes());
        if let Some(recipient_id) = &packet.recipient_id {
            bytes.extend_from_slice(recipient_id.as_bytes());
        }
        if let Some(ref route) = packet.route {
            bytes.push(route.len() as u8);
            for hop in route {
                bytes.extend_from_slice(hop.as_bytes());
            }
        }

        // Payload area and signature
        bytes.extend_from_slice(&payload_area);
        if let Some(signature) = &packet.signature {
            bytes.extend_from_slice(signature);
        }

        if pad {
            bytes = Padding::pad(bytes);
        }

        Ok(bytes)
    }

    /// Decode a packet from wire bytes.
    ///
    /// Decoding is attempted on the raw frame first; the format is
    /// self-describing, so trailing padding is simply ignored. Only if that
    /// fails is PKCS#7 padding stripped and the decode retried, and only
    /// when stripping actually changed the input. Invalid padding is kept
    /// as data, which keeps the scheme compatible with non-padded senders.
    pub fn decode(bytes: &[u8]) -> Result<BitchatPacket> {
        match Self::decode_with_consumed(bytes) {
            Ok((packet, _)) => Ok(packet),
            Err(err) => {
                let stripped = Padding::unpad(bytes);
                if stripped.len() == bytes.len() {
                    return Err(err);
                }
                Self::decode_with_consumed(stripped).map(|(packet, _)| packet)
            }
        }
    }

    /// Decode a packet and report how many bytes of the input belong to the
    /// frame. Trailing bytes beyond the frame (padding, or the next chunk in
    /// a reassembly buffer) are not touched.
    pub fn decode_with_consumed(bytes: &[u8]) -> Result<(BitchatPacket, usize)> {
        let mut reader = FrameReader::new(bytes);

        let version = reader.read_u8("version")?;
        if version != PROTOCOL_VERSION_1 && version != PROTOCOL_VERSION_2 {
            return Err(BitchatError::InvalidPacket(
                PacketError::UnsupportedVersion { version },
            ));
        }

        let message_type = MessageType::from_u8(reader.read_u8("type")?)?;
        let ttl = Ttl::new(reader.read_u8("ttl")?);
        let timestamp = Timestamp::new(u64::from_be_bytes(reader.read_array::<8>("timestamp")?));
        let flags = PacketFlags::new(reader.read_u8("flags")?);

        let payload_len = match version {
            PROTOCOL_VERSION_1 => {
                u16::from_be_bytes(reader.read_array::<2>("payload length")?) as usize
            }
            _ => u32::from_be_bytes(reader.read_array::<4>("payload length")?) as usize,
        };
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(BitchatError::InvalidPacket(PacketError::PayloadTooLarge {
                actual: payload_len,
                max: MAX_PAYLOAD_SIZE,
            }));
        }

        let sender_id = PeerId::new(reader.read_array::<8>("sender ID")?);
        let recipient_id = if flags.has_recipient() {
            Some(PeerId::new(reader.read_array::<8>("recipient ID")?))
        } else {
            None
        };

        let route = if flags.has_route() {
            if version < PROTOCOL_VERSION_2 {
                return Err(BitchatError::invalid_packet(
                    "Route requires protocol version 2",
                ));
            }
            let hop_count = reader.read_u8("route length")? as usize;
            let mut hops = Vec::with_capacity(hop_count);
            for _ in 0..hop_count {
                hops.push(PeerId::new(reader.read_array::<8>("route hop")?));
            }
            Some(hops)
        } else {
            None
        };

        let payload_area = reader.read_slice(payload_len, "payload")?;
        let payload = if flags.is_compressed() {
            Compression::decompress_area(payload_area, version)?
        } else {
            payload_area.to_vec()
        };

        let signature = if flags.has_signature() {
            Some(reader.read_array::<64>("signature")?)
        } else {
            None
        };

        let packet = BitchatPacket {
            version,
            message_type,
            ttl,
            timestamp,
            sender_id,
            recipient_id,
            route,
            payload,
            signature,
            is_rsr: flags.is_rsr(),
        };
        packet.validate()?;

        Ok((packet, reader.consumed()))
    }
}

// ----------------------------------------------------------------------------
// Frame Reader
// ----------------------------------------------------------------------------

/// Cursor over an incoming frame with bounds-checked reads
struct FrameReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> FrameReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn consumed(&self) -> usize {
        self.offset
    }

    fn read_u8(&mut self, context: &'static str) -> Result<u8> {
        let slice = self.read_slice(1, context)?;
        Ok(slice[0])
    }

    fn read_array<const N: usize>(&mut self, context: &'static str) -> Result<[u8; N]> {
        let slice = self.read_slice(N, context)?;
        let mut array = [0u8; N];
        array.copy_from_slice(slice);
        Ok(array)
    }

    fn read_slice(&mut self, len: usize, context: &'static str) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(BitchatError::InvalidPacket(PacketError::Truncated {
                context,
            }))?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }
}

// ----------------------------------------------------------------------------
// Compression
// ----------------------------------------------------------------------------

/// Payload compression (zlib-wrapped deflate)
pub struct Compression;

impl Compression {
    /// Compression kicks in only above the threshold
    pub fn should_compress(payload: &[u8]) -> bool {
        payload.len() > COMPRESSION_THRESHOLD
    }

    /// Deflate `data`, returning None when compression does not strictly
    /// shrink it.
    pub fn compress(data: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), ZlibCompression::default());
        encoder
            .write_all(data)
            .map_err(|_| BitchatError::InvalidPacket(PacketError::CompressionFailed))?;
        let deflated = encoder
            .finish()
            .map_err(|_| BitchatError::InvalidPacket(PacketError::CompressionFailed))?;
        if deflated.len() < data.len() {
            Ok(Some(deflated))
        } else {
            Ok(None)
        }
    }

    /// Decompress a payload area: original-size field (u16 for v1, u32 for
    /// v2) followed by zlib bytes.
    fn decompress_area(area: &[u8], version: u8) -> Result<Vec<u8>> {
        let size_field = if version == PROTOCOL_VERSION_1 { 2 } else { 4 };
        if area.len() <= size_field {
            return Err(BitchatError::InvalidPacket(PacketError::Truncated {
                context: "compressed payload",
            }));
        }

        let original_len = match version {
            PROTOCOL_VERSION_1 => u16::from_be_bytes([area[0], area[1]]) as usize,
            _ => u32::from_be_bytes([area[0], area[1], area[2], area[3]]) as usize,
        };
        if original_len > MAX_PAYLOAD_SIZE {
            return Err(BitchatError::InvalidPacket(PacketError::PayloadTooLarge {
                actual: original_len,
                max: MAX_PAYLOAD_SIZE,
            }));
        }

        let compressed = &area[size_field..];
        let ratio = original_len as u64 / compressed.len() as u64;
        if ratio > MAX_DECOMPRESSION_RATIO {
            return Err(BitchatError::InvalidPacket(
                PacketError::DecompressionBomb { ratio },
            ));
        }

        let mut decompressed = Vec::with_capacity(original_len);
        let mut decoder = ZlibDecoder::new(compressed).take(original_len as u64 + 1);
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|_| BitchatError::InvalidPacket(PacketError::DecompressionFailed))?;
        if decompressed.len() != original_len {
            return Err(BitchatError::InvalidPacket(
                PacketError::DecompressionFailed,
            ));
        }

        Ok(decompressed)
    }
}

// ----------------------------------------------------------------------------
// Padding
// ----------------------------------------------------------------------------

/// Frame padding for traffic analysis resistance
pub struct Padding;

impl Padding {
    /// Pad a frame up to the next standard block.
    ///
    /// The block is chosen so that frame + a 16-byte cipher tag still fits.
    /// Pad bytes all carry the pad length (PKCS#7 style), which caps a
    /// single padding run at 255 bytes; frames needing more, and frames
    /// already larger than the biggest block, are left unpadded and rely on
    /// transport-layer fragmentation.
    pub fn pad(mut frame: Vec<u8>) -> Vec<u8> {
        let Some(target) = Self::target_block_size(frame.len()) else {
            return frame;
        };
        let pad_len = target - frame.len();
        if (1..=255).contains(&pad_len) {
            frame.resize(target, pad_len as u8);
        }
        frame
    }

    /// Strip PKCS#7-style padding. Returns the input unchanged when the
    /// trailing bytes do not form valid padding.
    pub fn unpad(data: &[u8]) -> &[u8] {
        let Some(&last) = data.last() else {
            return data;
        };
        let pad_len = last as usize;
        if pad_len == 0 || pad_len >= data.len() {
            return data;
        }
        let body_len = data.len() - pad_len;
        if data[body_len..].iter().all(|&byte| byte == last) {
            &data[..body_len]
        } else {
            data
        }
    }

    /// Smallest standard block that fits `frame_len` plus the cipher tag
    /// reservation; None when the frame exceeds the largest block.
    fn target_block_size(frame_len: usize) -> Option<usize> {
        let needed = frame_len + CIPHER_TAG_RESERVATION;
        PADDING_BLOCK_SIZES
            .iter()
            .copied()
            .find(|&block| needed <= block)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::MessageType;

    fn test_packet(payload: Vec<u8>) -> BitchatPacket {
        BitchatPacket::new(
            MessageType::Message,
            PeerId::new([1, 2, 3, 4, 5, 6, 7, 8]),
            payload,
        )
        .with_timestamp(Timestamp::new(1_700_000_000_000))
    }

    #[test]
    fn test_plain_roundtrip() {
        let packet = test_packet(b"Hello, BitChat!".to_vec());
        let encoded = WireFormat::encode(&packet).unwrap();
        assert_eq!(encoded.len(), HEADER_SIZE_V1 + 8 + packet.payload.len());

        let decoded = WireFormat::decode(&encoded).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_roundtrip_with_recipient_and_signature() {
        let mut packet = test_packet(b"direct".to_vec()).with_recipient(PeerId::new([9; 8]));
        packet.signature = Some([42u8; 64]);

        let decoded = WireFormat::decode(&WireFormat::encode(&packet).unwrap()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_roundtrip_with_route_and_rsr() {
        let packet = test_packet(b"relayed".to_vec())
            .with_route(vec![PeerId::new([3; 8]), PeerId::new([4; 8])])
            .with_rsr();
        assert_eq!(packet.version, 2);

        let encoded = WireFormat::encode(&packet).unwrap();
        // v2 header, sender, count byte + two hops
        assert_eq!(
            encoded.len(),
            HEADER_SIZE_V2 + 8 + 1 + 16 + packet.payload.len()
        );

        let decoded = WireFormat::decode(&encoded).unwrap();
        assert_eq!(decoded, packet);
        assert!(decoded.is_rsr);
    }

    #[test]
    fn test_padded_frame_is_block_sized_and_decodes_raw() {
        // A 40-byte-ish frame lands on the 256 block (scenario S5).
        let packet = test_packet(vec![7u8; 18]);
        let encoded = WireFormat::encode_with_options(&packet, false, true).unwrap();
        assert_eq!(encoded.len(), 256);

        // decode_with_consumed succeeds on the raw padded frame.
        let (decoded, consumed) = WireFormat::decode_with_consumed(&encoded).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(consumed, HEADER_SIZE_V1 + 8 + 18);

        assert_eq!(WireFormat::decode(&encoded).unwrap(), packet);
    }

    #[test]
    fn test_padding_block_selection() {
        assert_eq!(Padding::target_block_size(40), Some(256));
        assert_eq!(Padding::target_block_size(240), Some(256));
        assert_eq!(Padding::target_block_size(241), Some(512));
        assert_eq!(Padding::target_block_size(1008), Some(1024));
        assert_eq!(Padding::target_block_size(2032), Some(2048));
        assert_eq!(Padding::target_block_size(2033), None);
        assert_eq!(Padding::target_block_size(5000), None);
    }

    #[test]
    fn test_oversized_frames_stay_unpadded() {
        let frame = vec![1u8; 3000];
        assert_eq!(Padding::pad(frame.clone()), frame);

        // Pad runs longer than 255 cannot be expressed and are skipped.
        let frame = vec![1u8; 1200];
        assert_eq!(Padding::pad(frame.clone()).len(), 1200);
    }

    #[test]
    fn test_unpad_keeps_invalid_padding() {
        let data = vec![1, 2, 3, 4, 3];
        // Last byte claims 3 pad bytes but they are not all 0x03.
        assert_eq!(Padding::unpad(&data), &data[..]);

        let padded = vec![1, 2, 3, 3, 3, 3];
        assert_eq!(Padding::unpad(&padded), &[1, 2, 3]);

        // A pad length consuming the whole buffer is not padding.
        let all_pad = vec![4, 4, 4, 4];
        assert_eq!(Padding::unpad(&all_pad), &all_pad[..]);
    }

    #[test]
    fn test_compression_roundtrip() {
        let payload = b"BitChat mesh relay ".repeat(40); // 760 B, compressible
        let packet = test_packet(payload.clone());

        let encoded = WireFormat::encode_with_options(&packet, true, false).unwrap();
        // IS_COMPRESSED flag is at the flags offset of the v1 header.
        assert_ne!(encoded[11] & PacketFlags::IS_COMPRESSED, 0);
        assert!(encoded.len() < HEADER_SIZE_V1 + 8 + payload.len());

        let decoded = WireFormat::decode(&encoded).unwrap();
        assert_eq!(decoded.payload, payload);
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_incompressible_payload_stays_raw() {
        // Pseudo-random bytes do not deflate smaller.
        let payload: Vec<u8> = (0..400u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 24) as u8)
            .collect();
        let packet = test_packet(payload);

        let encoded = WireFormat::encode_with_options(&packet, true, false).unwrap();
        assert_eq!(encoded[11] & PacketFlags::IS_COMPRESSED, 0);
        assert_eq!(WireFormat::decode(&encoded).unwrap(), packet);
    }

    #[test]
    fn test_small_payload_never_compressed() {
        let packet = test_packet(vec![b'a'; COMPRESSION_THRESHOLD]);
        let encoded = WireFormat::encode_with_options(&packet, true, false).unwrap();
        assert_eq!(encoded[11] & PacketFlags::IS_COMPRESSED, 0);
    }

    #[test]
    fn test_decompression_bomb_rejected() {
        // Hand-build a v1 frame whose compressed area claims a 60000-byte
        // original from a single compressed byte.
        let mut frame = Vec::new();
        frame.push(1u8); // version
        frame.push(MessageType::Message.as_u8());
        frame.push(7u8); // ttl
        frame.extend_from_slice(&1_700_000_000_000u64.to_be_bytes());
        frame.push(PacketFlags::IS_COMPRESSED); // flags
        frame.extend_from_slice(&3u16.to_be_bytes()); // payload_len
        frame.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]); // sender
        frame.extend_from_slice(&60_000u16.to_be_bytes()); // claimed original
        frame.push(0x78); // one "compressed" byte

        let err = WireFormat::decode(&frame).unwrap_err();
        assert!(matches!(
            err,
            BitchatError::InvalidPacket(PacketError::DecompressionBomb { .. })
        ));
    }

    #[test]
    fn test_truncated_frames_fail_cleanly() {
        let packet = test_packet(b"truncate me".to_vec());
        let encoded = WireFormat::encode(&packet).unwrap();

        for len in 0..encoded.len() {
            assert!(WireFormat::decode(&encoded[..len]).is_err());
        }
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut frame = WireFormat::encode(&test_packet(vec![1])).unwrap();
        frame[0] = 9;
        assert!(WireFormat::decode(&frame).is_err());
    }

    #[test]
    fn test_payload_length_bound() {
        let mut frame = Vec::new();
        frame.push(2u8); // v2 so the length field can lie big
        frame.push(MessageType::Message.as_u8());
        frame.push(7u8);
        frame.extend_from_slice(&0u64.to_be_bytes());
        frame.push(0u8);
        frame.extend_from_slice(&(11 * 1024 * 1024u32).to_be_bytes());
        frame.extend_from_slice(&[0u8; 8]);

        let err = WireFormat::decode(&frame).unwrap_err();
        assert!(matches!(
            err,
            BitchatError::InvalidPacket(PacketError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_v1_frame_with_route_flag_rejected() {
        let mut frame = WireFormat::encode(&test_packet(vec![1])).unwrap();
        frame[11] |= PacketFlags::HAS_ROUTE;
        assert!(WireFormat::decode(&frame).is_err());
    }
}
