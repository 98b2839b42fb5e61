//! Wire framing: header validation, payload extraction and response
//! encoding.
//!
//! Every frame starts with a nine-byte header, big-endian on the wire:
//!
//! ```text
//! offset 0 : 3 bytes  preamble "MAI"
//! offset 3 : 2 bytes  version
//! offset 5 : 4 bytes  payload size (>= 1)
//! offset 9 : payload
//! ```
//!
//! The same parser runs on client request streams and on the ack streams
//! coming back from peer servers.

use crate::config::{
    code, VersionTable, HEADER_SIZE, MSG_PREAMBLE, SPECIAL_COMMUNICATION, UNINITIALIZED_VERSION,
};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::error;

/// Outcome of validating the accumulated bytes of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// A complete frame is present; the payload is
    /// `buf[HEADER_SIZE..HEADER_SIZE + payload_len]`.
    Found { payload_len: usize },
    /// Not enough bytes yet. `declared` carries the payload size as soon as
    /// the header has been validated, so the caller can size its buffer.
    WaitForMore { declared: Option<u32> },
    InvalidHeader,
    InvalidVersion,
    InvalidSize,
}

/// Validate the frame at the start of `buf`.
///
/// `known_version` is the session's negotiated version; it is set on the
/// first frame whose header validates and must match on every later frame.
/// A frame may not redeclare the version mid-session: processors for the
/// old version could still be running against it.
pub fn parse_frame(
    buf: &[u8],
    known_version: &mut u16,
    versions: &VersionTable,
) -> ParseOutcome {
    if buf.len() < HEADER_SIZE {
        return ParseOutcome::WaitForMore { declared: None };
    }

    if &buf[..3] != MSG_PREAMBLE {
        return ParseOutcome::InvalidHeader;
    }

    let version = u16::from_be_bytes([buf[3], buf[4]]);

    if version == UNINITIALIZED_VERSION
        || (*known_version != UNINITIALIZED_VERSION && *known_version != version)
    {
        return ParseOutcome::InvalidVersion;
    }

    *known_version = version;

    let size = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]);

    if size == 0 {
        return ParseOutcome::InvalidSize;
    }

    let params = match versions.get(version) {
        Some(p) => p,
        None => {
            error!(
                version = format_args!("0x{version:X}"),
                "no request processor registered for version; treating as invalid"
            );
            return ParseOutcome::InvalidVersion;
        }
    };

    if size as usize > params.max_request_size {
        return ParseOutcome::InvalidSize;
    }

    if HEADER_SIZE + size as usize > buf.len() {
        return ParseOutcome::WaitForMore {
            declared: Some(size),
        };
    }

    ParseOutcome::Found {
        payload_len: size as usize,
    }
}

fn put_header(out: &mut BytesMut, version: u16, size: u32) {
    out.put_slice(MSG_PREAMBLE);
    out.put_u16(version);
    out.put_u32(size);
}

/// Encode the wire form of a response for a locally connected client:
/// header carrying the sender's version, then the payload verbatim.
pub fn encode_local(version: u16, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    put_header(&mut out, version, payload.len() as u32);
    out.put_slice(payload);
    out.freeze()
}

/// Encode the wire form of a response forwarded to a peer server:
/// header under the reserved version, then sender version (2), handle
/// count (4), one 8-byte registration number per recipient, and the
/// original payload.
pub fn encode_forwarded(sender_version: u16, registrations: &[u64], payload: &[u8]) -> Bytes {
    let inner = 2 + 4 + registrations.len() * 8 + payload.len();
    let mut out = BytesMut::with_capacity(HEADER_SIZE + inner);

    put_header(&mut out, SPECIAL_COMMUNICATION, inner as u32);
    out.put_u16(sender_version);
    out.put_u32(registrations.len() as u32);
    for &registration in registrations {
        out.put_u64(registration);
    }
    out.put_slice(payload);
    out.freeze()
}

/// Decoded body of a forwarded-response frame, as received by the peer.
#[derive(Debug, PartialEq, Eq)]
pub struct ForwardedMessage {
    pub sender_version: u16,
    pub registrations: Vec<u64>,
    /// Offset of the original payload within the input slice.
    pub payload_offset: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ForwardedDecodeError {
    #[error("forwarded response too short to carry version and handle count")]
    TooShort,
    #[error("forwarded response truncated inside its handle array")]
    TruncatedHandles,
    #[error("forwarded response carries no payload")]
    EmptyPayload,
}

/// Decode the payload of a frame received under the reserved version:
/// `sender-version (2) | handle-count (4) | count x registration (8) |
/// payload`.
pub fn decode_forwarded(payload: &[u8]) -> Result<ForwardedMessage, ForwardedDecodeError> {
    if payload.len() < 6 {
        return Err(ForwardedDecodeError::TooShort);
    }

    let sender_version = u16::from_be_bytes([payload[0], payload[1]]);
    let count = u32::from_be_bytes([payload[2], payload[3], payload[4], payload[5]]) as usize;

    let mut registrations = Vec::with_capacity(count.min(1024));
    let mut index = 6;
    for _ in 0..count {
        if index + 8 > payload.len() {
            return Err(ForwardedDecodeError::TruncatedHandles);
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&payload[index..index + 8]);
        registrations.push(u64::from_be_bytes(raw));
        index += 8;
    }

    if index >= payload.len() {
        return Err(ForwardedDecodeError::EmptyPayload);
    }

    Ok(ForwardedMessage {
        sender_version,
        registrations,
        payload_offset: index,
    })
}

/// Response-type code of an already-encoded wire form. For frames under the
/// reserved version this is the first payload byte; anything else is an
/// ordinary response.
pub fn response_type(version: u16, payload: &[u8]) -> u8 {
    if version == SPECIAL_COMMUNICATION {
        payload[0]
    } else {
        code::ORDINARY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VersionParams;

    fn table() -> VersionTable {
        VersionTable::build([(
            1,
            VersionParams {
                max_request_size: 1024,
                max_response_size: 1024,
            },
        )])
        .unwrap()
    }

    fn frame(version: u16, payload: &[u8]) -> Vec<u8> {
        encode_local(version, payload).to_vec()
    }

    #[test]
    fn test_complete_frame_found() {
        let versions = table();
        let buf = frame(1, b"hello");
        let mut known = UNINITIALIZED_VERSION;

        let outcome = parse_frame(&buf, &mut known, &versions);
        assert_eq!(outcome, ParseOutcome::Found { payload_len: 5 });
        assert_eq!(known, 1);
        assert_eq!(&buf[HEADER_SIZE..HEADER_SIZE + 5], b"hello");
    }

    #[test]
    fn test_short_buffer_waits_without_declared() {
        let versions = table();
        let buf = frame(1, b"hello");
        let mut known = UNINITIALIZED_VERSION;

        for len in 0..HEADER_SIZE {
            assert_eq!(
                parse_frame(&buf[..len], &mut known, &versions),
                ParseOutcome::WaitForMore { declared: None }
            );
        }
    }

    #[test]
    fn test_exactly_header_bytes_reports_declared() {
        let versions = table();
        let buf = frame(1, b"hello");
        let mut known = UNINITIALIZED_VERSION;

        let outcome = parse_frame(&buf[..HEADER_SIZE], &mut known, &versions);
        assert_eq!(
            outcome,
            ParseOutcome::WaitForMore { declared: Some(5) }
        );
        assert_eq!(known, 1);
    }

    #[test]
    fn test_bad_preamble() {
        let versions = table();
        let mut buf = frame(1, b"hello");
        buf[0] = b'X';
        let mut known = UNINITIALIZED_VERSION;

        assert_eq!(
            parse_frame(&buf, &mut known, &versions),
            ParseOutcome::InvalidHeader
        );
    }

    #[test]
    fn test_version_zero_rejected() {
        let versions = table();
        let mut buf = frame(1, b"hello");
        buf[3] = 0;
        buf[4] = 0;
        let mut known = UNINITIALIZED_VERSION;

        assert_eq!(
            parse_frame(&buf, &mut known, &versions),
            ParseOutcome::InvalidVersion
        );
        assert_eq!(known, UNINITIALIZED_VERSION);
    }

    #[test]
    fn test_version_change_mid_session_rejected() {
        let versions = VersionTable::build([
            (1, VersionParams::default()),
            (2, VersionParams::default()),
        ])
        .unwrap();
        let buf = frame(2, b"hello");
        let mut known = 1;

        assert_eq!(
            parse_frame(&buf, &mut known, &versions),
            ParseOutcome::InvalidVersion
        );
        assert_eq!(known, 1);
    }

    #[test]
    fn test_unregistered_version_rejected() {
        let versions = table();
        let buf = frame(7, b"hello");
        let mut known = UNINITIALIZED_VERSION;

        assert_eq!(
            parse_frame(&buf, &mut known, &versions),
            ParseOutcome::InvalidVersion
        );
    }

    #[test]
    fn test_zero_size_rejected() {
        let versions = table();
        let mut buf = frame(1, b"x");
        buf[5..9].copy_from_slice(&0u32.to_be_bytes());
        let mut known = UNINITIALIZED_VERSION;

        assert_eq!(
            parse_frame(&buf, &mut known, &versions),
            ParseOutcome::InvalidSize
        );
    }

    #[test]
    fn test_size_at_version_limit_accepted() {
        let versions = table();
        let payload = vec![0xAB; 1024];
        let buf = frame(1, &payload);
        let mut known = UNINITIALIZED_VERSION;

        assert_eq!(
            parse_frame(&buf, &mut known, &versions),
            ParseOutcome::Found { payload_len: 1024 }
        );
    }

    #[test]
    fn test_size_above_version_limit_rejected() {
        let versions = table();
        let payload = vec![0xAB; 1025];
        let buf = frame(1, &payload);
        let mut known = UNINITIALIZED_VERSION;

        assert_eq!(
            parse_frame(&buf, &mut known, &versions),
            ParseOutcome::InvalidSize
        );
    }

    #[test]
    fn test_parse_is_associative_over_splits() {
        // Feeding a prefix then the whole buffer must land in the same
        // place as feeding the whole buffer at once.
        let versions = table();
        let buf = frame(1, b"split me");

        for split in 1..buf.len() {
            let mut known = UNINITIALIZED_VERSION;
            match parse_frame(&buf[..split], &mut known, &versions) {
                ParseOutcome::WaitForMore { .. } => {}
                other => panic!("prefix of {split} bytes gave {other:?}"),
            }
            assert_eq!(
                parse_frame(&buf, &mut known, &versions),
                ParseOutcome::Found { payload_len: 8 }
            );
        }
    }

    #[test]
    fn test_local_encode_roundtrip() {
        let versions = table();
        let wire = encode_local(1, b"payload");
        let mut known = UNINITIALIZED_VERSION;

        assert_eq!(
            parse_frame(&wire, &mut known, &versions),
            ParseOutcome::Found { payload_len: 7 }
        );
        assert_eq!(known, 1);
        assert_eq!(&wire[HEADER_SIZE..], b"payload");
    }

    #[test]
    fn test_forwarded_encode_decode_roundtrip() {
        let registrations = vec![3u64, 17, 0xDEAD_BEEF_0001];
        let wire = encode_forwarded(2, &registrations, b"fanout");

        // Outer header declares the reserved version and the inner length.
        assert_eq!(u16::from_be_bytes([wire[3], wire[4]]), SPECIAL_COMMUNICATION);
        let inner = &wire[HEADER_SIZE..];
        assert_eq!(inner.len(), 2 + 4 + 3 * 8 + 6);

        let decoded = decode_forwarded(inner).unwrap();
        assert_eq!(decoded.sender_version, 2);
        assert_eq!(decoded.registrations, registrations);
        assert_eq!(&inner[decoded.payload_offset..], b"fanout");
    }

    #[test]
    fn test_forwarded_decode_rejects_truncation() {
        let wire = encode_forwarded(2, &[1, 2, 3], b"x");
        let inner = &wire[HEADER_SIZE..];

        assert_eq!(decode_forwarded(&inner[..5]), Err(ForwardedDecodeError::TooShort));
        assert_eq!(
            decode_forwarded(&inner[..6 + 2 * 8 + 4]),
            Err(ForwardedDecodeError::TruncatedHandles)
        );
        // A handle array running to the exact end leaves no payload.
        assert_eq!(
            decode_forwarded(&inner[..6 + 3 * 8]),
            Err(ForwardedDecodeError::EmptyPayload)
        );
    }

    #[test]
    fn test_response_type() {
        assert_eq!(response_type(SPECIAL_COMMUNICATION, &[code::KEEP_ALIVE]), 0);
        assert_eq!(response_type(1, b"anything"), code::ORDINARY);
    }
}
