//! Stream framing for peer links
//!
//! Wire format:
//! [Header: 18 bytes ASCII "length:" + decimal length, left-justified,
//! space-padded to 11 chars][Payload: exactly `length` bytes]
//!
//! There is no delimiter, checksum or version field; message boundaries
//! are recovered purely from the declared length.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Header prefix
pub const HEADER_PREFIX: &[u8] = b"length:";

/// Total header size
pub const HEADER_LEN: usize = 18;

/// Width of the decimal length field
pub const LENGTH_FIELD_LEN: usize = HEADER_LEN - HEADER_PREFIX.len();

/// Largest payload the 11-digit length field can declare
pub const MAX_DECLARED_LEN: u64 = 99_999_999_999;

/// Frame decoding errors. Both are fatal to the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Header bytes are not `length:` followed by a padded decimal
    #[error("malformed frame header: {0:?}")]
    MalformedHeader(String),

    /// Declared length exceeds what this decoder accepts
    #[error("frame of {declared} bytes exceeds limit of {limit}")]
    TooLarge { declared: u64, limit: u64 },
}

/// Build the 18-byte header for a payload of `len` bytes
pub fn encode_header(len: usize) -> Result<[u8; HEADER_LEN], FrameError> {
    let declared = len as u64;
    if declared > MAX_DECLARED_LEN {
        return Err(FrameError::TooLarge {
            declared,
            limit: MAX_DECLARED_LEN,
        });
    }

    let text = format!("length:{:<11}", len);
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(text.as_bytes());
    Ok(header)
}

/// Encode one payload into header + payload bytes
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, FrameError> {
    let header = encode_header(payload.len())?;
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_slice(&header);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Parse the declared payload length out of a complete header
pub fn parse_header(header: &[u8]) -> Result<u64, FrameError> {
    let malformed = || FrameError::MalformedHeader(String::from_utf8_lossy(header).into_owned());

    if header.len() != HEADER_LEN || !header.starts_with(HEADER_PREFIX) {
        return Err(malformed());
    }

    let field = std::str::from_utf8(&header[HEADER_PREFIX.len()..])
        .map_err(|_| malformed())?
        .trim();

    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }

    field.parse::<u64>().map_err(|_| malformed())
}

/// Where the decoder is within the current frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Waiting for 18 header bytes
    Header,
    /// Waiting for this many payload bytes
    Payload(usize),
}

/// Incremental frame decoder.
///
/// Feed it chunks of arbitrary size; completed payloads come out in the
/// order they were written. A partially received frame stays buffered
/// until the rest arrives.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    state: DecodeState,
    max_len: u64,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Decoder accepting any length the header can express
    pub fn new() -> Self {
        Self::with_max_len(MAX_DECLARED_LEN)
    }

    /// Decoder rejecting frames larger than `max_len`
    pub fn with_max_len(max_len: u64) -> Self {
        Self {
            buffer: BytesMut::new(),
            state: DecodeState::Header,
            max_len,
        }
    }

    /// Append received bytes
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Pop the next complete payload, if the buffer holds one
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if self.buffer.len() < HEADER_LEN {
                        return Ok(None);
                    }

                    let declared = parse_header(&self.buffer[..HEADER_LEN])?;
                    if declared > self.max_len {
                        return Err(FrameError::TooLarge {
                            declared,
                            limit: self.max_len,
                        });
                    }

                    let len = usize::try_from(declared).map_err(|_| FrameError::TooLarge {
                        declared,
                        limit: usize::MAX as u64,
                    })?;

                    self.buffer.advance(HEADER_LEN);
                    self.state = DecodeState::Payload(len);
                }
                DecodeState::Payload(remaining) => {
                    if self.buffer.len() < remaining {
                        return Ok(None);
                    }

                    let payload = self.buffer.split_to(remaining).freeze();
                    self.state = DecodeState::Header;
                    return Ok(Some(payload));
                }
            }
        }
    }

    /// Append a chunk and drain every payload it completes
    pub fn decode(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>, FrameError> {
        self.extend(chunk);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Bytes buffered but not yet returned
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the decoder is between frames with nothing buffered
    pub fn is_idle(&self) -> bool {
        self.state == DecodeState::Header && self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn concat(messages: &[&[u8]]) -> Vec<u8> {
        messages
            .iter()
            .flat_map(|m| encode_frame(m).unwrap().to_vec())
            .collect()
    }

    #[test]
    fn test_header_layout() {
        let header = encode_header(42).unwrap();
        assert_eq!(&header, b"length:42         ");
        assert_eq!(parse_header(&header).unwrap(), 42);

        let header = encode_header(0).unwrap();
        assert_eq!(&header, b"length:0          ");
    }

    #[test]
    fn test_encode_appends_raw_payload() {
        let frame = encode_frame(b"hi").unwrap();
        assert_eq!(&frame[..], b"length:2          hi");
    }

    #[test]
    fn test_single_chunk() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.decode(&encode_frame(b"hello world").unwrap()).unwrap();
        assert_eq!(frames, vec![Bytes::from_static(b"hello world")]);
        assert!(decoder.is_idle());
    }

    #[test]
    fn test_every_split_point() {
        let message = b"{\"op\":\"publish\",\"topic\":\"/cmd_vel\"}";
        let encoded = encode_frame(message).unwrap();

        for split in 0..=encoded.len() {
            let mut decoder = FrameDecoder::new();
            let mut frames = decoder.decode(&encoded[..split]).unwrap();
            frames.extend(decoder.decode(&encoded[split..]).unwrap());
            assert_eq!(frames.len(), 1, "split at {}", split);
            assert_eq!(&frames[0][..], message);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let encoded = concat(&[&b"first"[..], &b""[..], &b"third message"[..]]);
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for byte in &encoded {
            frames.extend(decoder.decode(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(
            frames,
            vec![
                Bytes::from_static(b"first"),
                Bytes::new(),
                Bytes::from_static(b"third message"),
            ]
        );
    }

    #[test]
    fn test_many_messages_in_one_chunk() {
        let messages: Vec<Vec<u8>> = (0..50)
            .map(|i| format!("message-{}", i).repeat(i % 7).into_bytes())
            .collect();
        let refs: Vec<&[u8]> = messages.iter().map(|m| m.as_slice()).collect();
        let encoded = concat(&refs);

        let mut decoder = FrameDecoder::new();
        let frames = decoder.decode(&encoded).unwrap();
        let decoded: Vec<Vec<u8>> = frames.iter().map(|f| f.to_vec()).collect();
        assert_eq!(decoded, messages);
    }

    #[test]
    fn test_irregular_chunking_preserves_order() {
        let messages: Vec<&[u8]> = vec![
            &b"alpha"[..],
            &b""[..],
            &b"gamma-gamma"[..],
            &b"d"[..],
            &b"epsilon!"[..],
        ];
        let encoded = concat(&messages);

        for step in [1usize, 2, 3, 5, 17, 19, 64] {
            let mut decoder = FrameDecoder::new();
            let mut frames = Vec::new();
            for chunk in encoded.chunks(step) {
                frames.extend(decoder.decode(chunk).unwrap());
            }
            let decoded: Vec<&[u8]> = frames.iter().map(|f| &f[..]).collect();
            assert_eq!(decoded, messages, "step {}", step);
        }
    }

    #[test]
    fn test_zero_length_payload() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.decode(&encode_frame(b"").unwrap()).unwrap();
        assert_eq!(frames, vec![Bytes::new()]);
        assert!(decoder.is_idle());
    }

    #[test]
    fn test_partial_header_waits() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.decode(b"length:5   ").unwrap().is_empty());
        assert_eq!(decoder.buffered(), 11);
        let frames = decoder.decode(b"       abcde").unwrap();
        assert_eq!(frames, vec![Bytes::from_static(b"abcde")]);
    }

    #[test]
    fn test_partial_payload_is_kept() {
        let encoded = encode_frame(b"0123456789").unwrap();
        let mut decoder = FrameDecoder::new();
        assert!(decoder.decode(&encoded[..HEADER_LEN + 4]).unwrap().is_empty());
        assert_eq!(decoder.buffered(), 4);
        let frames = decoder.decode(&encoded[HEADER_LEN + 4..]).unwrap();
        assert_eq!(&frames[0][..], b"0123456789");
    }

    #[test]
    fn test_malformed_header() {
        let mut decoder = FrameDecoder::new();
        let err = decoder.decode(b"length:abc        payload").unwrap_err();
        assert!(matches!(err, FrameError::MalformedHeader(_)));

        let mut decoder = FrameDecoder::new();
        let err = decoder.decode(b"LENGTH:5          hello").unwrap_err();
        assert!(matches!(err, FrameError::MalformedHeader(_)));

        let mut decoder = FrameDecoder::new();
        let err = decoder.decode(b"length:           ").unwrap_err();
        assert!(matches!(err, FrameError::MalformedHeader(_)));
    }

    #[test]
    fn test_length_limit() {
        let mut decoder = FrameDecoder::with_max_len(4);
        let err = decoder.decode(&encode_frame(b"too long").unwrap()).unwrap_err();
        assert_eq!(err, FrameError::TooLarge { declared: 8, limit: 4 });
    }

    #[test]
    fn test_largest_declared_len_waits_or_rejects() {
        let header = format!("length:{:<11}", MAX_DECLARED_LEN);
        let mut decoder = FrameDecoder::new();
        match decoder.decode(header.as_bytes()) {
            // Fits in usize: the decoder waits for the payload
            Ok(frames) => {
                assert!(frames.is_empty());
                assert_eq!(decoder.buffered(), 0);
                assert!(!decoder.is_idle());
            }
            Err(err) => {
                assert!(usize::try_from(MAX_DECLARED_LEN).is_err());
                assert!(matches!(err, FrameError::TooLarge { .. }));
            }
        }
    }

    #[test]
    fn test_max_declared_len_fits_field() {
        let text = format!("{:<11}", MAX_DECLARED_LEN);
        assert_eq!(text.len(), LENGTH_FIELD_LEN);
    }
}
