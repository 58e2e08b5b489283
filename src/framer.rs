//! Length-prefixed framing and the typed envelope carried inside each frame.
//!
//! A frame is a 4-byte big-endian length followed by that many payload bytes.
//! The payload is an [`Envelope`]: payload type (u32 BE), client message id
//! length (u16 BE, 0 when absent), the id bytes, then the opaque body.

use crate::errors::{Result, SessionError};

const LEN_PREFIX: usize = 4;
const ENVELOPE_HEADER: usize = 6;

pub fn encode_frame(payload: &[u8], max_len: usize) -> Result<Vec<u8>> {
    if payload.len() > max_len || payload.len() > u32::MAX as usize {
        return Err(SessionError::Protocol(format!(
            "outbound frame of {} bytes exceeds limit {}",
            payload.len(),
            max_len
        )));
    }
    let mut out = Vec::with_capacity(LEN_PREFIX + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Incremental decoder; feed it whatever the socket returned and pull frames.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_len: usize,
}

impl FrameDecoder {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::with_capacity(8 * 1024),
            max_len,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the next complete frame, `Ok(None)` if more bytes are needed.
    /// An oversized length is unrecoverable: the stream position can no longer
    /// be trusted.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let mut prefix = [0u8; LEN_PREFIX];
        prefix.copy_from_slice(&self.buf[..LEN_PREFIX]);
        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_len {
            return Err(SessionError::Protocol(format!(
                "inbound frame of {len} bytes exceeds limit {}",
                self.max_len
            )));
        }
        if self.buf.len() < LEN_PREFIX + len {
            return Ok(None);
        }
        let frame = self.buf[LEN_PREFIX..LEN_PREFIX + len].to_vec();
        self.buf.drain(..LEN_PREFIX + len);
        Ok(Some(frame))
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub payload_type: u32,
    pub client_msg_id: Option<String>,
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn new(payload_type: u32, client_msg_id: Option<String>, body: Vec<u8>) -> Self {
        Self {
            payload_type,
            client_msg_id,
            body,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let id = self.client_msg_id.as_deref().unwrap_or("");
        if id.len() > u16::MAX as usize {
            return Err(SessionError::Protocol("client message id too long".into()));
        }
        let mut out = Vec::with_capacity(ENVELOPE_HEADER + id.len() + self.body.len());
        out.extend_from_slice(&self.payload_type.to_be_bytes());
        out.extend_from_slice(&(id.len() as u16).to_be_bytes());
        out.extend_from_slice(id.as_bytes());
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < ENVELOPE_HEADER {
            return Err(SessionError::Protocol(format!(
                "envelope too short: {} bytes",
                frame.len()
            )));
        }
        let payload_type = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        let id_len = u16::from_be_bytes([frame[4], frame[5]]) as usize;
        let id_end = ENVELOPE_HEADER + id_len;
        if frame.len() < id_end {
            return Err(SessionError::Protocol(
                "client message id overruns envelope".into(),
            ));
        }
        let client_msg_id = if id_len == 0 {
            None
        } else {
            let raw = std::str::from_utf8(&frame[ENVELOPE_HEADER..id_end])
                .map_err(|e| SessionError::Protocol(format!("client message id: {e}")))?;
            Some(raw.to_string())
        };
        Ok(Self {
            payload_type,
            client_msg_id,
            body: frame[id_end..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_handles_split_and_coalesced_frames() {
        let a = encode_frame(b"hello", 1024).unwrap();
        let b = encode_frame(b"world!", 1024).unwrap();
        let mut stream = a.clone();
        stream.extend_from_slice(&b);

        let mut decoder = FrameDecoder::new(1024);
        decoder.extend(&stream[..3]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.extend(&stream[3..]);
        assert_eq!(decoder.next_frame().unwrap().unwrap(), b"hello");
        assert_eq!(decoder.next_frame().unwrap().unwrap(), b"world!");
        assert!(decoder.next_frame().unwrap().is_none());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn oversized_length_is_protocol_error() {
        let mut decoder = FrameDecoder::new(16);
        decoder.extend(&100u32.to_be_bytes());
        assert!(matches!(
            decoder.next_frame(),
            Err(SessionError::Protocol(_))
        ));
    }

    #[test]
    fn envelope_keeps_optional_id() {
        let pushed = Envelope::new(2131, None, b"{}".to_vec());
        assert_eq!(Envelope::decode(&pushed.encode().unwrap()).unwrap(), pushed);

        let reply = Envelope::new(2101, Some("17".into()), vec![]);
        let decoded = Envelope::decode(&reply.encode().unwrap()).unwrap();
        assert_eq!(decoded.client_msg_id.as_deref(), Some("17"));
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn truncated_envelope_is_rejected() {
        assert!(Envelope::decode(&[0, 0, 8]).is_err());
        assert!(Envelope::decode(&[0, 0, 8, 51, 0, 9, b'x']).is_err());
    }
}
