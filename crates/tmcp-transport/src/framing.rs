//! Envelope framing for binary and text transports.
//!
//! Socket transports carry length-prefixed binary frames. Push streams are
//! text-only, so envelopes travel there as unpadded base64url `data:` events.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Default upper bound for a single envelope (1 MiB).
pub const MAX_ENVELOPE_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("frame too large: {0} bytes (max: {1})")]
    TooLarge(usize, usize),

    #[error("incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    #[error("invalid frame format")]
    InvalidFormat,
}

/// Length-prefixed binary frames: `len (u32 BE) || data`.
#[derive(Clone, Copy, Debug)]
pub struct LengthCodec {
    max_frame_size: usize,
}

impl LengthCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>, FramingError> {
        if data.len() > self.max_frame_size {
            return Err(FramingError::TooLarge(data.len(), self.max_frame_size));
        }
        let mut encoded = Vec::with_capacity(4 + data.len());
        encoded.put_u32(data.len() as u32);
        encoded.extend_from_slice(data);
        Ok(encoded)
    }

    /// Pull one complete frame off the front of `buf`, if there is one.
    pub fn decode_stream(&self, buf: &mut BytesMut) -> Result<Option<Vec<u8>>, FramingError> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let len = (&buf[..4]).get_u32() as usize;
        if len > self.max_frame_size {
            return Err(FramingError::TooLarge(len, self.max_frame_size));
        }
        if buf.len() < 4 + len {
            return Ok(None);
        }
        buf.advance(4);
        Ok(Some(buf.split_to(len).to_vec()))
    }
}

impl Default for LengthCodec {
    fn default() -> Self {
        Self::new(MAX_ENVELOPE_SIZE)
    }
}

/// Text event framing for push streams: `data: <base64url>\n\n`.
#[derive(Clone, Copy, Debug)]
pub struct TextEventCodec {
    max_frame_size: usize,
}

impl TextEventCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn encode(&self, data: &[u8]) -> Result<String, FramingError> {
        if data.len() > self.max_frame_size {
            return Err(FramingError::TooLarge(data.len(), self.max_frame_size));
        }
        Ok(format!("data: {}\n\n", URL_SAFE_NO_PAD.encode(data)))
    }

    pub fn decode(&self, event: &str) -> Result<Vec<u8>, FramingError> {
        let body = event
            .strip_prefix("data: ")
            .and_then(|rest| rest.strip_suffix("\n\n"))
            .ok_or(FramingError::InvalidFormat)?;
        // base64 expands by 4/3; reject before allocating
        if body.len() / 4 * 3 > self.max_frame_size + 3 {
            return Err(FramingError::TooLarge(body.len() / 4 * 3, self.max_frame_size));
        }
        let data = URL_SAFE_NO_PAD.decode(body).map_err(|_| FramingError::InvalidFormat)?;
        if data.len() > self.max_frame_size {
            return Err(FramingError::TooLarge(data.len(), self.max_frame_size));
        }
        Ok(data)
    }
}

impl Default for TextEventCodec {
    fn default() -> Self {
        Self::new(MAX_ENVELOPE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_length_codec_partial_reads() {
        let codec = LengthCodec::default();
        let encoded = codec.encode(b"envelope").unwrap();

        let mut buf = BytesMut::from(&encoded[..3]);
        assert!(codec.decode_stream(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&encoded[3..]);
        assert_eq!(codec.decode_stream(&mut buf).unwrap().unwrap(), b"envelope");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_length_codec_rejects_oversize() {
        let codec = LengthCodec::new(8);
        assert!(matches!(codec.encode(&[0u8; 9]), Err(FramingError::TooLarge(9, 8))));
    }

    #[test]
    fn test_text_event_shape() {
        let codec = TextEventCodec::default();
        let event = codec.encode(&[0xfb, 0xff]).unwrap();
        assert_eq!(event, "data: -_8\n\n");
        assert_eq!(codec.decode(&event).unwrap(), vec![0xfb, 0xff]);
    }

    #[test]
    fn test_text_event_rejects_garbage() {
        let codec = TextEventCodec::default();
        assert!(matches!(codec.decode("event: ping\n\n"), Err(FramingError::InvalidFormat)));
        assert!(matches!(codec.decode("data: !!!\n\n"), Err(FramingError::InvalidFormat)));
    }

    proptest! {
        #[test]
        fn prop_text_event_round_trip(data in prop::collection::vec(any::<u8>(), 0..4096)) {
            let codec = TextEventCodec::default();
            let event = codec.encode(&data).unwrap();
            prop_assert_eq!(codec.decode(&event).unwrap(), data);
        }
    }
}
