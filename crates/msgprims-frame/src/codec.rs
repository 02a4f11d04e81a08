use bytes::{Buf, BufMut, BytesMut};
use msgprims_core::Message;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{FrameError, Result};

/// Size of every length field: 4 bytes, big-endian.
pub const LENGTH_SIZE: usize = 4;

/// Default maximum frame size, header included: 16 MiB.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Default maximum number of parts (text plus blobs) per frame.
pub const DEFAULT_MAX_PARTS: usize = 1024;

/// Configuration for the message codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum encoded frame size in bytes. Default: 16 MiB.
    pub max_frame_size: usize,
    /// Maximum number of parts per frame. Default: 1024.
    pub max_parts: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_parts: DEFAULT_MAX_PARTS,
        }
    }
}

impl FrameConfig {
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn with_max_parts(mut self, max_parts: usize) -> Self {
        self.max_parts = max_parts;
        self
    }
}

/// Encode a message into the wire format.
///
/// Wire format:
/// ```text
/// ┌────────────┬──────────────────┬─────────────┬────────┬─────┬────────┐
/// │ Count (4B) │ Lengths          │ Text (JSON) │ Blob 0 │ ... │ Blob n │
/// │ BE u32     │ Count × BE u32   │ UTF-8       │        │     │        │
/// └────────────┴──────────────────┴─────────────┴────────┴─────┴────────┘
/// ```
pub fn encode_message(message: &Message, dst: &mut BytesMut) -> Result<()> {
    let text = serde_json::to_vec(&message.text)?;
    let part_count = 1 + message.blobs.len();

    let mut lengths = Vec::with_capacity(part_count);
    lengths.push(part_length(text.len())?);
    for blob in &message.blobs {
        lengths.push(part_length(blob.len())?);
    }
    let count = u32::try_from(part_count).map_err(|_| FrameError::TooManyParts {
        count: part_count,
        max: u32::MAX as usize,
    })?;

    let body: usize = text.len() + message.blobs.iter().map(|b| b.len()).sum::<usize>();
    dst.reserve(LENGTH_SIZE * (1 + part_count) + body);
    dst.put_u32(count);
    for length in lengths {
        dst.put_u32(length);
    }
    dst.put_slice(&text);
    for blob in &message.blobs {
        dst.put_slice(blob);
    }
    Ok(())
}

/// Encoded size of a message without encoding it.
pub fn encoded_len(message: &Message) -> Result<usize> {
    let text = serde_json::to_vec(&message.text)?;
    let body: usize = text.len() + message.blobs.iter().map(|b| b.len()).sum::<usize>();
    Ok(LENGTH_SIZE * (2 + message.blobs.len()) + body)
}

fn part_length(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| FrameError::FrameTooLarge {
        size: len,
        max: u32::MAX as usize,
    })
}

/// Decode a message from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_message(src: &mut BytesMut, config: &FrameConfig) -> Result<Option<Message>> {
    if src.len() < LENGTH_SIZE {
        return Ok(None);
    }

    let part_count = read_u32(src, 0) as usize;
    if part_count == 0 {
        return Err(FrameError::EmptyFrame);
    }
    if part_count > config.max_parts {
        return Err(FrameError::TooManyParts {
            count: part_count,
            max: config.max_parts,
        });
    }

    let header_len = LENGTH_SIZE * (1 + part_count);
    if src.len() < header_len {
        return Ok(None);
    }

    let mut lengths = Vec::with_capacity(part_count);
    let mut total = header_len;
    for index in 0..part_count {
        let length = read_u32(src, LENGTH_SIZE * (1 + index)) as usize;
        total = total.saturating_add(length);
        lengths.push(length);
    }

    if total > config.max_frame_size {
        return Err(FrameError::FrameTooLarge {
            size: total,
            max: config.max_frame_size,
        });
    }
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(header_len);
    let text = src.split_to(lengths[0]).freeze();
    let blobs = lengths[1..]
        .iter()
        .map(|&length| src.split_to(length).freeze())
        .collect();
    let text = serde_json::from_slice(&text)?;

    Ok(Some(Message { text, blobs }))
}

fn read_u32(src: &BytesMut, offset: usize) -> u32 {
    let mut field = [0u8; LENGTH_SIZE];
    field.copy_from_slice(&src[offset..offset + LENGTH_SIZE]);
    u32::from_be_bytes(field)
}

/// `tokio_util` codec for [`Message`] frames.
#[derive(Debug, Clone, Default)]
pub struct MessageCodec {
    config: FrameConfig,
}

impl MessageCodec {
    pub fn new(config: FrameConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        decode_message(src, &self.config)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::ConnectionClosed),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let size = encoded_len(&item)?;
        if size > self.config.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size,
                max: self.config.max_frame_size,
            });
        }
        let parts = 1 + item.blobs.len();
        if parts > self.config.max_parts {
            return Err(FrameError::TooManyParts {
                count: parts,
                max: self.config.max_parts,
            });
        }
        encode_message(&item, dst)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde_json::json;

    use super::*;

    fn config() -> FrameConfig {
        FrameConfig::default()
    }

    #[test]
    fn wire_layout_matches_format() {
        let message = Message::with_blobs(json!({"a": 1}), [Bytes::from_static(b"xyz")]);
        let mut buf = BytesMut::new();
        encode_message(&message, &mut buf).unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&2u32.to_be_bytes());
        expected.extend_from_slice(&7u32.to_be_bytes());
        expected.extend_from_slice(&3u32.to_be_bytes());
        expected.extend_from_slice(br#"{"a":1}"#);
        expected.extend_from_slice(b"xyz");
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(encoded_len(&message).unwrap(), expected.len());
    }

    #[test]
    fn decode_restores_text_and_blob_order() {
        let message = Message::with_blobs(
            json!({"frame": 3, "planes": ["y", "u", "v"]}),
            [b"first".to_vec(), Vec::new(), b"third".to_vec()],
        );
        let mut buf = BytesMut::new();
        encode_message(&message, &mut buf).unwrap();

        let decoded = decode_message(&mut buf, &config()).unwrap().unwrap();
        assert_eq!(decoded, message);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_incomplete_header() {
        let mut buf = BytesMut::from(&[0x00, 0x00, 0x00][..]);
        assert!(decode_message(&mut buf, &config()).unwrap().is_none());

        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u32(2);
        assert!(decode_message(&mut buf, &config()).unwrap().is_none());
    }

    #[test]
    fn decode_incomplete_body() {
        let mut buf = BytesMut::new();
        encode_message(&Message::new(json!({"hello": "there"})), &mut buf).unwrap();
        let full = buf.len();
        buf.truncate(full - 3);

        assert!(decode_message(&mut buf, &config()).unwrap().is_none());
        assert_eq!(buf.len(), full - 3);
    }

    #[test]
    fn decode_rejects_zero_parts() {
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        assert!(matches!(
            decode_message(&mut buf, &config()),
            Err(FrameError::EmptyFrame)
        ));
    }

    #[test]
    fn decode_rejects_too_many_parts() {
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        let cfg = FrameConfig::default().with_max_parts(4);
        assert!(matches!(
            decode_message(&mut buf, &cfg),
            Err(FrameError::TooManyParts { count: 5, max: 4 })
        ));
    }

    #[test]
    fn decode_rejects_oversized_frame() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u32(1024);
        let cfg = FrameConfig::default().with_max_frame_size(512);
        assert!(matches!(
            decode_message(&mut buf, &cfg),
            Err(FrameError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn decode_rejects_invalid_json() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u32(5);
        buf.put_slice(b"{nope");
        assert!(matches!(
            decode_message(&mut buf, &config()),
            Err(FrameError::InvalidText(_))
        ));
    }

    #[test]
    fn multiple_frames_in_one_buffer() {
        let mut buf = BytesMut::new();
        encode_message(&Message::new(json!(1)), &mut buf).unwrap();
        encode_message(&Message::new(json!("two")), &mut buf).unwrap();

        let first = decode_message(&mut buf, &config()).unwrap().unwrap();
        let second = decode_message(&mut buf, &config()).unwrap().unwrap();
        assert_eq!(first.text, json!(1));
        assert_eq!(second.text, json!("two"));
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_encode_enforces_limits() {
        let mut codec = MessageCodec::new(FrameConfig::default().with_max_frame_size(16));
        let mut buf = BytesMut::new();
        let err = codec
            .encode(Message::with_blobs(json!({}), [vec![0u8; 64]]), &mut buf)
            .unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { .. }));
        assert!(buf.is_empty());

        let mut codec = MessageCodec::new(FrameConfig::default().with_max_parts(1));
        let err = codec
            .encode(Message::with_blobs(json!({}), [b"x".to_vec()]), &mut buf)
            .unwrap_err();
        assert!(matches!(err, FrameError::TooManyParts { .. }));
    }

    #[test]
    fn codec_eof_mid_frame_is_an_error() {
        let mut buf = BytesMut::new();
        encode_message(&Message::new(json!({"x": 1})), &mut buf).unwrap();
        buf.truncate(buf.len() - 1);

        let mut codec = MessageCodec::default();
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(FrameError::ConnectionClosed)
        ));
        assert!(codec.decode_eof(&mut BytesMut::new()).unwrap().is_none());
    }
}
