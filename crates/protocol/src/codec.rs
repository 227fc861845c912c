//! Resumable envelope codec.
//!
//! Frame layout (all integers big-endian):
//!
//! ```text
//! policy u8 | ordered u8 | topic ordinal u8 | [topic len u32 | topic bytes]
//! | sequence i64 | timeout ms i64 | skip u8 | kind u8 | body len u32 | body
//! ```
//!
//! The bracketed part is present only for custom topics. Both directions keep
//! a field cursor, so a non-blocking transport can stop at any byte and
//! continue later with the same writer or reader.

use crate::envelope::{Envelope, OrderInfo};
use crate::error::{CodecError, Result};
use crate::messages::Message;
use crate::policy::IoPolicy;
use crate::topic::{CUSTOM_TOPIC_ORDINAL, Topic};
use std::time::Duration;

/// Largest accepted topic or body length
pub const MAX_FIELD_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Policy,
    Ordered,
    TopicOrdinal,
    TopicLen,
    TopicBytes,
    Sequence,
    Timeout,
    Skip,
    Kind,
    BodyLen,
    Body,
    Done,
}

impl Field {
    fn next(self, custom_topic: bool) -> Field {
        match self {
            Field::Policy => Field::Ordered,
            Field::Ordered => Field::TopicOrdinal,
            Field::TopicOrdinal if custom_topic => Field::TopicLen,
            Field::TopicOrdinal => Field::Sequence,
            Field::TopicLen => Field::TopicBytes,
            Field::TopicBytes => Field::Sequence,
            Field::Sequence => Field::Timeout,
            Field::Timeout => Field::Skip,
            Field::Skip => Field::Kind,
            Field::Kind => Field::BodyLen,
            Field::BodyLen => Field::Body,
            Field::Body | Field::Done => Field::Done,
        }
    }

    /// Width of fixed-size fields
    fn width(self) -> usize {
        match self {
            Field::Policy | Field::Ordered | Field::TopicOrdinal | Field::Skip | Field::Kind => 1,
            Field::TopicLen | Field::BodyLen => 4,
            Field::Sequence | Field::Timeout => 8,
            Field::TopicBytes | Field::Body | Field::Done => 0,
        }
    }
}

/// Incrementally writes one envelope.
pub struct EnvelopeWriter {
    field: Field,
    /// Bytes of the current field already written
    offset: usize,
    policy: u8,
    ordered: u8,
    topic_ordinal: u8,
    topic: Vec<u8>,
    sequence: i64,
    timeout_ms: i64,
    skip: u8,
    kind: u8,
    body: Vec<u8>,
}

impl EnvelopeWriter {
    /// Prepare an envelope for writing; the body is serialized once here.
    pub fn new(envelope: &Envelope) -> Result<Self> {
        let body = envelope.message.encode_body()?;
        if body.len() > MAX_FIELD_LEN {
            return Err(CodecError::FrameTooLarge {
                len: body.len(),
                max: MAX_FIELD_LEN,
            });
        }

        let topic = match &envelope.topic {
            Topic::Custom(bytes) => bytes.clone(),
            _ => Vec::new(),
        };
        if topic.len() > MAX_FIELD_LEN {
            return Err(CodecError::FrameTooLarge {
                len: topic.len(),
                max: MAX_FIELD_LEN,
            });
        }

        let order = envelope.order;
        Ok(Self {
            field: Field::Policy,
            offset: 0,
            policy: envelope.policy.ordinal(),
            ordered: u8::from(order.is_some()),
            topic_ordinal: envelope.topic.wire_ordinal(),
            topic,
            sequence: envelope.wire_sequence(),
            timeout_ms: order.map_or(0, |o| o.timeout.as_millis() as i64),
            skip: u8::from(order.is_some_and(|o| o.skip_on_timeout)),
            kind: envelope.message.kind() as u8,
            body,
        })
    }

    fn custom_topic(&self) -> bool {
        self.topic_ordinal == CUSTOM_TOPIC_ORDINAL
    }

    /// Total frame size in bytes
    pub fn encoded_len(&self) -> usize {
        let topic = if self.custom_topic() {
            4 + self.topic.len()
        } else {
            0
        };
        3 + topic + 8 + 8 + 1 + 1 + 4 + self.body.len()
    }

    pub fn is_done(&self) -> bool {
        self.field == Field::Done
    }

    fn scalar(&self, field: Field) -> [u8; 8] {
        let mut out = [0u8; 8];
        match field {
            Field::Policy => out[0] = self.policy,
            Field::Ordered => out[0] = self.ordered,
            Field::TopicOrdinal => out[0] = self.topic_ordinal,
            Field::Skip => out[0] = self.skip,
            Field::Kind => out[0] = self.kind,
            Field::TopicLen => out[..4].copy_from_slice(&(self.topic.len() as u32).to_be_bytes()),
            Field::BodyLen => out[..4].copy_from_slice(&(self.body.len() as u32).to_be_bytes()),
            Field::Sequence => out = self.sequence.to_be_bytes(),
            Field::Timeout => out = self.timeout_ms.to_be_bytes(),
            Field::TopicBytes | Field::Body | Field::Done => {}
        }
        out
    }

    /// Write as much of the frame as fits into `buf`; returns bytes written.
    pub fn write_to(&mut self, buf: &mut [u8]) -> usize {
        let mut written = 0;

        while self.field != Field::Done {
            let (n, field_len) = {
                let scalar;
                let src: &[u8] = match self.field {
                    Field::TopicBytes => &self.topic,
                    Field::Body => &self.body,
                    field => {
                        scalar = self.scalar(field);
                        &scalar[..field.width()]
                    }
                };
                let n = (src.len() - self.offset).min(buf.len() - written);
                buf[written..written + n].copy_from_slice(&src[self.offset..self.offset + n]);
                (n, src.len())
            };

            written += n;
            self.offset += n;

            if self.offset < field_len {
                // Out of room mid-field
                break;
            }

            self.field = self.field.next(self.custom_topic());
            self.offset = 0;
        }

        written
    }
}

#[derive(Default)]
struct RawFrame {
    policy: u8,
    ordered: u8,
    topic_ordinal: u8,
    topic: Vec<u8>,
    sequence: i64,
    timeout_ms: i64,
    skip: u8,
    kind: u8,
    body: Vec<u8>,
}

/// Incrementally reads envelopes from a byte stream.
pub struct EnvelopeReader {
    field: Field,
    /// Bytes of the current field received so far
    scratch: Vec<u8>,
    /// Length of the current field
    need: usize,
    frame: RawFrame,
}

impl Default for EnvelopeReader {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeReader {
    pub fn new() -> Self {
        Self {
            field: Field::Policy,
            scratch: Vec::with_capacity(8),
            need: Field::Policy.width(),
            frame: RawFrame::default(),
        }
    }

    /// Whether no partial frame is pending
    pub fn is_idle(&self) -> bool {
        self.field == Field::Policy && self.scratch.is_empty()
    }

    /// Consume bytes from `buf`.
    ///
    /// Stops after one complete frame. Returns the number of bytes consumed
    /// and, when a frame completed, its decoded envelope or the error that
    /// makes that single frame unusable.
    pub fn read_from(&mut self, buf: &[u8]) -> (usize, Option<Result<Envelope>>) {
        let mut consumed = 0;

        loop {
            let take = (self.need - self.scratch.len()).min(buf.len() - consumed);
            self.scratch
                .extend_from_slice(&buf[consumed..consumed + take]);
            consumed += take;

            if self.scratch.len() < self.need {
                return (consumed, None);
            }

            if let Some(result) = self.complete_field() {
                return (consumed, Some(result));
            }
        }
    }

    fn complete_field(&mut self) -> Option<Result<Envelope>> {
        let field = self.field;
        let bytes = std::mem::take(&mut self.scratch);

        match field {
            Field::Policy => self.frame.policy = bytes[0],
            Field::Ordered => self.frame.ordered = bytes[0],
            Field::TopicOrdinal => self.frame.topic_ordinal = bytes[0],
            Field::Skip => self.frame.skip = bytes[0],
            Field::Kind => self.frame.kind = bytes[0],
            Field::Sequence => self.frame.sequence = i64::from_be_bytes(to_array(&bytes)),
            Field::Timeout => self.frame.timeout_ms = i64::from_be_bytes(to_array(&bytes)),
            Field::TopicLen | Field::BodyLen => {
                let len = u32::from_be_bytes(to_array(&bytes)) as usize;
                if len > MAX_FIELD_LEN {
                    self.reset();
                    return Some(Err(CodecError::FrameTooLarge {
                        len,
                        max: MAX_FIELD_LEN,
                    }));
                }
                self.field = field.next(false);
                self.need = len;
                self.scratch = Vec::with_capacity(len);
                return None;
            }
            Field::TopicBytes => self.frame.topic = bytes,
            Field::Body => {
                self.frame.body = bytes;
                let frame = std::mem::take(&mut self.frame);
                self.reset();
                return Some(build(frame));
            }
            Field::Done => {}
        }

        let custom = self.frame.topic_ordinal == CUSTOM_TOPIC_ORDINAL;
        self.field = field.next(custom);
        self.need = self.field.width();
        self.scratch = Vec::with_capacity(8);
        None
    }

    fn reset(&mut self) {
        self.field = Field::Policy;
        self.need = Field::Policy.width();
        self.scratch = Vec::with_capacity(8);
        self.frame = RawFrame::default();
    }
}

fn to_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

fn build(frame: RawFrame) -> Result<Envelope> {
    let policy = IoPolicy::from_ordinal(frame.policy).ok_or(CodecError::UnknownPolicy(frame.policy))?;

    let topic = if frame.topic_ordinal == CUSTOM_TOPIC_ORDINAL {
        Topic::Custom(frame.topic)
    } else {
        Topic::from_ordinal(frame.topic_ordinal).ok_or(CodecError::UnknownTopic(frame.topic_ordinal))?
    };

    let order = if frame.ordered != 0 {
        if frame.sequence <= 0 {
            return Err(CodecError::InvalidSequence(frame.sequence));
        }
        Some(OrderInfo {
            sequence: frame.sequence as u64,
            timeout: Duration::from_millis(frame.timeout_ms.max(0) as u64),
            skip_on_timeout: frame.skip != 0,
        })
    } else {
        None
    };

    let message = Message::decode_body(frame.kind, &frame.body)?;

    Ok(Envelope {
        policy,
        topic,
        order,
        message,
    })
}

/// Encode a whole envelope in one go
pub fn encode_to_vec(envelope: &Envelope) -> Result<Vec<u8>> {
    let mut writer = EnvelopeWriter::new(envelope)?;
    let mut buf = vec![0u8; writer.encoded_len()];
    let written = writer.write_to(&mut buf);
    buf.truncate(written);
    Ok(buf)
}

/// Decode exactly one envelope from a complete frame
pub fn decode_from_slice(bytes: &[u8]) -> Result<Envelope> {
    let mut reader = EnvelopeReader::new();
    match reader.read_from(bytes) {
        (_, Some(result)) => result,
        (consumed, None) => Err(CodecError::Decode(format!(
            "truncated frame after {} bytes",
            consumed
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{FinishRequest, TxContext, TxEntry};
    use gridcore_common::{CacheKey, CacheValue, FutureId, NodeId, TxVersion};

    fn finish_envelope(topic: Topic) -> Envelope {
        let msg = Message::FinishRequest(FinishRequest {
            ctx: TxContext {
                version: TxVersion::new(42, 3, NodeId::random()),
                future_id: FutureId::new(),
                mini_id: FutureId::new(),
            },
            thread_id: 7,
            commit: true,
            invalidate: false,
            explicit_lock: true,
            topology_version: 5,
            tx_size: 1,
            writes: Some(vec![TxEntry::update(
                CacheKey::from("k"),
                CacheValue::from("v"),
            )]),
            sync: true,
        });
        Envelope::ordered(
            IoPolicy::System,
            topic,
            msg,
            17,
            Duration::from_millis(1500),
            true,
        )
    }

    #[test]
    fn test_whole_frame_roundtrip() {
        let envelope = Envelope::new(IoPolicy::Public, Topic::User, Message::user(b"hi".to_vec()));
        let bytes = encode_to_vec(&envelope).unwrap();
        assert_eq!(decode_from_slice(&bytes).unwrap(), envelope);

        let custom = finish_envelope(Topic::for_future(FutureId::new()));
        let bytes = encode_to_vec(&custom).unwrap();
        assert_eq!(decode_from_slice(&bytes).unwrap(), custom);
    }

    #[test]
    fn test_unordered_frame_carries_minus_one() {
        let envelope = Envelope::new(IoPolicy::Public, Topic::Job, Message::user(Vec::new()));
        let bytes = encode_to_vec(&envelope).unwrap();
        // policy, ordered, topic ordinal, then sequence
        assert_eq!(&bytes[3..11], &(-1i64).to_be_bytes());
    }

    #[test]
    fn test_split_at_every_boundary() {
        let envelope = finish_envelope(Topic::custom(b"tx-topic".to_vec()));
        let total = EnvelopeWriter::new(&envelope).unwrap().encoded_len();

        for chunk in 1..=total {
            let mut writer = EnvelopeWriter::new(&envelope).unwrap();
            let mut reader = EnvelopeReader::new();
            let mut decoded = None;
            let mut buf = vec![0u8; chunk];

            while !writer.is_done() {
                let n = writer.write_to(&mut buf);
                let mut pos = 0;
                while pos < n {
                    let (consumed, result) = reader.read_from(&buf[pos..n]);
                    pos += consumed;
                    if let Some(result) = result {
                        decoded = Some(result.unwrap());
                    }
                }
            }

            assert_eq!(decoded.as_ref(), Some(&envelope), "chunk size {}", chunk);
            assert!(reader.is_idle());
        }
    }

    #[test]
    fn test_writer_resumes_after_empty_buffer() {
        let envelope = finish_envelope(Topic::Cache);
        let mut writer = EnvelopeWriter::new(&envelope).unwrap();

        assert_eq!(writer.write_to(&mut []), 0);
        let mut out = vec![0u8; writer.encoded_len()];
        let n = writer.write_to(&mut out[..5]);
        assert_eq!(n, 5);
        let rest = writer.write_to(&mut out[5..]);
        assert!(writer.is_done());
        assert_eq!(decode_from_slice(&out[..n + rest]).unwrap(), envelope);
    }

    #[test]
    fn test_bad_frame_does_not_poison_stream() {
        let good = finish_envelope(Topic::Cache);
        let mut bad = encode_to_vec(&good).unwrap();
        bad[0] = 9;
        let good_bytes = encode_to_vec(&good).unwrap();

        let mut stream = bad.clone();
        stream.extend_from_slice(&good_bytes);

        let mut reader = EnvelopeReader::new();
        let (consumed, result) = reader.read_from(&stream);
        assert_eq!(consumed, bad.len());
        assert_eq!(result, Some(Err(CodecError::UnknownPolicy(9))));

        let (consumed, result) = reader.read_from(&stream[bad.len()..]);
        assert_eq!(consumed, good_bytes.len());
        assert_eq!(result, Some(Ok(good)));
    }

    #[test]
    fn test_oversized_length_is_rejected() {
        let envelope = finish_envelope(Topic::custom(b"t".to_vec()));
        let mut bytes = encode_to_vec(&envelope).unwrap();
        // Topic length follows the three single-byte header fields
        bytes[3..7].copy_from_slice(&u32::MAX.to_be_bytes());

        let result = decode_from_slice(&bytes);
        assert!(matches!(result, Err(CodecError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_ordered_frame_with_zero_sequence_is_rejected() {
        let mut envelope = finish_envelope(Topic::Cache);
        if let Some(order) = envelope.order.as_mut() {
            order.sequence = 0;
        }
        let bytes = encode_to_vec(&envelope).unwrap();
        assert_eq!(decode_from_slice(&bytes), Err(CodecError::InvalidSequence(0)));
    }

    #[test]
    fn test_truncated_frame() {
        let bytes = encode_to_vec(&finish_envelope(Topic::Cache)).unwrap();
        assert!(matches!(
            decode_from_slice(&bytes[..bytes.len() - 2]),
            Err(CodecError::Decode(_))
        ));
    }
}
