use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::messages::Envelope;
use crate::error::Error;

/// Length-prefixed `bincode` framing for `Envelope`s, the in-repo stand-in
/// for Avro-encoded Kafka messages (spec §6 "Wire format"). A 4-byte
/// big-endian length prefix precedes each encoded envelope so the decoder
/// can wait for a full frame before attempting to deserialize it.
#[derive(Debug, Default)]
pub struct EnvelopeCodec {
    max_frame_len: usize,
}

impl EnvelopeCodec {
    pub fn new(max_frame_len: usize) -> Self {
        EnvelopeCodec { max_frame_len }
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = Error;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = bincode::serialize(&item).map_err(|e| Error::TransportError(format!("encode failed: {e}")))?;
        if self.max_frame_len > 0 && payload.len() > self.max_frame_len {
            return Err(Error::TransportError(format!("message of {} bytes exceeds message.max.bytes={}", payload.len(), self.max_frame_len)));
        }
        dst.reserve(4 + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes(src[..4].try_into().unwrap()) as usize;
        if self.max_frame_len > 0 && len > self.max_frame_len {
            return Err(Error::TransportError(format!("incoming frame of {len} bytes exceeds message.max.bytes={}", self.max_frame_len)));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let frame = src.split_to(len);
        let envelope: Envelope = bincode::deserialize(&frame).map_err(|e| Error::TransportError(format!("decode failed: {e}")))?;
        Ok(Some(envelope))
    }
}
