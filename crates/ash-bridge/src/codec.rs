//! 4-byte big-endian length prefix + UTF-8 JSON frame. Generic over an encode
//! type and a decode type so the same codec serves both halves of the bridge:
//! the server encodes [`Command`][crate::Command] and decodes
//! [`Event`][crate::Event]; the in-sandbox runtime does the reverse. This
//! mirrors the "codec wrapped around a `Framed` stream" shape querymt's mesh
//! transport uses for its own wire framing, generalized from a libp2p stream
//! to a plain Unix-domain socket.

use std::io;
use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::codec::{Decoder, Encoder};

/// Frames larger than this are rejected rather than buffered — guards
/// against a corrupt length prefix turning into an unbounded allocation.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const LENGTH_PREFIX_LEN: usize = 4;

pub struct JsonLengthCodec<Enc, Dec> {
    _marker: PhantomData<(Enc, Dec)>,
}

impl<Enc, Dec> Default for JsonLengthCodec<Enc, Dec> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<Enc, Dec> JsonLengthCodec<Enc, Dec> {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON decode error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame of {0} bytes exceeds max frame length {MAX_FRAME_LEN}")]
    FrameTooLarge(usize),
}

impl<Enc, Dec> Encoder<Enc> for JsonLengthCodec<Enc, Dec>
where
    Enc: Serialize,
{
    type Error = CodecError;

    fn encode(&mut self, item: Enc, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = serde_json::to_vec(&item)?;
        if body.len() > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(body.len()));
        }
        dst.reserve(LENGTH_PREFIX_LEN + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

impl<Enc, Dec> Decoder for JsonLengthCodec<Enc, Dec>
where
    Dec: DeserializeOwned,
{
    type Item = Dec;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes(src[..LENGTH_PREFIX_LEN].try_into().unwrap()) as usize;
        if len > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(len));
        }
        if src.len() < LENGTH_PREFIX_LEN + len {
            src.reserve(LENGTH_PREFIX_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX_LEN);
        let body = src.split_to(len);
        let item = serde_json::from_slice(&body)?;
        Ok(Some(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Command, QueryOptions};

    #[test]
    fn round_trips_a_frame() {
        let mut codec = JsonLengthCodec::<Command, Command>::new();
        let mut buf = BytesMut::new();
        let cmd = Command::Query {
            query_id: "q1".into(),
            prompt: "ping".into(),
            options: QueryOptions::default(),
        };
        codec.encode(cmd.clone(), &mut buf).unwrap();
        // length prefix then exactly that many bytes, nothing else
        let len = u32::from_be_bytes(buf[..4].try_into().unwrap()) as usize;
        assert_eq!(buf.len(), 4 + len);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.query_id(), cmd.query_id());
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_waits_for_full_frame() {
        let mut codec = JsonLengthCodec::<Command, Command>::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                Command::Abort {
                    query_id: "q1".into(),
                },
                &mut buf,
            )
            .unwrap();
        let full = buf.split();
        // feed one byte at a time; decode must return None until complete
        let mut partial = BytesMut::new();
        for (i, byte) in full.iter().enumerate() {
            partial.extend_from_slice(&[*byte]);
            let result = codec.decode(&mut partial).unwrap();
            if i + 1 < full.len() {
                assert!(result.is_none());
            } else {
                assert!(result.is_some());
            }
        }
    }

    #[test]
    fn rejects_oversized_length_prefix() {
        let mut codec = JsonLengthCodec::<Command, Command>::new();
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_LEN + 1) as u32);
        assert!(codec.decode(&mut buf).is_err());
    }
}
