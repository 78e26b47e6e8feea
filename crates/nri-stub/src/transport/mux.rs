//! Connection multiplexing over one socket.
//!
//! Frame layout: `conn id (u32 BE) | payload length (u32 BE) | payload`.

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use derive_more::Display;
use tokio_util::codec::Decoder;
use tokio_util::codec::Encoder;

use super::CodecError;

const HEADER_LEN: usize = 8;

/// Largest payload carried by a single frame.
pub const MAX_PAYLOAD: usize = 4 << 20;

/// Identifier of a logical connection inside the multiplexed socket.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display("conn#{_0}")]
pub struct ConnId(pub u32);

/// Runtime-to-plugin requests.
pub const PLUGIN_SERVICE_CONN: ConnId = ConnId(1);
/// Plugin-to-runtime requests.
pub const RUNTIME_SERVICE_CONN: ConnId = ConnId(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxFrame {
    pub conn: ConnId,
    pub payload: Bytes,
}

impl MuxFrame {
    pub fn new(conn: ConnId, payload: impl Into<Bytes>) -> Self {
        Self {
            conn,
            payload: payload.into(),
        }
    }

    /// Splits `data` into as many frames as the payload limit requires.
    pub fn chunked(conn: ConnId, mut data: Bytes) -> Vec<Self> {
        let mut frames = Vec::with_capacity(data.len() / MAX_PAYLOAD + 1);
        while data.len() > MAX_PAYLOAD {
            frames.push(Self::new(conn, data.split_to(MAX_PAYLOAD)));
        }
        if !data.is_empty() {
            frames.push(Self::new(conn, data));
        }
        frames
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MuxCodec;

impl Decoder for MuxCodec {
    type Item = MuxFrame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<MuxFrame>, CodecError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header: &[u8] = &src[..HEADER_LEN];
        let conn = ConnId(header.get_u32());
        let len = header.get_u32() as usize;
        if len > MAX_PAYLOAD {
            return Err(CodecError::FrameTooLarge {
                len,
                max: MAX_PAYLOAD,
            });
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(MuxFrame { conn, payload }))
    }
}

impl Encoder<MuxFrame> for MuxCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: MuxFrame, dst: &mut BytesMut) -> Result<(), CodecError> {
        let len = frame.payload.len();
        if len > MAX_PAYLOAD {
            return Err(CodecError::FrameTooLarge {
                len,
                max: MAX_PAYLOAD,
            });
        }

        dst.reserve(HEADER_LEN + len);
        dst.put_u32(frame.conn.0);
        dst.put_u32(len as u32);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
