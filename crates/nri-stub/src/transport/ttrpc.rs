//! ttrpc message framing and envelopes.
//!
//! Header layout: `length (u32 BE) | stream id (u32 BE) | type (u8) | flags (u8)`,
//! followed by a protobuf encoded [`Request`] or [`Response`].

use std::time::Duration;

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use derive_more::Display;
use prost::Message;
use tokio_util::codec::Decoder;
use tokio_util::codec::Encoder;

use super::CodecError;

const HEADER_LEN: usize = 10;

/// Largest message body accepted on either side.
pub const MAX_MESSAGE: usize = 4 << 20;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Request,
    Response,
}

impl MessageType {
    const fn wire(self) -> u8 {
        match self {
            MessageType::Request => 0x1,
            MessageType::Response => 0x2,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            0x1 => Ok(MessageType::Request),
            0x2 => Ok(MessageType::Response),
            other => Err(CodecError::UnknownMessageType(other)),
        }
    }
}

/// One framed ttrpc message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtrpcMessage {
    pub stream_id: u32,
    pub kind: MessageType,
    pub flags: u8,
    pub payload: Bytes,
}

impl TtrpcMessage {
    pub fn request(stream_id: u32, request: &Request) -> Self {
        Self {
            stream_id,
            kind: MessageType::Request,
            flags: 0,
            payload: request.encode_to_vec().into(),
        }
    }

    pub fn response(stream_id: u32, response: &Response) -> Self {
        Self {
            stream_id,
            kind: MessageType::Response,
            flags: 0,
            payload: response.encode_to_vec().into(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TtrpcCodec;

impl Decoder for TtrpcCodec {
    type Item = TtrpcMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<TtrpcMessage>, CodecError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header: &[u8] = &src[..HEADER_LEN];
        let len = header.get_u32() as usize;
        let stream_id = header.get_u32();
        let kind = header.get_u8();
        let flags = header.get_u8();
        if len > MAX_MESSAGE {
            return Err(CodecError::FrameTooLarge {
                len,
                max: MAX_MESSAGE,
            });
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(TtrpcMessage {
            stream_id,
            kind: MessageType::try_from(kind)?,
            flags,
            payload,
        }))
    }
}

impl Encoder<TtrpcMessage> for TtrpcCodec {
    type Error = CodecError;

    fn encode(&mut self, message: TtrpcMessage, dst: &mut BytesMut) -> Result<(), CodecError> {
        let len = message.payload.len();
        if len > MAX_MESSAGE {
            return Err(CodecError::FrameTooLarge {
                len,
                max: MAX_MESSAGE,
            });
        }

        dst.reserve(HEADER_LEN + len);
        dst.put_u32(len as u32);
        dst.put_u32(message.stream_id);
        dst.put_u8(message.kind.wire());
        dst.put_u8(message.flags);
        dst.extend_from_slice(&message.payload);
        Ok(())
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
    #[prost(string, tag = "1")]
    pub service: String,
    #[prost(string, tag = "2")]
    pub method: String,
    #[prost(bytes = "bytes", tag = "3")]
    pub payload: Bytes,
    #[prost(int64, tag = "4")]
    pub timeout_nano: i64,
    #[prost(message, repeated, tag = "5")]
    pub metadata: Vec<KeyValue>,
}

impl Request {
    pub fn new(service: &str, method: &str, payload: &impl Message) -> Self {
        Self {
            service: service.to_string(),
            method: method.to_string(),
            payload: payload.encode_to_vec().into(),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_nano = i64::try_from(timeout.as_nanos()).unwrap_or(i64::MAX);
        self
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyValue {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
    #[prost(message, optional, tag = "1")]
    pub status: Option<Status>,
    #[prost(bytes = "bytes", tag = "2")]
    pub payload: Bytes,
}

impl Response {
    pub fn ok(payload: impl Into<Bytes>) -> Self {
        Self {
            status: None,
            payload: payload.into(),
        }
    }

    pub fn error(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status: Some(Status {
                code: code as i32,
                message: message.into(),
            }),
            payload: Bytes::new(),
        }
    }

    /// Status code of the response; a missing status means success.
    pub fn code(&self) -> i32 {
        self.status.as_ref().map_or(StatusCode::Ok as i32, |s| s.code)
    }

    pub fn is_ok(&self) -> bool {
        self.code() == StatusCode::Ok as i32
    }
}

/// `google.rpc.Status` without details.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Status {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

/// gRPC status codes used by this stub.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    Unknown = 2,
    InvalidArgument = 3,
    Unimplemented = 12,
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn header_is_ten_bytes_big_endian() {
        let mut buf = BytesMut::new();
        let message = TtrpcMessage {
            stream_id: 3,
            kind: MessageType::Response,
            flags: 0,
            payload: Bytes::from_static(b"ok"),
        };
        TtrpcCodec.encode(message, &mut buf).expect("encode");

        assert_eq!(&buf[..], &[0, 0, 0, 2, 0, 0, 0, 3, 2, 0, b'o', b'k'][..]);
    }

    #[test]
    fn decode_across_partial_reads() {
        let request = Request::new("svc", "Method", &nri_api::Empty {});
        let mut encoded = BytesMut::new();
        TtrpcCodec
            .encode(TtrpcMessage::request(1, &request), &mut encoded)
            .expect("encode");

        let mut buf = BytesMut::new();
        let mut codec = TtrpcCodec;
        let (head, tail) = encoded.split_at(4);
        buf.extend_from_slice(head);
        assert!(codec.decode(&mut buf).expect("partial").is_none());
        buf.extend_from_slice(tail);

        let message = codec.decode(&mut buf).expect("decode").expect("message");
        assert_eq!(message.kind, MessageType::Request);
        let decoded = Request::decode(message.payload).expect("request");
        assert_eq!(decoded.service, "svc");
        assert_eq!(decoded.method, "Method");
    }

    #[test]
    fn decode_rejects_unknown_message_type() {
        let mut buf = BytesMut::from(&[0, 0, 0, 0, 0, 0, 0, 1, 9, 0][..]);
        let err = TtrpcCodec.decode(&mut buf).expect_err("should reject");
        assert!(matches!(err, CodecError::UnknownMessageType(9)));
    }

    #[test]
    fn response_without_status_is_ok() {
        assert!(Response::ok(Bytes::new()).is_ok());

        let failed = Response::error(StatusCode::Unimplemented, "nope");
        assert!(!failed.is_ok());
        assert_eq!(failed.code(), 12);
    }

    #[test]
    fn request_timeout_is_in_nanoseconds() {
        let request =
            Request::new("svc", "m", &nri_api::Empty {}).with_timeout(Duration::from_secs(2));
        assert_eq!(request.timeout_nano, 2_000_000_000);
    }
}
