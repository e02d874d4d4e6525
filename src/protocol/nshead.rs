//! Legacy nshead framing.
//!
//! A 36-byte little-endian header precedes every body:
//!
//! ```text
//! 0    2         4        8               24       28         32         36
//! | id | version | log id | provider [16] | magic  | reserved | body len |
//! ```
//!
//! The header only has room for the low 32 bits of the correlation id, so both
//! body flavours repeat the full 64-bit id. Bit 0 of `reserved` marks responses.
//! The JSON flavour's body is a `serde_json` document (and therefore starts with
//! `{`); the protobuf flavour's body is a `prost` message.
use std::{collections::BTreeMap, time::Duration};

use bytes::{Buf, BufMut};
use prost::Message as ProstMessage;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::message::{Attachments, Message, Request, Response, Status};

use super::{
    Decoded, Detection, FrameError, MAX_BODY_LEN, NSHEAD_JSON, NSHEAD_PROTO, Protocol,
    ProtocolId, check_body_len, check_magic,
};

pub(crate) const HEADER_LEN: usize = 36;
const MAGIC: u32 = 0xfb70_9394;
const MAGIC_OFFSET: usize = 24;
const PROVIDER: &[u8] = b"relay";
const PROVIDER_SIZE: usize = 16;
const VERSION: u16 = 1;
const RESPONSE_BIT: u32 = 0x1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Body {
    Json,
    Protobuf,
}

#[derive(Debug, Clone, Copy)]
pub struct NsheadProtocol {
    body: Body,
}

impl NsheadProtocol {
    pub fn json() -> Self {
        Self { body: Body::Json }
    }

    pub fn protobuf() -> Self {
        Self {
            body: Body::Protobuf,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonBody {
    log_id: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    service: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    method: String,
    #[serde(default)]
    status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    attachments: Attachments,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    params: Option<Value>,
}

/// Distinguishes an explicit `null` from an absent field.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

#[derive(Clone, PartialEq, prost::Message)]
struct ProtoBody {
    #[prost(uint64, tag = "1")]
    log_id: u64,
    #[prost(string, tag = "2")]
    service: String,
    #[prost(string, tag = "3")]
    method: String,
    #[prost(uint32, tag = "4")]
    status: u32,
    #[prost(string, optional, tag = "5")]
    error: Option<String>,
    #[prost(uint64, optional, tag = "6")]
    timeout_ms: Option<u64>,
    #[prost(btree_map = "string, string", tag = "7")]
    attachments: BTreeMap<String, String>,
    #[prost(bytes = "vec", tag = "8")]
    payload: Vec<u8>,
}

/// Everything a body carries, independent of its encoding.
struct Fields {
    log_id: u64,
    service: String,
    method: String,
    status: u16,
    error: Option<String>,
    timeout_ms: Option<u64>,
    attachments: Attachments,
    payload: Vec<u8>,
}

impl NsheadProtocol {
    fn body_name(&self) -> &'static str {
        match self.body {
            Body::Json => "nshead_json",
            Body::Protobuf => "nshead_proto",
        }
    }

    fn encode_body(&self, fields: Fields) -> Result<Vec<u8>, FrameError> {
        match self.body {
            Body::Json => {
                let params = if fields.payload.is_empty() {
                    None
                } else {
                    Some(serde_json::from_slice::<Value>(&fields.payload).map_err(|_| {
                        FrameError::Unsupported {
                            protocol: self.body_name(),
                            what: "a payload that is not a JSON document".into(),
                        }
                    })?)
                };
                let body = JsonBody {
                    log_id: fields.log_id,
                    service: fields.service,
                    method: fields.method,
                    status: fields.status,
                    error: fields.error,
                    timeout_ms: fields.timeout_ms,
                    attachments: fields.attachments,
                    params,
                };
                serde_json::to_vec(&body).map_err(|e| FrameError::malformed(self.body_name(), e))
            }
            Body::Protobuf => Ok(ProtoBody {
                log_id: fields.log_id,
                service: fields.service,
                method: fields.method,
                status: fields.status.into(),
                error: fields.error,
                timeout_ms: fields.timeout_ms,
                attachments: fields.attachments,
                payload: fields.payload,
            }
            .encode_to_vec()),
        }
    }

    fn decode_body(&self, body: &[u8]) -> Result<Fields, FrameError> {
        match self.body {
            Body::Json => {
                let body: JsonBody = serde_json::from_slice(body)
                    .map_err(|e| FrameError::malformed(self.body_name(), e))?;
                let payload = match body.params {
                    Some(params) => serde_json::to_vec(&params)
                        .map_err(|e| FrameError::malformed(self.body_name(), e))?,
                    None => Vec::new(),
                };
                Ok(Fields {
                    log_id: body.log_id,
                    service: body.service,
                    method: body.method,
                    status: body.status,
                    error: body.error,
                    timeout_ms: body.timeout_ms,
                    attachments: body.attachments,
                    payload,
                })
            }
            Body::Protobuf => {
                let body = ProtoBody::decode(body)
                    .map_err(|e| FrameError::malformed(self.body_name(), e))?;
                let status = u16::try_from(body.status).map_err(|_| {
                    FrameError::malformed(self.body_name(), format!("status {}", body.status))
                })?;
                Ok(Fields {
                    log_id: body.log_id,
                    service: body.service,
                    method: body.method,
                    status,
                    error: body.error,
                    timeout_ms: body.timeout_ms,
                    attachments: body.attachments,
                    payload: body.payload,
                })
            }
        }
    }

    fn frame(&self, response: bool, fields: Fields) -> Result<Vec<u8>, FrameError> {
        let log_id = fields.log_id;
        let body = self.encode_body(fields)?;
        if body.len() > MAX_BODY_LEN {
            return Err(FrameError::TooLarge {
                protocol: self.body_name(),
                len: body.len(),
                max: MAX_BODY_LEN,
            });
        }

        let mut provider = [0u8; PROVIDER_SIZE];
        provider[..PROVIDER.len()].clone_from_slice(PROVIDER);

        let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
        frame.put_u16_le(0);
        frame.put_u16_le(VERSION);
        frame.put_u32_le(log_id as u32);
        frame.put_slice(&provider);
        frame.put_u32_le(MAGIC);
        frame.put_u32_le(if response { RESPONSE_BIT } else { 0 });
        frame.put_u32_le(body.len() as u32);
        frame.put_slice(&body);
        Ok(frame)
    }
}

impl Protocol for NsheadProtocol {
    fn id(&self) -> ProtocolId {
        match self.body {
            Body::Json => NSHEAD_JSON,
            Body::Protobuf => NSHEAD_PROTO,
        }
    }

    fn name(&self) -> &'static str {
        self.body_name()
    }

    fn detect(&self, prefix: &[u8]) -> Detection {
        if prefix.len() > MAGIC_OFFSET
            && check_magic(&prefix[MAGIC_OFFSET..], &MAGIC.to_le_bytes(), self.name()).is_err()
        {
            return Detection::NoMatch;
        }
        if prefix.len() < HEADER_LEN {
            return Detection::NeedMore;
        }

        let body_len = (&prefix[HEADER_LEN - 4..HEADER_LEN]).get_u32_le();
        let first = match prefix.get(HEADER_LEN) {
            Some(byte) => Some(*byte),
            None if body_len == 0 => None,
            None => return Detection::NeedMore,
        };
        let is_json = first == Some(b'{');
        match (self.body, is_json) {
            (Body::Json, true) | (Body::Protobuf, false) => Detection::Match(()),
            _ => Detection::NoMatch,
        }
    }

    fn encode_request(&self, request: &Request) -> Result<Vec<u8>, FrameError> {
        self.frame(
            false,
            Fields {
                log_id: request.log_id,
                service: request.service.clone(),
                method: request.method.clone(),
                status: Status::Ok.into(),
                error: None,
                timeout_ms: request.timeout.map(|t| t.as_millis() as u64),
                attachments: request.attachments.clone(),
                payload: request.payload.clone(),
            },
        )
    }

    fn encode_response(&self, response: &Response) -> Result<Vec<u8>, FrameError> {
        self.frame(
            true,
            Fields {
                log_id: response.log_id,
                service: String::new(),
                method: String::new(),
                status: response.status.into(),
                error: response.error.clone(),
                timeout_ms: None,
                attachments: response.attachments.clone(),
                payload: response.payload.clone(),
            },
        )
    }

    fn decode(&self, buf: &[u8]) -> Result<Decoded, FrameError> {
        if buf.len() > MAGIC_OFFSET
            && !check_magic(&buf[MAGIC_OFFSET..], &MAGIC.to_le_bytes(), self.name())?
        {
            return Ok(Decoded::Insufficient);
        }
        if buf.len() < HEADER_LEN {
            return Ok(Decoded::Insufficient);
        }

        let mut header = &buf[MAGIC_OFFSET + 4..HEADER_LEN];
        let reserved = header.get_u32_le();
        let body_len = check_body_len(header.get_u32_le(), self.name())?;
        let consumed = HEADER_LEN + body_len;
        if buf.len() < consumed {
            return Ok(Decoded::Insufficient);
        }

        let fields = self.decode_body(&buf[HEADER_LEN..consumed])?;
        let message = if reserved & RESPONSE_BIT != 0 {
            let status = Status::try_from(fields.status).map_err(|code| {
                FrameError::malformed(self.name(), format!("unknown status {code}"))
            })?;
            Message::Response(Response {
                log_id: fields.log_id,
                status,
                payload: fields.payload,
                error: fields.error,
                attachments: fields.attachments,
                protocol: self.id(),
            })
        } else {
            Message::Request(Request {
                log_id: fields.log_id,
                service: fields.service,
                method: fields.method,
                payload: fields.payload,
                attachments: fields.attachments,
                protocol: self.id(),
                timeout: fields.timeout_ms.map(Duration::from_millis),
            })
        };

        Ok(Decoded::Frame { message, consumed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::assert_every_split;

    fn request(protocol: ProtocolId) -> Request {
        let mut request = Request::new("echo", "Echo", br#""hello world""#.to_vec())
            .with_attachment("caller", "tests");
        request.log_id = (7u64 << 32) | 5;
        request.protocol = protocol;
        request
    }

    #[test]
    fn header_layout() {
        let frame = NsheadProtocol::json()
            .encode_request(&request(NSHEAD_JSON))
            .unwrap();
        assert_eq!(&frame[2..4], &VERSION.to_le_bytes());
        assert_eq!(&frame[4..8], &5u32.to_le_bytes());
        assert_eq!(&frame[8..13], b"relay");
        assert_eq!(&frame[24..28], &MAGIC.to_le_bytes());
        assert_eq!(frame[HEADER_LEN], b'{');
    }

    #[test]
    fn json_request_every_split() {
        let request = request(NSHEAD_JSON);
        let codec = NsheadProtocol::json();
        let frame = codec.encode_request(&request).unwrap();
        assert_every_split(&codec, &frame, &Message::Request(request));
    }

    #[test]
    fn protobuf_response_every_split() {
        let mut response = Response::ok(u64::MAX - 1, b"\x00\x01binary".to_vec());
        response.protocol = NSHEAD_PROTO;
        let codec = NsheadProtocol::protobuf();
        let frame = codec.encode_response(&response).unwrap();
        assert_every_split(&codec, &frame, &Message::Response(response));
    }

    #[test]
    fn json_null_params_survive() {
        let mut request = request(NSHEAD_JSON);
        request.payload = b"null".to_vec();
        let codec = NsheadProtocol::json();
        let frame = codec.encode_request(&request).unwrap();
        assert_every_split(&codec, &frame, &Message::Request(request));
    }

    #[test]
    fn json_flavour_rejects_binary_payloads() {
        let mut request = request(NSHEAD_JSON);
        request.payload = vec![0xff, 0x00];
        assert!(matches!(
            NsheadProtocol::json().encode_request(&request),
            Err(FrameError::Unsupported { .. })
        ));
    }

    #[test]
    fn flavours_detect_their_own_bodies() {
        let json = NsheadProtocol::json();
        let proto = NsheadProtocol::protobuf();

        let frame = json.encode_request(&request(NSHEAD_JSON)).unwrap();
        assert_eq!(json.detect(&frame), Detection::Match(()));
        assert_eq!(proto.detect(&frame), Detection::NoMatch);

        let frame = proto.encode_request(&request(NSHEAD_PROTO)).unwrap();
        assert_eq!(proto.detect(&frame), Detection::Match(()));
        assert_eq!(json.detect(&frame), Detection::NoMatch);

        assert_eq!(json.detect(&frame[..20]), Detection::NeedMore);
    }

    #[test]
    fn bad_magic() {
        let mut frame = NsheadProtocol::protobuf()
            .encode_request(&request(NSHEAD_PROTO))
            .unwrap();
        frame[25] ^= 0xff;
        assert!(matches!(
            NsheadProtocol::protobuf().decode(&frame),
            Err(FrameError::BadMagic { .. })
        ));
        assert!(matches!(
            NsheadProtocol::protobuf().decode(&frame[..26]),
            Err(FrameError::BadMagic { .. })
        ));
    }
}
