//! Dubbo-compatible framing with JSON bodies.
//!
//! ```text
//! 0        2      3        4             12         16
//! | 0xdabb | flag | status | request id  | body len |
//! ```
//!
//! `flag` holds the request (0x80), two-way (0x40) and event (0x20) bits plus
//! the serialization id in the low five bits; only id 6 (JSON) is spoken.
//! Bodies are newline-delimited JSON values.
//!
//! Requests: dubbo version, service path, service version, method, parameter
//! types, zero or more arguments, attachments. Responses with status 20 start
//! with a kind marker followed by a value or an exception; any other status is
//! followed by the error text alone.
//!
//! The request attachments `path`, `interface`, `version` and `timeout` are
//! owned by the framing and are not surfaced to handlers.
use std::time::Duration;

use bytes::{Buf, BufMut};
use serde_json::Value;

use crate::message::{Attachments, Message, Request, Response, Status};

use super::{
    DUBBO, Decoded, Detection, FrameError, MAX_BODY_LEN, Protocol, ProtocolId, check_body_len,
    check_magic, detect_magic,
};

const NAME: &str = "dubbo";
const MAGIC: &[u8; 2] = &[0xda, 0xbb];
pub(crate) const HEADER_LEN: usize = 16;

const FLAG_REQUEST: u8 = 0x80;
const FLAG_TWOWAY: u8 = 0x40;
const FLAG_EVENT: u8 = 0x20;
const SERIALIZATION_MASK: u8 = 0x1f;
const SERIALIZATION_JSON: u8 = 6;

const DUBBO_VERSION: &str = "2.0.2";
const SERVICE_VERSION: &str = "0.0.0";
const OBJECT_TYPE: &str = "Ljava/lang/Object;";
const RESERVED_KEYS: [&str; 4] = ["path", "interface", "version", "timeout"];

const STATUS_OK: u8 = 20;
const STATUS_BAD_REQUEST: u8 = 40;
const STATUS_SERVICE_NOT_FOUND: u8 = 60;
const STATUS_SERVICE_ERROR: u8 = 70;
const STATUS_SERVER_ERROR: u8 = 80;
const STATUS_THREADPOOL_EXHAUSTED: u8 = 100;

const RESPONSE_WITH_EXCEPTION: u64 = 0;
const RESPONSE_VALUE: u64 = 1;
const RESPONSE_NULL_VALUE: u64 = 2;
const RESPONSE_WITH_EXCEPTION_WITH_ATTACHMENTS: u64 = 3;
const RESPONSE_VALUE_WITH_ATTACHMENTS: u64 = 4;
const RESPONSE_NULL_VALUE_WITH_ATTACHMENTS: u64 = 5;

#[derive(Debug, Clone, Copy, Default)]
pub struct DubboProtocol;

fn status_code(status: Status) -> u8 {
    match status {
        Status::Ok | Status::ApplicationError => STATUS_OK,
        Status::BadRequest => STATUS_BAD_REQUEST,
        Status::ServiceNotFound => STATUS_SERVICE_NOT_FOUND,
        Status::MethodNotFound => STATUS_SERVICE_ERROR,
        Status::ServerError => STATUS_SERVER_ERROR,
        Status::RateLimited => STATUS_THREADPOOL_EXHAUSTED,
    }
}

fn status_from_code(code: u8) -> Result<Status, FrameError> {
    match code {
        STATUS_OK => Ok(Status::Ok),
        STATUS_BAD_REQUEST => Ok(Status::BadRequest),
        STATUS_SERVICE_NOT_FOUND => Ok(Status::ServiceNotFound),
        STATUS_SERVICE_ERROR => Ok(Status::MethodNotFound),
        STATUS_SERVER_ERROR => Ok(Status::ServerError),
        STATUS_THREADPOOL_EXHAUSTED => Ok(Status::RateLimited),
        other => Err(FrameError::malformed(NAME, format!("unknown status {other}"))),
    }
}

fn payload_value(payload: &[u8]) -> Result<Value, FrameError> {
    serde_json::from_slice(payload).map_err(|_| FrameError::Unsupported {
        protocol: NAME,
        what: "a payload that is not a JSON document".into(),
    })
}

fn to_json(value: &Value) -> Result<Vec<u8>, FrameError> {
    serde_json::to_vec(value).map_err(|e| FrameError::malformed(NAME, e))
}

fn attachments_value(attachments: &Attachments) -> Value {
    Value::Object(
        attachments
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

fn attachments_from(value: Option<Value>) -> Result<Attachments, FrameError> {
    match value {
        None | Some(Value::Null) => Ok(Attachments::new()),
        Some(Value::Object(map)) => Ok(map
            .into_iter()
            .map(|(k, v)| match v {
                Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect()),
        Some(other) => Err(FrameError::malformed(
            NAME,
            format!("attachments must be an object, got {other}"),
        )),
    }
}

fn text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn expect_str(value: Option<Value>, field: &str) -> Result<String, FrameError> {
    match value {
        Some(Value::String(s)) => Ok(s),
        _ => Err(FrameError::malformed(NAME, format!("missing {field}"))),
    }
}

impl DubboProtocol {
    fn frame(flag: u8, status: u8, id: u64, values: &[Value]) -> Result<Vec<u8>, FrameError> {
        let mut body = Vec::new();
        for value in values {
            serde_json::to_writer(&mut body, value).map_err(|e| FrameError::malformed(NAME, e))?;
            body.put_u8(b'\n');
        }
        if body.len() > MAX_BODY_LEN {
            return Err(FrameError::TooLarge {
                protocol: NAME,
                len: body.len(),
                max: MAX_BODY_LEN,
            });
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
        frame.put_slice(MAGIC);
        frame.put_u8(flag | SERIALIZATION_JSON);
        frame.put_u8(status);
        frame.put_u64(id);
        frame.put_u32(body.len() as u32);
        frame.put_slice(&body);
        Ok(frame)
    }

    fn decode_request(id: u64, values: Vec<Value>) -> Result<Request, FrameError> {
        let mut values = values.into_iter();
        let _dubbo_version = expect_str(values.next(), "dubbo version")?;
        let service = expect_str(values.next(), "service path")?;
        let _version = expect_str(values.next(), "service version")?;
        let method = expect_str(values.next(), "method name")?;
        let param_types = expect_str(values.next(), "parameter types")?;

        let mut rest: Vec<Value> = values.collect();
        let attachments = if param_types.is_empty() && rest.is_empty() {
            None
        } else {
            rest.pop()
        };
        let mut attachments = attachments_from(attachments)?;

        let payload = match rest.len() {
            0 => Vec::new(),
            1 => to_json(&rest[0])?,
            _ => to_json(&Value::Array(rest))?,
        };

        let timeout = attachments
            .get("timeout")
            .and_then(|t| t.parse::<u64>().ok())
            .map(Duration::from_millis);
        for key in RESERVED_KEYS {
            attachments.remove(key);
        }

        Ok(Request {
            log_id: id,
            service,
            method,
            payload,
            attachments,
            protocol: DUBBO,
            timeout,
        })
    }

    fn decode_response(id: u64, status: u8, values: Vec<Value>) -> Result<Response, FrameError> {
        let status = status_from_code(status)?;
        let mut values = values.into_iter();
        let mut response = Response {
            log_id: id,
            status,
            protocol: DUBBO,
            ..Default::default()
        };

        if !status.is_ok() {
            response.error = values.next().map(text);
            return Ok(response);
        }

        let kind = values
            .next()
            .and_then(|v| v.as_u64())
            .ok_or_else(|| FrameError::malformed(NAME, "missing response kind"))?;
        match kind {
            RESPONSE_VALUE | RESPONSE_VALUE_WITH_ATTACHMENTS => {
                let value = values
                    .next()
                    .ok_or_else(|| FrameError::malformed(NAME, "missing response value"))?;
                response.payload = to_json(&value)?;
            }
            RESPONSE_WITH_EXCEPTION | RESPONSE_WITH_EXCEPTION_WITH_ATTACHMENTS => {
                response.status = Status::ApplicationError;
                response.error = Some(values.next().map(text).unwrap_or_default());
            }
            RESPONSE_NULL_VALUE | RESPONSE_NULL_VALUE_WITH_ATTACHMENTS => {}
            other => {
                return Err(FrameError::malformed(
                    NAME,
                    format!("unknown response kind {other}"),
                ));
            }
        }
        if kind >= RESPONSE_WITH_EXCEPTION_WITH_ATTACHMENTS {
            response.attachments = attachments_from(values.next())?;
        }
        Ok(response)
    }
}

impl Protocol for DubboProtocol {
    fn id(&self) -> ProtocolId {
        DUBBO
    }

    fn name(&self) -> &'static str {
        NAME
    }

    fn detect(&self, prefix: &[u8]) -> Detection {
        detect_magic(prefix, MAGIC)
    }

    fn encode_request(&self, request: &Request) -> Result<Vec<u8>, FrameError> {
        let mut attachments = attachments_value(&request.attachments);
        if let Value::Object(map) = &mut attachments {
            map.insert("path".into(), Value::String(request.service.clone()));
            map.insert("interface".into(), Value::String(request.service.clone()));
            map.insert("version".into(), Value::String(SERVICE_VERSION.into()));
            if let Some(timeout) = request.timeout {
                map.insert("timeout".into(), Value::String(timeout.as_millis().to_string()));
            }
        }

        let mut values = vec![
            Value::String(DUBBO_VERSION.into()),
            Value::String(request.service.clone()),
            Value::String(SERVICE_VERSION.into()),
            Value::String(request.method.clone()),
        ];
        if request.payload.is_empty() {
            values.push(Value::String(String::new()));
        } else {
            values.push(Value::String(OBJECT_TYPE.into()));
            values.push(payload_value(&request.payload)?);
        }
        values.push(attachments);

        Self::frame(FLAG_REQUEST | FLAG_TWOWAY, 0, request.log_id, &values)
    }

    fn encode_response(&self, response: &Response) -> Result<Vec<u8>, FrameError> {
        let values = match response.status {
            Status::Ok if response.payload.is_empty() => vec![
                Value::from(RESPONSE_NULL_VALUE_WITH_ATTACHMENTS),
                attachments_value(&response.attachments),
            ],
            Status::Ok => vec![
                Value::from(RESPONSE_VALUE_WITH_ATTACHMENTS),
                payload_value(&response.payload)?,
                attachments_value(&response.attachments),
            ],
            Status::ApplicationError => vec![
                Value::from(RESPONSE_WITH_EXCEPTION_WITH_ATTACHMENTS),
                Value::String(response.error.clone().unwrap_or_default()),
                attachments_value(&response.attachments),
            ],
            _ => vec![Value::String(response.error.clone().unwrap_or_default())],
        };
        Self::frame(0, status_code(response.status), response.log_id, &values)
    }

    fn decode(&self, buf: &[u8]) -> Result<Decoded, FrameError> {
        if !check_magic(buf, MAGIC, NAME)? || buf.len() < HEADER_LEN {
            return Ok(Decoded::Insufficient);
        }

        let mut header = &buf[MAGIC.len()..HEADER_LEN];
        let flag = header.get_u8();
        let status = header.get_u8();
        let id = header.get_u64();
        let body_len = check_body_len(header.get_u32(), NAME)?;

        let consumed = HEADER_LEN + body_len;
        if buf.len() < consumed {
            return Ok(Decoded::Insufficient);
        }
        if flag & FLAG_EVENT != 0 {
            return Ok(Decoded::Skipped { consumed });
        }
        let serialization = flag & SERIALIZATION_MASK;
        if serialization != SERIALIZATION_JSON {
            return Err(FrameError::Unsupported {
                protocol: NAME,
                what: format!("serialization id {serialization}"),
            });
        }

        let values = serde_json::Deserializer::from_slice(&buf[HEADER_LEN..consumed])
            .into_iter::<Value>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| FrameError::malformed(NAME, e))?;

        let message = if flag & FLAG_REQUEST != 0 {
            Message::Request(Self::decode_request(id, values)?)
        } else {
            Message::Response(Self::decode_response(id, status, values)?)
        };
        Ok(Decoded::Frame { message, consumed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::assert_every_split;

    fn request() -> Request {
        let mut request = Request::new("org.relay.Echo", "echo", br#""hello world""#.to_vec())
            .with_attachment("trace-id", "abc")
            .with_timeout(Duration::from_millis(800));
        request.log_id = 4242;
        request.protocol = DUBBO;
        request
    }

    fn heartbeat(id: u64) -> Vec<u8> {
        DubboProtocol::frame(FLAG_REQUEST | FLAG_TWOWAY | FLAG_EVENT, 0, id, &[Value::Null]).unwrap()
    }

    #[test]
    fn request_body_lines() {
        let frame = DubboProtocol.encode_request(&request()).unwrap();
        assert_eq!(&frame[..2], MAGIC);
        assert_eq!(frame[2], FLAG_REQUEST | FLAG_TWOWAY | SERIALIZATION_JSON);

        let body = std::str::from_utf8(&frame[HEADER_LEN..]).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines[0], r#""2.0.2""#);
        assert_eq!(lines[1], r#""org.relay.Echo""#);
        assert_eq!(lines[3], r#""echo""#);
        assert_eq!(lines[5], r#""hello world""#);
        assert!(lines[6].contains(r#""timeout":"800""#));
    }

    #[test]
    fn request_every_split() {
        let request = request();
        let frame = DubboProtocol.encode_request(&request).unwrap();
        assert_every_split(&DubboProtocol, &frame, &Message::Request(request));
    }

    #[test]
    fn request_without_arguments() {
        let mut request = request();
        request.payload.clear();
        let frame = DubboProtocol.encode_request(&request).unwrap();
        assert_every_split(&DubboProtocol, &frame, &Message::Request(request));
    }

    #[test]
    fn responses_every_split() {
        let mut ok = Response::ok(1, br#"{"n":1}"#.to_vec());
        ok.attachments.insert("k".into(), "v".into());
        let mut empty = Response::ok(2, Vec::new());
        let mut app = Response::error(3, Status::ApplicationError, "boom");
        let mut limited = Response::error(4, Status::RateLimited, "too many calls");

        for response in [&mut ok, &mut empty, &mut app, &mut limited] {
            response.protocol = DUBBO;
            let frame = DubboProtocol.encode_response(response).unwrap();
            assert_every_split(&DubboProtocol, &frame, &Message::Response(response.clone()));
        }
    }

    #[test]
    fn rejects_non_json_payloads() {
        let mut request = request();
        request.payload = b"\x01\x02".to_vec();
        assert!(matches!(
            DubboProtocol.encode_request(&request),
            Err(FrameError::Unsupported { .. })
        ));
    }

    #[test]
    fn heartbeats_are_skipped() {
        let frame = heartbeat(9);
        assert_eq!(
            DubboProtocol.decode(&frame).unwrap(),
            Decoded::Skipped {
                consumed: frame.len()
            }
        );
    }

    #[test]
    fn other_serializations_are_unsupported() {
        let mut frame = DubboProtocol.encode_request(&request()).unwrap();
        frame[2] = FLAG_REQUEST | FLAG_TWOWAY | 2;
        assert!(matches!(
            DubboProtocol.decode(&frame),
            Err(FrameError::Unsupported { .. })
        ));
    }
}
