//! Native framing.
//!
//! ```text
//! 0      4          8                16     17      18       20         24
//! | RLAY | body len | log id         | kind | flags | status | meta len |
//! | meta (bincode) ... | payload ... |
//! ```
//!
//! All header integers are big-endian. `kind` is 0 for requests and 1 for
//! responses; `status` is only meaningful for responses.
use std::time::Duration;

use bincode::{Decode, Encode};
use bytes::{Buf, BufMut};

use crate::{
    codec::wire_config,
    message::{Attachments, Message, Request, Response, Status},
};

use super::{
    Decoded, Detection, FrameError, MAX_BODY_LEN, Protocol, ProtocolId, STANDARD, check_body_len,
    check_magic, detect_magic,
};

const NAME: &str = "relay_std";
const MAGIC: &[u8; 4] = b"RLAY";
pub(crate) const HEADER_LEN: usize = 24;

const KIND_REQUEST: u8 = 0;
const KIND_RESPONSE: u8 = 1;

#[derive(Debug, Encode, Decode)]
struct RequestMeta {
    service: String,
    method: String,
    timeout_ms: Option<u64>,
    attachments: Attachments,
}

#[derive(Debug, Encode, Decode)]
struct ResponseMeta {
    error: Option<String>,
    attachments: Attachments,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StandardProtocol;

impl StandardProtocol {
    fn frame(
        kind: u8,
        log_id: u64,
        status: Status,
        meta: &impl Encode,
        payload: &[u8],
    ) -> Result<Vec<u8>, FrameError> {
        let meta = bincode::encode_to_vec(meta, wire_config())
            .map_err(|e| FrameError::malformed(NAME, e))?;
        let body_len = meta.len() + payload.len();
        if body_len > MAX_BODY_LEN {
            return Err(FrameError::TooLarge {
                protocol: NAME,
                len: body_len,
                max: MAX_BODY_LEN,
            });
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + body_len);
        frame.put_slice(MAGIC);
        frame.put_u32(body_len as u32);
        frame.put_u64(log_id);
        frame.put_u8(kind);
        frame.put_u8(0);
        frame.put_u16(status.into());
        frame.put_u32(meta.len() as u32);
        frame.put_slice(&meta);
        frame.put_slice(payload);
        Ok(frame)
    }
}

impl Protocol for StandardProtocol {
    fn id(&self) -> ProtocolId {
        STANDARD
    }

    fn name(&self) -> &'static str {
        NAME
    }

    fn detect(&self, prefix: &[u8]) -> Detection {
        detect_magic(prefix, MAGIC)
    }

    fn encode_request(&self, request: &Request) -> Result<Vec<u8>, FrameError> {
        let meta = RequestMeta {
            service: request.service.clone(),
            method: request.method.clone(),
            timeout_ms: request.timeout.map(|t| t.as_millis() as u64),
            attachments: request.attachments.clone(),
        };
        Self::frame(
            KIND_REQUEST,
            request.log_id,
            Status::Ok,
            &meta,
            &request.payload,
        )
    }

    fn encode_response(&self, response: &Response) -> Result<Vec<u8>, FrameError> {
        let meta = ResponseMeta {
            error: response.error.clone(),
            attachments: response.attachments.clone(),
        };
        Self::frame(
            KIND_RESPONSE,
            response.log_id,
            response.status,
            &meta,
            &response.payload,
        )
    }

    fn decode(&self, buf: &[u8]) -> Result<Decoded, FrameError> {
        if !check_magic(buf, MAGIC, NAME)? || buf.len() < HEADER_LEN {
            return Ok(Decoded::Insufficient);
        }

        let mut header = &buf[MAGIC.len()..HEADER_LEN];
        let body_len = check_body_len(header.get_u32(), NAME)?;
        let log_id = header.get_u64();
        let kind = header.get_u8();
        let _flags = header.get_u8();
        let status = header.get_u16();
        let meta_len = header.get_u32() as usize;
        if meta_len > body_len {
            return Err(FrameError::malformed(
                NAME,
                format!("meta length {meta_len} exceeds body length {body_len}"),
            ));
        }

        let consumed = HEADER_LEN + body_len;
        if buf.len() < consumed {
            return Ok(Decoded::Insufficient);
        }
        let (meta, payload) = buf[HEADER_LEN..consumed].split_at(meta_len);

        let message = match kind {
            KIND_REQUEST => {
                let (meta, _): (RequestMeta, _) = bincode::decode_from_slice(meta, wire_config())
                    .map_err(|e| FrameError::malformed(NAME, e))?;
                Message::Request(Request {
                    log_id,
                    service: meta.service,
                    method: meta.method,
                    payload: payload.to_vec(),
                    attachments: meta.attachments,
                    protocol: STANDARD,
                    timeout: meta.timeout_ms.map(Duration::from_millis),
                })
            }
            KIND_RESPONSE => {
                let (meta, _): (ResponseMeta, _) = bincode::decode_from_slice(meta, wire_config())
                    .map_err(|e| FrameError::malformed(NAME, e))?;
                let status = Status::try_from(status)
                    .map_err(|code| FrameError::malformed(NAME, format!("unknown status {code}")))?;
                Message::Response(Response {
                    log_id,
                    status,
                    payload: payload.to_vec(),
                    error: meta.error,
                    attachments: meta.attachments,
                    protocol: STANDARD,
                })
            }
            other => {
                return Err(FrameError::malformed(
                    NAME,
                    format!("unknown frame kind {other}"),
                ));
            }
        };

        Ok(Decoded::Frame { message, consumed })
    }
}
