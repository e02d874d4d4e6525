//! Framing for connections that also carry server-initiated messages.
//!
//! ```text
//! 0      4          8                16           17         18       20
//! | PUSH | body len | log id         | frame type | reserved | status |
//! | envelope (bincode) ... |
//! ```
//!
//! Frame type 0 is a request, 1 a response and 2 a push. Pushes always carry
//! log id 0 and are never matched against a pending call.
use std::time::Duration;

use bincode::{Decode, Encode};
use bytes::{Buf, BufMut};

use crate::{
    codec::wire_config,
    message::{Attachments, Message, Push, Request, Response, Status},
};

use super::{
    Decoded, Detection, FrameError, MAX_BODY_LEN, PUSH, Protocol, ProtocolId, check_body_len,
    check_magic, detect_magic,
};

const NAME: &str = "relay_push";
const MAGIC: &[u8; 4] = b"PUSH";
pub(crate) const HEADER_LEN: usize = 20;

const FRAME_REQUEST: u8 = 0;
const FRAME_RESPONSE: u8 = 1;
const FRAME_PUSH: u8 = 2;

#[derive(Debug, Default, Encode, Decode)]
struct Envelope {
    service: String,
    method: String,
    error: Option<String>,
    timeout_ms: Option<u64>,
    attachments: Attachments,
    payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PushProtocol;

impl PushProtocol {
    fn frame(
        frame_type: u8,
        log_id: u64,
        status: Status,
        envelope: &Envelope,
    ) -> Result<Vec<u8>, FrameError> {
        let body = bincode::encode_to_vec(envelope, wire_config())
            .map_err(|e| FrameError::malformed(NAME, e))?;
        if body.len() > MAX_BODY_LEN {
            return Err(FrameError::TooLarge {
                protocol: NAME,
                len: body.len(),
                max: MAX_BODY_LEN,
            });
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
        frame.put_slice(MAGIC);
        frame.put_u32(body.len() as u32);
        frame.put_u64(log_id);
        frame.put_u8(frame_type);
        frame.put_u8(0);
        frame.put_u16(status.into());
        frame.put_slice(&body);
        Ok(frame)
    }
}

impl Protocol for PushProtocol {
    fn id(&self) -> ProtocolId {
        PUSH
    }

    fn name(&self) -> &'static str {
        NAME
    }

    fn detect(&self, prefix: &[u8]) -> Detection {
        detect_magic(prefix, MAGIC)
    }

    fn encode_request(&self, request: &Request) -> Result<Vec<u8>, FrameError> {
        let envelope = Envelope {
            service: request.service.clone(),
            method: request.method.clone(),
            timeout_ms: request.timeout.map(|t| t.as_millis() as u64),
            attachments: request.attachments.clone(),
            payload: request.payload.clone(),
            ..Default::default()
        };
        Self::frame(FRAME_REQUEST, request.log_id, Status::Ok, &envelope)
    }

    fn encode_response(&self, response: &Response) -> Result<Vec<u8>, FrameError> {
        let envelope = Envelope {
            error: response.error.clone(),
            attachments: response.attachments.clone(),
            payload: response.payload.clone(),
            ..Default::default()
        };
        Self::frame(FRAME_RESPONSE, response.log_id, response.status, &envelope)
    }

    fn encode_push(&self, push: &Push) -> Result<Vec<u8>, FrameError> {
        let envelope = Envelope {
            service: push.service.clone(),
            method: push.method.clone(),
            attachments: push.attachments.clone(),
            payload: push.payload.clone(),
            ..Default::default()
        };
        Self::frame(FRAME_PUSH, 0, Status::Ok, &envelope)
    }

    fn decode(&self, buf: &[u8]) -> Result<Decoded, FrameError> {
        if !check_magic(buf, MAGIC, NAME)? || buf.len() < HEADER_LEN {
            return Ok(Decoded::Insufficient);
        }

        let mut header = &buf[MAGIC.len()..HEADER_LEN];
        let body_len = check_body_len(header.get_u32(), NAME)?;
        let log_id = header.get_u64();
        let frame_type = header.get_u8();
        let _reserved = header.get_u8();
        let status = header.get_u16();

        let consumed = HEADER_LEN + body_len;
        if buf.len() < consumed {
            return Ok(Decoded::Insufficient);
        }
        let (envelope, _): (Envelope, _) =
            bincode::decode_from_slice(&buf[HEADER_LEN..consumed], wire_config())
                .map_err(|e| FrameError::malformed(NAME, e))?;

        let message = match frame_type {
            FRAME_REQUEST => Message::Request(Request {
                log_id,
                service: envelope.service,
                method: envelope.method,
                payload: envelope.payload,
                attachments: envelope.attachments,
                protocol: PUSH,
                timeout: envelope.timeout_ms.map(Duration::from_millis),
            }),
            FRAME_RESPONSE => Message::Response(Response {
                log_id,
                status: Status::try_from(status).map_err(|code| {
                    FrameError::malformed(NAME, format!("unknown status {code}"))
                })?,
                payload: envelope.payload,
                error: envelope.error,
                attachments: envelope.attachments,
                protocol: PUSH,
            }),
            FRAME_PUSH => Message::Push(Push {
                service: envelope.service,
                method: envelope.method,
                payload: envelope.payload,
                attachments: envelope.attachments,
            }),
            other => {
                return Err(FrameError::malformed(
                    NAME,
                    format!("unknown frame type {other}"),
                ));
            }
        };

        Ok(Decoded::Frame { message, consumed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::assert_every_split;

    #[test]
    fn push_every_split() {
        let mut push = Push::new("ticker", "Price", b"{\"px\":10}".to_vec());
        push.attachments.insert("seq".into(), "1".into());
        let frame = PushProtocol.encode_push(&push).unwrap();

        assert_eq!(frame[16], FRAME_PUSH);
        assert_eq!(&frame[8..16], &0u64.to_be_bytes());
        assert_every_split(&PushProtocol, &frame, &Message::Push(push));
    }

    #[test]
    fn request_and_response_every_split() {
        let mut request = Request::new("echo", "Echo", b"ping".to_vec());
        request.log_id = 12;
        request.protocol = PUSH;
        let frame = PushProtocol.encode_request(&request).unwrap();
        assert_every_split(&PushProtocol, &frame, &Message::Request(request));

        let mut response = Response::error(12, Status::RateLimited, "slow down");
        response.protocol = PUSH;
        let frame = PushProtocol.encode_response(&response).unwrap();
        assert_every_split(&PushProtocol, &frame, &Message::Response(response));
    }

    #[test]
    fn unknown_frame_type() {
        let mut frame = PushProtocol
            .encode_push(&Push::new("a", "b", Vec::new()))
            .unwrap();
        frame[16] = 7;
        assert!(matches!(
            PushProtocol.decode(&frame),
            Err(FrameError::Malformed { .. })
        ));
    }
}
