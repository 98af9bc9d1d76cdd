//! Client-facing ingress requests and egress events.

use bytes::{BufMut, Bytes, BytesMut};

use super::{put_bytes, put_string, CodecError, Reader};
use crate::session::EventCode;

#[derive(Clone, Debug, PartialEq)]
pub enum IngressRequest {
    SessionConnect {
        correlation_id: i64,
        response_stream_id: i32,
        version: i32,
        response_channel: String,
        encoded_credentials: Bytes,
    },
    SessionClose {
        leadership_term_id: i64,
        cluster_session_id: i64,
    },
    Message {
        leadership_term_id: i64,
        cluster_session_id: i64,
        payload: Bytes,
    },
    SessionKeepAlive {
        leadership_term_id: i64,
        cluster_session_id: i64,
    },
    ChallengeResponse {
        correlation_id: i64,
        cluster_session_id: i64,
        encoded_credentials: Bytes,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum EgressEvent {
    SessionEvent {
        cluster_session_id: i64,
        correlation_id: i64,
        leadership_term_id: i64,
        leader_member_id: i32,
        code: EventCode,
        detail: String,
    },
    Challenge {
        correlation_id: i64,
        cluster_session_id: i64,
        encoded_challenge: Bytes,
    },
    NewLeader {
        cluster_session_id: i64,
        leadership_term_id: i64,
        leader_member_id: i32,
        ingress_endpoints: String,
    },
}

mod tag {
    pub const SESSION_CONNECT: u32 = 1;
    pub const SESSION_CLOSE: u32 = 2;
    pub const MESSAGE: u32 = 3;
    pub const SESSION_KEEP_ALIVE: u32 = 4;
    pub const CHALLENGE_RESPONSE: u32 = 5;

    pub const SESSION_EVENT: u32 = 11;
    pub const CHALLENGE: u32 = 12;
    pub const NEW_LEADER: u32 = 13;
}

impl IngressRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            IngressRequest::SessionConnect {
                correlation_id,
                response_stream_id,
                version,
                response_channel,
                encoded_credentials,
            } => {
                buf.put_u32_le(tag::SESSION_CONNECT);
                buf.put_i64_le(*correlation_id);
                buf.put_i32_le(*response_stream_id);
                buf.put_i32_le(*version);
                put_string(&mut buf, response_channel);
                put_bytes(&mut buf, encoded_credentials);
            }
            IngressRequest::SessionClose {
                leadership_term_id,
                cluster_session_id,
            } => {
                buf.put_u32_le(tag::SESSION_CLOSE);
                buf.put_i64_le(*leadership_term_id);
                buf.put_i64_le(*cluster_session_id);
            }
            IngressRequest::Message {
                leadership_term_id,
                cluster_session_id,
                payload,
            } => {
                buf.put_u32_le(tag::MESSAGE);
                buf.put_i64_le(*leadership_term_id);
                buf.put_i64_le(*cluster_session_id);
                put_bytes(&mut buf, payload);
            }
            IngressRequest::SessionKeepAlive {
                leadership_term_id,
                cluster_session_id,
            } => {
                buf.put_u32_le(tag::SESSION_KEEP_ALIVE);
                buf.put_i64_le(*leadership_term_id);
                buf.put_i64_le(*cluster_session_id);
            }
            IngressRequest::ChallengeResponse {
                correlation_id,
                cluster_session_id,
                encoded_credentials,
            } => {
                buf.put_u32_le(tag::CHALLENGE_RESPONSE);
                buf.put_i64_le(*correlation_id);
                buf.put_i64_le(*cluster_session_id);
                put_bytes(&mut buf, encoded_credentials);
            }
        }
        buf.freeze()
    }

    pub fn decode(frame: &[u8]) -> Result<IngressRequest, CodecError> {
        let mut reader = Reader::new(frame);
        match reader.u32()? {
            tag::SESSION_CONNECT => Ok(IngressRequest::SessionConnect {
                correlation_id: reader.i64()?,
                response_stream_id: reader.i32()?,
                version: reader.i32()?,
                response_channel: reader.string()?,
                encoded_credentials: reader.bytes()?,
            }),
            tag::SESSION_CLOSE => Ok(IngressRequest::SessionClose {
                leadership_term_id: reader.i64()?,
                cluster_session_id: reader.i64()?,
            }),
            tag::MESSAGE => Ok(IngressRequest::Message {
                leadership_term_id: reader.i64()?,
                cluster_session_id: reader.i64()?,
                payload: reader.bytes()?,
            }),
            tag::SESSION_KEEP_ALIVE => Ok(IngressRequest::SessionKeepAlive {
                leadership_term_id: reader.i64()?,
                cluster_session_id: reader.i64()?,
            }),
            tag::CHALLENGE_RESPONSE => Ok(IngressRequest::ChallengeResponse {
                correlation_id: reader.i64()?,
                cluster_session_id: reader.i64()?,
                encoded_credentials: reader.bytes()?,
            }),
            other => Err(CodecError::UnknownType(other)),
        }
    }
}

impl EgressEvent {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            EgressEvent::SessionEvent {
                cluster_session_id,
                correlation_id,
                leadership_term_id,
                leader_member_id,
                code,
                detail,
            } => {
                buf.put_u32_le(tag::SESSION_EVENT);
                buf.put_i64_le(*cluster_session_id);
                buf.put_i64_le(*correlation_id);
                buf.put_i64_le(*leadership_term_id);
                buf.put_i32_le(*leader_member_id);
                buf.put_u8(code.code());
                put_string(&mut buf, detail);
            }
            EgressEvent::Challenge {
                correlation_id,
                cluster_session_id,
                encoded_challenge,
            } => {
                buf.put_u32_le(tag::CHALLENGE);
                buf.put_i64_le(*correlation_id);
                buf.put_i64_le(*cluster_session_id);
                put_bytes(&mut buf, encoded_challenge);
            }
            EgressEvent::NewLeader {
                cluster_session_id,
                leadership_term_id,
                leader_member_id,
                ingress_endpoints,
            } => {
                buf.put_u32_le(tag::NEW_LEADER);
                buf.put_i64_le(*cluster_session_id);
                buf.put_i64_le(*leadership_term_id);
                buf.put_i32_le(*leader_member_id);
                put_string(&mut buf, ingress_endpoints);
            }
        }
        buf.freeze()
    }

    pub fn decode(frame: &[u8]) -> Result<EgressEvent, CodecError> {
        let mut reader = Reader::new(frame);
        match reader.u32()? {
            tag::SESSION_EVENT => Ok(EgressEvent::SessionEvent {
                cluster_session_id: reader.i64()?,
                correlation_id: reader.i64()?,
                leadership_term_id: reader.i64()?,
                leader_member_id: reader.i32()?,
                code: {
                    let code = reader.u8()?;
                    EventCode::from_code(code).ok_or(CodecError::InvalidValue(code as u32))?
                },
                detail: reader.string()?,
            }),
            tag::CHALLENGE => Ok(EgressEvent::Challenge {
                correlation_id: reader.i64()?,
                cluster_session_id: reader.i64()?,
                encoded_challenge: reader.bytes()?,
            }),
            tag::NEW_LEADER => Ok(EgressEvent::NewLeader {
                cluster_session_id: reader.i64()?,
                leadership_term_id: reader.i64()?,
                leader_member_id: reader.i32()?,
                ingress_endpoints: reader.string()?,
            }),
            other => Err(CodecError::UnknownType(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_connect_round_trip() {
        let request = IngressRequest::SessionConnect {
            correlation_id: 1,
            response_stream_id: 9,
            version: 1 << 16,
            response_channel: "mem:client-0".to_string(),
            encoded_credentials: Bytes::from_static(b"token"),
        };
        assert_eq!(IngressRequest::decode(&request.encode()).unwrap(), request);
    }

    #[test]
    fn new_leader_round_trip() {
        let event = EgressEvent::NewLeader {
            cluster_session_id: 4,
            leadership_term_id: 2,
            leader_member_id: 1,
            ingress_endpoints: "0=c0,1=c1,2=c2".to_string(),
        };
        assert_eq!(EgressEvent::decode(&event.encode()).unwrap(), event);
    }
}
