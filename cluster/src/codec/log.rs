//! Records of the replicated log stream.
//!
//! Every record is stamped with the leadership term that appended it and the
//! cluster timestamp, which is the authoritative cluster time on replay.

use bytes::{BufMut, Bytes, BytesMut};

use super::{put_bytes, put_string, CodecError, Reader};
use crate::session::CloseReason;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClusterAction {
    Suspend,
    Resume,
    Snapshot,
}

impl ClusterAction {
    fn code(self) -> u8 {
        match self {
            ClusterAction::Suspend => 0,
            ClusterAction::Resume => 1,
            ClusterAction::Snapshot => 2,
        }
    }

    fn from_code(code: u8) -> Result<Self, CodecError> {
        match code {
            0 => Ok(ClusterAction::Suspend),
            1 => Ok(ClusterAction::Resume),
            2 => Ok(ClusterAction::Snapshot),
            other => Err(CodecError::InvalidValue(other as u32)),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChangeType {
    Join,
    Quit,
}

impl ChangeType {
    fn code(self) -> u8 {
        match self {
            ChangeType::Join => 0,
            ChangeType::Quit => 1,
        }
    }

    fn from_code(code: u8) -> Result<Self, CodecError> {
        match code {
            0 => Ok(ChangeType::Join),
            1 => Ok(ChangeType::Quit),
            other => Err(CodecError::InvalidValue(other as u32)),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum LogRecord {
    SessionOpen {
        leadership_term_id: i64,
        cluster_session_id: i64,
        correlation_id: i64,
        timestamp_ms: i64,
        response_stream_id: i32,
        response_channel: String,
    },
    SessionClose {
        leadership_term_id: i64,
        cluster_session_id: i64,
        timestamp_ms: i64,
        close_reason: CloseReason,
    },
    /// A client or service message; service messages carry negative ids.
    Message {
        leadership_term_id: i64,
        cluster_session_id: i64,
        timestamp_ms: i64,
        payload: Bytes,
    },
    TimerEvent {
        leadership_term_id: i64,
        correlation_id: i64,
        timestamp_ms: i64,
    },
    ClusterAction {
        leadership_term_id: i64,
        log_position: i64,
        timestamp_ms: i64,
        action: ClusterAction,
    },
    NewLeadershipTermEvent {
        leadership_term_id: i64,
        log_position: i64,
        timestamp_ms: i64,
        leader_member_id: i32,
        log_session_id: i32,
    },
    MembershipChangeEvent {
        leadership_term_id: i64,
        log_position: i64,
        timestamp_ms: i64,
        leader_member_id: i32,
        cluster_size: i32,
        change_type: ChangeType,
        member_id: i32,
        cluster_members: String,
    },
}

mod tag {
    pub const SESSION_OPEN: u32 = 1;
    pub const SESSION_CLOSE: u32 = 2;
    pub const MESSAGE: u32 = 3;
    pub const TIMER_EVENT: u32 = 4;
    pub const CLUSTER_ACTION: u32 = 5;
    pub const NEW_LEADERSHIP_TERM: u32 = 6;
    pub const MEMBERSHIP_CHANGE: u32 = 7;
}

impl LogRecord {
    pub fn timestamp_ms(&self) -> i64 {
        match self {
            LogRecord::SessionOpen { timestamp_ms, .. }
            | LogRecord::SessionClose { timestamp_ms, .. }
            | LogRecord::Message { timestamp_ms, .. }
            | LogRecord::TimerEvent { timestamp_ms, .. }
            | LogRecord::ClusterAction { timestamp_ms, .. }
            | LogRecord::NewLeadershipTermEvent { timestamp_ms, .. }
            | LogRecord::MembershipChangeEvent { timestamp_ms, .. } => *timestamp_ms,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            LogRecord::SessionOpen {
                leadership_term_id,
                cluster_session_id,
                correlation_id,
                timestamp_ms,
                response_stream_id,
                response_channel,
            } => {
                buf.put_u32_le(tag::SESSION_OPEN);
                buf.put_i64_le(*leadership_term_id);
                buf.put_i64_le(*cluster_session_id);
                buf.put_i64_le(*correlation_id);
                buf.put_i64_le(*timestamp_ms);
                buf.put_i32_le(*response_stream_id);
                put_string(&mut buf, response_channel);
            }
            LogRecord::SessionClose {
                leadership_term_id,
                cluster_session_id,
                timestamp_ms,
                close_reason,
            } => {
                buf.put_u32_le(tag::SESSION_CLOSE);
                buf.put_i64_le(*leadership_term_id);
                buf.put_i64_le(*cluster_session_id);
                buf.put_i64_le(*timestamp_ms);
                buf.put_u8(close_reason.code());
            }
            LogRecord::Message {
                leadership_term_id,
                cluster_session_id,
                timestamp_ms,
                payload,
            } => {
                buf.put_u32_le(tag::MESSAGE);
                buf.put_i64_le(*leadership_term_id);
                buf.put_i64_le(*cluster_session_id);
                buf.put_i64_le(*timestamp_ms);
                put_bytes(&mut buf, payload);
            }
            LogRecord::TimerEvent {
                leadership_term_id,
                correlation_id,
                timestamp_ms,
            } => {
                buf.put_u32_le(tag::TIMER_EVENT);
                buf.put_i64_le(*leadership_term_id);
                buf.put_i64_le(*correlation_id);
                buf.put_i64_le(*timestamp_ms);
            }
            LogRecord::ClusterAction {
                leadership_term_id,
                log_position,
                timestamp_ms,
                action,
            } => {
                buf.put_u32_le(tag::CLUSTER_ACTION);
                buf.put_i64_le(*leadership_term_id);
                buf.put_i64_le(*log_position);
                buf.put_i64_le(*timestamp_ms);
                buf.put_u8(action.code());
            }
            LogRecord::NewLeadershipTermEvent {
                leadership_term_id,
                log_position,
                timestamp_ms,
                leader_member_id,
                log_session_id,
            } => {
                buf.put_u32_le(tag::NEW_LEADERSHIP_TERM);
                buf.put_i64_le(*leadership_term_id);
                buf.put_i64_le(*log_position);
                buf.put_i64_le(*timestamp_ms);
                buf.put_i32_le(*leader_member_id);
                buf.put_i32_le(*log_session_id);
            }
            LogRecord::MembershipChangeEvent {
                leadership_term_id,
                log_position,
                timestamp_ms,
                leader_member_id,
                cluster_size,
                change_type,
                member_id,
                cluster_members,
            } => {
                buf.put_u32_le(tag::MEMBERSHIP_CHANGE);
                buf.put_i64_le(*leadership_term_id);
                buf.put_i64_le(*log_position);
                buf.put_i64_le(*timestamp_ms);
                buf.put_i32_le(*leader_member_id);
                buf.put_i32_le(*cluster_size);
                buf.put_u8(change_type.code());
                buf.put_i32_le(*member_id);
                put_string(&mut buf, cluster_members);
            }
        }
        buf.freeze()
    }

    pub fn decode(frame: &[u8]) -> Result<LogRecord, CodecError> {
        let mut reader = Reader::new(frame);
        match reader.u32()? {
            tag::SESSION_OPEN => Ok(LogRecord::SessionOpen {
                leadership_term_id: reader.i64()?,
                cluster_session_id: reader.i64()?,
                correlation_id: reader.i64()?,
                timestamp_ms: reader.i64()?,
                response_stream_id: reader.i32()?,
                response_channel: reader.string()?,
            }),
            tag::SESSION_CLOSE => Ok(LogRecord::SessionClose {
                leadership_term_id: reader.i64()?,
                cluster_session_id: reader.i64()?,
                timestamp_ms: reader.i64()?,
                close_reason: {
                    let code = reader.u8()?;
                    CloseReason::from_code(code)
                        .ok_or(CodecError::InvalidValue(code as u32))?
                },
            }),
            tag::MESSAGE => Ok(LogRecord::Message {
                leadership_term_id: reader.i64()?,
                cluster_session_id: reader.i64()?,
                timestamp_ms: reader.i64()?,
                payload: reader.bytes()?,
            }),
            tag::TIMER_EVENT => Ok(LogRecord::TimerEvent {
                leadership_term_id: reader.i64()?,
                correlation_id: reader.i64()?,
                timestamp_ms: reader.i64()?,
            }),
            tag::CLUSTER_ACTION => Ok(LogRecord::ClusterAction {
                leadership_term_id: reader.i64()?,
                log_position: reader.i64()?,
                timestamp_ms: reader.i64()?,
                action: ClusterAction::from_code(reader.u8()?)?,
            }),
            tag::NEW_LEADERSHIP_TERM => Ok(LogRecord::NewLeadershipTermEvent {
                leadership_term_id: reader.i64()?,
                log_position: reader.i64()?,
                timestamp_ms: reader.i64()?,
                leader_member_id: reader.i32()?,
                log_session_id: reader.i32()?,
            }),
            tag::MEMBERSHIP_CHANGE => Ok(LogRecord::MembershipChangeEvent {
                leadership_term_id: reader.i64()?,
                log_position: reader.i64()?,
                timestamp_ms: reader.i64()?,
                leader_member_id: reader.i32()?,
                cluster_size: reader.i32()?,
                change_type: ChangeType::from_code(reader.u8()?)?,
                member_id: reader.i32()?,
                cluster_members: reader.string()?,
            }),
            other => Err(CodecError::UnknownType(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trip() {
        let record = LogRecord::Message {
            leadership_term_id: 3,
            cluster_session_id: 42,
            timestamp_ms: 1_000,
            payload: Bytes::from_static(b"payload"),
        };
        assert_eq!(LogRecord::decode(&record.encode()).unwrap(), record);
    }

    #[test]
    fn membership_change_round_trip() {
        let record = LogRecord::MembershipChangeEvent {
            leadership_term_id: 1,
            log_position: 256,
            timestamp_ms: 7,
            leader_member_id: 0,
            cluster_size: 4,
            change_type: ChangeType::Join,
            member_id: 3,
            cluster_members: "0,c,m,l,t,a|3,c3,m3,l3,t3,a3".to_string(),
        };
        assert_eq!(LogRecord::decode(&record.encode()).unwrap(), record);
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let record = LogRecord::TimerEvent {
            leadership_term_id: 0,
            correlation_id: 1,
            timestamp_ms: 2,
        };
        let encoded = record.encode();
        assert!(matches!(
            LogRecord::decode(&encoded[..encoded.len() - 1]),
            Err(CodecError::Truncated)
        ));
    }
}
