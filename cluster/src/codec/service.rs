//! Duplex control messages between the module and its hosted services.

use bytes::{BufMut, Bytes, BytesMut};

use super::{put_bytes, put_string, CodecError, Reader};

/// Module → service.
#[derive(Clone, Debug, PartialEq)]
pub enum ToServiceMessage {
    JoinLog {
        leadership_term_id: i64,
        log_position: i64,
        max_log_position: i64,
        member_id: i32,
        log_session_id: i32,
        log_stream_id: i32,
        log_channel: String,
    },
    ClusterMembersResponse {
        correlation_id: i64,
        leader_member_id: i32,
        active_members: String,
        passive_members: String,
    },
    TerminationPosition {
        log_position: i64,
    },
    ElectionStartEvent {
        log_position: i64,
    },
}

/// Service → module.
#[derive(Clone, Debug, PartialEq)]
pub enum FromServiceMessage {
    ServiceAck {
        log_position: i64,
        ack_id: i64,
        relevant_id: i64,
        service_id: i32,
    },
    ServiceMessage {
        leadership_term_id: i64,
        payload: Bytes,
    },
    CloseSession {
        cluster_session_id: i64,
    },
    ScheduleTimer {
        correlation_id: i64,
        deadline_ms: i64,
    },
    CancelTimer {
        correlation_id: i64,
    },
    ClusterMembersQuery {
        correlation_id: i64,
    },
}

mod tag {
    pub const JOIN_LOG: u32 = 1;
    pub const CLUSTER_MEMBERS_RESPONSE: u32 = 2;
    pub const TERMINATION_POSITION: u32 = 3;
    pub const ELECTION_START: u32 = 4;

    pub const SERVICE_ACK: u32 = 11;
    pub const SERVICE_MESSAGE: u32 = 12;
    pub const CLOSE_SESSION: u32 = 13;
    pub const SCHEDULE_TIMER: u32 = 14;
    pub const CANCEL_TIMER: u32 = 15;
    pub const CLUSTER_MEMBERS_QUERY: u32 = 16;
}

impl ToServiceMessage {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            ToServiceMessage::JoinLog {
                leadership_term_id,
                log_position,
                max_log_position,
                member_id,
                log_session_id,
                log_stream_id,
                log_channel,
            } => {
                buf.put_u32_le(tag::JOIN_LOG);
                buf.put_i64_le(*leadership_term_id);
                buf.put_i64_le(*log_position);
                buf.put_i64_le(*max_log_position);
                buf.put_i32_le(*member_id);
                buf.put_i32_le(*log_session_id);
                buf.put_i32_le(*log_stream_id);
                put_string(&mut buf, log_channel);
            }
            ToServiceMessage::ClusterMembersResponse {
                correlation_id,
                leader_member_id,
                active_members,
                passive_members,
            } => {
                buf.put_u32_le(tag::CLUSTER_MEMBERS_RESPONSE);
                buf.put_i64_le(*correlation_id);
                buf.put_i32_le(*leader_member_id);
                put_string(&mut buf, active_members);
                put_string(&mut buf, passive_members);
            }
            ToServiceMessage::TerminationPosition { log_position } => {
                buf.put_u32_le(tag::TERMINATION_POSITION);
                buf.put_i64_le(*log_position);
            }
            ToServiceMessage::ElectionStartEvent { log_position } => {
                buf.put_u32_le(tag::ELECTION_START);
                buf.put_i64_le(*log_position);
            }
        }
        buf.freeze()
    }

    pub fn decode(frame: &[u8]) -> Result<ToServiceMessage, CodecError> {
        let mut reader = Reader::new(frame);
        match reader.u32()? {
            tag::JOIN_LOG => Ok(ToServiceMessage::JoinLog {
                leadership_term_id: reader.i64()?,
                log_position: reader.i64()?,
                max_log_position: reader.i64()?,
                member_id: reader.i32()?,
                log_session_id: reader.i32()?,
                log_stream_id: reader.i32()?,
                log_channel: reader.string()?,
            }),
            tag::CLUSTER_MEMBERS_RESPONSE => Ok(ToServiceMessage::ClusterMembersResponse {
                correlation_id: reader.i64()?,
                leader_member_id: reader.i32()?,
                active_members: reader.string()?,
                passive_members: reader.string()?,
            }),
            tag::TERMINATION_POSITION => Ok(ToServiceMessage::TerminationPosition {
                log_position: reader.i64()?,
            }),
            tag::ELECTION_START => Ok(ToServiceMessage::ElectionStartEvent {
                log_position: reader.i64()?,
            }),
            other => Err(CodecError::UnknownType(other)),
        }
    }
}

impl FromServiceMessage {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            FromServiceMessage::ServiceAck {
                log_position,
                ack_id,
                relevant_id,
                service_id,
            } => {
                buf.put_u32_le(tag::SERVICE_ACK);
                buf.put_i64_le(*log_position);
                buf.put_i64_le(*ack_id);
                buf.put_i64_le(*relevant_id);
                buf.put_i32_le(*service_id);
            }
            FromServiceMessage::ServiceMessage {
                leadership_term_id,
                payload,
            } => {
                buf.put_u32_le(tag::SERVICE_MESSAGE);
                buf.put_i64_le(*leadership_term_id);
                put_bytes(&mut buf, payload);
            }
            FromServiceMessage::CloseSession { cluster_session_id } => {
                buf.put_u32_le(tag::CLOSE_SESSION);
                buf.put_i64_le(*cluster_session_id);
            }
            FromServiceMessage::ScheduleTimer {
                correlation_id,
                deadline_ms,
            } => {
                buf.put_u32_le(tag::SCHEDULE_TIMER);
                buf.put_i64_le(*correlation_id);
                buf.put_i64_le(*deadline_ms);
            }
            FromServiceMessage::CancelTimer { correlation_id } => {
                buf.put_u32_le(tag::CANCEL_TIMER);
                buf.put_i64_le(*correlation_id);
            }
            FromServiceMessage::ClusterMembersQuery { correlation_id } => {
                buf.put_u32_le(tag::CLUSTER_MEMBERS_QUERY);
                buf.put_i64_le(*correlation_id);
            }
        }
        buf.freeze()
    }

    pub fn decode(frame: &[u8]) -> Result<FromServiceMessage, CodecError> {
        let mut reader = Reader::new(frame);
        match reader.u32()? {
            tag::SERVICE_ACK => Ok(FromServiceMessage::ServiceAck {
                log_position: reader.i64()?,
                ack_id: reader.i64()?,
                relevant_id: reader.i64()?,
                service_id: reader.i32()?,
            }),
            tag::SERVICE_MESSAGE => Ok(FromServiceMessage::ServiceMessage {
                leadership_term_id: reader.i64()?,
                payload: reader.bytes()?,
            }),
            tag::CLOSE_SESSION => Ok(FromServiceMessage::CloseSession {
                cluster_session_id: reader.i64()?,
            }),
            tag::SCHEDULE_TIMER => Ok(FromServiceMessage::ScheduleTimer {
                correlation_id: reader.i64()?,
                deadline_ms: reader.i64()?,
            }),
            tag::CANCEL_TIMER => Ok(FromServiceMessage::CancelTimer {
                correlation_id: reader.i64()?,
            }),
            tag::CLUSTER_MEMBERS_QUERY => Ok(FromServiceMessage::ClusterMembersQuery {
                correlation_id: reader.i64()?,
            }),
            other => Err(CodecError::UnknownType(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_log_round_trip() {
        let message = ToServiceMessage::JoinLog {
            leadership_term_id: 1,
            log_position: 96,
            max_log_position: i64::MAX,
            member_id: 0,
            log_session_id: 12,
            log_stream_id: 100,
            log_channel: "mem:member-0-log".to_string(),
        };
        assert_eq!(ToServiceMessage::decode(&message.encode()).unwrap(), message);
    }

    #[test]
    fn service_ack_round_trip() {
        let message = FromServiceMessage::ServiceAck {
            log_position: 256,
            ack_id: 3,
            relevant_id: -1,
            service_id: 0,
        };
        assert_eq!(FromServiceMessage::decode(&message.encode()).unwrap(), message);
    }
}
