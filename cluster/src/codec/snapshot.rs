//! Records of the module's own snapshot stream.
//!
//! A snapshot is a begin marker, the module state, cluster members, every
//! open or closed session, live timers, the pending service messages, and an
//! end marker.

use bytes::{BufMut, Bytes, BytesMut};

use super::{put_bytes, put_string, CodecError, Reader};
use crate::session::CloseReason;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MarkerLabel {
    Begin,
    End,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SnapshotRecord {
    Marker {
        label: MarkerLabel,
        log_position: i64,
        leadership_term_id: i64,
        timestamp_ms: i64,
    },
    ModuleState {
        next_session_id: i64,
        next_service_session_id: i64,
        log_service_session_id: i64,
        pending_message_capacity: i64,
    },
    ClusterMembers {
        member_id: i32,
        high_member_id: i32,
        cluster_members: String,
    },
    Session {
        cluster_session_id: i64,
        correlation_id: i64,
        opened_log_position: i64,
        time_of_last_activity_ms: i64,
        close_reason: Option<CloseReason>,
        response_stream_id: i32,
        response_channel: String,
    },
    Timer {
        correlation_id: i64,
        deadline_ms: i64,
    },
    PendingMessage {
        cluster_session_id: i64,
        payload: Bytes,
    },
}

mod tag {
    pub const MARKER: u32 = 1;
    pub const MODULE_STATE: u32 = 2;
    pub const CLUSTER_MEMBERS: u32 = 3;
    pub const SESSION: u32 = 4;
    pub const TIMER: u32 = 5;
    pub const PENDING_MESSAGE: u32 = 6;
}

impl SnapshotRecord {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            SnapshotRecord::Marker {
                label,
                log_position,
                leadership_term_id,
                timestamp_ms,
            } => {
                buf.put_u32_le(tag::MARKER);
                buf.put_u8(matches!(label, MarkerLabel::End) as u8);
                buf.put_i64_le(*log_position);
                buf.put_i64_le(*leadership_term_id);
                buf.put_i64_le(*timestamp_ms);
            }
            SnapshotRecord::ModuleState {
                next_session_id,
                next_service_session_id,
                log_service_session_id,
                pending_message_capacity,
            } => {
                buf.put_u32_le(tag::MODULE_STATE);
                buf.put_i64_le(*next_session_id);
                buf.put_i64_le(*next_service_session_id);
                buf.put_i64_le(*log_service_session_id);
                buf.put_i64_le(*pending_message_capacity);
            }
            SnapshotRecord::ClusterMembers {
                member_id,
                high_member_id,
                cluster_members,
            } => {
                buf.put_u32_le(tag::CLUSTER_MEMBERS);
                buf.put_i32_le(*member_id);
                buf.put_i32_le(*high_member_id);
                put_string(&mut buf, cluster_members);
            }
            SnapshotRecord::Session {
                cluster_session_id,
                correlation_id,
                opened_log_position,
                time_of_last_activity_ms,
                close_reason,
                response_stream_id,
                response_channel,
            } => {
                buf.put_u32_le(tag::SESSION);
                buf.put_i64_le(*cluster_session_id);
                buf.put_i64_le(*correlation_id);
                buf.put_i64_le(*opened_log_position);
                buf.put_i64_le(*time_of_last_activity_ms);
                buf.put_u8(close_reason.map_or(0, CloseReason::code));
                buf.put_i32_le(*response_stream_id);
                put_string(&mut buf, response_channel);
            }
            SnapshotRecord::Timer {
                correlation_id,
                deadline_ms,
            } => {
                buf.put_u32_le(tag::TIMER);
                buf.put_i64_le(*correlation_id);
                buf.put_i64_le(*deadline_ms);
            }
            SnapshotRecord::PendingMessage {
                cluster_session_id,
                payload,
            } => {
                buf.put_u32_le(tag::PENDING_MESSAGE);
                buf.put_i64_le(*cluster_session_id);
                put_bytes(&mut buf, payload);
            }
        }
        buf.freeze()
    }

    pub fn decode(frame: &[u8]) -> Result<SnapshotRecord, CodecError> {
        let mut reader = Reader::new(frame);
        match reader.u32()? {
            tag::MARKER => Ok(SnapshotRecord::Marker {
                label: if reader.bool()? {
                    MarkerLabel::End
                } else {
                    MarkerLabel::Begin
                },
                log_position: reader.i64()?,
                leadership_term_id: reader.i64()?,
                timestamp_ms: reader.i64()?,
            }),
            tag::MODULE_STATE => Ok(SnapshotRecord::ModuleState {
                next_session_id: reader.i64()?,
                next_service_session_id: reader.i64()?,
                log_service_session_id: reader.i64()?,
                pending_message_capacity: reader.i64()?,
            }),
            tag::CLUSTER_MEMBERS => Ok(SnapshotRecord::ClusterMembers {
                member_id: reader.i32()?,
                high_member_id: reader.i32()?,
                cluster_members: reader.string()?,
            }),
            tag::SESSION => Ok(SnapshotRecord::Session {
                cluster_session_id: reader.i64()?,
                correlation_id: reader.i64()?,
                opened_log_position: reader.i64()?,
                time_of_last_activity_ms: reader.i64()?,
                close_reason: CloseReason::from_code(reader.u8()?),
                response_stream_id: reader.i32()?,
                response_channel: reader.string()?,
            }),
            tag::TIMER => Ok(SnapshotRecord::Timer {
                correlation_id: reader.i64()?,
                deadline_ms: reader.i64()?,
            }),
            tag::PENDING_MESSAGE => Ok(SnapshotRecord::PendingMessage {
                cluster_session_id: reader.i64()?,
                payload: reader.bytes()?,
            }),
            other => Err(CodecError::UnknownType(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_round_trip_with_and_without_close_reason() {
        let open = SnapshotRecord::Session {
            cluster_session_id: 3,
            correlation_id: 8,
            opened_log_position: 96,
            time_of_last_activity_ms: 1_000,
            close_reason: None,
            response_stream_id: 9,
            response_channel: "mem:client-3".to_string(),
        };
        assert_eq!(SnapshotRecord::decode(&open.encode()).unwrap(), open);

        let closed = SnapshotRecord::Session {
            cluster_session_id: 4,
            correlation_id: 9,
            opened_log_position: 128,
            time_of_last_activity_ms: 2_000,
            close_reason: Some(CloseReason::Timeout),
            response_stream_id: 9,
            response_channel: "mem:client-4".to_string(),
        };
        assert_eq!(SnapshotRecord::decode(&closed.encode()).unwrap(), closed);
    }

    #[test]
    fn markers_round_trip() {
        let begin = SnapshotRecord::Marker {
            label: MarkerLabel::Begin,
            log_position: 128,
            leadership_term_id: 2,
            timestamp_ms: 10,
        };
        let end = SnapshotRecord::Marker {
            label: MarkerLabel::End,
            log_position: 128,
            leadership_term_id: 2,
            timestamp_ms: 10,
        };
        assert_eq!(SnapshotRecord::decode(&begin.encode()).unwrap(), begin);
        assert_eq!(SnapshotRecord::decode(&end.encode()).unwrap(), end);
    }
}
