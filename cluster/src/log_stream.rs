//! Leader-side append and follower-side consume of the replicated log.

use log::{error, warn};
use stream::{
    aligned_frame_length, Action, Publication, Subscription, NOT_CONNECTED, NULL_SESSION_ID,
};

use crate::codec::log::{ChangeType, ClusterAction, LogRecord};
use crate::session::{CloseReason, ClusterSession};

/// Appends framed records to the log publication. Every append returns the
/// post-append log position or a negative soft-fail sentinel which must be
/// retried on a later duty cycle without reordering.
#[derive(Default)]
pub struct LogPublisher {
    publication: Option<Publication>,
}

impl LogPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_publication(&mut self, publication: Publication) {
        self.publication = Some(publication);
    }

    pub fn disconnect(&mut self) {
        if let Some(publication) = self.publication.take() {
            publication.close();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.publication.is_some()
    }

    pub fn session_id(&self) -> i32 {
        self.publication
            .as_ref()
            .map_or(NULL_SESSION_ID, Publication::session_id)
    }

    pub fn position(&self) -> i64 {
        self.publication.as_ref().map_or(0, Publication::position)
    }

    /// Position the log will be at after appending `encoded_length` bytes.
    pub fn position_after(&self, encoded_length: usize) -> i64 {
        self.position() + aligned_frame_length(encoded_length) as i64
    }

    pub fn add_passive_follower(&self, log_endpoint: &str) {
        if let Some(publication) = &self.publication {
            publication.add_destination(log_endpoint);
        }
    }

    pub fn remove_passive_follower(&self, log_endpoint: &str) {
        if let Some(publication) = &self.publication {
            publication.remove_destination(log_endpoint);
        }
    }

    fn append(&self, record: &LogRecord) -> i64 {
        match &self.publication {
            Some(publication) => publication.offer(&record.encode()),
            None => NOT_CONNECTED,
        }
    }

    pub fn append_message(
        &self,
        leadership_term_id: i64,
        cluster_session_id: i64,
        timestamp_ms: i64,
        payload: bytes::Bytes,
    ) -> i64 {
        self.append(&LogRecord::Message {
            leadership_term_id,
            cluster_session_id,
            timestamp_ms,
            payload,
        })
    }

    pub fn append_session_open(
        &self,
        session: &ClusterSession,
        leadership_term_id: i64,
        timestamp_ms: i64,
    ) -> i64 {
        self.append(&LogRecord::SessionOpen {
            leadership_term_id,
            cluster_session_id: session.id(),
            correlation_id: session.correlation_id(),
            timestamp_ms,
            response_stream_id: session.response_stream_id(),
            response_channel: session.response_channel().to_string(),
        })
    }

    pub fn append_session_close(
        &self,
        session: &ClusterSession,
        leadership_term_id: i64,
        timestamp_ms: i64,
    ) -> bool {
        let close_reason = session.close_reason().unwrap_or(CloseReason::ServiceAction);
        self.append(&LogRecord::SessionClose {
            leadership_term_id,
            cluster_session_id: session.id(),
            timestamp_ms,
            close_reason,
        }) > 0
    }

    pub fn append_timer_event(
        &self,
        correlation_id: i64,
        leadership_term_id: i64,
        timestamp_ms: i64,
    ) -> bool {
        self.append(&LogRecord::TimerEvent {
            leadership_term_id,
            correlation_id,
            timestamp_ms,
        }) > 0
    }

    /// The record carries the position the log reaches once it lands, so the
    /// record is encoded twice: once to size the frame, once for real.
    pub fn append_cluster_action(
        &self,
        leadership_term_id: i64,
        timestamp_ms: i64,
        action: ClusterAction,
    ) -> i64 {
        let probe = LogRecord::ClusterAction {
            leadership_term_id,
            log_position: 0,
            timestamp_ms,
            action,
        };
        let log_position = self.position_after(probe.encode().len());
        self.append(&LogRecord::ClusterAction {
            leadership_term_id,
            log_position,
            timestamp_ms,
            action,
        })
    }

    pub fn append_new_leadership_term_event(
        &self,
        leadership_term_id: i64,
        log_position: i64,
        timestamp_ms: i64,
        leader_member_id: i32,
        log_session_id: i32,
    ) -> bool {
        self.append(&LogRecord::NewLeadershipTermEvent {
            leadership_term_id,
            log_position,
            timestamp_ms,
            leader_member_id,
            log_session_id,
        }) > 0
    }

    #[allow(clippy::too_many_arguments)]
    pub fn append_membership_change_event(
        &self,
        leadership_term_id: i64,
        timestamp_ms: i64,
        leader_member_id: i32,
        cluster_size: i32,
        change_type: ChangeType,
        member_id: i32,
        cluster_members: &str,
    ) -> i64 {
        let probe = LogRecord::MembershipChangeEvent {
            leadership_term_id,
            log_position: 0,
            timestamp_ms,
            leader_member_id,
            cluster_size,
            change_type,
            member_id,
            cluster_members: cluster_members.to_string(),
        };
        let log_position = self.position_after(probe.encode().len());
        self.append(&LogRecord::MembershipChangeEvent {
            leadership_term_id,
            log_position,
            timestamp_ms,
            leader_member_id,
            cluster_size,
            change_type,
            member_id,
            cluster_members: cluster_members.to_string(),
        })
    }
}

/// Follower-side ordered consume of the log stream, dispatching each record
/// with its post-record position and driving cluster time from the record
/// timestamps.
pub struct LogAdapter {
    subscription: Subscription,
    log_session_id: i32,
    position: i64,
}

impl LogAdapter {
    pub fn new(subscription: Subscription, log_session_id: i32, start_position: i64) -> Self {
        Self {
            subscription,
            log_session_id,
            position: start_position,
        }
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn log_session_id(&self) -> i32 {
        self.log_session_id
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn is_image_closed(&self) -> bool {
        self.subscription.is_image_closed(self.log_session_id)
    }

    pub fn has_image(&self) -> bool {
        self.subscription.has_image(self.log_session_id)
    }

    pub fn remove_destination(&self, endpoint: &str) {
        self.subscription.remove_destination(endpoint);
    }

    pub fn add_destination(&self, endpoint: &str) {
        self.subscription.add_destination(endpoint);
    }

    /// Consumes records up to `bound_position`, handing each decoded record
    /// and its end position to the handler.
    pub fn poll<H>(&mut self, bound_position: i64, limit: usize, mut handler: H) -> usize
    where
        H: FnMut(LogRecord, i64),
    {
        let session_id = self.log_session_id;
        let position = &mut self.position;

        self.subscription.poll(
            |frame_session_id, end_position, payload| {
                if frame_session_id != session_id {
                    warn!(
                        "ignoring frame from unexpected log session {} (expected {})",
                        frame_session_id, session_id
                    );
                    return Action::Continue;
                }
                if end_position > bound_position {
                    return Action::Abort;
                }
                match LogRecord::decode(payload) {
                    Ok(record) => {
                        *position = end_position;
                        handler(record, end_position);
                        Action::Continue
                    }
                    Err(err) => {
                        error!("undecodable log record at {}: {}", end_position, err);
                        *position = end_position;
                        Action::Continue
                    }
                }
            },
            limit,
        )
    }
}
