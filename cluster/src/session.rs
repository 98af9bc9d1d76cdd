//! Client sessions and admission.
//!
//! Sessions only move forward through their states; `Closed` is terminal.
//! A leader allocates ids from a monotone counter, appends a `SessionOpen`
//! record once the authenticator admits the client, and replicates closes.

use bytes::Bytes;
use stream::{Publication, Transport, NULL_POSITION};

use crate::ingress::SessionProxy;
use crate::NULL_VALUE;

pub const SESSION_INVALID_VERSION_DETAIL: &str = "invalid client version";
pub const SESSION_LIMIT_DETAIL: &str = "concurrent session limit";
pub const SESSION_TIMEOUT_DETAIL: &str = "session inactive";
pub const SESSION_TERMINATED_DETAIL: &str = "session terminated";
pub const SESSION_REJECTED_DETAIL: &str = "session failed authentication";

/// Client protocol semantic version; the major must match to connect.
pub const PROTOCOL_MAJOR_VERSION: i32 = 1;
pub const PROTOCOL_SEMANTIC_VERSION: i32 = PROTOCOL_MAJOR_VERSION << 16;

pub fn semantic_version_major(version: i32) -> i32 {
    (version >> 16) & 0xFF
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Init,
    Connected,
    Challenged,
    Authenticated,
    Open,
    Rejected,
    Closed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloseReason {
    ClientAction,
    ServiceAction,
    Timeout,
}

impl CloseReason {
    pub fn code(self) -> u8 {
        match self {
            CloseReason::ClientAction => 1,
            CloseReason::ServiceAction => 2,
            CloseReason::Timeout => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<CloseReason> {
        match code {
            1 => Some(CloseReason::ClientAction),
            2 => Some(CloseReason::ServiceAction),
            3 => Some(CloseReason::Timeout),
            _ => None,
        }
    }
}

/// Codes carried on egress session events.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventCode {
    Ok,
    Error,
    Redirect,
    AuthenticationRejected,
}

impl EventCode {
    pub fn code(self) -> u8 {
        match self {
            EventCode::Ok => 0,
            EventCode::Error => 1,
            EventCode::Redirect => 2,
            EventCode::AuthenticationRejected => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<EventCode> {
        match code {
            0 => Some(EventCode::Ok),
            1 => Some(EventCode::Error),
            2 => Some(EventCode::Redirect),
            3 => Some(EventCode::AuthenticationRejected),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct ClusterSession {
    id: i64,
    correlation_id: i64,
    opened_log_position: i64,
    time_of_last_activity_ms: i64,
    state: SessionState,
    close_reason: Option<CloseReason>,
    response_stream_id: i32,
    response_channel: String,
    response_publication: Option<Publication>,
    has_new_leader_event_pending: bool,
    event_code: EventCode,
    response_detail: String,
}

impl ClusterSession {
    pub fn new(id: i64, response_stream_id: i32, response_channel: &str) -> Self {
        Self {
            id,
            correlation_id: NULL_VALUE,
            opened_log_position: NULL_POSITION,
            time_of_last_activity_ms: 0,
            state: SessionState::Init,
            close_reason: None,
            response_stream_id,
            response_channel: response_channel.to_string(),
            response_publication: None,
            has_new_leader_event_pending: false,
            event_code: EventCode::Ok,
            response_detail: String::new(),
        }
    }

    /// Rebuilds a session from a snapshot record.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: i64,
        correlation_id: i64,
        opened_log_position: i64,
        time_of_last_activity_ms: i64,
        response_stream_id: i32,
        response_channel: &str,
        close_reason: Option<CloseReason>,
    ) -> Self {
        let mut session = Self::new(id, response_stream_id, response_channel);
        session.correlation_id = correlation_id;
        session.opened_log_position = opened_log_position;
        session.time_of_last_activity_ms = time_of_last_activity_ms;
        session.close_reason = close_reason;
        session.state = if close_reason.is_some() {
            SessionState::Closed
        } else {
            SessionState::Open
        };
        session
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn correlation_id(&self) -> i64 {
        self.correlation_id
    }

    pub fn opened_log_position(&self) -> i64 {
        self.opened_log_position
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub fn response_stream_id(&self) -> i32 {
        self.response_stream_id
    }

    pub fn response_channel(&self) -> &str {
        &self.response_channel
    }

    pub fn response_publication(&self) -> Option<&Publication> {
        self.response_publication.as_ref()
    }

    pub fn event_code(&self) -> EventCode {
        self.event_code
    }

    pub fn response_detail(&self) -> &str {
        &self.response_detail
    }

    pub fn time_of_last_activity_ms(&self) -> i64 {
        self.time_of_last_activity_ms
    }

    pub fn set_time_of_last_activity_ms(&mut self, now_ms: i64) {
        self.time_of_last_activity_ms = now_ms;
    }

    pub fn last_activity(&mut self, now_ms: i64, correlation_id: i64) {
        self.time_of_last_activity_ms = now_ms;
        self.correlation_id = correlation_id;
    }

    pub fn has_new_leader_event_pending(&self) -> bool {
        self.has_new_leader_event_pending
    }

    pub fn set_new_leader_event_pending(&mut self, pending: bool) {
        self.has_new_leader_event_pending = pending;
    }

    /// Opens the response publication towards the client.
    pub fn connect(&mut self, transport: &Transport) {
        if self.response_publication.is_none() {
            self.response_publication = Some(
                transport.add_publication(&self.response_channel, self.response_stream_id),
            );
        }
    }

    pub fn is_response_publication_connected(&self) -> bool {
        self.response_publication
            .as_ref()
            .map_or(false, Publication::is_connected)
    }

    pub fn connected(&mut self) {
        if self.state == SessionState::Init {
            self.state = SessionState::Connected;
        }
    }

    pub fn challenged(&mut self) {
        if matches!(self.state, SessionState::Init | SessionState::Connected) {
            self.state = SessionState::Challenged;
        }
    }

    pub fn authenticated(&mut self) {
        if self.state != SessionState::Rejected && self.state != SessionState::Closed {
            self.state = SessionState::Authenticated;
        }
    }

    pub fn reject(&mut self, code: EventCode, detail: &str) {
        self.state = SessionState::Rejected;
        self.event_code = code;
        self.response_detail = detail.to_string();
    }

    pub fn open(&mut self, log_position: i64) {
        self.opened_log_position = log_position;
        self.state = SessionState::Open;
    }

    pub fn close(&mut self, reason: CloseReason) {
        if self.state != SessionState::Closed {
            self.close_reason = Some(reason);
            self.state = SessionState::Closed;
        }
        if let Some(publication) = self.response_publication.take() {
            publication.close();
        }
    }
}

/// Admission decisions for a connecting client. Implementations drive the
/// session through `Connected → (Challenged →) Authenticated` or reject it.
pub trait Authenticator: Send {
    /// A connect request with credentials has arrived.
    fn on_connect_request(&mut self, session_id: i64, encoded_credentials: &Bytes, now_ms: i64);

    /// A response to an earlier challenge has arrived.
    fn on_challenge_response(&mut self, session_id: i64, encoded_credentials: &Bytes, now_ms: i64);

    /// The session's response channel is connected; the authenticator may
    /// authenticate, challenge or reject.
    fn on_connected_session(&mut self, session: &mut SessionProxy<'_>, now_ms: i64);

    /// A previously-challenged session is awaiting a verdict.
    fn on_challenged_session(&mut self, session: &mut SessionProxy<'_>, now_ms: i64);
}

/// Admits every client without credentials checks.
#[derive(Default)]
pub struct AllowAllAuthenticator;

impl Authenticator for AllowAllAuthenticator {
    fn on_connect_request(&mut self, _session_id: i64, _credentials: &Bytes, _now_ms: i64) {}

    fn on_challenge_response(&mut self, _session_id: i64, _credentials: &Bytes, _now_ms: i64) {}

    fn on_connected_session(&mut self, session: &mut SessionProxy<'_>, _now_ms: i64) {
        session.authenticate();
    }

    fn on_challenged_session(&mut self, session: &mut SessionProxy<'_>, _now_ms: i64) {
        session.authenticate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_only_lifecycle() {
        let mut session = ClusterSession::new(1, 9, "mem:client-1");
        assert_eq!(session.state(), SessionState::Init);
        session.connected();
        session.authenticated();
        session.open(96);
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.opened_log_position(), 96);

        session.close(CloseReason::Timeout);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.close_reason(), Some(CloseReason::Timeout));

        // A second close keeps the original reason.
        session.close(CloseReason::ClientAction);
        assert_eq!(session.close_reason(), Some(CloseReason::Timeout));
    }

    #[test]
    fn rejected_session_cannot_authenticate() {
        let mut session = ClusterSession::new(2, 9, "mem:client-2");
        session.reject(EventCode::Error, SESSION_LIMIT_DETAIL);
        session.authenticated();
        assert_eq!(session.state(), SessionState::Rejected);
        assert_eq!(session.response_detail(), SESSION_LIMIT_DETAIL);
    }

    #[test]
    fn restore_from_snapshot_state() {
        let open = ClusterSession::restore(7, 3, 128, 50, 9, "mem:client-7", None);
        assert_eq!(open.state(), SessionState::Open);

        let closed =
            ClusterSession::restore(8, 4, 160, 60, 9, "mem:c8", Some(CloseReason::ClientAction));
        assert_eq!(closed.state(), SessionState::Closed);
    }
}
