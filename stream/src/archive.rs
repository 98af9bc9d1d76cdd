//! Log-recording archive service.
//!
//! A recording taps a stream: attached to a publication it records frames as
//! they are offered (local source), attached to a subscription it records
//! frames as they are delivered (remote source). Frames keep their original
//! stream positions, so a replayed recording reproduces the exact positions
//! of the recorded stream and a recording extended after restart carries on
//! contiguously.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::channel::ChannelUri;
use crate::counter::Counter;
use crate::transport::{Frame, ReplayState, Transport};
use crate::{NULL_POSITION, NULL_SESSION_ID};

/// Replay session ids live above this base so they never collide with
/// transport session ids.
const REPLAY_ID_BASE: i64 = 1 << 40;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SourceLocation {
    /// Record at the publication, as frames are offered.
    Local,
    /// Record at the subscription, as frames are delivered.
    Remote,
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("recording not found: {0}")]
    RecordingNotFound(i64),
    #[error("recording {0} is still active")]
    RecordingActive(i64),
    #[error("no publication for channel {0}")]
    PublicationNotFound(String),
    #[error("no subscription for channel {0}")]
    SubscriptionNotFound(String),
    #[error("channel {0} carries no session-id for a local recording")]
    MissingSessionId(String),
}

#[derive(Clone, Debug)]
pub struct RecordingExtent {
    pub recording_id: i64,
    pub start_position: i64,
    pub stop_position: i64,
    pub session_id: i32,
    pub stream_id: i32,
}

pub(crate) struct RecordingState {
    pub id: i64,
    pub start_position: i64,
    pub position: i64,
    pub frames: Vec<Frame>,
    pub active: bool,
    pub session_id: i32,
    pub stream_id: i32,
    pub counter: Counter,
}

impl RecordingState {
    /// Appends a frame if it continues the recording; anything already
    /// recorded or out of order is ignored, which is what makes the
    /// replay-then-live overlap harmless.
    pub(crate) fn record(&mut self, frame: &Frame) {
        if !self.active {
            return;
        }
        if self.position == NULL_POSITION {
            self.start_position = frame.start;
            self.position = frame.start;
        }
        if frame.start == self.position {
            self.frames.push(frame.clone());
            self.position = frame.end;
            self.counter.set_ordered(frame.end);
        }
    }

    pub(crate) fn frame_at(&self, position: i64) -> Option<Frame> {
        match self
            .frames
            .binary_search_by_key(&position, |frame| frame.start)
        {
            Ok(index) => Some(self.frames[index].clone()),
            Err(_) => None,
        }
    }
}

#[derive(Default)]
pub(crate) struct ArchiveState {
    next_recording_id: i64,
    next_replay_id: i64,
    recordings: HashMap<i64, Arc<Mutex<RecordingState>>>,
}

/// Handle on the in-process archive shared by every member of a transport.
#[derive(Clone)]
pub struct Archive {
    transport: Transport,
    state: Arc<Mutex<ArchiveState>>,
}

impl Archive {
    pub fn connect(transport: &Transport) -> Self {
        Self {
            transport: transport.clone(),
            state: transport.archive_state(),
        }
    }

    pub fn start_recording(
        &self,
        channel: &str,
        stream_id: i32,
        source: SourceLocation,
    ) -> Result<i64, ArchiveError> {
        let uri = ChannelUri::parse(channel);
        let (start_position, session_id) = match source {
            SourceLocation::Local => {
                let session_id = uri
                    .session_id()
                    .ok_or_else(|| ArchiveError::MissingSessionId(channel.to_string()))?;
                let publication = self
                    .transport
                    .network
                    .find_publication_by_session(session_id, stream_id)
                    .ok_or_else(|| ArchiveError::PublicationNotFound(channel.to_string()))?;
                (publication.position.load(std::sync::atomic::Ordering::Acquire), session_id)
            }
            SourceLocation::Remote => {
                (NULL_POSITION, uri.session_id().unwrap_or(NULL_SESSION_ID))
            }
        };

        let recording = {
            let mut state = self.state.lock().unwrap();
            let id = state.next_recording_id;
            state.next_recording_id += 1;
            let recording = Arc::new(Mutex::new(RecordingState {
                id,
                start_position,
                position: start_position,
                frames: Vec::new(),
                active: true,
                session_id,
                stream_id,
                counter: Counter::new(start_position),
            }));
            state.recordings.insert(id, Arc::clone(&recording));
            recording
        };

        self.attach(&recording, channel, stream_id, source)?;
        let id = recording.lock().unwrap().id;
        Ok(id)
    }

    pub fn extend_recording(
        &self,
        recording_id: i64,
        channel: &str,
        stream_id: i32,
        source: SourceLocation,
    ) -> Result<(), ArchiveError> {
        let recording = self.recording(recording_id)?;
        recording.lock().unwrap().active = true;
        self.attach(&recording, channel, stream_id, source)
    }

    fn attach(
        &self,
        recording: &Arc<Mutex<RecordingState>>,
        channel: &str,
        stream_id: i32,
        source: SourceLocation,
    ) -> Result<(), ArchiveError> {
        let uri = ChannelUri::parse(channel);
        match source {
            SourceLocation::Local => {
                let session_id = uri
                    .session_id()
                    .ok_or_else(|| ArchiveError::MissingSessionId(channel.to_string()))?;
                let publication = self
                    .transport
                    .network
                    .find_publication_by_session(session_id, stream_id)
                    .ok_or_else(|| ArchiveError::PublicationNotFound(channel.to_string()))?;
                *publication.recording.lock().unwrap() = Some(Arc::clone(recording));
            }
            SourceLocation::Remote => {
                let endpoint = uri
                    .endpoint()
                    .ok_or_else(|| ArchiveError::SubscriptionNotFound(channel.to_string()))?;
                let subscription = self
                    .transport
                    .network
                    .find_subscription_by_endpoint(endpoint, stream_id)
                    .ok_or_else(|| ArchiveError::SubscriptionNotFound(channel.to_string()))?;
                *subscription.recording.lock().unwrap() = Some(Arc::clone(recording));
            }
        }
        Ok(())
    }

    /// Stops the recording attached through `channel`, detaching the tap.
    /// The endpoint identifies a recording subscription; a session id alone
    /// identifies a recording publication.
    pub fn stop_recording(&self, channel: &str, stream_id: i32) -> Result<(), ArchiveError> {
        let uri = ChannelUri::parse(channel);
        let mut detached = uri
            .endpoint()
            .and_then(|endpoint| {
                self.transport
                    .network
                    .find_recording_subscription(endpoint, stream_id)
            })
            .and_then(|subscription| subscription.recording.lock().unwrap().take());

        if detached.is_none() {
            if let Some(session_id) = uri.session_id() {
                detached = self
                    .transport
                    .network
                    .find_publication_by_session(session_id, stream_id)
                    .and_then(|publication| publication.recording.lock().unwrap().take());
            }
        }

        if let Some(recording) = detached {
            recording.lock().unwrap().active = false;
        }
        Ok(())
    }

    pub fn stop_recording_id(&self, recording_id: i64) -> Result<(), ArchiveError> {
        let recording = self.recording(recording_id)?;
        recording.lock().unwrap().active = false;
        self.detach_everywhere(&recording);
        Ok(())
    }

    pub fn start_replay(
        &self,
        recording_id: i64,
        position: i64,
        length: i64,
        channel: &str,
        stream_id: i32,
    ) -> Result<i64, ArchiveError> {
        let recording = self.recording(recording_id)?;
        let uri = ChannelUri::parse(channel);
        let endpoint = uri
            .endpoint()
            .ok_or_else(|| ArchiveError::SubscriptionNotFound(channel.to_string()))?
            .to_string();

        let (from_position, fixed_stop) = {
            let recording = recording.lock().unwrap();
            let from = if position == NULL_POSITION {
                recording.start_position
            } else {
                position
            };
            (from, recording.position)
        };
        let stop_position = if length == i64::MAX {
            i64::MAX
        } else if length < 0 {
            fixed_stop
        } else {
            from_position + length
        };

        let replay_id = {
            let mut state = self.state.lock().unwrap();
            let id = REPLAY_ID_BASE + state.next_replay_id;
            state.next_replay_id += 1;
            id
        };
        let session_id = uri.session_id().unwrap_or(replay_id as i32);

        self.transport
            .network
            .state
            .lock()
            .unwrap()
            .replays
            .push(ReplayState {
                replay_id,
                recording,
                from_position,
                stop_position,
                endpoint,
                stream_id,
                session_id,
            });
        Ok(replay_id)
    }

    pub fn stop_replay(&self, replay_id: i64) {
        self.transport
            .network
            .state
            .lock()
            .unwrap()
            .replays
            .retain(|replay| replay.replay_id != replay_id);
    }

    /// `NULL_POSITION` while the recording is still active.
    pub fn get_stop_position(&self, recording_id: i64) -> Result<i64, ArchiveError> {
        let recording = self.recording(recording_id)?;
        let recording = recording.lock().unwrap();
        if recording.active {
            Ok(NULL_POSITION)
        } else {
            Ok(recording.position)
        }
    }

    pub fn get_recording_position(&self, recording_id: i64) -> Result<i64, ArchiveError> {
        Ok(self.recording(recording_id)?.lock().unwrap().position)
    }

    pub fn truncate_recording(
        &self,
        recording_id: i64,
        position: i64,
    ) -> Result<(), ArchiveError> {
        let recording = self.recording(recording_id)?;
        let mut recording = recording.lock().unwrap();
        if recording.active {
            return Err(ArchiveError::RecordingActive(recording_id));
        }
        recording.frames.retain(|frame| frame.end <= position);
        recording.position = position.min(recording.position);
        recording.counter.set_ordered(recording.position);
        Ok(())
    }

    pub fn list_recording(&self, recording_id: i64) -> Result<RecordingExtent, ArchiveError> {
        let recording = self.recording(recording_id)?;
        let recording = recording.lock().unwrap();
        Ok(RecordingExtent {
            recording_id,
            start_position: recording.start_position,
            stop_position: recording.position,
            session_id: recording.session_id,
            stream_id: recording.stream_id,
        })
    }

    /// Counter tracking the recorded position, for use as an
    /// appended-position counter.
    pub fn recording_position_counter(&self, recording_id: i64) -> Result<Counter, ArchiveError> {
        Ok(self.recording(recording_id)?.lock().unwrap().counter.clone())
    }

    /// Most recent active recording of the given stream session.
    pub fn find_recording_by_session(&self, session_id: i32) -> Option<i64> {
        let state = self.state.lock().unwrap();
        state
            .recordings
            .values()
            .filter_map(|recording| {
                let recording = recording.lock().unwrap();
                if recording.session_id == session_id {
                    Some(recording.id)
                } else {
                    None
                }
            })
            .max()
    }

    fn recording(&self, recording_id: i64) -> Result<Arc<Mutex<RecordingState>>, ArchiveError> {
        self.state
            .lock()
            .unwrap()
            .recordings
            .get(&recording_id)
            .cloned()
            .ok_or(ArchiveError::RecordingNotFound(recording_id))
    }

    fn detach_everywhere(&self, recording: &Arc<Mutex<RecordingState>>) {
        let state = self.transport.network.state.lock().unwrap();
        for publication in state.publications.iter().filter_map(std::sync::Weak::upgrade) {
            let mut tap = publication.recording.lock().unwrap();
            if tap.as_ref().map_or(false, |r| Arc::ptr_eq(r, recording)) {
                *tap = None;
            }
        }
        for subscription in state.subscriptions.iter().filter_map(std::sync::Weak::upgrade) {
            let mut tap = subscription.recording.lock().unwrap();
            if tap.as_ref().map_or(false, |r| Arc::ptr_eq(r, recording)) {
                *tap = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Action;

    #[test]
    fn record_and_replay_preserves_positions() {
        let transport = Transport::new();
        let archive = Archive::connect(&transport);

        let publication = transport.add_publication("mem:src?session-id=5", 3);
        let recording_id = archive
            .start_recording("mem:src?session-id=5", 3, SourceLocation::Local)
            .unwrap();

        let first_end = publication.offer(b"alpha");
        let second_end = publication.offer(b"beta");
        assert_eq!(archive.get_recording_position(recording_id).unwrap(), second_end);

        let subscription = transport.add_subscription("mem:dst", 3);
        archive
            .start_replay(recording_id, 0, -1, "mem:dst", 3)
            .unwrap();

        let mut seen = Vec::new();
        subscription.poll(
            |_, position, payload| {
                seen.push((position, payload.to_vec()));
                Action::Continue
            },
            10,
        );
        assert_eq!(
            seen,
            vec![(first_end, b"alpha".to_vec()), (second_end, b"beta".to_vec())]
        );
    }

    #[test]
    fn remote_recording_records_delivered_frames() {
        let transport = Transport::new();
        let archive = Archive::connect(&transport);

        let subscription = transport.add_subscription("mem:follower", 3);
        let recording_id = archive
            .start_recording("mem:follower", 3, SourceLocation::Remote)
            .unwrap();

        let publication = transport.add_publication("mem:follower", 3);
        let end = publication.offer(b"entry");

        // Nothing recorded until the frame is actually delivered.
        assert_eq!(archive.get_recording_position(recording_id).unwrap(), NULL_POSITION);
        subscription.poll(|_, _, _| Action::Continue, 10);
        assert_eq!(archive.get_recording_position(recording_id).unwrap(), end);
    }

    #[test]
    fn stop_truncate_and_extent() {
        let transport = Transport::new();
        let archive = Archive::connect(&transport);
        let publication = transport.add_publication("mem:src?session-id=9", 3);
        let recording_id = archive
            .start_recording("mem:src?session-id=9", 3, SourceLocation::Local)
            .unwrap();

        let first_end = publication.offer(b"keep");
        let second_end = publication.offer(b"drop");
        assert_eq!(archive.get_stop_position(recording_id).unwrap(), NULL_POSITION);

        archive.stop_recording("mem:src?session-id=9", 3).unwrap();
        assert_eq!(archive.get_stop_position(recording_id).unwrap(), second_end);

        archive.truncate_recording(recording_id, first_end).unwrap();
        let extent = archive.list_recording(recording_id).unwrap();
        assert_eq!(extent.stop_position, first_end);
        assert_eq!(extent.session_id, 9);
    }
}
