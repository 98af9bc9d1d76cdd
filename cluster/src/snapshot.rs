//! Writing and loading the module's own snapshot stream.

use log::debug;
use stream::{Action, Publication, Subscription};

use crate::codec::snapshot::{MarkerLabel, SnapshotRecord};
use crate::error::ClusterError;

/// Writes snapshot records through an exclusive publication, idling through
/// the supplied closure on back-pressure so the transport stays alive and
/// interrupts surface as errors.
pub struct SnapshotTaker<'a, F>
where
    F: FnMut() -> Result<(), ClusterError>,
{
    publication: &'a Publication,
    idle: F,
}

impl<'a, F> SnapshotTaker<'a, F>
where
    F: FnMut() -> Result<(), ClusterError>,
{
    pub fn new(publication: &'a Publication, idle: F) -> Self {
        Self { publication, idle }
    }

    fn offer(&mut self, record: &SnapshotRecord) -> Result<(), ClusterError> {
        let encoded = record.encode();
        while self.publication.offer(&encoded) <= 0 {
            (self.idle)()?;
        }
        Ok(())
    }

    pub fn mark_begin(
        &mut self,
        log_position: i64,
        leadership_term_id: i64,
        timestamp_ms: i64,
    ) -> Result<(), ClusterError> {
        self.offer(&SnapshotRecord::Marker {
            label: MarkerLabel::Begin,
            log_position,
            leadership_term_id,
            timestamp_ms,
        })
    }

    pub fn mark_end(
        &mut self,
        log_position: i64,
        leadership_term_id: i64,
        timestamp_ms: i64,
    ) -> Result<(), ClusterError> {
        self.offer(&SnapshotRecord::Marker {
            label: MarkerLabel::End,
            log_position,
            leadership_term_id,
            timestamp_ms,
        })
    }

    pub fn snapshot(&mut self, record: SnapshotRecord) -> Result<(), ClusterError> {
        self.offer(&record)
    }
}

/// Reads a replayed snapshot stream until the end marker.
pub struct SnapshotLoader {
    subscription: Subscription,
    session_id: i32,
    in_snapshot: bool,
    done: bool,
}

impl SnapshotLoader {
    pub fn new(subscription: Subscription, session_id: i32) -> Self {
        Self {
            subscription,
            session_id,
            in_snapshot: false,
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn is_image_closed(&self) -> bool {
        self.subscription.is_image_closed(self.session_id)
    }

    /// Delivers decoded records between the begin and end markers.
    pub fn poll<H>(&mut self, mut handler: H) -> Result<usize, ClusterError>
    where
        H: FnMut(SnapshotRecord),
    {
        if self.done {
            return Ok(0);
        }

        let mut decode_error = None;
        let in_snapshot = &mut self.in_snapshot;
        let done = &mut self.done;

        let fragments = self.subscription.poll(
            |_, _, payload| {
                let record = match SnapshotRecord::decode(payload) {
                    Ok(record) => record,
                    Err(err) => {
                        decode_error = Some(err);
                        return Action::Abort;
                    }
                };
                match record {
                    SnapshotRecord::Marker {
                        label: MarkerLabel::Begin,
                        ..
                    } => {
                        debug!("snapshot load begin");
                        *in_snapshot = true;
                    }
                    SnapshotRecord::Marker {
                        label: MarkerLabel::End,
                        ..
                    } => {
                        debug!("snapshot load end");
                        *done = true;
                        return Action::Continue;
                    }
                    record if *in_snapshot => handler(record),
                    _ => {}
                }
                Action::Continue
            },
            64,
        );

        if let Some(err) = decode_error {
            return Err(ClusterError::SnapshotLoad(err.to_string()));
        }
        Ok(fragments)
    }
}
