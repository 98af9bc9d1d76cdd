//! Recording log: the index of leadership terms and snapshots from which
//! recovery plans are derived.

use log::info;
use stream::{Archive, NULL_POSITION};

use crate::error::ClusterError;
use crate::{MODULE_SERVICE_ID, NULL_VALUE};

#[derive(Clone, Debug)]
pub struct TermEntry {
    pub recording_id: i64,
    pub leadership_term_id: i64,
    pub term_base_log_position: i64,
    /// Position the term closed at, `NULL_POSITION` while open.
    pub log_position: i64,
    pub timestamp_ms: i64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Snapshot {
    pub recording_id: i64,
    pub leadership_term_id: i64,
    pub term_base_log_position: i64,
    pub log_position: i64,
    pub timestamp_ms: i64,
    pub service_id: i32,
}

/// Tail of the log to replay after the latest snapshot.
#[derive(Clone, Debug)]
pub struct LogTail {
    pub recording_id: i64,
    pub leadership_term_id: i64,
    pub term_base_log_position: i64,
    pub start_position: i64,
    pub stop_position: i64,
}

#[derive(Clone, Debug, Default)]
pub struct RecoveryPlan {
    pub last_leadership_term_id: i64,
    pub appended_log_position: i64,
    /// Module snapshot first, then one per service id.
    pub snapshots: Vec<Snapshot>,
    pub log: Option<LogTail>,
}

impl RecoveryPlan {
    pub fn has_replay(&self) -> bool {
        self.log
            .as_ref()
            .map_or(false, |log| log.start_position < log.stop_position)
    }
}

#[derive(Default)]
pub struct RecordingLog {
    terms: Vec<TermEntry>,
    snapshots: Vec<Snapshot>,
}

impl RecordingLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Term entries must strictly increase by leadership term id.
    pub fn append_term(
        &mut self,
        recording_id: i64,
        leadership_term_id: i64,
        term_base_log_position: i64,
        timestamp_ms: i64,
    ) -> Result<(), ClusterError> {
        if let Some(last) = self.terms.last() {
            if leadership_term_id <= last.leadership_term_id {
                return Err(ClusterError::RecordingLogOrder(format!(
                    "term {} after {}",
                    leadership_term_id, last.leadership_term_id
                )));
            }
        }
        info!(
            "recording log: term {} base {} recording {}",
            leadership_term_id, term_base_log_position, recording_id
        );
        self.terms.push(TermEntry {
            recording_id,
            leadership_term_id,
            term_base_log_position,
            log_position: NULL_POSITION,
            timestamp_ms,
        });
        Ok(())
    }

    pub fn append_snapshot(
        &mut self,
        recording_id: i64,
        leadership_term_id: i64,
        term_base_log_position: i64,
        log_position: i64,
        timestamp_ms: i64,
        service_id: i32,
    ) {
        self.snapshots.push(Snapshot {
            recording_id,
            leadership_term_id,
            term_base_log_position,
            log_position,
            timestamp_ms,
            service_id,
        });
    }

    /// Closes the term entry at the position the term ended.
    pub fn commit_log_position(&mut self, leadership_term_id: i64, log_position: i64) {
        if let Some(entry) = self
            .terms
            .iter_mut()
            .find(|entry| entry.leadership_term_id == leadership_term_id)
        {
            entry.log_position = log_position;
        }
    }

    pub fn get_term_entry(&self, leadership_term_id: i64) -> Result<&TermEntry, ClusterError> {
        self.terms
            .iter()
            .find(|entry| entry.leadership_term_id == leadership_term_id)
            .ok_or(ClusterError::UnknownTerm(leadership_term_id))
    }

    pub fn last_term_entry(&self) -> Option<&TermEntry> {
        self.terms.last()
    }

    pub fn find_last_term_recording_id(&self) -> i64 {
        self.terms.last().map_or(NULL_VALUE, |entry| entry.recording_id)
    }

    /// Latest snapshot group that is complete: one snapshot for every
    /// service id in `0..service_count` plus the module's own (id −1), all
    /// taken at the same `(leadership_term_id, log_position)`.
    fn latest_valid_snapshots(&self, service_count: usize) -> Vec<Snapshot> {
        let mut groups: Vec<(i64, i64)> = self
            .snapshots
            .iter()
            .map(|snapshot| (snapshot.leadership_term_id, snapshot.log_position))
            .collect();
        groups.sort_unstable();
        groups.dedup();

        for (leadership_term_id, log_position) in groups.into_iter().rev() {
            let group: Vec<Snapshot> = self
                .snapshots
                .iter()
                .filter(|snapshot| {
                    snapshot.leadership_term_id == leadership_term_id
                        && snapshot.log_position == log_position
                })
                .cloned()
                .collect();

            let has_module = group.iter().any(|s| s.service_id == MODULE_SERVICE_ID);
            let has_all_services = (0..service_count as i32)
                .all(|service_id| group.iter().any(|s| s.service_id == service_id));

            if has_module && has_all_services {
                let mut ordered = Vec::with_capacity(group.len());
                ordered.extend(group.iter().find(|s| s.service_id == MODULE_SERVICE_ID).cloned());
                for service_id in 0..service_count as i32 {
                    ordered.extend(group.iter().find(|s| s.service_id == service_id).cloned());
                }
                return ordered;
            }
        }

        Vec::new()
    }

    /// Latest-snapshot-plus-tail view used to restore state on start.
    pub fn create_recovery_plan(
        &self,
        archive: &Archive,
        service_count: usize,
    ) -> RecoveryPlan {
        let snapshots = self.latest_valid_snapshots(service_count);
        let snapshot_position = snapshots.first().map_or(0, |s| s.log_position);
        let snapshot_term = snapshots.first().map_or(NULL_VALUE, |s| s.leadership_term_id);

        let mut plan = RecoveryPlan {
            last_leadership_term_id: snapshot_term,
            appended_log_position: snapshot_position,
            snapshots,
            log: None,
        };

        if let Some(term) = self.terms.last() {
            plan.last_leadership_term_id = term.leadership_term_id;

            let recorded = archive
                .get_stop_position(term.recording_id)
                .ok()
                .filter(|position| *position != NULL_POSITION)
                .or_else(|| archive.get_recording_position(term.recording_id).ok())
                .unwrap_or(term.term_base_log_position);

            let start_position = snapshot_position.max(term.term_base_log_position);
            let stop_position = if term.log_position != NULL_POSITION {
                term.log_position
            } else {
                recorded
            };

            plan.appended_log_position = recorded.max(snapshot_position);
            plan.log = Some(LogTail {
                recording_id: term.recording_id,
                leadership_term_id: term.leadership_term_id,
                term_base_log_position: term.term_base_log_position,
                start_position,
                stop_position,
            });
        }

        plan
    }

    /// Recovery plan for a dynamic joiner, built purely from the snapshots
    /// retrieved from the leader.
    pub fn create_recovery_plan_from_snapshots(snapshots: &[Snapshot]) -> RecoveryPlan {
        let last = snapshots.first();
        RecoveryPlan {
            last_leadership_term_id: last.map_or(NULL_VALUE, |s| s.leadership_term_id),
            appended_log_position: last.map_or(0, |s| s.log_position),
            snapshots: snapshots.to_vec(),
            log: None,
        }
    }

    pub fn entries(&self) -> (&[TermEntry], &[Snapshot]) {
        (&self.terms, &self.snapshots)
    }
}
