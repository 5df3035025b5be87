//! Substitution state machine and its backing table.
//!
//! ```text
//!   (none) ──on_enter_waiting──► Waiting ──scheduled──► Substituted
//!                                                          │ host found
//!                                                          ▼
//!   (none) ◄──────on_left(original)──────────────── Rescheduled
//!   (none) ◄──on_left(provisioning task) while Waiting/Substituted
//! ```

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubstitutionState {
    /// Recorded; the original is being pulled from the queue.
    Waiting,
    /// The host-provisioning task is queued in the original's place.
    Substituted,
    /// A host was found and the original is back in the queue.
    Rescheduled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubstitutionRecord {
    pub original_id: String,
    pub provisioning_id: String,
    pub state: SubstitutionState,
}

/// Original task id → record, plus the reverse index.
#[derive(Default)]
pub struct SubstitutionTable {
    by_original: DashMap<String, SubstitutionRecord>,
    by_provisioning: DashMap<String, String>,
}

impl SubstitutionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new substitution in `Waiting`. `false` if one exists.
    pub(crate) fn begin(&self, original_id: &str, provisioning_id: &str) -> bool {
        match self.by_original.entry(original_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(SubstitutionRecord {
                    original_id: original_id.to_string(),
                    provisioning_id: provisioning_id.to_string(),
                    state: SubstitutionState::Waiting,
                });
                self.by_provisioning
                    .insert(provisioning_id.to_string(), original_id.to_string());
                true
            }
        }
    }

    /// `Waiting` to `Substituted`. A record already rescheduled by a fast
    /// provisioning task keeps its state.
    pub(crate) fn mark_substituted(&self, original_id: &str) {
        if let Some(mut record) = self.by_original.get_mut(original_id) {
            if record.state == SubstitutionState::Waiting {
                record.state = SubstitutionState::Substituted;
            }
        }
    }

    /// Move to `Rescheduled` if the record still belongs to this
    /// provisioning task.
    pub(crate) fn mark_rescheduled(&self, original_id: &str, provisioning_id: &str) -> bool {
        match self.by_original.get_mut(original_id) {
            Some(mut record) if record.provisioning_id == provisioning_id => {
                record.state = SubstitutionState::Rescheduled;
                true
            }
            _ => false,
        }
    }

    /// Drop state after a queue item left. Returns whether anything changed.
    pub(crate) fn left(&self, id: &str) -> bool {
        if let Some((_, original_id)) = self.by_provisioning.remove(id) {
            // Left before a host was found: the substitution is abandoned.
            self.by_original.remove_if(&original_id, |_, record| {
                record.provisioning_id == id && record.state != SubstitutionState::Rescheduled
            });
            return true;
        }

        self.by_original
            .remove_if(id, |_, record| record.state == SubstitutionState::Rescheduled)
            .is_some()
    }

    pub fn state_of(&self, original_id: &str) -> Option<SubstitutionState> {
        self.by_original.get(original_id).map(|r| r.state)
    }

    pub fn original_for(&self, provisioning_id: &str) -> Option<String> {
        self.by_provisioning.get(provisioning_id).map(|r| r.value().clone())
    }

    pub fn records(&self) -> Vec<SubstitutionRecord> {
        let mut records: Vec<_> = self.by_original.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.original_id.cmp(&b.original_id));
        records
    }

    pub fn len(&self) -> usize {
        self.by_original.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_original.is_empty()
    }
}
