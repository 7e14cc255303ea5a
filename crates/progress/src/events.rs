//! Change notifications emitted by the reconciler.
//!
//! Whenever one reconcile pass mutates any records, the caller's update
//! callback receives one [`RecordUpdate`] per touched record, batched so
//! that simultaneously-ready events produce a single notification.

use serde::Serialize;

/// Which fields of a record changed in one reconcile pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangedFields {
    pub status: bool,
    pub progress_text: bool,
    pub result_hash: bool,
}

impl ChangedFields {
    /// True if any field changed.
    pub fn any(&self) -> bool {
        self.status || self.progress_text || self.result_hash
    }
}

/// One changed record in an update batch.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RecordUpdate {
    /// Position of the record in the batch.
    pub index: usize,
    /// The fields that changed.
    pub changed: ChangedFields,
}
