//! Generation records, their collection, and owned display handles.
//!
//! One [`GenerationRecord`] tracks the lifecycle of one requested image:
//! `queued -> generating -> completed | failed`, with `completed` and
//! `failed` terminal. The terminal-state guard in [`GenerationRecord::apply`]
//! makes reconciliation order-independent: a stale or duplicate event
//! arriving after a terminal one is a no-op.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use imagineit_backend::messages::JobStatus;
use imagineit_core::types::{ImageHash, JobRef};
use serde::Serialize;

use crate::events::ChangedFields;

/// Progress text set on completed records.
pub const DONE_MARKER: &str = "done";

/// Lifecycle status of one generation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Dispatched, no progress observed yet.
    Queued,
    /// The backend reported generation in progress.
    Generating,
    /// Generation finished; the result hash is set.
    Completed,
    /// Generation failed; the progress text holds the failure detail.
    Failed,
}

impl RecordStatus {
    /// `completed` and `failed` accept no further mutation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordStatus::Completed | RecordStatus::Failed)
    }
}

// ---------------------------------------------------------------------------
// Display handles
// ---------------------------------------------------------------------------

/// Acquire/release accounting for display handles.
///
/// Cheap to clone; all clones share one counter pair. The reconciler's
/// batch transitions must never leak handles, so
/// [`outstanding`](Self::outstanding) is expected to return to zero
/// whenever a batch is superseded or torn down.
#[derive(Debug, Clone, Default)]
pub struct HandleTracker {
    inner: Arc<TrackerCounts>,
}

#[derive(Debug, Default)]
struct TrackerCounts {
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl HandleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of fetched image bytes as a tracked handle.
    pub fn acquire(&self, bytes: Vec<u8>) -> ImageHandle {
        self.inner.acquired.fetch_add(1, Ordering::Relaxed);
        ImageHandle {
            bytes,
            tracker: self.clone(),
        }
    }

    /// Total handles acquired so far.
    pub fn acquired(&self) -> usize {
        self.inner.acquired.load(Ordering::Relaxed)
    }

    /// Total handles released so far.
    pub fn released(&self) -> usize {
        self.inner.released.load(Ordering::Relaxed)
    }

    /// Handles currently alive.
    pub fn outstanding(&self) -> usize {
        self.acquired() - self.released()
    }
}

/// A locally-owned displayable image resource.
///
/// Stands in for the panel's object-URL: acquired when a completed
/// record's hash is resolved to bytes, released deterministically when the
/// record is replaced or discarded (drop-based, counted by the tracker).
pub struct ImageHandle {
    bytes: Vec<u8>,
    tracker: HandleTracker,
}

impl ImageHandle {
    /// The decoded/fetched image bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Drop for ImageHandle {
    fn drop(&mut self) {
        self.tracker.inner.released.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for ImageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageHandle")
            .field("len", &self.bytes.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Client-side tracked state of one requested image.
#[derive(Debug)]
pub struct GenerationRecord {
    index: usize,
    reference: JobRef,
    status: RecordStatus,
    progress_text: Option<String>,
    result_hash: Option<ImageHash>,
    image: Option<ImageHandle>,
}

impl GenerationRecord {
    fn new(index: usize, reference: JobRef) -> Self {
        Self {
            index,
            reference,
            status: RecordStatus::Queued,
            progress_text: None,
            result_hash: None,
            image: None,
        }
    }

    /// Stable position in the originally requested batch.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Backend-issued job reference. Immutable once assigned.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn status(&self) -> RecordStatus {
        self.status
    }

    /// Human-readable progress or failure detail.
    pub fn progress_text(&self) -> Option<&str> {
        self.progress_text.as_deref()
    }

    /// Content hash of the result. Set only on completed records.
    pub fn result_hash(&self) -> Option<&str> {
        self.result_hash.as_deref()
    }

    /// The attached display handle, if the UI layer resolved one.
    pub fn image(&self) -> Option<&ImageHandle> {
        self.image.as_ref()
    }

    /// Merge one status event into this record.
    ///
    /// Returns the changed fields, or `None` when the event was a no-op:
    /// either the record is already terminal (the terminal-state guard) or
    /// the event carried nothing new (repeated progress text).
    pub fn apply(&mut self, update: &JobStatus) -> Option<ChangedFields> {
        if self.status.is_terminal() {
            tracing::debug!(
                index = self.index,
                status = ?self.status,
                "Discarding event for terminal record",
            );
            return None;
        }

        let mut changed = ChangedFields::default();
        match update {
            JobStatus::InProgress { detail } => {
                if self.status != RecordStatus::Generating {
                    self.status = RecordStatus::Generating;
                    changed.status = true;
                }
                if self.progress_text.as_deref() != Some(detail) {
                    self.progress_text = Some(detail.clone());
                    changed.progress_text = true;
                }
            }
            JobStatus::Completed { hash } => {
                self.status = RecordStatus::Completed;
                self.result_hash = Some(hash.clone());
                self.progress_text = Some(DONE_MARKER.to_string());
                changed = ChangedFields {
                    status: true,
                    progress_text: true,
                    result_hash: true,
                };
            }
            JobStatus::Failed { detail } => {
                self.status = RecordStatus::Failed;
                self.progress_text = Some(detail.clone());
                changed.status = true;
                changed.progress_text = true;
            }
        }

        changed.any().then_some(changed)
    }

    /// Attach a display handle resolved from this record's result hash.
    /// Any previously attached handle is released.
    pub fn attach_image(&mut self, handle: ImageHandle) {
        self.image = Some(handle);
    }

    /// Detach and return the display handle, if any.
    pub fn take_image(&mut self) -> Option<ImageHandle> {
        self.image.take()
    }
}

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

/// The ordered record collection for one generation batch.
///
/// Seeded with exactly one `queued` record per dispatched reference; its
/// length never changes for the lifetime of the batch. A new batch gets a
/// new `RecordSet` (the collection's top-level structure is replaced, not
/// resized in place).
#[derive(Debug, Default)]
pub struct RecordSet {
    records: Vec<GenerationRecord>,
}

impl RecordSet {
    /// The empty collection (no batch active).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Seed one `queued` record per reference, in dispatch order.
    pub fn seed(references: Vec<JobRef>) -> Self {
        let records = references
            .into_iter()
            .enumerate()
            .map(|(index, reference)| GenerationRecord::new(index, reference))
            .collect();
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&GenerationRecord> {
        self.records.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut GenerationRecord> {
        self.records.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &GenerationRecord> {
        self.records.iter()
    }

    /// Merge one status event into the record at `index`.
    ///
    /// Out-of-range indices are logged and ignored; otherwise this is
    /// [`GenerationRecord::apply`].
    pub fn apply(&mut self, index: usize, update: &JobStatus) -> Option<ChangedFields> {
        match self.records.get_mut(index) {
            Some(record) => record.apply(update),
            None => {
                tracing::warn!(index, len = self.records.len(), "Event for unknown index");
                None
            }
        }
    }

    /// True once every record is terminal.
    pub fn settled(&self) -> bool {
        self.records.iter().all(|r| r.status.is_terminal())
    }

    /// Release every attached display handle.
    ///
    /// Called when the batch is superseded or the owning view goes away.
    pub fn release_images(&mut self) {
        for record in &mut self.records {
            record.image = None;
        }
    }
}
