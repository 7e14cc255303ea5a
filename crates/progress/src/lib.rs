//! Generation-progress reconciliation.
//!
//! Tracks one batched generation request as an ordered collection of
//! [`record::GenerationRecord`]s, fans out one asynchronous update source
//! per job reference (polling or push-stream), and folds the incoming
//! status events into consistent, monotonic record mutations with
//! batched change notifications.

pub mod events;
pub mod record;
pub mod reconciler;
pub mod source;

pub use events::{ChangedFields, RecordUpdate};
pub use reconciler::{ProgressReconciler, UpdateCallback};
pub use record::{GenerationRecord, HandleTracker, ImageHandle, RecordSet, RecordStatus};
pub use source::{PollConfig, PollSource, ProgressSource, SourceEvent, SourceMode, StreamSource};
