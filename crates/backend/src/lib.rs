//! HTTP and SSE client for the imagineit image-generation backend.
//!
//! Provides the generation dispatch call, per-reference status polling,
//! the server-sent-events progress stream, image retrieval, and typed
//! wrappers for the curation endpoints (labels, deletion, training-image
//! upload, zip export, LoRA mounting) using [`reqwest`].

pub mod api;
pub mod error;
pub mod messages;
pub mod sse;

pub use api::ImagineBackend;
pub use error::{BackendError, DispatchError};
pub use messages::{map_status, JobStatus, StatusPayload};
