//! Per-reference update sources.
//!
//! A [`ProgressSource`] drives status updates for one job reference until
//! the job reaches a terminal state, the source errors, or the batch is
//! cancelled. Two strategies exist, selected by [`SourceMode`]: fixed-
//! interval polling and the SSE push stream. Either way the source's only
//! output is [`SourceEvent`]s on the channel it is given; all record
//! mutation happens in the reconcile loop.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use imagineit_backend::messages::{map_status, JobStatus, StatusPayload};
use imagineit_backend::ImagineBackend;
use imagineit_core::types::JobRef;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Failure detail for a source whose transport broke.
pub const STREAM_ERROR_DETAIL: &str = "stream connection error";

/// Failure detail for a poll source that exceeded its time budget.
pub const TIMEOUT_DETAIL: &str = "timed out";

/// One mapped status event, tagged with the record it belongs to.
#[derive(Debug, Clone)]
pub struct SourceEvent {
    /// Position of the record in the batch.
    pub index: usize,
    /// The mapped status.
    pub status: JobStatus,
}

/// Strategy interface for per-reference update sources.
///
/// `run` must send mapped events to `tx` and return once the reference is
/// terminal, the transport failed (after reporting a per-record failure),
/// or `cancel` fires. It must never affect sibling references.
pub trait ProgressSource: Send + Sync + 'static {
    fn run(
        &self,
        index: usize,
        reference: JobRef,
        tx: mpsc::Sender<SourceEvent>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Which update-source strategy to use for a batch.
#[derive(Debug, Clone)]
pub enum SourceMode {
    /// Fixed-interval status polling.
    Poll(PollConfig),
    /// SSE push stream.
    Stream,
}

impl SourceMode {
    /// Build the source implementation for this mode.
    pub fn into_source(self, backend: Arc<ImagineBackend>) -> Arc<dyn ProgressSource> {
        match self {
            SourceMode::Poll(config) => Arc::new(PollSource::new(backend, config)),
            SourceMode::Stream => Arc::new(StreamSource::new(backend)),
        }
    }
}

// ---------------------------------------------------------------------------
// Polling
// ---------------------------------------------------------------------------

/// Tunable parameters for the polling strategy.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Delay between status requests.
    pub interval: Duration,
    /// Upper bound on total wait per reference. Exceeding it fails the
    /// record with a timed-out detail.
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            timeout: Duration::from_secs(300),
        }
    }
}

/// Polling update source: requests the status object for its reference on
/// a fixed interval until terminal or timed out.
pub struct PollSource {
    backend: Arc<ImagineBackend>,
    config: PollConfig,
}

impl PollSource {
    pub fn new(backend: Arc<ImagineBackend>, config: PollConfig) -> Self {
        Self { backend, config }
    }
}

impl ProgressSource for PollSource {
    fn run(
        &self,
        index: usize,
        reference: JobRef,
        tx: mpsc::Sender<SourceEvent>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let backend = Arc::clone(&self.backend);
        let config = self.config.clone();
        Box::pin(poll_reference(backend, config, index, reference, tx, cancel))
    }
}

async fn poll_reference(
    backend: Arc<ImagineBackend>,
    config: PollConfig,
    index: usize,
    reference: JobRef,
    tx: mpsc::Sender<SourceEvent>,
    cancel: CancellationToken,
) {
    // The budget bounds the whole source, including a request that hangs
    // mid-flight: the deadline arm fires even while `progress` is pending.
    let deadline = tokio::time::Instant::now() + config.timeout;

    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {
                budget_exhausted(&tx, index, &reference, &config).await;
                return;
            }
            result = backend.progress(&reference) => result,
        };

        match result {
            Ok(payload) => {
                if forward_payload(&payload, index, &reference, &tx).await {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(index, reference = %reference, error = %e, "Status poll failed");
                send_failure(&tx, index, STREAM_ERROR_DETAIL).await;
                return;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {
                budget_exhausted(&tx, index, &reference, &config).await;
                return;
            }
            _ = tokio::time::sleep(config.interval) => {}
        }
    }
}

async fn budget_exhausted(
    tx: &mpsc::Sender<SourceEvent>,
    index: usize,
    reference: &str,
    config: &PollConfig,
) {
    tracing::warn!(
        index,
        reference = %reference,
        timeout_secs = config.timeout.as_secs(),
        "Poll budget exhausted",
    );
    send_failure(tx, index, TIMEOUT_DETAIL).await;
}

// ---------------------------------------------------------------------------
// Push stream
// ---------------------------------------------------------------------------

/// Push-stream update source: consumes the per-reference SSE channel.
pub struct StreamSource {
    backend: Arc<ImagineBackend>,
}

impl StreamSource {
    pub fn new(backend: Arc<ImagineBackend>) -> Self {
        Self { backend }
    }
}

impl ProgressSource for StreamSource {
    fn run(
        &self,
        index: usize,
        reference: JobRef,
        tx: mpsc::Sender<SourceEvent>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let backend = Arc::clone(&self.backend);
        Box::pin(consume_stream(backend, index, reference, tx, cancel))
    }
}

async fn consume_stream(
    backend: Arc<ImagineBackend>,
    index: usize,
    reference: JobRef,
    tx: mpsc::Sender<SourceEvent>,
    cancel: CancellationToken,
) {
    let stream = tokio::select! {
        _ = cancel.cancelled() => return,
        result = backend.progress_stream(&reference) => match result {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(index, reference = %reference, error = %e, "Failed to open progress stream");
                send_failure(&tx, index, STREAM_ERROR_DETAIL).await;
                return;
            }
        },
    };
    tokio::pin!(stream);

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return,
            item = stream.next() => item,
        };

        match item {
            Some(Ok(data)) => {
                let payload: StatusPayload = match serde_json::from_str(&data) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!(
                            index,
                            reference = %reference,
                            error = %e,
                            raw_event = %data,
                            "Failed to parse stream event",
                        );
                        continue;
                    }
                };
                if forward_payload(&payload, index, &reference, &tx).await {
                    return;
                }
            }
            Some(Err(e)) => {
                tracing::warn!(index, reference = %reference, error = %e, "Progress stream broke");
                send_failure(&tx, index, STREAM_ERROR_DETAIL).await;
                return;
            }
            None => {
                tracing::debug!(index, reference = %reference, "Progress stream closed");
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Map one payload and forward it. Returns `true` once this source is done
/// (terminal status delivered, or the receiver went away). Unparseable
/// payloads are logged and skipped.
async fn forward_payload(
    payload: &StatusPayload,
    index: usize,
    reference: &str,
    tx: &mpsc::Sender<SourceEvent>,
) -> bool {
    match map_status(payload) {
        Ok(status) => {
            let terminal = matches!(
                status,
                JobStatus::Completed { .. } | JobStatus::Failed { .. }
            );
            if tx.send(SourceEvent { index, status }).await.is_err() {
                return true;
            }
            terminal
        }
        Err(e) => {
            tracing::debug!(
                index,
                reference = %reference,
                raw_status = %payload.status,
                error = %e,
                "Skipping unmapped status",
            );
            false
        }
    }
}

async fn send_failure(tx: &mpsc::Sender<SourceEvent>, index: usize, detail: &str) {
    let _ = tx
        .send(SourceEvent {
            index,
            status: JobStatus::Failed {
                detail: detail.to_string(),
            },
        })
        .await;
}
