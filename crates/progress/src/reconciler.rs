//! Batch-level progress reconciliation.
//!
//! [`ProgressReconciler`] owns the record collection for the active
//! generation batch. Starting a batch dispatches the request, seeds one
//! `queued` record per returned reference, spawns one update-source task
//! per distinct reference, and funnels every source event through a single
//! reconcile-loop task — the only writer of the collection. Starting a
//! new batch supersedes the old one: its sources are cancelled, its
//! display handles released, and the collection replaced wholesale.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use imagineit_backend::error::DispatchError;
use imagineit_backend::ImagineBackend;
use imagineit_core::generation::GenerationConfig;
use imagineit_core::types::JobRef;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::events::RecordUpdate;
use crate::record::{HandleTracker, RecordSet, RecordStatus};
use crate::source::{ProgressSource, SourceEvent, SourceMode};

/// Capacity of the source-event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long to wait for a cancelled task to exit during teardown.
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Invoked with the current collection and the batch of changed records
/// after every reconcile pass that mutated anything.
pub type UpdateCallback = Arc<dyn Fn(&RecordSet, &[RecordUpdate]) + Send + Sync>;

/// Reconciles per-reference update streams into one record collection.
///
/// Created once per view via [`ProgressReconciler::new`]; the returned
/// `Arc` can be cheaply cloned wherever batches are started from.
pub struct ProgressReconciler {
    backend: Arc<ImagineBackend>,
    source: Arc<dyn ProgressSource>,
    on_update: UpdateCallback,
    tracker: HandleTracker,
    /// The active batch, if any. Replaced atomically on supersede.
    current: Mutex<Option<BatchSession>>,
    /// Master cancellation token -- cancelled on view teardown.
    cancel: CancellationToken,
}

/// Internal bookkeeping for one active batch.
struct BatchSession {
    batch_id: Uuid,
    records: Arc<RwLock<RecordSet>>,
    /// Per-batch cancellation token (child of the master token).
    cancel: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    settled_rx: watch::Receiver<bool>,
}

impl ProgressReconciler {
    /// Create a reconciler using the update-source strategy for `mode`.
    pub fn new(
        backend: Arc<ImagineBackend>,
        mode: SourceMode,
        on_update: UpdateCallback,
    ) -> Arc<Self> {
        let source = mode.into_source(Arc::clone(&backend));
        Self::with_source(backend, source, on_update)
    }

    /// Create a reconciler with an explicit source implementation.
    pub fn with_source(
        backend: Arc<ImagineBackend>,
        source: Arc<dyn ProgressSource>,
        on_update: UpdateCallback,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            source,
            on_update,
            tracker: HandleTracker::new(),
            current: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// Handle-release accounting shared with every handle this reconciler
    /// acquires.
    pub fn tracker(&self) -> &HandleTracker {
        &self.tracker
    }

    /// Dispatch a generation request and start tracking it.
    ///
    /// Validation, connectivity, application, and protocol failures
    /// surface here as one top-level error; no records are created and any
    /// batch already in flight is left untouched. On success the previous
    /// batch (if any) is superseded and the freshly seeded collection
    /// returned.
    pub async fn start_batch(
        &self,
        config: &GenerationConfig,
    ) -> Result<Arc<RwLock<RecordSet>>, DispatchError> {
        let references = self.backend.dispatch(config).await?;
        Ok(self.start_with_references(references).await)
    }

    /// Start tracking an already-dispatched reference list.
    ///
    /// Supersedes the active batch: cancels its source tasks, releases its
    /// display handles, and replaces the collection with one `queued`
    /// record per reference.
    pub async fn start_with_references(&self, references: Vec<JobRef>) -> Arc<RwLock<RecordSet>> {
        let mut current = self.current.lock().await;
        if let Some(previous) = current.take() {
            self.teardown_session(previous, "superseded").await;
        }

        let batch_id = Uuid::new_v4();
        let records = Arc::new(RwLock::new(RecordSet::seed(references.clone())));
        let cancel = self.cancel.child_token();
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (settled_tx, settled_rx) = watch::channel(false);

        // One source per distinct reference; duplicate indices piggyback on
        // the first one's events so every record still reaches a terminal
        // state.
        let mut tasks = Vec::with_capacity(references.len() + 1);
        let mut in_flight: HashMap<JobRef, usize> = HashMap::with_capacity(references.len());
        let mut fan_out: HashMap<usize, Vec<usize>> = HashMap::new();
        for (index, reference) in references.iter().enumerate() {
            match in_flight.entry(reference.clone()) {
                Entry::Occupied(entry) => {
                    tracing::warn!(
                        index,
                        reference = %reference,
                        "Duplicate reference, sharing the in-flight source",
                    );
                    fan_out.entry(*entry.get()).or_default().push(index);
                    continue;
                }
                Entry::Vacant(entry) => {
                    entry.insert(index);
                }
            }
            let fut = self
                .source
                .run(index, reference.clone(), tx.clone(), cancel.clone());
            tasks.push(tokio::spawn(fut));
        }
        // The loop's receiver closes once every source task is done.
        drop(tx);

        tasks.push(tokio::spawn(reconcile_loop(
            batch_id,
            Arc::clone(&records),
            rx,
            fan_out,
            self.on_update.clone(),
            cancel.clone(),
            settled_tx,
        )));

        tracing::info!(
            batch_id = %batch_id,
            count = references.len(),
            "Tracking generation batch",
        );

        *current = Some(BatchSession {
            batch_id,
            records: Arc::clone(&records),
            cancel,
            tasks,
            settled_rx,
        });
        records
    }

    /// The active batch's collection, if a batch is being tracked.
    pub async fn records(&self) -> Option<Arc<RwLock<RecordSet>>> {
        self.current
            .lock()
            .await
            .as_ref()
            .map(|session| Arc::clone(&session.records))
    }

    /// Wait until every record of the active batch is terminal.
    ///
    /// Returns `false` when no batch is active or the batch was cancelled
    /// before settling.
    pub async fn wait_settled(&self) -> bool {
        let rx = self
            .current
            .lock()
            .await
            .as_ref()
            .map(|session| session.settled_rx.clone());
        let Some(mut rx) = rx else {
            return false;
        };
        loop {
            if *rx.borrow() {
                return true;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }

    /// Attach fetched image bytes to a completed record as an owned
    /// display handle.
    ///
    /// Returns `false` when the index is unknown or the record is not
    /// completed (a handle only ever derives from a result hash).
    pub async fn attach_image(&self, index: usize, bytes: Vec<u8>) -> bool {
        let Some(records) = self.records().await else {
            return false;
        };
        let mut set = records.write().await;
        match set.get_mut(index) {
            Some(record) if record.status() == RecordStatus::Completed => {
                record.attach_image(self.tracker.acquire(bytes));
                true
            }
            _ => false,
        }
    }

    /// Tear down the active batch and stop accepting new events.
    ///
    /// Called when the owning view goes away. Releases every display
    /// handle the current collection holds.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down progress reconciler");
        self.cancel.cancel();
        let mut current = self.current.lock().await;
        if let Some(session) = current.take() {
            self.teardown_session(session, "shutdown").await;
        }
    }

    // ---- private helpers ----

    /// Cancel a session's tasks, wait briefly for them to exit, and
    /// release its display handles.
    async fn teardown_session(&self, session: BatchSession, reason: &'static str) {
        session.cancel.cancel();
        for task in session.tasks {
            let _ = tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, task).await;
        }
        session.records.write().await.release_images();
        tracing::info!(batch_id = %session.batch_id, reason, "Batch torn down");
    }
}

/// Core reconcile loop: drain ready events, merge them under the terminal
/// guard, notify the caller once per pass.
///
/// Runs until the batch settles, the cancellation token fires, or every
/// source has finished and the channel drained.
async fn reconcile_loop(
    batch_id: Uuid,
    records: Arc<RwLock<RecordSet>>,
    mut rx: mpsc::Receiver<SourceEvent>,
    fan_out: HashMap<usize, Vec<usize>>,
    on_update: UpdateCallback,
    cancel: CancellationToken,
    settled_tx: watch::Sender<bool>,
) {
    if records.read().await.settled() {
        // Zero-length batch; nothing will ever arrive.
        let _ = settled_tx.send(true);
        return;
    }

    loop {
        let first = tokio::select! {
            _ = cancel.cancelled() => return,
            event = rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };

        // Coalesce whatever else is already queued into one pass so a
        // burst of simultaneous events produces a single notification.
        let mut events = vec![first];
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }

        let mut set = records.write().await;
        let mut updates = Vec::with_capacity(events.len());
        for event in events {
            let aliases = fan_out.get(&event.index).into_iter().flatten().copied();
            for index in std::iter::once(event.index).chain(aliases) {
                if let Some(changed) = set.apply(index, &event.status) {
                    updates.push(RecordUpdate { index, changed });
                }
            }
        }
        if !updates.is_empty() {
            on_update(&set, &updates);
        }
        let settled = set.settled();
        drop(set);

        if settled {
            tracing::info!(batch_id = %batch_id, "Batch settled");
            let _ = settled_tx.send(true);
            return;
        }
    }
}
