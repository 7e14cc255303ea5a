//! End-to-end reconciler tests using a scripted update source.
//!
//! The scripted source replays a fixed event sequence per job reference,
//! which lets these tests exercise fan-out, batching, the terminal-state
//! guard, supersede, and handle release without a live backend.

use std::collections::HashMap;
use std::future::Future;
use std::net::TcpListener;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use imagineit_backend::messages::JobStatus;
use imagineit_backend::ImagineBackend;
use imagineit_core::generation::GenerationConfig;
use imagineit_progress::{
    PollConfig, PollSource, ProgressReconciler, ProgressSource, RecordSet, RecordStatus,
    RecordUpdate, SourceEvent, UpdateCallback,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
enum Step {
    Emit(JobStatus),
    /// Park until the batch is cancelled.
    Hang,
}

/// Replays a per-reference script of status events.
struct ScriptedSource {
    scripts: HashMap<String, Vec<Step>>,
    runs: AtomicUsize,
}

impl ScriptedSource {
    fn new(scripts: Vec<(&str, Vec<Step>)>) -> Arc<Self> {
        Arc::new(Self {
            scripts: scripts
                .into_iter()
                .map(|(r, s)| (r.to_string(), s))
                .collect(),
            runs: AtomicUsize::new(0),
        })
    }

    /// How many times `run` was invoked.
    fn runs(&self) -> usize {
        self.runs.load(Ordering::Relaxed)
    }
}

impl ProgressSource for ScriptedSource {
    fn run(
        &self,
        index: usize,
        reference: String,
        tx: mpsc::Sender<SourceEvent>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.runs.fetch_add(1, Ordering::Relaxed);
        let script = self.scripts.get(&reference).cloned().unwrap_or_default();
        Box::pin(async move {
            for step in script {
                match step {
                    Step::Emit(status) => {
                        if tx.send(SourceEvent { index, status }).await.is_err() {
                            return;
                        }
                    }
                    Step::Hang => {
                        cancel.cancelled().await;
                        return;
                    }
                }
            }
        })
    }
}

fn in_progress(detail: &str) -> Step {
    Step::Emit(JobStatus::InProgress {
        detail: detail.to_string(),
    })
}

fn completed(hash: &str) -> Step {
    Step::Emit(JobStatus::Completed {
        hash: hash.to_string(),
    })
}

fn failed(detail: &str) -> Step {
    Step::Emit(JobStatus::Failed {
        detail: detail.to_string(),
    })
}

fn unreachable_backend() -> Arc<ImagineBackend> {
    // Port 1 refuses connections.
    Arc::new(ImagineBackend::new("http://127.0.0.1:1".to_string()))
}

fn noop_callback() -> UpdateCallback {
    Arc::new(|_, _| {})
}

fn recording_callback() -> (UpdateCallback, Arc<Mutex<Vec<RecordUpdate>>>) {
    let seen: Arc<Mutex<Vec<RecordUpdate>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback: UpdateCallback = Arc::new(move |_set: &RecordSet, updates: &[RecordUpdate]| {
        sink.lock().unwrap().extend_from_slice(updates);
    });
    (callback, seen)
}

async fn settle(reconciler: &ProgressReconciler) -> bool {
    tokio::time::timeout(Duration::from_secs(2), reconciler.wait_settled())
        .await
        .expect("batch did not settle in time")
}

#[tokio::test]
async fn two_streams_complete_with_distinct_hashes() {
    let source = ScriptedSource::new(vec![
        ("r0", vec![in_progress("step 1/20"), completed("hash-0")]),
        ("r1", vec![in_progress("step 1/20"), completed("hash-1")]),
    ]);
    let reconciler =
        ProgressReconciler::with_source(unreachable_backend(), source, noop_callback());

    let records = reconciler
        .start_with_references(vec!["r0".into(), "r1".into()])
        .await;
    assert!(settle(&reconciler).await);

    let set = records.read().await;
    assert_eq!(set.len(), 2);
    for record in set.iter() {
        assert_eq!(record.status(), RecordStatus::Completed);
        assert_eq!(record.progress_text(), Some("done"));
    }
    assert_eq!(set.get(0).unwrap().result_hash(), Some("hash-0"));
    assert_eq!(set.get(1).unwrap().result_hash(), Some("hash-1"));
}

#[tokio::test]
async fn one_failure_does_not_abort_siblings() {
    let source = ScriptedSource::new(vec![
        ("r0", vec![in_progress("(1/20)"), completed("hash-0")]),
        ("r1", vec![in_progress("(1/20)"), failed("OOM")]),
        ("r2", vec![completed("hash-2")]),
    ]);
    let reconciler =
        ProgressReconciler::with_source(unreachable_backend(), source, noop_callback());

    let records = reconciler
        .start_with_references(vec!["r0".into(), "r1".into(), "r2".into()])
        .await;
    assert!(settle(&reconciler).await);

    let set = records.read().await;
    assert_eq!(set.get(0).unwrap().status(), RecordStatus::Completed);
    assert_eq!(set.get(2).unwrap().status(), RecordStatus::Completed);
    assert_ne!(
        set.get(0).unwrap().result_hash(),
        set.get(2).unwrap().result_hash()
    );

    let failed_record = set.get(1).unwrap();
    assert_eq!(failed_record.status(), RecordStatus::Failed);
    assert_eq!(failed_record.progress_text(), Some("OOM"));
    assert!(failed_record.result_hash().is_none());
}

#[tokio::test]
async fn update_callback_reports_every_record() {
    let source = ScriptedSource::new(vec![
        ("r0", vec![in_progress("(1/2)"), completed("h0")]),
        ("r1", vec![failed("boom")]),
    ]);
    let (callback, seen) = recording_callback();
    let reconciler = ProgressReconciler::with_source(unreachable_backend(), source, callback);

    reconciler
        .start_with_references(vec!["r0".into(), "r1".into()])
        .await;
    assert!(settle(&reconciler).await);

    let updates = seen.lock().unwrap();
    assert!(updates.iter().any(|u| u.index == 0 && u.changed.status));
    assert!(updates.iter().any(|u| u.index == 1 && u.changed.status));
    // Completion must be reported as a hash change exactly once.
    assert_eq!(
        updates
            .iter()
            .filter(|u| u.index == 0 && u.changed.result_hash)
            .count(),
        1
    );
}

#[tokio::test]
async fn new_batch_supersedes_in_flight_batch() {
    let source = ScriptedSource::new(vec![
        ("a0", vec![completed("hash-a0")]),
        ("a1", vec![in_progress("(3/20)"), Step::Hang]),
        ("a2", vec![completed("hash-a2")]),
    ]);
    let reconciler =
        ProgressReconciler::with_source(unreachable_backend(), source, noop_callback());

    let batch1 = reconciler
        .start_with_references(vec!["a0".into(), "a1".into(), "a2".into()])
        .await;

    // Wait for the first record to complete and the second to start
    // generating, then give the completed one a display handle.
    wait_until(&batch1, |set| {
        set.get(0).map(|r| r.status()) == Some(RecordStatus::Completed)
            && set.get(1).map(|r| r.status()) == Some(RecordStatus::Generating)
    })
    .await;
    assert!(reconciler.attach_image(0, vec![1, 2, 3]).await);
    assert_eq!(reconciler.tracker().outstanding(), 1);

    // Supersede while a1 is still generating.
    let batch2 = reconciler
        .start_with_references(vec!["b0".into(), "b1".into()])
        .await;

    let set = batch2.read().await;
    assert_eq!(set.len(), 2);
    assert!(set.iter().all(|r| r.status() == RecordStatus::Queued));
    drop(set);

    // Every handle batch 1 held is released, and its records stop moving.
    assert_eq!(reconciler.tracker().outstanding(), 0);
    assert_eq!(reconciler.tracker().acquired(), reconciler.tracker().released());
    let old = batch1.read().await;
    assert_eq!(old.get(1).unwrap().status(), RecordStatus::Generating);
    assert!(old.get(0).unwrap().image().is_none());
}

#[tokio::test]
async fn duplicate_references_share_one_source() {
    let source = ScriptedSource::new(vec![("same", vec![in_progress("(1/2)"), completed("h")])]);
    let reconciler = ProgressReconciler::with_source(
        unreachable_backend(),
        Arc::clone(&source) as Arc<dyn ProgressSource>,
        noop_callback(),
    );

    let records = reconciler
        .start_with_references(vec!["same".into(), "same".into()])
        .await;
    assert!(settle(&reconciler).await);

    // One source drives both records to the same terminal state.
    assert_eq!(source.runs(), 1);
    let set = records.read().await;
    for record in set.iter() {
        assert_eq!(record.status(), RecordStatus::Completed);
        assert_eq!(record.result_hash(), Some("h"));
    }
}

#[tokio::test]
async fn hanging_status_request_fails_with_timeout() {
    // Accepts the TCP connection but never answers the request.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let backend = Arc::new(ImagineBackend::new(format!("http://{addr}")));
    let source = Arc::new(PollSource::new(
        Arc::clone(&backend),
        PollConfig {
            interval: Duration::from_millis(10),
            timeout: Duration::from_millis(200),
        },
    ));
    let reconciler = ProgressReconciler::with_source(backend, source, noop_callback());

    let records = reconciler.start_with_references(vec!["r0".into()]).await;
    assert!(settle(&reconciler).await);

    let set = records.read().await;
    let record = set.get(0).unwrap();
    assert_eq!(record.status(), RecordStatus::Failed);
    assert_eq!(record.progress_text(), Some("timed out"));
    drop(listener);
}

#[tokio::test]
async fn poll_transport_error_fails_records_independently() {
    let backend = unreachable_backend();
    let source = Arc::new(PollSource::new(
        Arc::clone(&backend),
        PollConfig::default(),
    ));
    let reconciler = ProgressReconciler::with_source(backend, source, noop_callback());

    let records = reconciler
        .start_with_references(vec!["r0".into(), "r1".into()])
        .await;
    assert!(settle(&reconciler).await);

    let set = records.read().await;
    assert_eq!(set.len(), 2);
    for record in set.iter() {
        assert_eq!(record.status(), RecordStatus::Failed);
        assert_eq!(record.progress_text(), Some("stream connection error"));
    }
}

#[tokio::test]
async fn attach_image_rejects_non_completed_records() {
    let source = ScriptedSource::new(vec![("r0", vec![in_progress("(1/20)"), Step::Hang])]);
    let reconciler =
        ProgressReconciler::with_source(unreachable_backend(), source, noop_callback());

    let records = reconciler.start_with_references(vec!["r0".into()]).await;
    wait_until(&records, |set| {
        set.get(0).map(|r| r.status()) == Some(RecordStatus::Generating)
    })
    .await;

    assert!(!reconciler.attach_image(0, vec![1]).await);
    assert!(!reconciler.attach_image(7, vec![1]).await);
    assert_eq!(reconciler.tracker().outstanding(), 0);
}

#[tokio::test]
async fn shutdown_releases_handles_and_clears_batch() {
    let source = ScriptedSource::new(vec![("r0", vec![completed("h0")])]);
    let reconciler =
        ProgressReconciler::with_source(unreachable_backend(), source, noop_callback());

    reconciler.start_with_references(vec!["r0".into()]).await;
    assert!(settle(&reconciler).await);
    assert!(reconciler.attach_image(0, vec![9; 16]).await);
    assert_eq!(reconciler.tracker().outstanding(), 1);

    reconciler.shutdown().await;
    assert_eq!(reconciler.tracker().outstanding(), 0);
    assert!(reconciler.records().await.is_none());
}

#[tokio::test]
async fn validation_error_creates_no_records() {
    let source = ScriptedSource::new(vec![]);
    let reconciler =
        ProgressReconciler::with_source(unreachable_backend(), source, noop_callback());

    let config = GenerationConfig::new("");
    let result = reconciler.start_batch(&config).await;
    assert!(result.is_err());
    assert!(reconciler.records().await.is_none());
}

/// Poll the collection until `pred` holds (or panic after ~1s).
async fn wait_until<F>(records: &Arc<tokio::sync::RwLock<RecordSet>>, pred: F)
where
    F: Fn(&RecordSet) -> bool,
{
    for _ in 0..200 {
        if pred(&*records.read().await) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within deadline");
}
