//! `imagineit-panel` -- command-line stand-in for the browser panel.
//!
//! Dispatches one generation batch, prints reconciled progress as it
//! arrives, and fetches the completed images once the batch settles.
//!
//! # Environment variables
//!
//! | Variable                       | Required | Default | Description                                  |
//! |--------------------------------|----------|---------|----------------------------------------------|
//! | `IMAGINEIT_API_URL`            | yes      | --      | Backend base URL, e.g. `http://host:8795`    |
//! | `IMAGINEIT_MODE`               | no       | `poll`  | Update-source strategy: `poll` or `stream`   |
//! | `IMAGINEIT_POLL_INTERVAL_MS`   | no       | `100`   | Poll interval (poll mode only)               |
//! | `IMAGINEIT_BATCH_SIZE`         | no       | `1`     | Images per inference call                    |
//! | `IMAGINEIT_INFERENCE_COUNT`    | no       | `1`     | Number of inference calls                    |
//! | `IMAGINEIT_NEGATIVE_PROMPT`    | no       | empty   | Negative prompt                              |
//! | `IMAGINEIT_SEED`               | no       | random  | Fixed seed                                   |
//! | `IMAGINEIT_COMPRESSION_LEVEL`  | no       | `0`     | Server-side downscale level for result fetch |
//!
//! The prompt is taken from the command-line arguments.

use std::sync::Arc;
use std::time::Duration;

use imagineit_backend::error::DispatchError;
use imagineit_backend::ImagineBackend;
use imagineit_core::generation::GenerationConfig;
use imagineit_progress::{
    PollConfig, ProgressReconciler, RecordSet, RecordUpdate, SourceMode, UpdateCallback,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Default poll interval in milliseconds.
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "imagineit_panel=info,imagineit_progress=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let api_url = std::env::var("IMAGINEIT_API_URL").unwrap_or_else(|_| {
        tracing::error!("IMAGINEIT_API_URL environment variable is required");
        std::process::exit(1);
    });

    let prompt: String = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if prompt.is_empty() {
        tracing::error!("Usage: imagineit-panel <prompt...>");
        std::process::exit(1);
    }

    let mode = match std::env::var("IMAGINEIT_MODE").as_deref() {
        Ok("stream") => SourceMode::Stream,
        Ok("poll") | Err(_) => SourceMode::Poll(poll_config_from_env()),
        Ok(other) => {
            tracing::error!(mode = %other, "IMAGINEIT_MODE must be 'poll' or 'stream'");
            std::process::exit(1);
        }
    };

    let config = GenerationConfig {
        negative_prompt: env_or_default("IMAGINEIT_NEGATIVE_PROMPT", String::new()),
        seed: std::env::var("IMAGINEIT_SEED").ok().and_then(|v| v.parse().ok()),
        batch_size: env_or_default("IMAGINEIT_BATCH_SIZE", 1),
        inference_count: env_or_default("IMAGINEIT_INFERENCE_COUNT", 1),
        ..GenerationConfig::new(prompt)
    };

    let backend = Arc::new(ImagineBackend::new(api_url));
    let reconciler = ProgressReconciler::new(Arc::clone(&backend), mode, print_updates());

    tracing::info!(
        prompt = %config.prompt,
        count = config.requested_count(),
        "Dispatching generation batch",
    );

    if let Err(e) = reconciler.start_batch(&config).await {
        match e {
            DispatchError::Validation(err) => tracing::error!(error = %err, "Invalid request"),
            DispatchError::Backend(err) => tracing::error!(error = %err, "Dispatch failed"),
        }
        std::process::exit(1);
    }

    if !reconciler.wait_settled().await {
        tracing::error!("Batch did not settle");
        std::process::exit(1);
    }

    fetch_results(&backend, &reconciler).await;
    reconciler.shutdown().await;
}

/// Update callback: log every changed record from the current snapshot.
fn print_updates() -> UpdateCallback {
    Arc::new(|set: &RecordSet, updates: &[RecordUpdate]| {
        for update in updates {
            if let Some(record) = set.get(update.index) {
                tracing::info!(
                    index = record.index(),
                    status = ?record.status(),
                    progress = record.progress_text().unwrap_or(""),
                    "Record updated",
                );
            }
        }
    })
}

/// Resolve every completed record's hash to image bytes and attach the
/// display handles, reporting the decoded dimensions.
async fn fetch_results(backend: &ImagineBackend, reconciler: &ProgressReconciler) {
    let Some(records) = reconciler.records().await else {
        return;
    };
    let level: u32 = env_or_default("IMAGINEIT_COMPRESSION_LEVEL", 0);

    let completed: Vec<(usize, String)> = {
        let set = records.read().await;
        set.iter()
            .filter_map(|r| r.result_hash().map(|h| (r.index(), h.to_string())))
            .collect()
    };

    for (index, hash) in completed {
        match backend.fetch_image(&hash, level).await {
            Ok(bytes) => {
                match image::load_from_memory(&bytes) {
                    Ok(img) => tracing::info!(
                        index,
                        hash = %hash,
                        width = img.width(),
                        height = img.height(),
                        bytes = bytes.len(),
                        "Fetched result image",
                    ),
                    Err(e) => tracing::warn!(index, hash = %hash, error = %e, "Result is not a decodable image"),
                }
                reconciler.attach_image(index, bytes).await;
            }
            Err(e) => {
                tracing::warn!(index, hash = %hash, error = %e, "Failed to fetch result image");
            }
        }
    }

    let set = records.read().await;
    let completed = set
        .iter()
        .filter(|r| r.result_hash().is_some())
        .count();
    tracing::info!(
        total = set.len(),
        completed,
        failed = set.len() - completed,
        "Batch finished",
    );
}

fn poll_config_from_env() -> PollConfig {
    let interval_ms: u64 = env_or_default("IMAGINEIT_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS);
    PollConfig {
        interval: Duration::from_millis(interval_ms),
        ..PollConfig::default()
    }
}

fn env_or_default<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
