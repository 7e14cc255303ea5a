//! Dispatch error-path tests that need no live backend.

use assert_matches::assert_matches;
use imagineit_backend::{BackendError, DispatchError, ImagineBackend};
use imagineit_core::generation::GenerationConfig;

#[tokio::test]
async fn empty_prompt_fails_before_any_network_call() {
    // Nothing listens here; validation must short-circuit the request.
    let backend = ImagineBackend::new("http://127.0.0.1:1".to_string());
    let config = GenerationConfig::new("");

    let err = backend.dispatch(&config).await.unwrap_err();
    assert_matches!(err, DispatchError::Validation(_));
}

#[tokio::test]
async fn unreachable_backend_is_a_connectivity_error() {
    let backend = ImagineBackend::new("http://127.0.0.1:1".to_string());
    let config = GenerationConfig::new("a cat");

    let err = backend.dispatch(&config).await.unwrap_err();
    assert_matches!(err, DispatchError::Backend(BackendError::Request(_)));
}
