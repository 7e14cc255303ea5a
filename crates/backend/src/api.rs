//! REST client for the imagineit backend HTTP endpoints.
//!
//! Wraps the generation dispatch, status polling, image retrieval, and
//! curation endpoints (labels, deletion, training-image upload, zip
//! export, LoRA mounting) using [`reqwest`].

use imagineit_core::generation::GenerationConfig;
use imagineit_core::types::{ImageHash, JobRef};
use serde::{Deserialize, Serialize};

use crate::error::{BackendError, DispatchError};
use crate::messages::{ReferenceReply, StatusPayload};

/// HTTP client for a single imagineit backend.
pub struct ImagineBackend {
    pub(crate) client: reqwest::Client,
    pub(crate) api_url: String,
}

/// Filters for the stored-image hash listing.
#[derive(Debug, Clone, Default)]
pub struct HashListFilter {
    /// Keep images whose prompt contains any of these comma-separated tags.
    pub include_prompt: Option<String>,
    /// Keep images whose negative prompt contains any of these tags.
    pub include_negative_prompt: Option<String>,
    /// Drop images whose prompt contains any of these tags.
    pub exclude_prompt: Option<String>,
    /// Drop images whose negative prompt contains any of these tags.
    pub exclude_negative_prompt: Option<String>,
    /// Keep only labeled (`true`) or unlabeled (`false`) images.
    pub labeled: Option<bool>,
}

/// Request for the zip export endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ZipExportRequest {
    /// Archive name (without extension) when saved server-side.
    pub zip_file_name: String,
    /// Lay the archive out as labeled training data (image + caption
    /// text file per hash) instead of plain images.
    pub is_train_data: bool,
    /// Hashes to include.
    pub img_hashes: Vec<ImageHash>,
    /// Return the archive bytes inline instead of saving server-side.
    pub return_file: bool,
}

/// Reply of the zip export endpoint.
#[derive(Debug)]
pub struct ZipExportReply {
    /// Archive bytes, present when `return_file` was set.
    pub file: Option<Vec<u8>>,
}

#[derive(Debug, Deserialize)]
struct ZipExportBody {
    #[serde(default)]
    file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PromptBody {
    prompt: String,
}

#[derive(Debug, Deserialize)]
struct LabelBody {
    label: String,
}

#[derive(Debug, Deserialize)]
struct ReferenceBody {
    reference: JobRef,
}

impl ImagineBackend {
    /// Create a new client for a backend instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8795`.
    pub fn new(api_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url,
        }
    }

    /// Create a client reusing an existing [`reqwest::Client`]
    /// (useful for connection pooling).
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self { client, api_url }
    }

    /// Base HTTP API URL.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    // ---- generation ----

    /// Dispatch one batched generation request.
    ///
    /// Validates the config, sends a `POST /v1/inference`, and returns the
    /// ordered per-image job references. Both reply shapes (list of
    /// references, single combined reference) are accepted; after
    /// normalization the list length must equal
    /// [`GenerationConfig::requested_count`] or the dispatch fails with a
    /// protocol error.
    pub async fn dispatch(&self, config: &GenerationConfig) -> Result<Vec<JobRef>, DispatchError> {
        config.validate()?;

        let body = serde_json::json!({
            "prompt": config.prompt,
            "negative_prompt": config.negative_prompt,
            "width": config.width,
            "height": config.height,
            "num_inference_steps": config.steps,
            "guidance_scale": config.guidance_scale,
            "seed": config.seed,
            "batch_size": config.batch_size,
            "inference_size": config.inference_count,
        });

        let response = self
            .client
            .post(format!("{}/v1/inference", self.api_url))
            .json(&body)
            .send()
            .await
            .map_err(BackendError::from)?;

        let reply: ReferenceReply = Self::parse_response(response).await?;
        let references = reply.into_list();
        verify_reference_count(&references, config.requested_count())
            .map_err(BackendError::Protocol)?;

        tracing::info!(
            count = references.len(),
            prompt = %config.prompt,
            "Generation dispatched",
        );
        Ok(references)
    }

    /// Fetch the current status of one job reference.
    ///
    /// Sends a `GET /api/v1/imagine/progress/{reference}` request. Used by
    /// the polling update source.
    pub async fn progress(&self, reference: &str) -> Result<StatusPayload, BackendError> {
        let response = self
            .client
            .get(format!(
                "{}/api/v1/imagine/progress/{}",
                self.api_url, reference
            ))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    // ---- images ----

    /// Fetch a stored image by content hash.
    ///
    /// `compression_level` selects a server-side downscale: the returned
    /// image is shrunk by `2^level` per axis (0 = full size).
    pub async fn fetch_image(
        &self,
        hash: &str,
        compression_level: u32,
    ) -> Result<Vec<u8>, BackendError> {
        let response = self
            .client
            .get(format!("{}/api/v1/{}/image", self.api_url, hash))
            .query(&[("compression_level", compression_level)])
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Delete a stored image by content hash.
    pub async fn delete_image(&self, hash: &str) -> Result<(), BackendError> {
        let response = self
            .client
            .delete(format!("{}/api/v1/{}/image", self.api_url, hash))
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// List stored image hashes, optionally filtered.
    pub async fn image_hashes(
        &self,
        filter: &HashListFilter,
    ) -> Result<Vec<ImageHash>, BackendError> {
        let mut request = self
            .client
            .get(format!("{}/api/v1/imghashlist", self.api_url));
        if let Some(ref v) = filter.include_prompt {
            request = request.query(&[("include_filter_prompt", v)]);
        }
        if let Some(ref v) = filter.include_negative_prompt {
            request = request.query(&[("include_filter_negative_prompt", v)]);
        }
        if let Some(ref v) = filter.exclude_prompt {
            request = request.query(&[("exclude_filter_prompt", v)]);
        }
        if let Some(ref v) = filter.exclude_negative_prompt {
            request = request.query(&[("exclude_filter_negative_prompt", v)]);
        }
        if let Some(labeled) = filter.labeled {
            request = request.query(&[("labeled", labeled)]);
        }

        let response = request.send().await?;
        Self::parse_response(response).await
    }

    /// Check that the backend is up.
    ///
    /// Sends a `GET /api/v1/status` request and discards the body.
    pub async fn status(&self) -> Result<(), BackendError> {
        let response = self
            .client
            .get(format!("{}/api/v1/status", self.api_url))
            .send()
            .await?;

        Self::check_status(response).await
    }

    // ---- curation ----

    /// Read back the prompt an image was generated with.
    pub async fn prompt(&self, hash: &str) -> Result<String, BackendError> {
        let response = self
            .client
            .get(format!("{}/api/v1/{}/prompt", self.api_url, hash))
            .send()
            .await?;

        let body: PromptBody = Self::parse_response(response).await?;
        Ok(body.prompt)
    }

    /// Read an image's label.
    pub async fn label(&self, hash: &str) -> Result<String, BackendError> {
        let response = self
            .client
            .get(format!("{}/api/v1/{}/label", self.api_url, hash))
            .send()
            .await?;

        let body: LabelBody = Self::parse_response(response).await?;
        Ok(body.label)
    }

    /// Store an image's label, marking it as labeled.
    pub async fn set_label(&self, hash: &str, label: &str) -> Result<(), BackendError> {
        let response = self
            .client
            .put(format!("{}/api/v1/{}/label", self.api_url, hash))
            .query(&[("label", label)])
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// List the distinct tags appearing across stored prompts.
    pub async fn tags(&self) -> Result<Vec<String>, BackendError> {
        let response = self
            .client
            .get(format!("{}/api/v1/tags", self.api_url))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Upload a cropped training image, returning its storage reference.
    ///
    /// The backend takes the image bytes hex-encoded in the JSON body with
    /// the dimensions as query parameters.
    pub async fn upload_train_image(
        &self,
        width: u32,
        height: u32,
        png_bytes: &[u8],
    ) -> Result<JobRef, BackendError> {
        let body = serde_json::json!({ "image": hex::encode(png_bytes) });
        let response = self
            .client
            .post(format!("{}/api/v1/train/image", self.api_url))
            .query(&[("width", width), ("height", height)])
            .json(&body)
            .send()
            .await?;

        let body: ReferenceBody = Self::parse_response(response).await?;
        Ok(body.reference)
    }

    /// Export a curated set of images as a zip archive.
    ///
    /// When `return_file` is set, the archive bytes come back inline
    /// (hex-encoded by the backend, decoded here); otherwise the backend
    /// saves the archive server-side.
    pub async fn export_zip(
        &self,
        request: &ZipExportRequest,
    ) -> Result<ZipExportReply, BackendError> {
        let response = self
            .client
            .post(format!("{}/api/v1/zipfile", self.api_url))
            .json(request)
            .send()
            .await?;

        let body: ZipExportBody = Self::parse_response(response).await?;
        let file = match body.file {
            Some(encoded) => Some(
                hex::decode(&encoded)
                    .map_err(|e| BackendError::Protocol(format!("Bad zip payload: {e}")))?,
            ),
            None => None,
        };
        Ok(ZipExportReply { file })
    }

    /// Mount LoRA adapters by name, with optional per-adapter weights.
    ///
    /// Weights are forwarded verbatim; the backend owns their semantics.
    pub async fn mount_loras(
        &self,
        names: &[String],
        weights: Option<&[f64]>,
    ) -> Result<(), BackendError> {
        let body = serde_json::json!({
            "loras": names,
            "adapter_weights": weights,
        });
        let response = self
            .client
            .post(format!("{}/api/v1/lora-mount", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::check_status(response).await
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the response
    /// unchanged on success, or a [`BackendError::Api`] with the status
    /// and body text on failure.
    pub(crate) async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, BackendError> {
        let status = response.status();
        if !status.is_success() {
            let detail = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(BackendError::Api {
                status: status.as_u16(),
                detail,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    ///
    /// The backend signals some application errors as a 200 with an
    /// `{"error": "..."}` body; those are surfaced as [`BackendError::Api`]
    /// rather than a deserialization failure.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, BackendError> {
        let response = Self::ensure_success(response).await?;
        let status = response.status().as_u16();
        let value: serde_json::Value = response.json().await?;

        if let Some(detail) = value.get("error").and_then(|e| e.as_str()) {
            return Err(BackendError::Api {
                status,
                detail: detail.to_string(),
            });
        }

        serde_json::from_value(value)
            .map_err(|e| BackendError::Protocol(format!("Unexpected response shape: {e}")))
    }

    /// Assert the response has a success status code, discarding the body.
    async fn check_status(response: reqwest::Response) -> Result<(), BackendError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

/// Check that the normalized reference list matches the requested count.
fn verify_reference_count(references: &[JobRef], expected: usize) -> Result<(), String> {
    if references.len() != expected {
        return Err(format!(
            "Expected {expected} job references, backend returned {}",
            references.len()
        ));
    }
    Ok(())
}
