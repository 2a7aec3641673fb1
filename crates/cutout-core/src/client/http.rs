use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, Url};
use serde::Deserialize;
use tracing::debug;

use super::{RemoteError, SegmentClient, SegmentRequest, SegmentResult, Upload};
use crate::queue::registry::CancelSignal;

/// Connect timeout for the underlying HTTP client.  The overall request
/// deadline is enforced by the queue, not here.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Error body returned by the segmentation service on non-2xx responses.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// [`SegmentClient`] backed by the segmentation service's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpSegmentClient {
    http: Client,
    base_url: String,
}

impl HttpSegmentClient {
    /// Create a client for the service rooted at `base_url`
    /// (e.g. `http://localhost:8000`).
    pub fn new(base_url: impl Into<String>) -> Result<Self, RemoteError> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        Ok(Self::with_client(http, base_url))
    }

    /// Wrap an existing `reqwest::Client`.
    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Self { http, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/{}", self.base_url, path)
    }

    fn segment_form(request: SegmentRequest) -> Result<Form, RemoteError> {
        let params = request.params;
        let mut form = Form::new()
            .text("threshold", params.threshold.to_string())
            .text("feather", params.feather.to_string())
            .text("padding", params.padding.to_string())
            .text("auto_enhance", params.auto_enhance.to_string())
            .text("focus_mode", params.focus_mode.to_string())
            .text("allow_border_touch", params.allow_border_touch.to_string())
            .text("processing_mode", params.processing_mode.to_string());
        if let Some(index) = params.candidate_index {
            form = form.text("candidate_index", index.to_string());
        }

        let form = match request.upload {
            Upload::FileId(file_id) => form.text("file_id", file_id),
            Upload::File { name, mime, bytes } => {
                let mut part = Part::bytes(bytes.to_vec()).file_name(name);
                if let Some(mime) = mime {
                    part = part
                        .mime_str(&mime)
                        .map_err(|e| RemoteError::Transport(e.to_string()))?;
                }
                form.part("file", part)
            }
        };
        Ok(form)
    }
}

#[async_trait]
impl SegmentClient for HttpSegmentClient {
    async fn segment(
        &self,
        request: SegmentRequest,
        cancel: CancelSignal,
    ) -> Result<SegmentResult, RemoteError> {
        let form = Self::segment_form(request)?;
        let call = async {
            let response = self
                .http
                .post(self.url("segment"))
                .multipart(form)
                .send()
                .await
                .map_err(transport)?;
            decode_json(response).await
        };

        // Dropping `call` aborts the in-flight HTTP request.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("segment request aborted");
                Err(RemoteError::Aborted)
            }
            result = call => result,
        }
    }

    async fn job(&self, job_id: &str) -> Result<SegmentResult, RemoteError> {
        let response = self
            .http
            .get(self.url(&format!("job/{job_id}")))
            .send()
            .await
            .map_err(transport)?;
        decode_json(response).await
    }

    async fn download_zip(&self, job_ids: &[String]) -> Result<Bytes, RemoteError> {
        let mut url = Url::parse(&self.url("download_zip"))
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        url.query_pairs_mut().append_pair("ids", &job_ids.join(","));
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(transport)?;
        let response = ensure_success(response).await?;
        response.bytes().await.map_err(transport)
    }
}

fn transport(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Transport(format!("timeout: {e}"))
    } else {
        RemoteError::Transport(e.to_string())
    }
}

async fn ensure_success(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(rejection(status.as_u16(), &body))
}

async fn decode_json(response: Response) -> Result<SegmentResult, RemoteError> {
    let response = ensure_success(response).await?;
    let body = response.bytes().await.map_err(transport)?;
    serde_json::from_slice(&body).map_err(|e| RemoteError::Decode(e.to_string()))
}

/// Build a [`RemoteError::Rejected`] from a non-2xx body, preferring the
/// service's `{"error": "..."}` message over the raw text.
fn rejection(status: u16, body: &str) -> RemoteError {
    let message = match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => parsed.error,
        Err(_) if body.trim().is_empty() => format!("server returned status {status}"),
        Err(_) => body.trim().to_owned(),
    };
    RemoteError::Rejected { status, message }
}
