use crate::model::{Annotation, DiagnoseResponse};
use base64::{engine::general_purpose, Engine};
use futures::future::{BoxFuture, FutureExt};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Failure of the diagnose call itself, as opposed to an error the service
/// reports inside a successful response.
#[derive(Debug, Error)]
pub enum DiagnoseError {
    #[error("request failed with status code {status}")]
    Status { status: u16, detail: Option<String> },
    #[error("{0}")]
    Transport(String),
    #[error("invalid diagnose response: {0}")]
    Decode(String),
}

impl DiagnoseError {
    /// Human-readable detail supplied by the server, if any.
    pub fn detail(&self) -> Option<&str> {
        match self {
            DiagnoseError::Status { detail, .. } => detail.as_deref().filter(|d| !d.is_empty()),
            _ => None,
        }
    }

    pub fn transport_message(&self) -> Option<String> {
        let message = self.to_string();
        if message.trim().is_empty() {
            None
        } else {
            Some(message)
        }
    }
}

impl From<reqwest::Error> for DiagnoseError {
    fn from(err: reqwest::Error) -> Self {
        DiagnoseError::Transport(err.to_string())
    }
}

/// Message recorded for an item whose diagnose call did not complete.
/// Server detail wins over the transport text, which wins over the generic
/// fallback.
pub fn transport_failure_message(file_name: &str, err: &DiagnoseError) -> String {
    if let Some(detail) = err.detail() {
        return format!("{file_name}: {detail}");
    }
    match err.transport_message() {
        Some(message) => format!("{file_name}: {message}"),
        None => format!("Failed to process {file_name}."),
    }
}

/// The remote upload-and-diagnose call. Futures are boxed and `'static` so
/// the session can hold several of them while a stale one drains.
pub trait DiagnoseClient: Send + Sync {
    fn diagnose(
        &self,
        file_name: String,
        bytes: Vec<u8>,
    ) -> BoxFuture<'static, Result<DiagnoseResponse, DiagnoseError>>;
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    converted_image_base64: Option<String>,
    #[serde(default)]
    annotations: Option<Vec<Annotation>>,
    #[serde(default)]
    diagnostic_report: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireErrorBody {
    #[serde(default)]
    detail: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

pub fn parse_response_body(body: &[u8]) -> Result<DiagnoseResponse, DiagnoseError> {
    let wire: WireResponse =
        serde_json::from_slice(body).map_err(|e| DiagnoseError::Decode(e.to_string()))?;

    let converted_image = match non_empty(wire.converted_image_base64) {
        Some(encoded) => Some(
            general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|e| DiagnoseError::Decode(format!("image payload: {e}")))?,
        ),
        None => None,
    };

    Ok(DiagnoseResponse {
        converted_image,
        annotations: wire.annotations,
        report: non_empty(wire.diagnostic_report),
        error: non_empty(wire.error),
    })
}

fn parse_error_detail(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<WireErrorBody>(body)
        .ok()
        .and_then(|b| non_empty(b.detail))
}

#[derive(Clone)]
pub struct HttpDiagnoseClient {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpDiagnoseClient {
    pub fn new(api_base: &str, timeout: Duration) -> Result<Self, DiagnoseError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: diagnose_endpoint(api_base),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

pub fn diagnose_endpoint(api_base: &str) -> String {
    format!("{}/diagnose", api_base.trim_end_matches('/'))
}

impl DiagnoseClient for HttpDiagnoseClient {
    fn diagnose(
        &self,
        file_name: String,
        bytes: Vec<u8>,
    ) -> BoxFuture<'static, Result<DiagnoseResponse, DiagnoseError>> {
        let http = self.http.clone();
        let endpoint = self.endpoint.clone();
        async move {
            let part = Part::bytes(bytes).file_name(file_name.clone());
            let form = Form::new().part("file", part);
            debug!(%endpoint, file = %file_name, "uploading");

            let resp = http.post(&endpoint).multipart(form).send().await?;
            let status = resp.status();
            let body = resp.bytes().await?;

            if !status.is_success() {
                return Err(DiagnoseError::Status {
                    status: status.as_u16(),
                    detail: parse_error_detail(&body),
                });
            }
            parse_response_body(&body)
        }
        .boxed()
    }
}
