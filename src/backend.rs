//! HTTP client for the external DMS backend.
//!
//! Every call forwards the caller's bearer token. Bodies are kept as
//! `serde_json::Value` so backend envelopes reach the browser verbatim.

use reqwest::{multipart, Client, Method, RequestBuilder, Response};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("{message}")]
    Status { status: u16, message: String },

    #[error("Backend unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Backend returned malformed JSON: {0}")]
    Decode(String),
}

impl BackendError {
    /// 4xx answers will not change on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Status { status, .. } => *status >= 500,
            BackendError::Transport(_) => true,
            BackendError::Decode(_) => false,
        }
    }
}

/// A file part forwarded from an upload request.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub field: String,
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Clone)]
pub struct BackendClient {
    http: Client,
    base_url: String,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, path: &str, token: Option<&str>) -> RequestBuilder {
        let url = self.url(path);
        debug!(%method, %url, "backend request");
        let builder = self.http.request(method, url);
        match token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    pub async fn get_json(
        &self,
        path: &str,
        query: &[(String, String)],
        token: &str,
    ) -> Result<Value, BackendError> {
        let res = self
            .request(Method::GET, path, Some(token))
            .query(query)
            .send()
            .await?;
        read_json(res).await
    }

    pub async fn send_json<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &B,
        token: Option<&str>,
    ) -> Result<Value, BackendError> {
        let res = self.request(method, path, token).json(body).send().await?;
        read_json(res).await
    }

    pub async fn delete(&self, path: &str, token: &str) -> Result<Value, BackendError> {
        let res = self.request(Method::DELETE, path, Some(token)).send().await?;
        read_json(res).await
    }

    pub async fn upload(
        &self,
        path: &str,
        files: Vec<UploadFile>,
        fields: Vec<(String, String)>,
        token: &str,
    ) -> Result<Value, BackendError> {
        let mut form = multipart::Form::new();
        for (name, value) in fields {
            form = form.text(name, value);
        }
        for file in files {
            let mut part = multipart::Part::bytes(file.bytes).file_name(file.file_name);
            if let Some(content_type) = &file.content_type {
                part = part.mime_str(content_type)?;
            }
            form = form.part(file.field, part);
        }

        let res = self
            .request(Method::POST, path, Some(token))
            .multipart(form)
            .send()
            .await?;
        read_json(res).await
    }

    /// Opens a long-lived GET; the caller reads the body as a byte stream.
    pub async fn open_stream(&self, path: &str, token: Option<&str>) -> Result<Response, BackendError> {
        let res = self
            .request(Method::GET, path, token)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let text = res.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status,
                message: error_message(&text, status),
            });
        }
        Ok(res)
    }
}

async fn read_json(res: Response) -> Result<Value, BackendError> {
    let status = res.status();
    let text = res.text().await?;

    if !status.is_success() {
        return Err(BackendError::Status {
            status: status.as_u16(),
            message: error_message(&text, status.as_u16()),
        });
    }

    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|e| BackendError::Decode(e.to_string()))
}

/// Prefer the backend's own `message`/`error` field over the raw body.
fn error_message(body: &str, status: u16) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .or_else(|| Some(body.trim().to_string()).filter(|s| !s.is_empty()))
        .unwrap_or_else(|| format!("Backend request failed with status {status}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_paths_without_double_slashes() {
        let client = BackendClient::new("http://backend/api/");
        assert_eq!(client.url("/applications/1"), "http://backend/api/applications/1");
        assert_eq!(client.url("notifications"), "http://backend/api/notifications");
    }

    #[test]
    fn error_message_prefers_envelope_fields() {
        assert_eq!(
            error_message(r#"{"status":"error","message":"Document not found"}"#, 404),
            "Document not found"
        );
        assert_eq!(error_message(r#"{"error":"bad"}"#, 400), "bad");
        assert_eq!(error_message("gateway timeout", 504), "gateway timeout");
        assert_eq!(error_message("", 503), "Backend request failed with status 503");
    }

    #[test]
    fn only_server_side_failures_are_retryable() {
        let not_found = BackendError::Status { status: 404, message: String::new() };
        let unavailable = BackendError::Status { status: 503, message: String::new() };
        assert!(!not_found.is_retryable());
        assert!(unavailable.is_retryable());
    }
}
