use std::path::Path;

use anyhow::Context;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::models::{HealthStatus, Notification, Student, StudentProfile};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Request to {url} failed: {source}")]
    Transport { url: String, source: reqwest::Error },

    #[error("{message} ({status})")]
    Status { status: StatusCode, message: String },

    #[error("Unexpected payload from {url}: {source}")]
    Decode { url: String, source: serde_json::Error },
}

/// `--api-base` / `VITE_API_BASE_URL` when set and non-blank, else the local API port.
pub fn resolve_api_base(api_base: Option<&str>, api_port: u16) -> String {
    api_base
        .map(str::trim)
        .map(|value| value.trim_end_matches('/'))
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("http://127.0.0.1:{api_port}"))
}

/// Joins `path` onto `base` unless `path` is already an absolute URL.
pub fn api_url(base: &str, path: &str) -> String {
    let base = base.trim().trim_end_matches('/');
    if path.is_empty() {
        return if base.is_empty() { "/".to_string() } else { base.to_string() };
    }

    let lower = path.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return path.to_string();
    }

    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

/// Picks the message shown for a failed request: `detail`, then `message`.
pub fn error_detail(body: &str, status: StatusCode) -> String {
    let from_body = serde_json::from_str::<Value>(body).ok().and_then(|value| {
        ["detail", "message"].iter().find_map(|key| {
            value
                .get(*key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|text| !text.is_empty())
                .map(str::to_string)
        })
    });

    from_body.unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("Request failed")
            .to_string()
    })
}

/// List endpoints answer with a JSON array; anything else counts as empty.
pub fn decode_list<T: DeserializeOwned>(url: &str, body: &str) -> Result<Vec<T>, ApiError> {
    let value: Value = serde_json::from_str(body).map_err(|source| ApiError::Decode {
        url: url.to_string(),
        source,
    })?;
    if !value.is_array() {
        debug!(url, "list endpoint returned a non-array payload");
        return Ok(Vec::new());
    }
    serde_json::from_value(value).map_err(|source| ApiError::Decode {
        url: url.to_string(),
        source,
    })
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base: String,
}

impl ApiClient {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base: base.into().trim().trim_end_matches('/').to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    async fn get_text(&self, path: &str) -> Result<(String, String), ApiError> {
        let url = api_url(&self.base, path);
        debug!(%url, "GET");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|source| ApiError::Transport {
                url: url.clone(),
                source,
            })?;
        let status = response.status();
        let body = response.text().await.map_err(|source| ApiError::Transport {
            url: url.clone(),
            source,
        })?;

        if !status.is_success() {
            return Err(ApiError::Status {
                status,
                message: error_detail(&body, status),
            });
        }
        Ok((url, body))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let (url, body) = self.get_text(path).await?;
        serde_json::from_str(&body).map_err(|source| ApiError::Decode { url, source })
    }

    pub async fn health(&self) -> Result<HealthStatus, ApiError> {
        self.get_json("/api/health").await
    }

    pub async fn students(&self) -> Result<Vec<Student>, ApiError> {
        let (url, body) = self.get_text("/api/students").await?;
        decode_list(&url, &body)
    }

    pub async fn notifications(&self) -> Result<Vec<Notification>, ApiError> {
        let (url, body) = self.get_text("/api/notifications").await?;
        decode_list(&url, &body)
    }

    pub async fn student_profile(&self, roll_no: &str) -> Result<StudentProfile, ApiError> {
        self.get_json(&format!("/api/students/{}", roll_no.trim()))
            .await
    }
}

pub fn load_students_csv(path: &Path) -> anyhow::Result<Vec<Student>> {
    load_csv(path)
}

pub fn load_notifications_csv(path: &Path) -> anyhow::Result<Vec<Notification>> {
    load_csv(path)
}

fn load_csv<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Vec<T>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut rows = Vec::new();

    for (line, result) in reader.deserialize::<T>().enumerate() {
        let row = result.with_context(|| format!("{}: bad row {}", path.display(), line + 1))?;
        rows.push(row);
    }

    Ok(rows)
}
