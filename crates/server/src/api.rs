//! Outbound client for the identity / chart / record service.

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid credentials")]
    Unauthorized,
    #[error("not found")]
    NotFound,
    #[error("service responded with status {0}")]
    Status(StatusCode),
    #[error("service unreachable: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Me {
    pub id: i32,
    pub name: String,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chart {
    pub id: i32,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: i32,
    pub player: i32,
    pub score: i32,
    pub accuracy: f32,
    pub full_combo: bool,
}

pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("http client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Resolves a bearer token to the account it belongs to.
    pub async fn me(&self, token: &str) -> Result<Me, ApiError> {
        let response = self
            .client
            .get(format!("{}/me", self.base_url))
            .bearer_auth(token)
            .send()
            .await?;
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ApiError::Unauthorized),
            status if !status.is_success() => Err(ApiError::Status(status)),
            _ => Ok(response.json().await?),
        }
    }

    pub async fn chart(&self, id: i32) -> Result<Chart, ApiError> {
        let response = self
            .client
            .get(format!("{}/chart/{id}", self.base_url))
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(ApiError::NotFound),
            status if !status.is_success() => Err(ApiError::Status(status)),
            _ => Ok(response.json().await?),
        }
    }

    /// Chart display name with a local fallback. Chart metadata is cosmetic
    /// and must never block a room operation.
    pub async fn chart_name(&self, id: i32) -> String {
        match self.chart(id).await {
            Ok(chart) => chart.name,
            Err(error) => {
                tracing::debug!(chart = id, %error, "chart lookup failed, using fallback name");
                format!("Chart{id}")
            }
        }
    }

    pub async fn record(&self, id: i32) -> Result<Record, ApiError> {
        let response = self
            .client
            .get(format!("{}/record/{id}", self.base_url))
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(ApiError::NotFound),
            status if !status.is_success() => Err(ApiError::Status(status)),
            _ => Ok(response.json().await?),
        }
    }
}
