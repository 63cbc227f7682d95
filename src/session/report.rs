//! Hands the finished session record to the report service.

use crate::assessment::model::SessionState;
use crate::error::{AppError, AppResult};
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Serialize)]
struct FinalizeRequest<'a> {
    email: &'a str,
    assessment: &'a SessionState,
}

pub struct ReportClient {
    http: reqwest::Client,
    endpoint: String,
}

impl ReportClient {
    pub fn new(endpoint: impl Into<String>) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }

    /// POST `{email, assessment}` and wait for the service to accept it.
    pub async fn finalize(&self, email: &str, state: &SessionState) -> AppResult<()> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&FinalizeRequest { email, assessment: state })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, body = %body, "Report service rejected the assessment");
            return Err(AppError::Transport(format!(
                "report service answered {}",
                status
            )));
        }

        info!(endpoint = %self.endpoint, "Assessment report submitted");
        Ok(())
    }
}
