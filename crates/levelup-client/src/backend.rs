//! Interview endpoints of the LevelUp backend.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{AuthTokens, ClientError, InterviewRecord, Result};

/// Request body for `POST /interviews/generate-interview-questions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateInterviewRequest {
    /// Target role.
    pub role: String,

    /// Interview type.
    #[serde(rename = "type")]
    pub interview_type: String,

    /// Seniority level.
    pub level: String,

    /// Technologies to ask about.
    pub techstack: Vec<String>,

    /// Number of questions to generate.
    pub amount: u32,
}

/// Authenticated client for the interview endpoints.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    tokens: AuthTokens,
}

impl BackendClient {
    /// Creates a client with its own connection pool.
    #[must_use]
    pub fn new(base_url: impl Into<String>, tokens: AuthTokens) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, tokens)
    }

    /// Creates a client sharing an existing connection pool.
    #[must_use]
    pub fn with_client(
        http: reqwest::Client,
        base_url: impl Into<String>,
        tokens: AuthTokens,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
        }
    }

    /// Base URL requests are sent to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Fetches one interview by id.
    pub async fn get_interview(&self, id: i64) -> Result<InterviewRecord> {
        debug!(id, "Fetching interview");
        let response = self
            .http
            .get(self.url(&format!("/interviews/{id}")))
            .header(reqwest::header::AUTHORIZATION, self.tokens.authorization_header())
            .send()
            .await?;

        let response = check_status(response, || format!("interview {id}")).await?;
        Ok(response.json().await?)
    }

    /// Lists the signed-in user's interviews, newest first.
    pub async fn list_interviews(&self) -> Result<Vec<InterviewRecord>> {
        debug!("Listing interviews");
        let response = self
            .http
            .get(self.url("/interviews/"))
            .header(reqwest::header::AUTHORIZATION, self.tokens.authorization_header())
            .send()
            .await?;

        let response = check_status(response, || "interview list".to_string()).await?;
        Ok(response.json().await?)
    }

    /// Returns the most recently created interview, if any.
    ///
    /// The backend already orders by `created_at` descending, but the client
    /// picks the latest itself rather than relying on that.
    pub async fn latest_interview(&self) -> Result<Option<InterviewRecord>> {
        let interviews = self.list_interviews().await?;
        Ok(latest_by_created_at(&interviews).cloned())
    }

    /// Asks the backend to generate a new interview.
    pub async fn create_interview(
        &self,
        request: &CreateInterviewRequest,
    ) -> Result<InterviewRecord> {
        info!(role = %request.role, amount = request.amount, "Generating interview");
        let response = self
            .http
            .post(self.url("/interviews/generate-interview-questions"))
            .header(reqwest::header::AUTHORIZATION, self.tokens.authorization_header())
            .json(request)
            .send()
            .await?;

        let response = check_status(response, || "interview generator".to_string()).await?;
        Ok(response.json().await?)
    }
}

/// Returns the record with the greatest `created_at`.
#[must_use]
pub fn latest_by_created_at(interviews: &[InterviewRecord]) -> Option<&InterviewRecord> {
    interviews.iter().max_by_key(|record| record.created_at)
}

async fn check_status(
    response: reqwest::Response,
    resource: impl FnOnce() -> String,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match status.as_u16() {
        401 | 403 => {
            warn!(status = status.as_u16(), "Backend rejected access token");
            Err(ClientError::Unauthorized {
                status: status.as_u16(),
            })
        }
        404 => Err(ClientError::not_found(resource())),
        code => {
            let body: String = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(512)
                .collect();
            Err(ClientError::UnexpectedStatus { status: code, body })
        }
    }
}
