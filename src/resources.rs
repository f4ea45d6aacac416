//! HTTP adapters for the resource ports the orchestrator looks things up
//! through: versioned form definitions and per-page channel credentials,
//! both served by the survey-management service.

use async_trait::async_trait;
use serde::Deserialize;

use crate::engine::forms::FormDefinition;
use crate::transition::{CredentialStore, FormSource, LookupError};

#[derive(Debug, Deserialize)]
struct FormEnvelope {
    form: FormDefinition,
    surveyid: String,
}

#[derive(Debug, Deserialize)]
struct CredentialEnvelope {
    token: String,
}

#[derive(Debug, Clone)]
pub struct HttpResources {
    http: reqwest::Client,
    base_url: String,
}

impl HttpResources {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn fetch<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, LookupError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| LookupError(format!("request to {url} failed: {e}")))?
            .error_for_status()
            .map_err(|e| LookupError(format!("{url} returned an error status: {e}")))?;
        response
            .json()
            .await
            .map_err(|e| LookupError(format!("{url} returned an unreadable body: {e}")))
    }
}

#[async_trait]
impl FormSource for HttpResources {
    /// The form as it stood when the conversation started, so mid-survey
    /// edits do not shift questions under an active user.
    async fn form(
        &self,
        page: &str,
        shortcode: &str,
        as_of: Option<i64>,
    ) -> Result<(FormDefinition, String), LookupError> {
        let mut url = format!("{}/forms/{page}/{shortcode}", self.base_url);
        if let Some(timestamp) = as_of {
            url.push_str(&format!("?timestamp={timestamp}"));
        }
        let envelope: FormEnvelope = self.fetch(&url).await?;
        Ok((envelope.form, envelope.surveyid))
    }
}

#[async_trait]
impl CredentialStore for HttpResources {
    async fn page_credential(&self, page: &str) -> Result<String, LookupError> {
        let url = format!("{}/credentials/{page}", self.base_url);
        let envelope: CredentialEnvelope = self.fetch(&url).await?;
        Ok(envelope.token)
    }
}
