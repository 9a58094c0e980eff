use reqwest::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use std::sync::Arc;
use tracing::trace;

use super::{ResilientClient, TransportError};
use crate::security::intake::{
    AccessAttempt, HEADER_ORIGINAL_METHOD, HEADER_ORIGINAL_URI, HEADER_USER_ID,
};

/// What the orchestrator needs from a PEP answer.
#[derive(Debug, Clone)]
pub struct PepResponse {
    pub status: StatusCode,
    pub www_authenticate: Option<String>,
}

/// Client for the PEP `auth_request` endpoint.
#[derive(Debug, Clone)]
pub struct PepClient {
    url: String,
    transport: Arc<ResilientClient>,
}

impl PepClient {
    pub fn new(url: impl Into<String>, transport: Arc<ResilientClient>) -> Self {
        Self {
            url: url.into(),
            transport,
        }
    }

    /// GET the PEP with the original request attributes, and the RPT as bearer if held.
    ///
    /// Only a failed transport yields `Err`; any HTTP status is an `Ok`.
    pub async fn call(&self, attempt: &AccessAttempt) -> Result<PepResponse, TransportError> {
        let mut builder = self
            .transport
            .client()
            .get(&self.url)
            .header(HEADER_ORIGINAL_URI, &attempt.original_uri)
            .header(HEADER_ORIGINAL_METHOD, &attempt.original_method)
            .header(HEADER_USER_ID, &attempt.identity_token);
        if let Some(rpt) = attempt.rpt.as_deref().filter(|r| !r.is_empty()) {
            builder = builder.header(AUTHORIZATION, format!("Bearer {rpt}"));
        }
        let request = builder.build().map_err(TransportError::Request)?;

        trace!(url = %self.url, with_rpt = attempt.has_rpt(), "calling PEP auth_request");
        let response = self.transport.send(request, "pep auth_request").await?;

        let www_authenticate = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Ok(PepResponse {
            status: response.status(),
            www_authenticate,
        })
    }
}
