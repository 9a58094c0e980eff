use reqwest::header::CACHE_CONTROL;
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{AuthorizationServer, CLAIM_TOKEN_FORMAT_ID_TOKEN, GRANT_TYPE_UMA_TICKET};
use crate::error::GatewayError;
use crate::transport::ResilientClient;

#[derive(Debug, Default, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    id_token: String,
}

/// UMA client registered with the Authorization Server(s).
#[derive(Debug, Clone)]
pub struct UmaClient {
    client_id: String,
    client_secret: String,
    transport: Arc<ResilientClient>,
}

impl UmaClient {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        transport: Arc<ResilientClient>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            transport,
        }
    }

    /// Exchange a permission ticket for an RPT, presenting the user's ID token as claim.
    ///
    /// A 403 from the token endpoint is reported as [`GatewayError::Forbidden`]; every
    /// other non-200 answer is a [`GatewayError::TokenEndpointError`].
    pub async fn exchange_ticket_for_rpt(
        &self,
        server: &AuthorizationServer,
        id_token: &str,
        ticket: &str,
    ) -> Result<String, GatewayError> {
        if id_token.is_empty() {
            return Err(GatewayError::MissingAttributes {
                diagnostic: "missing user ID token to exchange ticket for RPT".to_string(),
            });
        }
        let endpoint = self.token_endpoint(server).await?;

        let params = [
            ("claim_token_format", CLAIM_TOKEN_FORMAT_ID_TOKEN),
            ("claim_token", id_token),
            ("ticket", ticket),
            ("grant_type", GRANT_TYPE_UMA_TICKET),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", "openid"),
        ];
        debug!(%endpoint, "requesting RPT from token endpoint");
        let body = self.post_token_request(&endpoint, &params, "exchange ticket for rpt").await?;

        if body.access_token.trim().is_empty() {
            return Err(GatewayError::EmptyRpt { endpoint });
        }
        Ok(body.access_token)
    }

    /// OAuth password grant for a user ID token. Operator and testing aid, not part of
    /// the request path.
    pub async fn password_grant_id_token(
        &self,
        server: &AuthorizationServer,
        username: &str,
        password: &str,
    ) -> Result<String, GatewayError> {
        let endpoint = self.token_endpoint(server).await?;
        let params = [
            ("scope", "openid user_name"),
            ("grant_type", "password"),
            ("username", username),
            ("password", password),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        let body = self.post_token_request(&endpoint, &params, "password grant").await?;
        if body.id_token.trim().is_empty() {
            return Err(GatewayError::TokenEndpointError {
                endpoint,
                reason: "no id_token in response".to_string(),
            });
        }
        Ok(body.id_token)
    }

    async fn token_endpoint(&self, server: &AuthorizationServer) -> Result<String, GatewayError> {
        match server.token_endpoint() {
            Some(endpoint) => Ok(endpoint.to_string()),
            None => server.clone().fetch_token_endpoint(&self.transport).await,
        }
    }

    async fn post_token_request(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
        reason: &str,
    ) -> Result<TokenResponse, GatewayError> {
        let failed = |reason: String| GatewayError::TokenEndpointError {
            endpoint: endpoint.to_string(),
            reason,
        };

        let request = self
            .transport
            .client()
            .post(endpoint)
            .header(CACHE_CONTROL, "no-cache")
            .form(params)
            .build()
            .map_err(|e| failed(format!("preparing request: {e}")))?;
        let response = self
            .transport
            .send(request, reason)
            .await
            .map_err(|e| failed(e.to_string()))?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::FORBIDDEN => {
                warn!(endpoint, "access request is FORBIDDEN (403) by token endpoint");
                return Err(GatewayError::Forbidden {
                    endpoint: endpoint.to_string(),
                });
            }
            other => return Err(failed(format!("unexpected response code {other}"))),
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| failed(format!("could not interpret json response: {e}")))
    }
}
