use axum::http::header::COOKIE;
use axum::http::HeaderMap;

use crate::agent::config::Config;
use crate::error::GatewayError;

pub const HEADER_ORIGINAL_URI: &str = "X-Original-Uri";
pub const HEADER_ORIGINAL_METHOD: &str = "X-Original-Method";
pub const HEADER_USER_ID: &str = "X-User-Id";

/// One inbound authorization request, owned by the decision engine for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessAttempt {
    pub original_uri: String,
    pub original_method: String,
    pub identity_token: String,
    /// Requesting Party Token, from a cookie or a ticket exchange.
    pub rpt: Option<String>,
    /// PEP calls made so far.
    pub attempts: u32,
}

impl AccessAttempt {
    /// Extract the attempt from proxy-forwarded headers and cookies.
    ///
    /// The identity token comes from `X-User-Id`, falling back to the configured cookie.
    /// A previously issued RPT cookie is picked up for a warm start.
    pub fn from_headers(headers: &HeaderMap, config: &Config) -> Result<Self, GatewayError> {
        let original_uri = header_value(headers, HEADER_ORIGINAL_URI).unwrap_or_default();
        let original_method = header_value(headers, HEADER_ORIGINAL_METHOD).unwrap_or_default();
        let identity_token = header_value(headers, HEADER_USER_ID)
            .or_else(|| cookie_value(headers, &config.user_id_cookie_name))
            .unwrap_or_default();

        if original_uri.is_empty() || original_method.is_empty() || identity_token.is_empty() {
            return Err(GatewayError::MissingAttributes {
                diagnostic: diagnostic(
                    &original_uri,
                    &original_method,
                    !identity_token.is_empty(),
                    &config.user_id_cookie_name,
                ),
            });
        }

        Ok(Self {
            original_uri,
            original_method,
            identity_token,
            rpt: cookie_value(headers, &config.rpt_cookie_name),
            attempts: 0,
        })
    }

    pub fn has_rpt(&self) -> bool {
        self.rpt.as_deref().is_some_and(|r| !r.is_empty())
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// First non-empty value of cookie `name` across all `Cookie` headers.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, v)| k.trim() == name && !v.trim().is_empty())
        .map(|(_, v)| v.trim().trim_matches('"').to_string())
}

fn diagnostic(uri: &str, method: &str, has_identity: bool, cookie_name: &str) -> String {
    let identity = if has_identity { "<present>" } else { "" };
    format!(
        "ERROR: Expecting non-zero values for the following data...\n\
         \x20 Original URI:    {uri}\n    [header {HEADER_ORIGINAL_URI}]\n\
         \x20 Original Method: {method}\n    [header {HEADER_ORIGINAL_METHOD}]\n\
         \x20 User ID Token:   {identity}\n    [header {HEADER_USER_ID} or cookie '{cookie_name}']\n"
    )
}
