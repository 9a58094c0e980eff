//! UMA 2.0 grant: challenge parsing, Authorization Server discovery cache and the
//! ticket-for-RPT exchange.

pub mod auth_server;
pub mod client;

pub use auth_server::{AuthServerRegistry, AuthorizationServer};
pub use client::UmaClient;

use crate::error::GatewayError;

pub const CLAIM_TOKEN_FORMAT_ID_TOKEN: &str =
    "http://openid.net/specs/openid-connect-core-1_0.html#IDToken";
pub const GRANT_TYPE_UMA_TICKET: &str = "urn:ietf:params:oauth:grant-type:uma-ticket";
pub const UMA_DISCOVERY_PATH: &str = "/.well-known/uma2-configuration";

/// Permission ticket challenge carried by a PEP 401.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub as_uri: String,
    pub ticket: String,
}

/// Parse a `WWW-Authenticate` value such as
/// `UMA realm="eoepca",as_uri="https://as.example",ticket="abc-123"`.
///
/// Pairs are comma separated; an auth-scheme prefix and quotes are tolerated and
/// unknown keys ignored. Both `as_uri` and `ticket` must be non-empty.
pub fn unpack_www_authenticate(header: &str) -> Result<Challenge, GatewayError> {
    let mut as_uri = "";
    let mut ticket = "";

    for part in header.split(',') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        // "UMA realm" -> "realm"
        let key = key.trim().rsplit(' ').next().unwrap_or_default();
        let value = value.trim().trim_matches('"').trim();
        match key {
            "as_uri" => as_uri = value,
            "ticket" => ticket = value,
            _ => {}
        }
    }

    if as_uri.is_empty() || ticket.is_empty() {
        return Err(GatewayError::MalformedChallenge(
            "failed to get as_uri and/or ticket".to_string(),
        ));
    }
    Ok(Challenge {
        as_uri: as_uri.to_string(),
        ticket: ticket.to_string(),
    })
}
