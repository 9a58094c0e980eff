//! Failure taxonomy of the authorization decision path.
//!
//! Every variant is converted into a definitive HTTP answer by the decision engine;
//! none of them ever reaches the proxy as an unhandled fault.

use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Mandatory intake attributes absent. Carries the diagnostic body sent to the caller.
    #[error("mandatory request attributes missing")]
    MissingAttributes { diagnostic: String },

    /// Outbound call could not complete after the transport retries.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// PEP 401 without a usable `WWW-Authenticate` challenge.
    #[error("malformed UMA challenge: {0}")]
    MalformedChallenge(String),

    #[error("authorization server unavailable: {0}")]
    AuthServerUnavailable(String),

    /// UMA discovery document unreachable, unparsable or without a token endpoint.
    #[error("discovery failed at {url}: {reason}")]
    DiscoveryFailed { url: String, reason: String },

    /// The Authorization Server refused the ticket (HTTP 403).
    #[error("access request forbidden by token endpoint {endpoint}")]
    Forbidden { endpoint: String },

    #[error("token endpoint {endpoint} failed: {reason}")]
    TokenEndpointError { endpoint: String, reason: String },

    #[error("token endpoint {endpoint} returned a blank RPT")]
    EmptyRpt { endpoint: String },

    #[error("authorization retry budget exhausted after {attempts} PEP calls: {last}")]
    RetryBudgetExhausted { attempts: u32, last: String },
}

impl GatewayError {
    pub fn is_forbidden(&self) -> bool {
        matches!(self, GatewayError::Forbidden { .. })
    }

    /// Response body for the proxy. Internal detail (endpoints, causes) stays in the log.
    pub fn public_message(&self) -> &'static str {
        match self {
            GatewayError::MissingAttributes { .. } => "mandatory request attributes missing",
            GatewayError::Transport(_) => "error making call to the pep auth_request endpoint",
            GatewayError::MalformedChallenge(_) => "could not parse the Www-Authenticate header",
            GatewayError::AuthServerUnavailable(_) | GatewayError::DiscoveryFailed { .. } => {
                "error getting the Authorization Server details"
            }
            GatewayError::Forbidden { .. } => "access request FORBIDDEN by Authorization Server",
            GatewayError::TokenEndpointError { .. } => "error getting RPT from Authorization Server",
            GatewayError::EmptyRpt { .. } => "the RPT obtained is blank",
            GatewayError::RetryBudgetExhausted { .. } => "PEP responded UNAUTHORIZED",
        }
    }
}
