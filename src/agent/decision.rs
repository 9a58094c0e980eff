use axum::http::header::{SET_COOKIE, WWW_AUTHENTICATE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, field, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::agent::config::Config;
use crate::error::GatewayError;
use crate::security::intake::AccessAttempt;
use crate::transport::pep::{PepClient, PepResponse};
use crate::transport::{ResilientClient, TransportError};
use crate::uma::{unpack_www_authenticate, AuthServerRegistry, AuthorizationServer, UmaClient};

const X_USER_ID: HeaderName = HeaderName::from_static("x-user-id");

/// Terminal outcome of one authorization request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// PEP allowed the request with this 2xx status.
    Authorized(StatusCode),
    Forbidden(String),
    Unauthorized(String),
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub outcome: Outcome,
    pub attempt: AccessAttempt,
}

/// Steps of the UMA flow for one request.
#[derive(Debug)]
enum Phase {
    /// PEP call without an RPT.
    Naive,
    /// PEP answered 401; parse its ticket and locate the Authorization Server.
    Challenge(PepResponse),
    Exchange {
        server: AuthorizationServer,
        ticket: String,
    },
    /// PEP call presenting the RPT.
    Retry,
}

/// Runs the naive-then-ticket-exchange flow and renders the single response per request.
#[derive(Debug)]
pub struct DecisionEngine {
    config: Arc<Config>,
    pep: PepClient,
    uma: UmaClient,
    registry: Arc<AuthServerRegistry>,
}

impl DecisionEngine {
    pub fn new(
        config: Arc<Config>,
        pep: PepClient,
        uma: UmaClient,
        registry: Arc<AuthServerRegistry>,
    ) -> Self {
        Self {
            config,
            pep,
            uma,
            registry,
        }
    }

    /// Wire the shared transport and Authorization Server registry from `config`.
    pub fn from_config(config: Arc<Config>) -> Result<Self, TransportError> {
        let transport = Arc::new(ResilientClient::new(&config)?);
        let registry = Arc::new(AuthServerRegistry::new(transport.clone()));
        let pep = PepClient::new(config.pep_url.clone(), transport.clone());
        let uma = UmaClient::new(
            config.client_id.clone(),
            config.client_secret.clone(),
            transport,
        );
        Ok(Self::new(config, pep, uma, registry))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AuthServerRegistry> {
        &self.registry
    }

    /// Answer one proxy subrequest. Always yields a response; logs the final status.
    pub async fn handle(&self, headers: &HeaderMap) -> Response {
        let span = info_span!(
            "auth_request",
            request_id = %Uuid::new_v4(),
            orig_uri = field::Empty,
            orig_method = field::Empty
        );
        self.handle_in_span(headers).instrument(span).await
    }

    async fn handle_in_span(&self, headers: &HeaderMap) -> Response {
        let started = Instant::now();
        let response = match AccessAttempt::from_headers(headers, &self.config) {
            Ok(attempt) => {
                let span = Span::current();
                span.record("orig_uri", attempt.original_uri.as_str());
                span.record("orig_method", attempt.original_method.as_str());
                debug!("START handling new request");
                let decision = self.decide(attempt).await;
                self.render(decision)
            }
            Err(err) => {
                error!(error = %err, "ERROR processing request headers");
                self.reject(&err)
            }
        };
        info!(
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request complete"
        );
        response
    }

    /// Run the flow to a terminal outcome.
    ///
    /// Every PEP call increments `attempt.attempts`; a 401 once the count exceeds
    /// `authorization_retries` ends the flow, so at most `authorization_retries + 1`
    /// PEP calls are made. A 401 to an RPT call is handled from its own challenge,
    /// without a fresh naive call.
    pub async fn decide(&self, mut attempt: AccessAttempt) -> Decision {
        let max_retries = self.config.authorization_retries;
        let mut phase = if attempt.has_rpt() {
            Phase::Retry
        } else {
            Phase::Naive
        };

        loop {
            phase = match phase {
                Phase::Naive | Phase::Retry => {
                    debug!(
                        attempt = attempt.attempts + 1,
                        with_rpt = attempt.has_rpt(),
                        "calling PEP auth_request"
                    );
                    let response = match self.pep.call(&attempt).await {
                        Ok(r) => r,
                        Err(e) => return self.fail(attempt, e.into()),
                    };
                    attempt.attempts += 1;

                    let status = response.status;
                    if status.is_success() {
                        debug!(status = status.as_u16(), "PEP authorized the request");
                        return Decision {
                            outcome: Outcome::Authorized(status),
                            attempt,
                        };
                    }
                    match status {
                        StatusCode::FORBIDDEN => {
                            debug!("PEP responded FORBIDDEN");
                            return Decision {
                                outcome: Outcome::Forbidden("PEP responded FORBIDDEN".to_string()),
                                attempt,
                            };
                        }
                        StatusCode::UNAUTHORIZED if attempt.attempts > max_retries => {
                            let err = GatewayError::RetryBudgetExhausted {
                                attempts: attempt.attempts,
                                last: if attempt.has_rpt() {
                                    "RPT was not accepted".to_string()
                                } else {
                                    "PEP responded UNAUTHORIZED".to_string()
                                },
                            };
                            return self.fail(attempt, err);
                        }
                        StatusCode::UNAUTHORIZED => {
                            debug!(attempt = attempt.attempts, "PEP responded UNAUTHORIZED");
                            Phase::Challenge(response)
                        }
                        other => {
                            error!(status = other.as_u16(), "unexpected return code from PEP auth_request endpoint");
                            return Decision {
                                outcome: Outcome::Unauthorized(format!(
                                    "Unexpected return code from PEP auth_request endpoint: {}",
                                    other.as_u16()
                                )),
                                attempt,
                            };
                        }
                    }
                }
                Phase::Challenge(response) => {
                    let header = match response.www_authenticate.filter(|h| !h.trim().is_empty()) {
                        Some(h) => h,
                        None => {
                            let err = GatewayError::MalformedChallenge(
                                "no Www-Authenticate header in PEP response".to_string(),
                            );
                            return self.fail(attempt, err);
                        }
                    };
                    let challenge = match unpack_www_authenticate(&header) {
                        Ok(c) => c,
                        Err(e) => return self.fail(attempt, e),
                    };
                    match self.registry.resolve(&challenge.as_uri).await {
                        Ok(server) => Phase::Exchange {
                            server,
                            ticket: challenge.ticket,
                        },
                        Err(e) => return self.fail(attempt, e),
                    }
                }
                Phase::Exchange { server, ticket } => {
                    match self
                        .uma
                        .exchange_ticket_for_rpt(&server, &attempt.identity_token, &ticket)
                        .await
                    {
                        Ok(rpt) => {
                            debug!(as_uri = server.base_url(), "obtained RPT from Authorization Server");
                            attempt.rpt = Some(rpt);
                            Phase::Retry
                        }
                        Err(e) => return self.fail(attempt, e),
                    }
                }
            };
        }
    }

    fn fail(&self, attempt: AccessAttempt, err: GatewayError) -> Decision {
        let outcome = if err.is_forbidden() {
            warn!(error = %err, "access request FORBIDDEN");
            Outcome::Forbidden(err.public_message().to_string())
        } else {
            error!(error = %err, attempts = attempt.attempts, "authorization failed");
            Outcome::Unauthorized(err.public_message().to_string())
        };
        Decision { outcome, attempt }
    }

    /// Turn a decision into the proxy response. Open access turns denials into 200.
    pub fn render(&self, decision: Decision) -> Response {
        let Decision { outcome, attempt } = decision;
        match outcome {
            Outcome::Authorized(status) => {
                let body = format!("PEP authorized the request with code: {}", status.as_u16());
                self.allow(status, &attempt.identity_token, attempt.rpt.as_deref(), body)
            }
            Outcome::Forbidden(msg) | Outcome::Unauthorized(msg) if self.config.open_access => {
                warn!(reason = %msg, "OPEN ACCESS: allowing request that would have been denied");
                // an RPT held here was not accepted, so it is not handed back
                self.allow(StatusCode::OK, &attempt.identity_token, None, msg)
            }
            Outcome::Forbidden(msg) => (StatusCode::FORBIDDEN, msg).into_response(),
            Outcome::Unauthorized(msg) => self.unauthorized(msg),
        }
    }

    fn reject(&self, err: &GatewayError) -> Response {
        match err {
            GatewayError::MissingAttributes { diagnostic } => self.unauthorized(diagnostic.clone()),
            other => self.unauthorized(other.public_message().to_string()),
        }
    }

    fn allow(
        &self,
        status: StatusCode,
        identity_token: &str,
        rpt: Option<&str>,
        body: String,
    ) -> Response {
        let mut headers = HeaderMap::new();
        match HeaderValue::from_str(identity_token) {
            Ok(v) => {
                headers.insert(X_USER_ID, v);
            }
            Err(e) => warn!(error = %e, "identity token is not a valid header value"),
        }
        if let Some(rpt) = rpt.filter(|r| !r.is_empty()) {
            let cookie = format!(
                "{}={}; Path=/; Max-Age={}; Secure; HttpOnly",
                self.config.rpt_cookie_name, rpt, self.config.rpt_cookie_max_age_secs
            );
            match HeaderValue::from_str(&cookie) {
                Ok(v) => {
                    headers.insert(SET_COOKIE, v);
                }
                Err(e) => warn!(error = %e, "RPT cannot be carried as a cookie"),
            }
        }
        (status, headers, body).into_response()
    }

    fn unauthorized(&self, body: String) -> Response {
        let mut headers = HeaderMap::new();
        match HeaderValue::from_str(&self.config.unauthorized_response) {
            Ok(v) => {
                headers.insert(WWW_AUTHENTICATE, v);
            }
            Err(e) => warn!(
                error = %e,
                "unauthorized_response is not a valid header value, answering without WWW-Authenticate"
            ),
        }
        (StatusCode::UNAUTHORIZED, headers, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(config: Config) -> DecisionEngine {
        DecisionEngine::from_config(Arc::new(config)).unwrap()
    }

    fn attempt(rpt: Option<&str>) -> AccessAttempt {
        AccessAttempt {
            original_uri: "/r".into(),
            original_method: "GET".into(),
            identity_token: "id-jwt".into(),
            rpt: rpt.map(str::to_string),
            attempts: 1,
        }
    }

    #[test]
    fn authorized_sets_identity_and_rpt_cookie() {
        let engine = engine(Config {
            rpt_cookie_max_age_secs: 120,
            ..Config::default()
        });
        let resp = engine.render(Decision {
            outcome: Outcome::Authorized(StatusCode::NO_CONTENT),
            attempt: attempt(Some("rpt-1")),
        });
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(resp.headers()["x-user-id"], "id-jwt");
        let cookie = resp.headers()[SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with("auth_rpt=rpt-1;"));
        assert!(cookie.contains("Max-Age=120"));
        assert!(cookie.contains("Secure"));
        assert!(cookie.contains("HttpOnly"));
    }

    #[test]
    fn authorized_without_rpt_sets_no_cookie() {
        let engine = engine(Config::default());
        let resp = engine.render(Decision {
            outcome: Outcome::Authorized(StatusCode::OK),
            attempt: attempt(None),
        });
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().get(SET_COOKIE).is_none());
    }

    #[test]
    fn unauthorized_carries_configured_challenge() {
        let engine = engine(Config {
            unauthorized_response: "Bearer realm=\"eoepca\"".into(),
            ..Config::default()
        });
        let resp = engine.render(Decision {
            outcome: Outcome::Unauthorized("nope".into()),
            attempt: attempt(None),
        });
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(resp.headers()[WWW_AUTHENTICATE], "Bearer realm=\"eoepca\"");
        assert!(resp.headers().get("x-user-id").is_none());
    }

    #[test]
    fn forbidden_is_403() {
        let engine = engine(Config::default());
        let resp = engine.render(Decision {
            outcome: Outcome::Forbidden("denied".into()),
            attempt: attempt(None),
        });
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn open_access_allows_denials() {
        let engine = engine(Config {
            open_access: true,
            ..Config::default()
        });
        for outcome in [Outcome::Forbidden("f".into()), Outcome::Unauthorized("u".into())] {
            let resp = engine.render(Decision {
                outcome,
                attempt: attempt(None),
            });
            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(resp.headers()["x-user-id"], "id-jwt");
        }
    }

    #[test]
    fn open_access_does_not_reissue_rejected_rpt() {
        let engine = engine(Config {
            open_access: true,
            ..Config::default()
        });
        let resp = engine.render(Decision {
            outcome: Outcome::Unauthorized("PEP responded UNAUTHORIZED".into()),
            attempt: attempt(Some("rejected-rpt")),
        });
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().get(SET_COOKIE).is_none());
    }

    #[test]
    fn invalid_unauthorized_response_still_answers_401() {
        let engine = engine(Config {
            unauthorized_response: "line\nbreak".into(),
            ..Config::default()
        });
        let resp = engine.render(Decision {
            outcome: Outcome::Unauthorized("nope".into()),
            attempt: attempt(None),
        });
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(resp.headers().get(WWW_AUTHENTICATE).is_none());
    }

    #[test]
    fn forbidden_errors_map_to_forbidden_outcome() {
        let engine = engine(Config::default());
        let d = engine.fail(
            attempt(None),
            GatewayError::Forbidden {
                endpoint: "https://as/token".into(),
            },
        );
        assert!(matches!(d.outcome, Outcome::Forbidden(_)));

        let d = engine.fail(attempt(None), GatewayError::EmptyRpt { endpoint: "e".into() });
        assert_eq!(d.outcome, Outcome::Unauthorized("the RPT obtained is blank".into()));
    }
}
