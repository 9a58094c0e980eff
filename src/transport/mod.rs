pub mod pep;

use rand::Rng;
use reqwest::{Client, Request, Response};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::agent::config::Config;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("building HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request body cannot be replayed for retry")]
    NotReplayable,
    #[error("request timed out after {attempts} attempts")]
    Timeout { attempts: u32 },
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
}

/// Retry budget and backoff schedule for outbound calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff: Duration::from_secs(2),
        }
    }

    /// Exponential backoff, capped, with 0.5x-1.5x jitter.
    fn backoff(&self, retry: u32) -> Duration {
        if self.initial_backoff.is_zero() {
            return Duration::ZERO;
        }
        let exp = self.initial_backoff.as_secs_f64() * 2f64.powi(retry.min(16) as i32);
        let capped = exp.min(self.max_backoff.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(capped * jitter)
    }
}

/// HTTP client that retries on 5xx responses and timeouts.
///
/// Each attempt gets the full client timeout, so a single call may take up to
/// `(max_retries + 1) * timeout` plus backoff.
#[derive(Debug, Clone)]
pub struct ResilientClient {
    client: Client,
    policy: RetryPolicy,
}

impl ResilientClient {
    pub fn new(config: &Config) -> Result<Self, TransportError> {
        Self::with_settings(
            config.http_timeout(),
            RetryPolicy::new(config.http_retries, config.http_retry_backoff()),
            config.insecure_tls_skip_verify,
        )
    }

    pub fn with_settings(
        timeout: Duration,
        policy: RetryPolicy,
        insecure_tls: bool,
    ) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(insecure_tls)
            .build()
            .map_err(TransportError::Client)?;
        debug!(
            timeout_ms = timeout.as_millis() as u64,
            max_retries = policy.max_retries,
            insecure_tls,
            "initialised HTTP client"
        );
        Ok(Self { client, policy })
    }

    /// Underlying client, for building requests.
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `request`, retrying the same request while the budget allows.
    ///
    /// 4xx responses and non-timeout errors are returned immediately. When the budget is
    /// spent the last response (or error) is returned as-is.
    pub async fn send(&self, request: Request, reason: &str) -> Result<Response, TransportError> {
        let mut attempt: u32 = 0;
        loop {
            let current = request.try_clone().ok_or(TransportError::NotReplayable)?;
            let outcome = self.client.execute(current).await;

            let retryable = match &outcome {
                Ok(resp) => resp.status().as_u16() >= 500,
                Err(e) => e.is_timeout(),
            };
            if !retryable || attempt >= self.policy.max_retries {
                return match outcome {
                    Ok(resp) => Ok(resp),
                    Err(e) if e.is_timeout() => Err(TransportError::Timeout {
                        attempts: attempt + 1,
                    }),
                    Err(e) => Err(TransportError::Request(e)),
                };
            }

            match &outcome {
                Ok(resp) => warn!(
                    reason,
                    status = resp.status().as_u16(),
                    attempt = attempt + 1,
                    "retrying request due to bad response code"
                ),
                Err(_) => warn!(reason, attempt = attempt + 1, "retrying request due to timeout"),
            }
            drop(outcome);

            let delay = self.policy.backoff(attempt);
            attempt += 1;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }
}
