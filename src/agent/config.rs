use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Gateway configuration. Built once at startup and shared read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_port: u16,
    /// PEP `auth_request` endpoint.
    pub pep_url: String,
    /// UMA client credentials registered with the Authorization Server(s).
    pub client_id: String,
    pub client_secret: String,
    /// Timeout applied to every individual outbound HTTP call.
    pub http_timeout_secs: u64,
    /// Transport retries on 5xx responses and timeouts.
    pub http_retries: u32,
    pub http_retry_backoff_ms: u64,
    /// PEP calls allowed after the initial one before giving up with 401.
    pub authorization_retries: u32,
    pub user_id_cookie_name: String,
    pub rpt_cookie_name: String,
    pub rpt_cookie_max_age_secs: u64,
    /// Value of the `WWW-Authenticate` header on 401 responses.
    pub unauthorized_response: String,
    pub open_access: bool,
    pub insecure_tls_skip_verify: bool,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: 80,
            pep_url: "http://pep".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            http_timeout_secs: 10,
            http_retries: 1,
            http_retry_backoff_ms: 100,
            authorization_retries: 1,
            user_id_cookie_name: "auth_user_id".to_string(),
            rpt_cookie_name: "auth_rpt".to_string(),
            rpt_cookie_max_age_secs: 300,
            unauthorized_response: "Please login to access the resource".to_string(),
            open_access: false,
            insecure_tls_skip_verify: false,
            log_level: "info".to_string(),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.trim().parse().ok())
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).context("reading config file")?;
        let cfg: Config = serde_json::from_str(&raw).context("parsing JSON config")?;
        Ok(cfg)
    }

    /// Load from an optional JSON file, then apply environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        cfg.apply_env();
        Ok(cfg)
    }

    /// Environment variables win over file values. Empty or unparsable values are ignored.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_parse("PORT") {
            self.listen_port = v;
        }
        if let Some(v) = env_string("PEP_URL") {
            self.pep_url = v;
        }
        if let Some(v) = env_string("CLIENT_ID") {
            self.client_id = v;
        }
        if let Some(v) = env_string("CLIENT_SECRET") {
            self.client_secret = v;
        }
        if let Some(v) = env_parse("HTTP_TIMEOUT") {
            self.http_timeout_secs = v;
        }
        if let Some(v) = env_parse("RETRIES_HTTP_REQUEST") {
            self.http_retries = v;
        }
        if let Some(v) = env_parse("HTTP_RETRY_BACKOFF_MS") {
            self.http_retry_backoff_ms = v;
        }
        if let Some(v) = env_parse("RETRIES_AUTHORIZATION_ATTEMPT") {
            self.authorization_retries = v;
        }
        if let Some(v) = env_string("USER_ID_COOKIE_NAME") {
            self.user_id_cookie_name = v;
        }
        if let Some(v) = env_string("AUTH_RPT_COOKIE_NAME") {
            self.rpt_cookie_name = v;
        }
        if let Some(v) = env_parse("AUTH_RPT_COOKIE_MAX_AGE") {
            self.rpt_cookie_max_age_secs = v;
        }
        if let Some(v) = env_string("UNAUTHORIZED_RESPONSE") {
            self.unauthorized_response = v;
        }
        if let Some(v) = env_parse("OPEN_ACCESS") {
            self.open_access = v;
        }
        if let Some(v) = env_parse("INSECURE_TLS_SKIP_VERIFY") {
            self.insecure_tls_skip_verify = v;
        }
        if let Some(v) = env_string("LOG_LEVEL") {
            self.log_level = v;
        }
        debug!(pep_url = %self.pep_url, open_access = self.open_access, "configuration resolved");
    }

    /// Ready once the UMA client credentials are present.
    pub fn is_ready(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty()
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn http_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.http_retry_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_parsing() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{
                "pep_url": "http://pep.local/authorize",
                "client_id": "my-client",
                "client_secret": "s3cret",
                "http_timeout_secs": 3,
                "authorization_retries": 2,
                "open_access": true
            }}"#
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.pep_url, "http://pep.local/authorize");
        assert_eq!(config.client_id, "my-client");
        assert_eq!(config.http_timeout(), Duration::from_secs(3));
        assert_eq!(config.authorization_retries, 2);
        assert!(config.open_access);
        // untouched fields keep their defaults
        assert_eq!(config.user_id_cookie_name, "auth_user_id");
        assert_eq!(config.rpt_cookie_name, "auth_rpt");
        assert_eq!(config.http_retries, 1);
        assert!(config.is_ready());
    }

    #[test]
    fn test_config_missing_file() {
        let result = Config::from_file("/nonexistent/path/config.json");
        assert!(result.is_err());
    }

    #[test]
    fn test_config_invalid_json() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{{invalid json").unwrap();

        let result = Config::from_file(file.path().to_str().unwrap());
        assert!(result.is_err());
    }

    #[test]
    fn test_defaults_not_ready_without_credentials() {
        let config = Config::default();
        assert!(!config.is_ready());
        assert_eq!(config.listen_port, 80);
        assert_eq!(config.unauthorized_response, "Please login to access the resource");
        assert_eq!(config.http_retry_backoff(), Duration::from_millis(100));
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("RETRIES_AUTHORIZATION_ATTEMPT", "4");
        std::env::set_var("AUTH_RPT_COOKIE_MAX_AGE", "not-a-number");
        std::env::set_var("INSECURE_TLS_SKIP_VERIFY", "true");

        let mut config = Config::default();
        config.apply_env();
        assert_eq!(config.authorization_retries, 4);
        assert_eq!(config.rpt_cookie_max_age_secs, 300);
        assert!(config.insecure_tls_skip_verify);

        std::env::remove_var("RETRIES_AUTHORIZATION_ATTEMPT");
        std::env::remove_var("AUTH_RPT_COOKIE_MAX_AGE");
        std::env::remove_var("INSECURE_TLS_SKIP_VERIFY");
    }
}
