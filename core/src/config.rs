//! Client configuration.
//!
//! Loaded from code through [`ClientConfig::builder`] or from the environment
//! through [`ClientConfig::from_env`]:
//!
//! - `REDCAP_API_URL` (required): the API endpoint, e.g.
//!   `https://redcap.example.org/api/`
//! - `REDCAP_TIMEOUT_SECS`: per-call deadline in seconds (default 300)
//! - `REDCAP_USER_AGENT`: `User-Agent` header value

use std::time::Duration;

use url::Url;

use crate::error::InvalidConfiguration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

pub const DEFAULT_USER_AGENT: &str = concat!("redcap-core/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub endpoint: Url,
    /// `None` waits indefinitely (cancellation still applies).
    pub timeout: Option<Duration>,
    pub user_agent: String,
}

impl ClientConfig {
    pub fn builder(endpoint: &str) -> ClientConfigBuilder {
        ClientConfigBuilder {
            endpoint: endpoint.to_string(),
            timeout: Some(DEFAULT_TIMEOUT),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    pub fn new(endpoint: &str) -> Result<Self, InvalidConfiguration> {
        Self::builder(endpoint).build()
    }

    pub fn from_env() -> Result<Self, InvalidConfiguration> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`Self::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, InvalidConfiguration> {
        let endpoint = lookup("REDCAP_API_URL").ok_or_else(|| {
            InvalidConfiguration::new("REDCAP_API_URL", "", ["an absolute http(s) URL"])
        })?;
        let mut builder = Self::builder(&endpoint);

        if let Some(raw) = lookup("REDCAP_TIMEOUT_SECS") {
            let secs = raw.trim().parse::<u64>().map_err(|_| {
                InvalidConfiguration::new("REDCAP_TIMEOUT_SECS", raw.as_str(), ["a whole number of seconds"])
            })?;
            builder = builder.timeout(Duration::from_secs(secs));
        }
        if let Some(agent) = lookup("REDCAP_USER_AGENT") {
            builder = builder.user_agent(agent);
        }
        builder.build()
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    endpoint: String,
    timeout: Option<Duration>,
    user_agent: String,
}

impl ClientConfigBuilder {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn no_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = agent.into();
        self
    }

    pub fn build(self) -> Result<ClientConfig, InvalidConfiguration> {
        let invalid = || InvalidConfiguration::new("endpoint", self.endpoint.as_str(), ["an absolute http(s) URL"]);
        let endpoint = Url::parse(self.endpoint.trim()).map_err(|_| invalid())?;
        if !matches!(endpoint.scheme(), "http" | "https") || endpoint.host_str().is_none() {
            return Err(invalid());
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(InvalidConfiguration::new("timeout", "0", ["a positive duration"]));
        }
        Ok(ClientConfig {
            endpoint,
            timeout: self.timeout,
            user_agent: self.user_agent,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn builder_applies_defaults() {
        let config = ClientConfig::new("https://redcap.example.org/api/").unwrap();
        assert_eq!(config.endpoint.as_str(), "https://redcap.example.org/api/");
        assert_eq!(config.timeout, Some(DEFAULT_TIMEOUT));
        assert!(config.user_agent.starts_with("redcap-core/"));
    }

    #[test]
    fn rejects_non_http_endpoints() {
        assert!(ClientConfig::new("ftp://redcap.example.org/api/").is_err());
        assert!(ClientConfig::new("not a url").is_err());
        let err = ClientConfig::new("mailto:someone@example.org").unwrap_err();
        assert_eq!(err.option, "endpoint");
    }

    #[test]
    fn rejects_zero_timeout() {
        let err = ClientConfig::builder("http://localhost/api/")
            .timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert_eq!(err.option, "timeout");
    }

    #[test]
    fn loads_from_environment_variables() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("REDCAP_API_URL", "http://127.0.0.1:8080/api/"),
            ("REDCAP_TIMEOUT_SECS", "30"),
            ("REDCAP_USER_AGENT", "study-sync/2.1"),
        ]))
        .unwrap();
        assert_eq!(config.timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.user_agent, "study-sync/2.1");
    }

    #[test]
    fn missing_url_and_bad_timeout_are_reported() {
        let err = ClientConfig::from_lookup(lookup(&[])).unwrap_err();
        assert_eq!(err.option, "REDCAP_API_URL");

        let err = ClientConfig::from_lookup(lookup(&[
            ("REDCAP_API_URL", "http://127.0.0.1/api/"),
            ("REDCAP_TIMEOUT_SECS", "soon"),
        ]))
        .unwrap_err();
        assert_eq!(err.option, "REDCAP_TIMEOUT_SECS");
        assert_eq!(err.value, "soon");
    }
}
