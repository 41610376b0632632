use once_cell::sync::Lazy;
use regex::Regex;

pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8010";
pub const BACKEND_URL_ENV: &str = "PAGE_ASSISTANT_BACKEND_URL";
pub const INSECURE_SSL_ENV: &str = "PAGE_ASSISTANT_INSECURE_SSL";

static HTTP_URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^https?://").unwrap());

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("backend URL must start with http:// or https://: {0:?}")]
    InvalidBackendUrl(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    backend_base_url: String,
}

impl Settings {
    /// Validate and normalize a backend base URL. A blank value falls back to
    /// the default; one trailing slash is dropped.
    pub fn new(backend_base_url: &str) -> Result<Self, ConfigError> {
        let raw = backend_base_url.trim();
        let raw = if raw.is_empty() { DEFAULT_BACKEND_URL } else { raw };
        let url = raw.strip_suffix('/').unwrap_or(raw);
        if !HTTP_URL_RE.is_match(url) {
            return Err(ConfigError::InvalidBackendUrl(url.to_string()));
        }
        Ok(Self {
            backend_base_url: url.to_string(),
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let value = std::env::var(BACKEND_URL_ENV).unwrap_or_default();
        Self::new(&value)
    }

    pub fn backend_base_url(&self) -> &str {
        &self.backend_base_url
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.backend_base_url, path.trim_start_matches('/'))
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend_base_url: DEFAULT_BACKEND_URL.to_string(),
        }
    }
}

pub fn insecure_ssl() -> bool {
    std::env::var(INSECURE_SSL_ENV).as_deref() == Ok("1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_is_dropped() {
        let settings = Settings::new("https://api.example.com/").unwrap();
        assert_eq!(settings.backend_base_url(), "https://api.example.com");
        assert_eq!(settings.endpoint("/chat"), "https://api.example.com/chat");
    }

    #[test]
    fn scheme_check_is_case_insensitive() {
        assert!(Settings::new("HTTP://localhost:8010").is_ok());
    }

    #[test]
    fn blank_uses_default() {
        assert_eq!(Settings::new("  ").unwrap(), Settings::default());
    }

    #[test]
    fn non_http_urls_are_rejected() {
        for bad in ["localhost:8010", "ftp://example.com", "javascript:alert(1)"] {
            assert_eq!(
                Settings::new(bad),
                Err(ConfigError::InvalidBackendUrl(bad.to_string()))
            );
        }
    }
}
