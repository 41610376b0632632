use std::time::Duration;

use url::Url;

const USER_AGENT: &str = concat!("page-assistant/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("{0}")]
    InvalidUrl(String),
    #[error("URL did not return HTML")]
    NotHtml,
    #[error("upstream returned status {0}")]
    Upstream(u16),
    #[error("{0}")]
    Request(String),
}

fn validate_url(url: &str) -> Result<(), FetchError> {
    let parsed = Url::parse(url).map_err(|_| FetchError::InvalidUrl("Invalid URL".to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(FetchError::InvalidUrl(
            "Only http and https URLs are allowed".to_string(),
        ));
    }
    Ok(())
}

/// Download a page's HTML for context extraction.
pub async fn fetch_html(url: &str, insecure: bool) -> Result<String, FetchError> {
    validate_url(url)?;

    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(
        reqwest::header::ACCEPT,
        reqwest::header::HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
        ),
    );
    headers.insert(
        reqwest::header::ACCEPT_LANGUAGE,
        reqwest::header::HeaderValue::from_static("ru-RU,ru;q=0.9,en-US;q=0.8,en;q=0.7"),
    );

    let mut builder = reqwest::ClientBuilder::new()
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(15))
        .redirect(reqwest::redirect::Policy::limited(10))
        .user_agent(USER_AGENT)
        .default_headers(headers);

    if insecure {
        builder = builder.danger_accept_invalid_certs(true);
    }

    let client = builder
        .build()
        .map_err(|e| FetchError::Request(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            FetchError::Request(format!("TimeoutError: {}", e))
        } else if e.is_connect() {
            FetchError::Request(format!("ConnectError: {}", e))
        } else {
            FetchError::Request(format!("RequestError: {}", e))
        }
    })?;

    if !response.status().is_success() {
        return Err(FetchError::Upstream(response.status().as_u16()));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_lowercase();

    if !content_type.contains("text/html") && !content_type.contains("application/xhtml") {
        return Err(FetchError::NotHtml);
    }

    tracing::debug!(url, "fetched page");
    response
        .text()
        .await
        .map_err(|e| FetchError::Request(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_http_schemes_pass() {
        assert!(validate_url("https://example.com/a").is_ok());
        assert!(validate_url("http://localhost:3000").is_ok());
        assert!(matches!(
            validate_url("file:///etc/passwd"),
            Err(FetchError::InvalidUrl(_))
        ));
        assert!(matches!(validate_url("not a url"), Err(FetchError::InvalidUrl(_))));
    }
}
