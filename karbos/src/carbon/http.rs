//! HTTP client abstraction for testability.
//!
//! Providers take the client as a type parameter so tests can inject a
//! [`MockHttpClient`] with canned responses instead of hitting the network.

use super::types::ProviderError;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Default per-call deadline for provider requests.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Trait for asynchronous HTTP client operations.
pub trait AsyncHttpClient: Send + Sync {
    /// Performs an async HTTP GET request.
    fn get(&self, url: &str) -> impl Future<Output = Result<Vec<u8>, ProviderError>> + Send;

    /// Performs an async HTTP GET request with custom headers.
    fn get_with_headers(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> impl Future<Output = Result<Vec<u8>, ProviderError>> + Send;

    /// Performs an async HTTP GET request with Basic authentication.
    fn get_with_basic_auth(
        &self,
        url: &str,
        username: &str,
        password: &str,
    ) -> impl Future<Output = Result<Vec<u8>, ProviderError>> + Send;
}

/// Real HTTP client implementation using reqwest.
#[derive(Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Creates a new client with the default 10-second timeout.
    pub fn new() -> Result<Self, ProviderError> {
        Self::with_timeout(DEFAULT_HTTP_TIMEOUT)
    }

    /// Creates a new client with a custom timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| ProviderError::Unreachable(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    async fn execute(&self, request: reqwest::RequestBuilder, url: &str) -> Result<Vec<u8>, ProviderError> {
        let response = match request.send().await {
            Ok(resp) => {
                debug!(url = url, status = resp.status().as_u16(), "HTTP response received");
                resp
            }
            Err(e) => {
                warn!(url = url, error = %e, is_timeout = e.is_timeout(), "HTTP request failed");
                return Err(ProviderError::Unreachable(format!("request failed: {}", e)));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let err = match status.as_u16() {
                401 | 403 => ProviderError::AuthFailed(format!("HTTP {} from {}", status, url)),
                429 => ProviderError::RateLimited(format!("HTTP 429 from {}", url)),
                _ => ProviderError::Unreachable(format!("HTTP {} from {}", status, url)),
            };
            warn!(url = url, status = status.as_u16(), "HTTP error status");
            return Err(err);
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| ProviderError::Malformed(format!("failed to read response: {}", e)))
    }
}

impl AsyncHttpClient for ReqwestClient {
    async fn get(&self, url: &str) -> Result<Vec<u8>, ProviderError> {
        self.execute(self.client.get(url), url).await
    }

    async fn get_with_headers(&self, url: &str, headers: &[(&str, &str)]) -> Result<Vec<u8>, ProviderError> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        self.execute(request, url).await
    }

    async fn get_with_basic_auth(
        &self,
        url: &str,
        username: &str,
        password: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        let request = self.client.get(url).basic_auth(username, Some(password));
        self.execute(request, url).await
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mock HTTP client returning a scripted sequence of responses.
    ///
    /// Each call pops the next response; when the script runs dry the last
    /// response repeats.
    pub struct MockHttpClient {
        responses: Mutex<Vec<Result<Vec<u8>, ProviderError>>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl MockHttpClient {
        pub fn new(response: Result<Vec<u8>, ProviderError>) -> Self {
            Self {
                responses: Mutex::new(vec![response]),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn with_script(responses: Vec<Result<Vec<u8>, ProviderError>>) -> Self {
            assert!(!responses.is_empty(), "script must have at least one response");
            Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn next(&self, url: &str) -> Result<Vec<u8>, ProviderError> {
            self.calls.lock().unwrap().push(url.to_string());
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                responses.remove(0)
            } else {
                responses[0].clone()
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl AsyncHttpClient for MockHttpClient {
        async fn get(&self, url: &str) -> Result<Vec<u8>, ProviderError> {
            self.next(url)
        }

        async fn get_with_headers(&self, url: &str, _headers: &[(&str, &str)]) -> Result<Vec<u8>, ProviderError> {
            self.next(url)
        }

        async fn get_with_basic_auth(
            &self,
            url: &str,
            _username: &str,
            _password: &str,
        ) -> Result<Vec<u8>, ProviderError> {
            self.next(url)
        }
    }

    #[tokio::test]
    async fn mock_client_returns_scripted_response() {
        let mock = MockHttpClient::new(Ok(vec![1, 2, 3]));
        assert_eq!(mock.get("http://example.com").await.unwrap(), vec![1, 2, 3]);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn mock_client_repeats_last_response() {
        let mock = MockHttpClient::with_script(vec![
            Ok(vec![1]),
            Err(ProviderError::Unreachable("down".to_string())),
        ]);
        assert!(mock.get("http://a").await.is_ok());
        assert!(mock.get("http://b").await.is_err());
        assert!(mock.get("http://c").await.is_err());
    }
}
