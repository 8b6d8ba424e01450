use std::collections::HashMap;

use async_trait::async_trait;
use tollgate_core::AppResult;
use url::Url;

/// Status, headers and body of one upstream response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportResponse {
    status: u16,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl TransportResponse {
    /// Creates a response. Header names are matched case-insensitively.
    #[must_use]
    pub fn new<I, K, V>(status: u16, headers: I, body: Vec<u8>) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        Self {
            status,
            headers: headers
                .into_iter()
                .map(|(name, value)| (name.as_ref().to_ascii_lowercase(), value.into()))
                .collect(),
            body,
        }
    }

    /// Returns the HTTP status code.
    #[must_use]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Returns one header value.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name.to_ascii_lowercase().as_str())
            .map(String::as_str)
    }

    /// Returns the raw body.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        self.body.as_slice()
    }

    /// Consumes the response and returns its body.
    #[must_use]
    pub fn into_body(self) -> Vec<u8> {
        self.body
    }
}

/// Outbound HTTP port for the rate-limited provider.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Issues one GET request. Only connectivity failures are errors; every
    /// status code is returned as a response.
    async fn get(&self, url: &Url) -> AppResult<TransportResponse>;
}
