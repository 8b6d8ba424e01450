use async_trait::async_trait;
use tollgate_application::{HttpTransport, TransportResponse};
use tollgate_core::{AppError, AppResult};
use tracing::debug;
use url::Url;

/// Header carrying the provider API key.
pub const DEFAULT_CREDENTIAL_HEADER: &str = "X-Riot-Token";

/// reqwest-based implementation of the outbound transport port.
#[derive(Clone)]
pub struct ReqwestHttpTransport {
    http_client: reqwest::Client,
    credential: Option<(String, String)>,
}

impl ReqwestHttpTransport {
    /// Creates a transport without credentials.
    #[must_use]
    pub fn new(http_client: reqwest::Client) -> Self {
        Self {
            http_client,
            credential: None,
        }
    }

    /// Sends `value` in header `header` on every request.
    #[must_use]
    pub fn with_credential(mut self, header: impl Into<String>, value: impl Into<String>) -> Self {
        self.credential = Some((header.into(), value.into()));
        self
    }
}

#[async_trait]
impl HttpTransport for ReqwestHttpTransport {
    async fn get(&self, url: &Url) -> AppResult<TransportResponse> {
        let mut builder = self.http_client.get(url.clone());
        if let Some((header, value)) = &self.credential {
            builder = builder.header(header.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(|error| {
            AppError::Unavailable(format!("request to '{url}' failed: {error}"))
        })?;
        let status = response.status().as_u16();
        debug!(url = %url, status, "provider responded");
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_owned(), value.to_owned()))
            })
            .collect::<Vec<_>>();
        let body = response.bytes().await.map_err(|error| {
            AppError::Unavailable(format!("failed to read response from '{url}': {error}"))
        })?;

        Ok(TransportResponse::new(status, headers, body.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tollgate_application::HttpTransport;
    use tollgate_core::AppError;
    use url::Url;

    use super::{DEFAULT_CREDENTIAL_HEADER, ReqwestHttpTransport};

    async fn serve_once(raw_response: &'static str) -> (Url, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap_or_else(|_| unreachable!());
        let address = listener.local_addr().unwrap_or_else(|_| unreachable!());
        let server = tokio::spawn(async move {
            let Ok((mut socket, _)) = listener.accept().await else {
                return String::new();
            };
            let mut request = vec![0_u8; 4096];
            let read = socket.read(&mut request).await.unwrap_or_default();
            let _ = socket.write_all(raw_response.as_bytes()).await;
            let _ = socket.shutdown().await;
            String::from_utf8_lossy(&request[..read]).into_owned()
        });

        let url = Url::parse(format!("http://{address}/lol/status/v4/platform-data").as_str())
            .unwrap_or_else(|_| unreachable!());
        (url, server)
    }

    #[tokio::test]
    async fn returns_status_headers_and_body_for_any_status() {
        let (url, server) = serve_once(
            "HTTP/1.1 429 Too Many Requests\r\nRetry-After: 3\r\nX-App-Rate-Limit: 20:1\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}",
        )
        .await;
        let transport = ReqwestHttpTransport::new(reqwest::Client::new())
            .with_credential(DEFAULT_CREDENTIAL_HEADER, "RGAPI-test");

        let response = transport
            .get(&url)
            .await
            .unwrap_or_else(|error| panic!("transport failed: {error}"));

        assert_eq!(response.status(), 429);
        assert_eq!(response.header("retry-after"), Some("3"));
        assert_eq!(response.header("X-App-Rate-Limit"), Some("20:1"));
        assert_eq!(response.body(), b"{}");
        let request = server.await.unwrap_or_default().to_ascii_lowercase();
        assert!(request.contains("x-riot-token: rgapi-test"));
    }

    #[tokio::test]
    async fn connection_failures_are_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap_or_else(|_| unreachable!());
        let address = listener.local_addr().unwrap_or_else(|_| unreachable!());
        drop(listener);
        let url = Url::parse(format!("http://{address}/").as_str())
            .unwrap_or_else(|_| unreachable!());

        let result = ReqwestHttpTransport::new(reqwest::Client::new())
            .get(&url)
            .await;

        assert!(matches!(result, Err(AppError::Unavailable(_))));
    }
}
