//! REST implementation of the remote list contract.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use blocksync_common::{Credential, Error, Identity, Result};

use crate::client::{BulkAddResult, BulkItemResult, RemoteEntry, RemoteList};

/// Default API endpoint.
const DEFAULT_BASE_URL: &str = "https://hn.gordyf.com";
/// Collection path on the API.
const BLOCKED_USERS_PATH: &str = "blocked-users";
/// Bulk upload sub-path.
const BULK_PATH: &str = "bulk";

/// Configuration for the HTTP client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// API base URL.
    pub base_url: String,
    /// Per-request timeout in seconds. Expiry is reported as a network error.
    pub timeout_secs: u64,
    /// User agent sent with every request.
    pub user_agent: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: 10,
            user_agent: concat!("blocksync/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    users: Vec<WireUser>,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    username: String,
}

#[derive(Debug, Serialize)]
struct BlockRequest<'a> {
    username: &'a str,
}

#[derive(Debug, Serialize)]
struct BulkBlockRequest<'a> {
    usernames: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct BulkBlockResponse {
    #[serde(default)]
    successful: usize,
    #[serde(default)]
    results: Vec<WireBulkItem>,
}

#[derive(Debug, Deserialize)]
struct WireBulkItem {
    username: String,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
}

/// Remote list client speaking JSON over HTTPS with bearer authentication.
pub struct HttpRemoteList {
    http: Client,
    base_url: Url,
}

impl HttpRemoteList {
    /// Create a new client.
    ///
    /// # Errors
    /// - Base URL does not parse or cannot carry a path
    /// - TLS backend fails to initialize
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| Error::InvalidInput(format!("Invalid base URL: {}", e)))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::InvalidInput(format!(
                "Base URL cannot carry a path: {}",
                config.base_url
            )));
        }

        let http = Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::InvalidInput(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http, base_url })
    }

    /// Build an endpoint URL below the base, percent-encoding each segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                Error::InvalidInput("Base URL cannot carry a path".to_string())
            })?;
            path.pop_if_empty().push(BLOCKED_USERS_PATH).extend(segments);
        }
        Ok(url)
    }

    /// Send a request and turn non-success statuses into classified errors.
    async fn send(&self, request: RequestBuilder, credential: &Credential) -> Result<Response> {
        let response = request
            .bearer_auth(credential.expose())
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let fallback = format!(
            "HTTP {}: {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown")
        );
        let message = match response.json::<ErrorBody>().await {
            Ok(ErrorBody { error: Some(error) }) => error,
            _ => fallback,
        };

        debug!("Remote answered {}: {}", status, message);
        Err(Error::from_status(status.as_u16(), message))
    }
}

fn transport_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Network("Request timeout".to_string())
    } else if err.is_decode() {
        Error::Serialization(format!("Failed to parse response: {}", err))
    } else {
        Error::Network(format!("Request failed: {}", err))
    }
}

fn into_entries(response: ListResponse) -> Vec<RemoteEntry> {
    response
        .users
        .into_iter()
        .filter_map(|user| match Identity::new(user.username) {
            Ok(identity) => Some(RemoteEntry { identity }),
            Err(e) => {
                warn!("Skipping invalid remote entry: {}", e);
                None
            }
        })
        .collect()
}

fn into_bulk_result(response: BulkBlockResponse) -> BulkAddResult {
    let results = response
        .results
        .into_iter()
        .filter_map(|item| {
            let identity = Identity::new(item.username).ok()?;
            Some(BulkItemResult {
                identity,
                success: item.success,
                message: item.message,
            })
        })
        .collect();

    BulkAddResult {
        successful: response.successful,
        results,
    }
}

#[async_trait]
impl RemoteList for HttpRemoteList {
    fn name(&self) -> &str {
        "http"
    }

    async fn list(&self, credential: &Credential) -> Result<Vec<RemoteEntry>> {
        let url = self.endpoint(&[])?;
        let response = self.send(self.http.get(url), credential).await?;
        let body: ListResponse = response.json().await.map_err(transport_error)?;
        Ok(into_entries(body))
    }

    async fn add(&self, credential: &Credential, identity: &Identity) -> Result<()> {
        let url = self.endpoint(&[])?;
        let body = BlockRequest {
            username: identity.as_str(),
        };
        self.send(self.http.post(url).json(&body), credential).await?;
        Ok(())
    }

    async fn remove(&self, credential: &Credential, identity: &Identity) -> Result<()> {
        let url = self.endpoint(&[identity.as_str()])?;
        self.send(self.http.delete(url), credential).await?;
        Ok(())
    }

    async fn bulk_add(
        &self,
        credential: &Credential,
        identities: &[Identity],
    ) -> Result<BulkAddResult> {
        let url = self.endpoint(&[BULK_PATH])?;
        let body = BulkBlockRequest {
            usernames: identities.iter().map(Identity::as_str).collect(),
        };
        let response = self.send(self.http.post(url).json(&body), credential).await?;
        let body: BulkBlockResponse = response.json().await.map_err(transport_error)?;
        Ok(into_bulk_result(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn client_for(base_url: &str, timeout_secs: u64) -> HttpRemoteList {
        HttpRemoteList::new(&RemoteConfig {
            base_url: base_url.to_string(),
            timeout_secs,
            ..RemoteConfig::default()
        })
        .unwrap()
    }

    fn credential() -> Credential {
        Credential::new("test-key").unwrap()
    }

    /// Serve a single canned response and hand back the raw request text.
    async fn serve_once(
        status_line: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];

            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);

                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            if name.eq_ignore_ascii_case("content-length") {
                                value.trim().parse::<usize>().ok()
                            } else {
                                None
                            }
                        })
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }

            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&request).to_string()
        });

        (format!("http://{}", addr), task)
    }

    #[test]
    fn test_invalid_base_url() {
        let result = HttpRemoteList::new(&RemoteConfig {
            base_url: "not a url".to_string(),
            ..RemoteConfig::default()
        });
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_endpoint_encodes_identity() {
        let client = client_for("https://api.example.com/v1/", 10);
        let url = client.endpoint(&["a b/c"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.com/v1/blocked-users/a%20b%2Fc"
        );
    }

    #[test]
    fn test_wire_list_skips_invalid_entries() {
        let body: ListResponse =
            serde_json::from_str(r#"{"users":[{"username":"alice"},{"username":"  "}]}"#)
                .unwrap();
        let entries = into_entries(body);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].identity.as_str(), "alice");
    }

    #[tokio::test]
    async fn test_list_sends_bearer_auth() {
        let (base, server) =
            serve_once("200 OK", r#"{"users":[{"username":"bob"},{"username":"carol"}]}"#).await;
        let client = client_for(&base, 5);

        let entries = client.list(&credential()).await.unwrap();
        let request = server.await.unwrap();

        assert_eq!(entries.len(), 2);
        assert!(request.starts_with("GET /blocked-users "));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer test-key"));
    }

    #[tokio::test]
    async fn test_error_body_message_is_used() {
        let (base, server) =
            serve_once("401 Unauthorized", r#"{"error":"Invalid API key","code":"AUTH"}"#).await;
        let client = client_for(&base, 5);

        let err = client.list(&credential()).await.unwrap_err();
        server.await.unwrap();

        assert!(err.is_auth());
        assert_eq!(err.to_string(), "Authentication failed: Invalid API key");
    }

    #[tokio::test]
    async fn test_conflict_on_add() {
        let (base, server) = serve_once("409 Conflict", "").await;
        let client = client_for(&base, 5);

        let err = client
            .add(&credential(), &Identity::new("alice").unwrap())
            .await
            .unwrap_err();
        let request = server.await.unwrap();

        assert!(matches!(err, Error::Conflict(ref m) if m == "HTTP 409: Conflict"));
        assert!(request.starts_with("POST /blocked-users "));
        assert!(request.contains(r#"{"username":"alice"}"#));
    }

    #[tokio::test]
    async fn test_server_error_on_remove() {
        let (base, server) = serve_once("503 Service Unavailable", "").await;
        let client = client_for(&base, 5);

        let err = client
            .remove(&credential(), &Identity::new("alice").unwrap())
            .await
            .unwrap_err();
        let request = server.await.unwrap();

        assert!(err.is_retryable());
        assert!(request.starts_with("DELETE /blocked-users/alice "));
    }

    #[tokio::test]
    async fn test_bulk_add_parses_items() {
        let (base, server) = serve_once(
            "200 OK",
            r#"{"successful":1,"results":[{"username":"alice","success":true},{"username":"bob","success":false,"message":"blocked elsewhere"}]}"#,
        )
        .await;
        let client = client_for(&base, 5);

        let identities = vec![Identity::new("alice").unwrap(), Identity::new("bob").unwrap()];
        let result = client.bulk_add(&credential(), &identities).await.unwrap();
        let request = server.await.unwrap();

        assert_eq!(result.successful, 1);
        assert_eq!(result.failures().count(), 1);
        assert!(request.starts_with("POST /blocked-users/bulk "));
        assert!(request.contains(r#"{"usernames":["alice","bob"]}"#));
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = client_for(&format!("http://{}", addr), 5);
        let err = client.list(&credential()).await.unwrap_err();
        assert!(err.is_network());
    }

    #[tokio::test]
    async fn test_timeout_is_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let client = client_for(&format!("http://{}", addr), 1);
        let err = client.list(&credential()).await.unwrap_err();
        assert!(err.is_network());
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_check_connection_reports_auth() {
        let (base, server) = serve_once("401 Unauthorized", "").await;
        let client = client_for(&base, 5);

        let check = client.check_connection(&credential()).await;
        server.await.unwrap();

        assert!(!check.success);
        assert!(check.is_auth_error);
        assert!(!check.is_network_error);
    }
}
