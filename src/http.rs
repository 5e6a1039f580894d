//! reqwest transport behind the [`Fetcher`] capability
//!
//! A target whose parameters carry an [`ENDPOINT_PARAM`] is sent as a form POST
//! to that endpoint with the remaining parameters as form fields. Every other
//! target is a GET of its identifier. Non-2xx responses are returned as-is;
//! classifying them is the retry policy's job.

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{FetchError, Result};
use crate::executor::Fetcher;
use crate::types::{FetchResponse, FetchTarget, Identity};

/// Parameter naming the URL a form target is posted to
pub const ENDPOINT_PARAM: &str = "endpoint";

/// Connect timeout for every client; the whole attempt is bounded by the executor
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Clients kept alive at once; the least recently used one is dropped first
const MAX_CACHED_CLIENTS: usize = 8;

/// HTTP transport with one client per proxy
///
/// reqwest binds proxies at client construction, so clients are cached by
/// proxy URL and reused across attempts that draw the same proxy. The cache
/// holds at most `MAX_CACHED_CLIENTS` clients, so a proxy API handing out a
/// fresh address per attempt does not pile up connection pools.
#[derive(Debug)]
pub struct HttpFetcher {
    referer: Option<String>,
    clients: Mutex<VecDeque<(Option<String>, reqwest::Client)>>,
}

impl HttpFetcher {
    /// Create a transport; `referer` is sent with every request when set
    pub fn new(referer: Option<String>) -> Self {
        Self {
            referer,
            clients: Mutex::new(VecDeque::new()),
        }
    }

    fn client(&self, proxy: Option<&str>) -> std::result::Result<reqwest::Client, FetchError> {
        let key = proxy.map(str::to_string);
        let mut clients = self
            .clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(pos) = clients.iter().position(|(k, _)| *k == key)
            && let Some(entry) = clients.remove(pos)
        {
            let client = entry.1.clone();
            clients.push_back(entry);
            return Ok(client);
        }

        let client = build_client(proxy)
            .map_err(|e| FetchError::Identity(format!("unusable proxy: {e}")))?;
        if clients.len() >= MAX_CACHED_CLIENTS {
            clients.pop_front();
        }
        clients.push_back((key, client.clone()));
        Ok(client)
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new(None)
    }
}

fn build_client(proxy: Option<&str>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT);
    builder = match proxy {
        Some(url) => builder.proxy(reqwest::Proxy::all(url)?),
        None => builder.no_proxy(),
    };
    Ok(builder.build()?)
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        target: &FetchTarget,
        identity: &Identity,
    ) -> std::result::Result<FetchResponse, FetchError> {
        let client = self.client(identity.proxy.as_deref())?;

        let mut request = match target.param(ENDPOINT_PARAM) {
            Some(endpoint) => {
                let form: BTreeMap<&str, &str> = target
                    .params()
                    .iter()
                    .filter(|(k, _)| k.as_str() != ENDPOINT_PARAM)
                    .map(|(k, v)| (k.as_str(), v.as_str()))
                    .collect();
                client.post(endpoint).form(&form)
            }
            None => client.get(target.identifier()),
        };
        request = request.header(reqwest::header::USER_AGENT, &identity.user_agent);
        if let Some(referer) = &self.referer {
            request = request.header(reqwest::header::REFERER, referer);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::MalformedBody(format!("body unreadable: {e}")))?;
        Ok(FetchResponse::new(status, body.to_vec()))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Phase;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn identity() -> Identity {
        Identity {
            proxy: None,
            user_agent: "harvest-test/1.0".into(),
        }
    }

    #[tokio::test]
    async fn get_sends_user_agent_and_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/detail/abc"))
            .and(header("user-agent", "harvest-test/1.0"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
            .expect(1)
            .mount(&server)
            .await;

        let target = FetchTarget::new(Phase::Detail, format!("{}/detail/abc", server.uri()));
        let resp = HttpFetcher::default()
            .fetch(&target, &identity())
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.text(), "<html>ok</html>");
    }

    #[tokio::test]
    async fn endpoint_targets_are_posted_as_forms() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/list"))
            .and(body_string_contains("currentPage=2"))
            .and(body_string_contains("code=KL4S"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"rows":[]}"#))
            .expect(1)
            .mount(&server)
            .await;

        let target = FetchTarget::new(Phase::Listing, "page:2").with_params([
            (ENDPOINT_PARAM.to_string(), format!("{}/list", server.uri())),
            ("currentPage".to_string(), "2".to_string()),
            ("code".to_string(), "KL4S".to_string()),
        ]);
        let resp = HttpFetcher::default()
            .fetch(&target, &identity())
            .await
            .unwrap();
        assert_eq!(resp.text(), r#"{"rows":[]}"#);
    }

    #[tokio::test]
    async fn error_statuses_are_returned_not_raised() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let target = FetchTarget::new(Phase::Attachment, server.uri());
        let resp = HttpFetcher::new(Some("http://example.org/".into()))
            .fetch(&target, &identity())
            .await
            .unwrap();
        assert_eq!(resp.status, 403);
        assert!(!resp.is_success());
    }

    #[tokio::test]
    async fn refused_connection_is_a_fetch_error() {
        // Bind then drop a listener so the port is very likely closed.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let target = FetchTarget::new(Phase::Detail, format!("http://127.0.0.1:{port}/x"));
        let err = HttpFetcher::default()
            .fetch(&target, &identity())
            .await
            .unwrap_err();
        assert!(
            matches!(err, FetchError::Connection(_) | FetchError::Timeout),
            "got {err:?}"
        );
    }

    #[test]
    fn clients_are_cached_per_proxy() {
        let fetcher = HttpFetcher::default();
        fetcher.client(None).unwrap();
        fetcher.client(Some("http://127.0.0.1:3128")).unwrap();
        fetcher.client(None).unwrap();
        assert_eq!(fetcher.clients.lock().unwrap().len(), 2);
    }

    #[test]
    fn client_cache_is_bounded_and_keeps_recent_proxies() {
        let fetcher = HttpFetcher::default();
        fetcher.client(None).unwrap();
        for port in 0..500 {
            fetcher
                .client(Some(&format!("http://127.0.0.1:{}", 10_000 + port)))
                .unwrap();
            // Keep the direct client warm.
            fetcher.client(None).unwrap();
        }
        let clients = fetcher.clients.lock().unwrap();
        assert_eq!(clients.len(), MAX_CACHED_CLIENTS);
        assert!(clients.iter().any(|(k, _)| k.is_none()));
        assert!(
            clients
                .iter()
                .any(|(k, _)| k.as_deref() == Some("http://127.0.0.1:10499"))
        );
    }
}
