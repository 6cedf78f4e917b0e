//! `reqwest`-backed transport.

use std::time::Duration;

use async_trait::async_trait;
use enricher_shared::{EnricherError, Result, ResultMap, ServiceConfig, Subject};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use tracing::{debug, instrument};
use url::Url;

use crate::wire::{ClassifyRequest, decode_remaining, decode_results};
use crate::{StatusSource, Transport, TransportError};

/// User-Agent string for service requests.
const USER_AGENT: &str = concat!("enricher/", env!("CARGO_PKG_VERSION"));

/// Largest response body accepted (2 MB).
const MAX_RESPONSE_SIZE: u64 = 2 * 1024 * 1024;

/// Connection settings for [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub endpoint: Url,
    pub status_endpoint: Option<Url>,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl HttpOptions {
    /// Build options from the `[service]` config section.
    pub fn from_config(service: &ServiceConfig, api_key: Option<String>) -> Result<Self> {
        let endpoint = Url::parse(&service.endpoint).map_err(|e| {
            EnricherError::config(format!("invalid service endpoint '{}': {e}", service.endpoint))
        })?;
        let status_endpoint = service
            .status_endpoint
            .as_deref()
            .map(|s| {
                Url::parse(s).map_err(|e| {
                    EnricherError::config(format!("invalid status endpoint '{s}': {e}"))
                })
            })
            .transpose()?;
        Ok(Self {
            endpoint,
            status_endpoint,
            api_key,
            timeout_secs: service.timeout_secs,
        })
    }
}

/// Classification over HTTP: one JSON POST per subject.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    options: HttpOptions,
}

impl HttpTransport {
    pub fn new(options: HttpOptions) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(options.timeout_secs))
            .build()
            .map_err(|e| EnricherError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, options })
    }

    /// Status client sharing this transport's connection pool, if a status
    /// endpoint is configured.
    pub fn status_source(&self) -> Option<HttpStatusSource> {
        self.options
            .status_endpoint
            .clone()
            .map(|endpoint| HttpStatusSource {
                client: self.client.clone(),
                endpoint,
                api_key: self.options.api_key.clone(),
            })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip_all, fields(subject = %subject.key))]
    async fn request(&self, subject: &Subject) -> std::result::Result<ResultMap, TransportError> {
        let request = self
            .client
            .post(self.options.endpoint.clone())
            .json(&ClassifyRequest::from(subject));
        let body = send_json(with_key(request, self.options.api_key.as_deref())).await?;
        let results = decode_results(&body)?;
        debug!(categories = results.len(), "classification received");
        Ok(results)
    }
}

/// Reads authoritative remaining quota with `GET <endpoint>?budget=<name>`.
#[derive(Debug, Clone)]
pub struct HttpStatusSource {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    #[instrument(skip_all, fields(budget = %budget))]
    async fn remaining(&self, budget: &str) -> std::result::Result<u64, TransportError> {
        let request = self
            .client
            .get(self.endpoint.clone())
            .query(&[("budget", budget)]);
        let body = send_json(with_key(request, self.api_key.as_deref())).await?;
        decode_remaining(&body)
    }
}

fn with_key(request: RequestBuilder, api_key: Option<&str>) -> RequestBuilder {
    match api_key {
        Some(key) => request.bearer_auth(key),
        None => request,
    }
}

/// Send a request and parse a successful JSON body.
async fn send_json(request: RequestBuilder) -> std::result::Result<Value, TransportError> {
    let response = request
        .send()
        .await
        .map_err(|e| TransportError::Network(e.to_string()))?;
    read_json(response).await
}

async fn read_json(response: Response) -> std::result::Result<Value, TransportError> {
    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::Status(status.as_u16()));
    }

    if let Some(len) = response.content_length() {
        if len > MAX_RESPONSE_SIZE {
            return Err(TransportError::Malformed(format!(
                "response too large ({len} bytes, max {MAX_RESPONSE_SIZE})"
            )));
        }
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| TransportError::Network(format!("failed to read body: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| TransportError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use enricher_shared::SubjectKind;
    use std::collections::BTreeMap;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport(server: &MockServer) -> HttpTransport {
        HttpTransport::new(HttpOptions {
            endpoint: Url::parse(&format!("{}/classify", server.uri())).unwrap(),
            status_endpoint: Some(Url::parse(&format!("{}/status", server.uri())).unwrap()),
            api_key: Some("secret".into()),
            timeout_secs: 5,
        })
        .unwrap()
    }

    fn url_subject(key: &str) -> Subject {
        Subject {
            key: key.into(),
            kind: SubjectKind::Url,
            source_fields: vec!["Homepage".into()],
            params: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn request_posts_subject_and_decodes_results() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/classify"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(serde_json::json!({
                "subject": "https://example.com",
                "kind": "url"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": {"CMS": ["WordPress"], "Frameworks": [{"name": "React"}]}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let results = transport(&server)
            .request(&url_subject("https://example.com"))
            .await
            .unwrap();
        assert_eq!(results["CMS"], vec!["WordPress"]);
        assert_eq!(results["Frameworks"], vec!["React"]);
    }

    #[tokio::test]
    async fn document_params_are_forwarded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/classify"))
            .and(body_partial_json(serde_json::json!({
                "kind": "document",
                "params": {"file": "f-9", "question": "Summary"}
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"results": {"Summary": "Short."}})),
            )
            .mount(&server)
            .await;

        let mut params = BTreeMap::new();
        params.insert("file".to_string(), "f-9".to_string());
        params.insert("question".to_string(), "Summary".to_string());
        let subject = Subject {
            key: "file:f-9#q:Summary".into(),
            kind: SubjectKind::Document,
            source_fields: vec!["Report".into()],
            params,
        };
        let results = transport(&server).request(&subject).await.unwrap();
        assert_eq!(results["Summary"], vec!["Short."]);
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let err = transport(&server)
            .request(&url_subject("https://example.com"))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Status(429));
    }

    #[tokio::test]
    async fn non_json_body_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let err = transport(&server)
            .request(&url_subject("https://example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Malformed(_)));
    }

    #[tokio::test]
    async fn unreachable_service_is_a_network_error() {
        let server = MockServer::start().await;
        let t = transport(&server);
        drop(server);

        let err = t.request(&url_subject("https://example.com")).await.unwrap_err();
        assert!(matches!(err, TransportError::Network(_)));
    }

    #[tokio::test]
    async fn status_source_reads_remaining() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .and(query_param("budget", "detections"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"remaining": 120})),
            )
            .mount(&server)
            .await;

        let status = transport(&server).status_source().unwrap();
        assert_eq!(status.remaining("detections").await.unwrap(), 120);
    }

    #[test]
    fn options_from_config() {
        let service = ServiceConfig {
            endpoint: "https://api.example.com/v1/classify".into(),
            status_endpoint: None,
            ..ServiceConfig::default()
        };
        let opts = HttpOptions::from_config(&service, None).unwrap();
        assert_eq!(opts.endpoint.host_str(), Some("api.example.com"));
        assert!(opts.status_endpoint.is_none());

        let broken = ServiceConfig {
            endpoint: "not a url".into(),
            ..ServiceConfig::default()
        };
        assert!(HttpOptions::from_config(&broken, None).is_err());
    }
}
