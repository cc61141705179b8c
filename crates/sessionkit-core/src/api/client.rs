//! Production transport over reqwest.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde_json::Value;
use tracing::{debug, warn};

use super::{ApiError, Method, Request, Transport};

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    initial_backoff_ms: u64,
}

impl ReqwestTransport {
    pub fn new(timeout_secs: u64) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            client,
            initial_backoff_ms: INITIAL_BACKOFF_MS,
        })
    }

    /// Override the first rate-limit backoff delay
    pub fn with_backoff(mut self, initial_backoff_ms: u64) -> Self {
        self.initial_backoff_ms = initial_backoff_ms;
        self
    }

    fn build(&self, request: &Request) -> reqwest::RequestBuilder {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
            Method::Put => self.client.put(&request.url),
            Method::Delete => self.client.delete(&request.url),
        };
        builder = builder.header(header::ACCEPT, "application/json");
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        builder
    }

    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(
        response: reqwest::Response,
    ) -> Result<Option<reqwest::Response>, ApiError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    /// Empty bodies (204, or a bare 200) decode to `Value::Null`
    async fn decode(response: reqwest::Response) -> Result<Value, ApiError> {
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON response: {}", e)))
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: Request) -> Result<Value, ApiError> {
        let mut retries = 0;
        let mut backoff_ms = self.initial_backoff_ms;

        loop {
            debug!(method = %request.method, url = %request.url, "Sending request");
            let response = self.build(&request).send().await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => return Self::decode(response).await,
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(url = %request.url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use wiremock::matchers::{body_json, header as header_is, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(method: Method, url: String, body: Option<Value>) -> Request {
        Request {
            method,
            url,
            body,
            headers: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_send_decodes_json_and_forwards_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .and(header_is("x-client", "cli"))
            .and(body_json(json!({"email": "a@b.c"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "T"})))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(5).unwrap();
        let mut req = request(
            Method::Post,
            format!("{}/auth/login", server.uri()),
            Some(json!({"email": "a@b.c"})),
        );
        req.headers.insert("x-client".to_string(), "cli".to_string());

        let res = transport.send(req).await.unwrap();
        assert_eq!(res, json!({"access_token": "T"}));
    }

    #[tokio::test]
    async fn test_empty_body_is_null() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/logout"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(5).unwrap();
        let res = transport
            .send(request(Method::Post, format!("{}/auth/logout", server.uri()), None))
            .await
            .unwrap();
        assert_eq!(res, Value::Null);
    }

    #[tokio::test]
    async fn test_status_errors_are_mapped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/user"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"message": "Unauthenticated."})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/register"))
            .respond_with(ResponseTemplate::new(422).set_body_json(json!({
                "message": "Password is weak.",
                "errors": {"password": "Password is weak."}
            })))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(5).unwrap();
        let err = transport
            .send(request(Method::Get, format!("{}/auth/user", server.uri()), None))
            .await
            .unwrap_err();
        assert!(err.is_unauthorized());

        let err = transport
            .send(request(Method::Post, format!("{}/auth/register", server.uri()), Some(json!({}))))
            .await
            .unwrap_err();
        match err {
            ApiError::Validation { message, errors, .. } => {
                assert_eq!(message, "Password is weak.");
                assert!(errors.contains_key("password"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rate_limit_retries_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/user"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/auth/user"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"id": 1}})))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(5).unwrap().with_backoff(1);
        let res = transport
            .send(request(Method::Get, format!("{}/auth/user", server.uri()), None))
            .await
            .unwrap();
        assert_eq!(res["data"]["id"], 1);
    }

    #[tokio::test]
    async fn test_rate_limit_gives_up() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(5).unwrap().with_backoff(1);
        let err = transport
            .send(request(Method::Get, format!("{}/anything", server.uri()), None))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::RateLimited));
    }
}
