//! reqwest-backed HTTP transport.

use async_trait::async_trait;
use skein_core::{ClientConfig, ClientError, ClientResult, HttpRequest, HttpResponse, HttpTransport};

#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestTransport {
    pub fn new(config: &ClientConfig) -> ClientResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;
        Ok(Self::with_client(client, &config.api_base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for `uri`; absolute URIs pass through.
    pub fn url(&self, uri: &str) -> String {
        resolve(&self.base_url, uri)
    }
}

pub(crate) fn resolve(base_url: &str, uri: &str) -> String {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        uri.to_string()
    } else {
        format!("{}{}", base_url, uri)
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> ClientResult<HttpResponse> {
        let url = self.url(&request.uri);
        let mut builder = self
            .client
            .request(request.method, url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
