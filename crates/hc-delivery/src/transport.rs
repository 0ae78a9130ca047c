//! HTTP transport seam
//!
//! The engine only depends on [`Transport`]. Production wiring uses
//! [`ReqwestTransport`]; tests plug in stubs.

use async_trait::async_trait;
use bytes::Bytes;
use hc_common::HttpMethod;
use hc_config::TransportSettings;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

use crate::error::{DeliveryError, TransportError};

/// A fully rendered request
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub content_type: String,
    pub body: Bytes,
}

/// Response body that has not been read yet
#[derive(Debug)]
pub enum ResponseBody {
    Empty,
    Buffered(Bytes),
    Stream(reqwest::Response),
}

#[derive(Debug)]
pub struct TransportResponse {
    pub status: u16,
    body: ResponseBody,
}

impl TransportResponse {
    pub fn new(status: u16, body: ResponseBody) -> Self {
        Self { status, body }
    }

    pub fn with_status(status: u16) -> Self {
        Self::new(status, ResponseBody::Empty)
    }

    /// Read the remaining body so the connection can go back to the pool
    pub async fn drain(self) -> Bytes {
        match self.body {
            ResponseBody::Empty => Bytes::new(),
            ResponseBody::Buffered(bytes) => bytes,
            ResponseBody::Stream(response) => match response.bytes().await {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!(error = %e, "Failed to drain response body");
                    Bytes::new()
                }
            },
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> Result<TransportResponse, TransportError>;
}

/// `reqwest`-backed transport whose idle pool is sized to the gate capacity
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(settings: &TransportSettings, pool_max: usize) -> Result<Self, DeliveryError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout())
            .timeout(settings.request_timeout())
            .user_agent(settings.user_agent.clone())
            .pool_max_idle_per_host(pool_max)
            .danger_accept_invalid_certs(!settings.verify_tls);

        if let Some(ref proxy) = settings.proxy {
            let proxy = reqwest::Proxy::all(proxy).map_err(TransportError::from)?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build().map_err(TransportError::from)?;
        Ok(Self { client })
    }
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Head => reqwest::Method::HEAD,
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = self
            .client
            .request(to_reqwest_method(request.method), &request.url)
            .header(CONTENT_TYPE, &request.content_type)
            .body(request.body.clone());

        for (name, value) in &request.headers {
            if name.eq_ignore_ascii_case(CONTENT_TYPE.as_str()) {
                continue;
            }
            builder = builder.header(name, value);
        }

        let response = builder.send().await?;
        Ok(TransportResponse::new(
            response.status().as_u16(),
            ResponseBody::Stream(response),
        ))
    }
}
