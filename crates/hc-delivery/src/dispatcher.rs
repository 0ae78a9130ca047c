//! Dispatcher
//!
//! Renders the URL and header templates for one attempt, sends the request and
//! classifies the result. Classification is applied in order:
//! 1. transient transport error -> retryable
//! 2. any other transport error -> terminal
//! 3. 2xx -> success, ignorable code -> ignorable
//! 4. retryable code (429 / 5xx by default) -> retryable
//! 5. anything else -> terminal

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use hc_common::{Event, FailureDetail, HttpMethod, Outcome};
use hc_config::{DeliveryConfig, RetryableCodes};
use tracing::debug;

use crate::encoder::EncodedBody;
use crate::error::TransportError;
use crate::template::Template;
use crate::transport::{HttpRequest, Transport};

/// Result of one attempt, with the drained body of failed responses
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub outcome: Outcome,
    pub response_body: Option<Bytes>,
}

pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    method: HttpMethod,
    url: Template,
    headers: Vec<(String, Template)>,
    ignorable_codes: BTreeSet<u16>,
    retryable_codes: RetryableCodes,
}

impl Dispatcher {
    pub fn new(config: &DeliveryConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            method: config.method,
            url: Template::parse(&config.url),
            headers: config
                .headers
                .iter()
                .map(|(name, value)| (name.clone(), Template::parse(value)))
                .collect(),
            ignorable_codes: config.ignorable_codes.clone(),
            retryable_codes: config.retry.retryable_codes.clone(),
        }
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn render_url(&self, event: &Event) -> String {
        self.url.render(event)
    }

    /// Render URL and headers against `event`. Called fresh for every attempt.
    pub fn render_request(&self, event: &Event, body: &EncodedBody) -> HttpRequest {
        HttpRequest {
            method: self.method,
            url: self.render_url(event),
            headers: self
                .headers
                .iter()
                .map(|(name, template)| (name.clone(), template.render(event)))
                .collect(),
            content_type: body.content_type.clone(),
            body: body.bytes.clone(),
        }
    }

    pub async fn send(&self, request: &HttpRequest) -> Dispatched {
        match self.transport.send(request).await {
            Ok(response) => {
                let status = response.status;
                let outcome = classify(Ok(status), &self.ignorable_codes, &self.retryable_codes);
                let body = response.drain().await;
                debug!(
                    url = %request.url,
                    status = status,
                    drained_bytes = body.len(),
                    "Response received"
                );
                let response_body = if outcome.is_delivered() { None } else { Some(body) };
                Dispatched { outcome, response_body }
            }
            Err(e) => Dispatched {
                outcome: classify(Err(&e), &self.ignorable_codes, &self.retryable_codes),
                response_body: None,
            },
        }
    }
}

/// Classify a transport result into an [`Outcome`]
pub fn classify(
    result: Result<u16, &TransportError>,
    ignorable_codes: &BTreeSet<u16>,
    retryable_codes: &RetryableCodes,
) -> Outcome {
    match result {
        Err(e) if e.is_transient() => Outcome::Retryable(FailureDetail::Transport {
            message: e.message.clone(),
        }),
        Err(e) => Outcome::Terminal(FailureDetail::Transport { message: e.message.clone() }),
        Ok(status) if (200..=299).contains(&status) => Outcome::Success { status },
        Ok(status) if ignorable_codes.contains(&status) => Outcome::Ignorable { status },
        Ok(status) if retryable_codes.contains(status) => {
            Outcome::Retryable(FailureDetail::Status { code: status })
        }
        Ok(status) => Outcome::Terminal(FailureDetail::Status { code: status }),
    }
}
