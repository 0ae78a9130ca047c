//! Delivery observer callbacks
//!
//! The retry controller reports through two distinguishable callbacks: one for
//! retryable responses and one for failures. Request headers and bodies are
//! only attached to reports when diagnostic detail is enabled.

use hc_common::{HttpMethod, Outcome};
use std::fmt;
use tracing::{error, warn};

/// Request details, only captured at diagnostic verbosity
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDetails {
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub response_body: Option<String>,
}

/// Why a unit stopped without being delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Outcome is not retryable
    Terminal,
    /// Outcome was retryable but retries are disabled
    RetriesDisabled,
    /// The attempt cap was reached
    Exhausted,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FailureReason::Terminal => "terminal",
            FailureReason::RetriesDisabled => "retries disabled",
            FailureReason::Exhausted => "attempts exhausted",
        };
        f.write_str(text)
    }
}

/// Everything known about one attempt
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptReport {
    pub method: HttpMethod,
    pub url: String,
    /// 1-based attempt number
    pub attempt: u32,
    /// Number of events carried by the request (more than one for `json_batch`)
    pub event_count: usize,
    pub outcome: Outcome,
    pub details: Option<RequestDetails>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailureReport {
    pub attempt: AttemptReport,
    pub reason: FailureReason,
}

/// A unit abandoned at shutdown, or never started because the gate closed
#[derive(Debug, Clone, PartialEq)]
pub struct AbandonReport {
    pub url: String,
    pub attempts: u32,
    pub event_count: usize,
    pub last_outcome: Option<Outcome>,
}

pub trait DeliveryObserver: Send + Sync {
    /// A retryable response was encountered; the request will be resubmitted
    fn on_retry(&self, report: &AttemptReport);

    /// The unit failed and its events are dropped
    fn on_failure(&self, report: &FailureReport);

    fn on_abandoned(&self, _report: &AbandonReport) {}
}

/// Default observer that writes reports to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl DeliveryObserver for TracingObserver {
    fn on_retry(&self, report: &AttemptReport) {
        match &report.details {
            Some(details) => warn!(
                method = %report.method,
                url = %report.url,
                attempt = report.attempt,
                events = report.event_count,
                outcome = %report.outcome,
                headers = ?details.headers,
                body = %details.body,
                response = ?details.response_body,
                "Encountered retryable HTTP response, will retry"
            ),
            None => warn!(
                method = %report.method,
                url = %report.url,
                attempt = report.attempt,
                events = report.event_count,
                outcome = %report.outcome,
                "Encountered retryable HTTP response, will retry"
            ),
        }
    }

    fn on_failure(&self, report: &FailureReport) {
        let attempt = &report.attempt;
        match &attempt.details {
            Some(details) => error!(
                method = %attempt.method,
                url = %attempt.url,
                attempt = attempt.attempt,
                events = attempt.event_count,
                outcome = %attempt.outcome,
                reason = %report.reason,
                headers = ?details.headers,
                body = %details.body,
                response = ?details.response_body,
                "Could not deliver event, dropping it"
            ),
            None => error!(
                method = %attempt.method,
                url = %attempt.url,
                attempt = attempt.attempt,
                events = attempt.event_count,
                outcome = %attempt.outcome,
                reason = %report.reason,
                "Could not deliver event, dropping it"
            ),
        }
    }

    fn on_abandoned(&self, report: &AbandonReport) {
        error!(
            url = %report.url,
            attempts = report.attempts,
            events = report.event_count,
            last_outcome = ?report.last_outcome,
            "Abandoning undelivered events"
        );
    }
}
