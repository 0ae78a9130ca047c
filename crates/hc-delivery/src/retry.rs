//! Retry Controller
//!
//! Owns the per-unit loop `Sending -> {Succeeded, Retrying, Failed}`:
//! - success / ignorable ends the loop quietly
//! - retryable outcomes are reported through `on_retry`, backed off and resent
//! - terminal outcomes are reported through `on_failure` and dropped
//!
//! Before every resubmission the shutdown signal is polled; a pending unit is
//! abandoned rather than retried while the pipeline is going down.

use std::sync::Arc;
use std::time::Duration;

use hc_common::{metric_names, Event, FailureDetail, Outcome};
use hc_config::RetryPolicy;
use rand::Rng;
use tracing::{debug, Level};

use crate::dispatcher::{Dispatched, Dispatcher};
use crate::encoder::EncodedBody;
use crate::error::DeliveryError;
use crate::observer::{AbandonReport, AttemptReport, DeliveryObserver, FailureReason, FailureReport, RequestDetails};
use crate::shutdown::ShutdownSignal;
use crate::transport::HttpRequest;

/// Longest uninterrupted sleep during backoff before the shutdown signal is checked again
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Terminal state of one delivery unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Delivered { attempts: u32 },
    Failed { attempts: u32, reason: FailureReason },
    Abandoned { attempts: u32 },
}

impl UnitOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            UnitOutcome::Delivered { attempts }
            | UnitOutcome::Failed { attempts, .. }
            | UnitOutcome::Abandoned { attempts } => *attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Done,
    Retry,
    Fail(FailureReason),
}

pub struct RetryController {
    dispatcher: Arc<Dispatcher>,
    policy: RetryPolicy,
    observer: Arc<dyn DeliveryObserver>,
    shutdown: Arc<dyn ShutdownSignal>,
    log_request_details: bool,
}

impl RetryController {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        policy: RetryPolicy,
        observer: Arc<dyn DeliveryObserver>,
        shutdown: Arc<dyn ShutdownSignal>,
    ) -> Self {
        Self {
            dispatcher,
            policy,
            observer,
            shutdown,
            log_request_details: false,
        }
    }

    /// Always attach headers and body to reports, regardless of log level
    pub fn with_request_details(mut self, enabled: bool) -> Self {
        self.log_request_details = enabled;
        self
    }

    /// Run one unit until it is delivered, fails, or is abandoned.
    ///
    /// `context` is the event URL and header templates render against;
    /// `event_count` is how many events the body carries.
    pub async fn run(&self, context: &Event, body: &EncodedBody, event_count: usize) -> UnitOutcome {
        let mut attempt: u32 = 0;
        let mut last_outcome: Option<Outcome> = None;

        loop {
            if attempt > 0 && self.shutdown.is_requested() {
                return self.abandon(context, attempt, event_count, last_outcome);
            }

            attempt += 1;
            metrics::counter!(metric_names::ATTEMPTS).increment(1);

            let request = self.dispatcher.render_request(context, body);
            let dispatched = self.dispatcher.send(&request).await;

            match self.decide(&dispatched.outcome, attempt) {
                Decision::Done => {
                    debug!(url = %request.url, attempt = attempt, outcome = %dispatched.outcome, "Delivered");
                    metrics::counter!(metric_names::SUCCESS).increment(event_count as u64);
                    return UnitOutcome::Delivered { attempts: attempt };
                }
                Decision::Retry => {
                    metrics::counter!(metric_names::RETRIES).increment(1);
                    let report = self.report(&request, attempt, event_count, &dispatched);
                    self.observer.on_retry(&report);
                    last_outcome = Some(dispatched.outcome);
                    self.backoff(attempt).await;
                }
                Decision::Fail(reason) => {
                    metrics::counter!(metric_names::FAILURES).increment(event_count as u64);
                    let report = FailureReport {
                        attempt: self.report(&request, attempt, event_count, &dispatched),
                        reason,
                    };
                    self.observer.on_failure(&report);
                    return UnitOutcome::Failed { attempts: attempt, reason };
                }
            }
        }
    }

    fn decide(&self, outcome: &Outcome, attempt: u32) -> Decision {
        let (wants_retry, refused) = match outcome {
            Outcome::Success { .. } | Outcome::Ignorable { .. } => return Decision::Done,
            Outcome::Retryable(_) => (self.policy.retry_failed, FailureReason::RetriesDisabled),
            Outcome::Terminal(FailureDetail::Status { .. }) => {
                (self.policy.retry_non_retryable_codes, FailureReason::Terminal)
            }
            Outcome::Terminal(_) => (false, FailureReason::Terminal),
        };

        if !wants_retry {
            return Decision::Fail(refused);
        }
        match self.policy.max_attempts {
            Some(max) if attempt >= max => Decision::Fail(FailureReason::Exhausted),
            _ => Decision::Retry,
        }
    }

    /// Report a unit given up at shutdown or after the gate closed. `attempts` is 0 for units that never started.
    pub fn abandon(
        &self,
        context: &Event,
        attempts: u32,
        event_count: usize,
        last_outcome: Option<Outcome>,
    ) -> UnitOutcome {
        metrics::counter!(metric_names::ABANDONED).increment(event_count as u64);
        let report = AbandonReport {
            url: self.dispatcher.render_url(context),
            attempts,
            event_count,
            last_outcome,
        };
        self.observer.on_abandoned(&report);
        UnitOutcome::Abandoned { attempts }
    }

    /// Report a unit whose body could not be encoded. Nothing is sent.
    pub fn reject(&self, context: &Event, event_count: usize, error: &DeliveryError) -> UnitOutcome {
        metrics::counter!(metric_names::FAILURES).increment(event_count as u64);
        let report = FailureReport {
            attempt: AttemptReport {
                method: self.dispatcher.method(),
                url: self.dispatcher.render_url(context),
                attempt: 0,
                event_count,
                outcome: Outcome::Terminal(FailureDetail::Encode { message: error.to_string() }),
                details: None,
            },
            reason: FailureReason::Terminal,
        };
        self.observer.on_failure(&report);
        UnitOutcome::Failed { attempts: 0, reason: FailureReason::Terminal }
    }

    async fn backoff(&self, attempt: u32) {
        let mut remaining = backoff_delay(&self.policy, attempt, rand::thread_rng().gen_range(-1.0..=1.0));
        while !remaining.is_zero() {
            if self.shutdown.is_requested() {
                return;
            }
            let step = remaining.min(SHUTDOWN_POLL_INTERVAL);
            tokio::time::sleep(step).await;
            remaining -= step;
        }
    }

    fn report(
        &self,
        request: &HttpRequest,
        attempt: u32,
        event_count: usize,
        dispatched: &Dispatched,
    ) -> AttemptReport {
        let verbose = self.log_request_details || tracing::enabled!(Level::DEBUG);
        let details = verbose.then(|| RequestDetails {
            headers: request.headers.clone(),
            body: String::from_utf8_lossy(&request.body).into_owned(),
            response_body: dispatched
                .response_body
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned()),
        });

        AttemptReport {
            method: request.method,
            url: request.url.clone(),
            attempt,
            event_count,
            outcome: dispatched.outcome.clone(),
            details,
        }
    }
}

/// Capped exponential delay before retry number `attempt`.
///
/// `jitter_sample` in `[-1.0, 1.0]` scales the configured jitter fraction.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32, jitter_sample: f64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let base = policy
        .initial_backoff
        .saturating_mul(1u32 << exponent)
        .min(policy.max_backoff);

    let factor = 1.0 + policy.jitter * jitter_sample.clamp(-1.0, 1.0);
    base.mul_f64(factor.max(0.0)).min(policy.max_backoff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::shutdown::{NeverShutdown, ShutdownFlag};
    use crate::transport::{Transport, TransportResponse};
    use async_trait::async_trait;
    use bytes::Bytes;
    use hc_common::HttpMethod;
    use hc_config::OutputSettings;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays scripted responses, then keeps answering with the fallback
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<u16, TransportError>>>,
        fallback: u16,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<u16, TransportError>>, fallback: u16) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fallback,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, _request: &HttpRequest) -> Result<TransportResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().pop_front().unwrap_or(Ok(self.fallback));
            next.map(TransportResponse::with_status)
        }
    }

    #[derive(Default)]
    struct CountingObserver {
        retries: Mutex<Vec<AttemptReport>>,
        failures: Mutex<Vec<FailureReport>>,
        abandoned: AtomicUsize,
    }

    impl DeliveryObserver for CountingObserver {
        fn on_retry(&self, report: &AttemptReport) {
            self.retries.lock().push(report.clone());
        }

        fn on_failure(&self, report: &FailureReport) {
            self.failures.lock().push(report.clone());
        }

        fn on_abandoned(&self, _report: &AbandonReport) {
            self.abandoned.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast_settings() -> OutputSettings {
        let mut settings = OutputSettings::new("http://localhost/ingest", HttpMethod::Post);
        settings.retry.initial_backoff_ms = 1;
        settings.retry.max_backoff_ms = 2;
        settings.retry.jitter = 0.0;
        settings
    }

    fn controller(
        settings: OutputSettings,
        transport: Arc<ScriptedTransport>,
        observer: Arc<CountingObserver>,
        shutdown: Arc<dyn ShutdownSignal>,
    ) -> RetryController {
        let config = settings.validate().unwrap();
        let dispatcher = Arc::new(Dispatcher::new(&config, transport));
        RetryController::new(dispatcher, config.retry.clone(), observer, shutdown)
    }

    fn body() -> EncodedBody {
        EncodedBody {
            bytes: Bytes::from_static(b"{\"secret\":\"s3cr3t\"}"),
            content_type: "application/json".to_string(),
        }
    }

    #[tokio::test]
    async fn test_success_needs_no_callbacks() {
        let transport = ScriptedTransport::new(vec![], 200);
        let observer = Arc::new(CountingObserver::default());
        let controller = controller(fast_settings(), transport.clone(), observer.clone(), Arc::new(NeverShutdown));

        let outcome = controller.run(&Event::new(), &body(), 1).await;
        assert_eq!(outcome, UnitOutcome::Delivered { attempts: 1 });
        assert_eq!(transport.calls(), 1);
        assert!(observer.retries.lock().is_empty());
        assert!(observer.failures.lock().is_empty());
    }

    #[tokio::test]
    async fn test_ignorable_needs_no_callbacks() {
        let transport = ScriptedTransport::new(vec![], 404);
        let observer = Arc::new(CountingObserver::default());
        let mut settings = fast_settings();
        settings.ignorable_codes = vec![404];
        let controller = controller(settings, transport.clone(), observer.clone(), Arc::new(NeverShutdown));

        let outcome = controller.run(&Event::new(), &body(), 1).await;
        assert_eq!(outcome, UnitOutcome::Delivered { attempts: 1 });
        assert!(observer.retries.lock().is_empty());
        assert!(observer.failures.lock().is_empty());
    }

    #[tokio::test]
    async fn test_retry_twice_then_succeed() {
        let transport = ScriptedTransport::new(vec![Ok(429), Ok(429)], 200);
        let observer = Arc::new(CountingObserver::default());
        let controller = controller(fast_settings(), transport.clone(), observer.clone(), Arc::new(NeverShutdown));

        let outcome = controller.run(&Event::new(), &body(), 1).await;
        assert_eq!(outcome, UnitOutcome::Delivered { attempts: 3 });
        assert_eq!(transport.calls(), 3);

        let retries = observer.retries.lock();
        assert_eq!(retries.len(), 2);
        assert_eq!(retries[0].attempt, 1);
        assert_eq!(retries[1].attempt, 2);
        assert!(observer.failures.lock().is_empty());
    }

    #[tokio::test]
    async fn test_server_errors_and_transient_transport_errors_retry() {
        let transport = ScriptedTransport::new(
            vec![Ok(500), Err(TransportError::transient("connection reset")), Ok(503)],
            201,
        );
        let observer = Arc::new(CountingObserver::default());
        let controller = controller(fast_settings(), transport.clone(), observer.clone(), Arc::new(NeverShutdown));

        let outcome = controller.run(&Event::new(), &body(), 1).await;
        assert_eq!(outcome, UnitOutcome::Delivered { attempts: 4 });
        assert_eq!(observer.retries.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_bad_request_fails_once() {
        let transport = ScriptedTransport::new(vec![], 400);
        let observer = Arc::new(CountingObserver::default());
        let controller = controller(fast_settings(), transport.clone(), observer.clone(), Arc::new(NeverShutdown));

        let outcome = controller.run(&Event::new(), &body(), 1).await;
        assert_eq!(outcome, UnitOutcome::Failed { attempts: 1, reason: FailureReason::Terminal });
        assert_eq!(transport.calls(), 1);
        assert!(observer.retries.lock().is_empty());

        let failures = observer.failures.lock();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].attempt.outcome, Outcome::Terminal(FailureDetail::Status { code: 400 }));
    }

    #[tokio::test]
    async fn test_fatal_transport_error_fails() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::fatal("builder error"))], 200);
        let observer = Arc::new(CountingObserver::default());
        let controller = controller(fast_settings(), transport.clone(), observer.clone(), Arc::new(NeverShutdown));

        let outcome = controller.run(&Event::new(), &body(), 1).await;
        assert_eq!(outcome, UnitOutcome::Failed { attempts: 1, reason: FailureReason::Terminal });
        assert_eq!(observer.failures.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_failed_disabled() {
        let transport = ScriptedTransport::new(vec![], 503);
        let observer = Arc::new(CountingObserver::default());
        let mut settings = fast_settings();
        settings.retry_failed = false;
        let controller = controller(settings, transport.clone(), observer.clone(), Arc::new(NeverShutdown));

        let outcome = controller.run(&Event::new(), &body(), 1).await;
        assert_eq!(
            outcome,
            UnitOutcome::Failed { attempts: 1, reason: FailureReason::RetriesDisabled }
        );
        assert!(observer.retries.lock().is_empty());
        assert_eq!(observer.failures.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_max_attempts_exhausted() {
        let transport = ScriptedTransport::new(vec![], 502);
        let observer = Arc::new(CountingObserver::default());
        let mut settings = fast_settings();
        settings.max_attempts = Some(3);
        let controller = controller(settings, transport.clone(), observer.clone(), Arc::new(NeverShutdown));

        let outcome = controller.run(&Event::new(), &body(), 1).await;
        assert_eq!(outcome, UnitOutcome::Failed { attempts: 3, reason: FailureReason::Exhausted });
        assert_eq!(transport.calls(), 3);
        assert_eq!(observer.retries.lock().len(), 2);
        assert_eq!(observer.failures.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_non_retryable_codes_policy() {
        let transport = ScriptedTransport::new(vec![Ok(400)], 200);
        let observer = Arc::new(CountingObserver::default());
        let mut settings = fast_settings();
        settings.retry_non_retryable_codes = true;
        let controller = controller(settings, transport.clone(), observer.clone(), Arc::new(NeverShutdown));

        let outcome = controller.run(&Event::new(), &body(), 1).await;
        assert_eq!(outcome, UnitOutcome::Delivered { attempts: 2 });
        assert_eq!(observer.retries.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_abandons_pending_retry() {
        let transport = ScriptedTransport::new(vec![], 503);
        let observer = Arc::new(CountingObserver::default());
        let flag = ShutdownFlag::new();
        let controller = controller(fast_settings(), transport.clone(), observer.clone(), Arc::new(flag.clone()));

        let run = tokio::spawn(async move { controller.run(&Event::new(), &body(), 1).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        flag.request();

        let outcome = tokio::time::timeout(Duration::from_secs(2), run).await.unwrap().unwrap();
        assert!(matches!(outcome, UnitOutcome::Abandoned { attempts } if attempts >= 1));
        assert_eq!(observer.abandoned.load(Ordering::SeqCst), 1);
        assert!(observer.failures.lock().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_still_allows_first_attempt() {
        let transport = ScriptedTransport::new(vec![], 200);
        let observer = Arc::new(CountingObserver::default());
        let flag = ShutdownFlag::new();
        flag.request();
        let controller = controller(fast_settings(), transport.clone(), observer.clone(), Arc::new(flag));

        let outcome = controller.run(&Event::new(), &body(), 1).await;
        assert_eq!(outcome, UnitOutcome::Delivered { attempts: 1 });
    }

    #[tokio::test]
    async fn test_reports_omit_details_by_default() {
        let transport = ScriptedTransport::new(vec![Ok(429)], 400);
        let observer = Arc::new(CountingObserver::default());
        let mut settings = fast_settings();
        settings.headers.insert("Authorization".to_string(), "Bearer token".to_string());
        let controller = controller(settings, transport, observer.clone(), Arc::new(NeverShutdown));

        controller.run(&Event::new(), &body(), 1).await;
        assert!(observer.retries.lock()[0].details.is_none());
        assert!(observer.failures.lock()[0].attempt.details.is_none());
    }

    #[tokio::test]
    async fn test_reports_include_details_when_enabled() {
        let transport = ScriptedTransport::new(vec![], 400);
        let observer = Arc::new(CountingObserver::default());
        let mut settings = fast_settings();
        settings.headers.insert("Authorization".to_string(), "Bearer token".to_string());
        let controller = controller(settings, transport, observer.clone(), Arc::new(NeverShutdown))
            .with_request_details(true);

        controller.run(&Event::new(), &body(), 1).await;
        let failures = observer.failures.lock();
        let details = failures[0].attempt.details.as_ref().unwrap();
        assert_eq!(details.headers, vec![("Authorization".to_string(), "Bearer token".to_string())]);
        assert!(details.body.contains("s3cr3t"));
    }

    #[tokio::test]
    async fn test_unencodable_unit_reported_as_failure() {
        let transport = ScriptedTransport::new(vec![], 200);
        let observer = Arc::new(CountingObserver::default());
        let controller = controller(fast_settings(), transport.clone(), observer.clone(), Arc::new(NeverShutdown));
        let error = DeliveryError::Encode(serde_json::from_str::<serde_json::Value>("{").unwrap_err());

        let outcome = controller.reject(&Event::new(), 2, &error);
        assert_eq!(outcome, UnitOutcome::Failed { attempts: 0, reason: FailureReason::Terminal });
        assert_eq!(transport.calls(), 0);
        assert!(observer.retries.lock().is_empty());

        let failures = observer.failures.lock();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].attempt.attempt, 0);
        assert_eq!(failures[0].attempt.event_count, 2);
        assert!(matches!(
            failures[0].attempt.outcome,
            Outcome::Terminal(FailureDetail::Encode { .. })
        ));
    }

    #[test]
    fn test_backoff_delay_is_capped_exponential() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
            jitter: 0.0,
            ..Default::default()
        };

        assert_eq!(backoff_delay(&policy, 1, 0.0), Duration::from_millis(100));
        assert_eq!(backoff_delay(&policy, 2, 0.0), Duration::from_millis(200));
        assert_eq!(backoff_delay(&policy, 4, 0.0), Duration::from_millis(800));
        assert_eq!(backoff_delay(&policy, 5, 0.0), Duration::from_millis(1000));
        assert_eq!(backoff_delay(&policy, 60, 0.0), Duration::from_millis(1000));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            jitter: 0.5,
            ..Default::default()
        };

        assert_eq!(backoff_delay(&policy, 1, -1.0), Duration::from_millis(50));
        assert_eq!(backoff_delay(&policy, 1, 1.0), Duration::from_millis(150));
    }
}
