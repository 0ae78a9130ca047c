//! HttpCourier delivery engine
//!
//! Sends events to a configured HTTP endpoint:
//! - `mapper` / `template`: reshape events and render `%{field}` references
//! - `encoder`: json, json_batch, form and message bodies
//! - `gate`: bounds outstanding requests to `pool_max`
//! - `dispatcher`: renders the request and classifies the response
//! - `retry`: retries retryable outcomes until success, failure or shutdown
//! - `engine`: fans a batch out into delivery units and waits for them

pub mod dispatcher;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod gate;
pub mod mapper;
pub mod observer;
pub mod retry;
pub mod shutdown;
pub mod template;
pub mod transport;

pub use dispatcher::{classify, Dispatched, Dispatcher};
pub use encoder::{BodyEncoder, EncodedBody};
pub use engine::{DeliveryEngine, DeliverySummary, EngineBuilder};
pub use error::{DeliveryError, Result, TransportError, TransportErrorKind};
pub use gate::{ConcurrencyGate, GateToken};
pub use mapper::FieldMapper;
pub use observer::{AbandonReport, AttemptReport, DeliveryObserver, FailureReason, FailureReport, TracingObserver};
pub use retry::{backoff_delay, RetryController, UnitOutcome};
pub use shutdown::{NeverShutdown, ShutdownFlag, ShutdownSignal};
pub use template::Template;
pub use transport::{HttpRequest, ReqwestTransport, Transport, TransportResponse};
