//! Networking
//!
//! Every manifest, segment, license and certificate request goes through the
//! [`NetworkingEngine`], which owns retries, URI rotation, timeouts,
//! cancellation and the modifier chain. The actual transfer is delegated to a
//! [`Transport`].

pub mod backoff;
pub mod engine;
pub mod modifiers;
pub mod request;
pub mod transport;

pub use backoff::Backoff;
pub use engine::{CdnFallback, NetworkingEngine, RecoverableErrorObserver, TraceObserver};
pub use modifiers::{request_fn, response_fn, ModifierChain, RequestModifier, ResponseModifier};
pub use request::{DownloadTrace, Request, RequestType, Response};
pub use transport::{HttpTransport, Progress, Transport, TransportError, TransportResponse};
