//! Remote execution bridge to a Continuum browser-automation server.
//!
//! One WebSocket carries every request and every reply. Replies are matched
//! to callers either by an echoed `commandId` or, for commands whose replies
//! carry no id, by handing them to the newest waiter of the same family.
//!
//! Layering, leaf first:
//! - [`transport`]: the WebSocket connection and greeting handshake
//! - [`router`]: classification and delivery of inbound frames
//! - [`correlation`]: pending requests and their single-use result slots
//! - [`envelope`]: peeling nested reply envelopes into an outcome
//! - [`client`]: the public submit API

pub mod client;
pub mod correlation;
pub mod envelope;
pub mod frame;
pub mod router;
pub mod transport;

pub use client::{CorrelationScheme, RemoteExecutionClient, SubmitOptions};
pub use correlation::{CorrelationKey, CorrelationTable, Family, PendingRequest, RequestState};
pub use envelope::{ConsoleBuckets, ExecutionOutcome, FailureKind, LogEntry, LogLevel, OutcomeError};
pub use frame::{CommandIdGenerator, TaskFrame};
pub use router::{Route, RoutedMessage, Router};
pub use transport::{Connection, ConnectionState};
