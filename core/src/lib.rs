//! Client-side request engine for a REDCap-style data API.
//!
//! # Overview
//! Every operation is a POST to a single endpoint, selected by a `content`
//! resource kind and an `action`. The engine validates options against a
//! per-operation scope table, encodes the request (form or multipart),
//! dispatches it with a deadline, and classifies the response, including
//! error envelopes the service returns with a 2xx status.
//!
//! # Design
//! - Encoding and classification are pure: `RequestEncoder` produces a
//!   `WireRequest` and `classify` consumes a `RawResponse`, so both are tested
//!   without a network.
//! - I/O sits behind two seams: `Transport` for the exchange and `FileStore`
//!   for downloaded files. Logging goes through the `LogSink` collaborator.
//! - Response bodies are returned verbatim; the engine never parses records.
//! - `RedcapClient` holds no credentials; the token is an argument to every
//!   call.

pub mod classify;
pub mod client;
pub mod config;
pub mod encode;
pub mod endpoint;
pub mod error;
pub mod http;
pub mod log;
pub mod options;
pub mod payload;
pub mod storage;
pub mod transport;
pub mod types;

pub use classify::{classify, Classifier, Expected, ResponsePayload, ResultEnvelope};
pub use client::{FileDownload, RedcapClient};
pub use config::ClientConfig;
pub use encode::RequestEncoder;
pub use endpoint::{endpoint, OperationDescriptor};
pub use error::{DomainError, EncodingError, InvalidConfiguration, RedcapError, StorageError, TransportError};
pub use http::{FileMetadata, RawResponse, WireRequest};
pub use log::{CallSite, LogSink, Severity, Stage, TracingLogSink};
pub use options::{OptionKey, OptionValue, ParameterSet};
pub use payload::{FileUpload, Payload};
pub use storage::{FileStore, FsFileStore};
pub use transport::{Deadline, Dispatcher, HttpTransport, Transport};
pub use types::{
    Action, ApiToken, CsvDelimiter, DataShape, DateFormat, DecimalCharacter, LogType, OverrideMode,
    OverwriteBehavior, RawOrLabel, RawOrLabelHeaders, ResourceKind, ReturnContent, ReturnFormat,
};
pub use tokio_util::sync::CancellationToken;
