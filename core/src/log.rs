//! Logging collaborator handed to the dispatcher and classifier.
//!
//! Entries are fire-and-forget: a sink can never change control flow. The
//! default sink forwards to `tracing`; tests substitute a recording sink.
//! Credentials and bodies are never part of an entry.

use std::fmt;

use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

/// Pipeline stage an entry was produced in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Encode,
    Dispatch,
    Classify,
    Store,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Encode => "encode",
            Stage::Dispatch => "dispatch",
            Stage::Classify => "classify",
            Stage::Store => "store",
        };
        f.write_str(name)
    }
}

/// Where in the engine an entry came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    /// Correlates every entry of one call.
    pub request_id: Uuid,
    /// Operation display name, e.g. `record/export`.
    pub operation: String,
    pub stage: Stage,
}

impl CallSite {
    pub fn new(request_id: Uuid, operation: impl Into<String>, stage: Stage) -> Self {
        Self { request_id, operation: operation.into(), stage }
    }

    pub fn at(&self, stage: Stage) -> Self {
        Self { stage, ..self.clone() }
    }
}

pub trait LogSink: Send + Sync {
    fn log(&self, severity: Severity, message: &str, site: &CallSite);
}

/// Forwards entries to the process `tracing` subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, severity: Severity, message: &str, site: &CallSite) {
        let (id, op, stage) = (&site.request_id, site.operation.as_str(), site.stage);
        match severity {
            Severity::Debug => tracing::debug!(request_id = %id, operation = op, %stage, "{message}"),
            Severity::Info => tracing::info!(request_id = %id, operation = op, %stage, "{message}"),
            Severity::Warn => tracing::warn!(request_id = %id, operation = op, %stage, "{message}"),
            Severity::Error => tracing::error!(request_id = %id, operation = op, %stage, "{message}"),
        }
    }
}
