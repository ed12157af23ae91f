//! Response classifier: raw response → result envelope.
//!
//! # Design
//! The service reports errors in-band, sometimes with a 2xx status, in the
//! negotiated error format. Classification therefore looks at the body, not
//! just the status:
//!
//! 1. Try to recognize the error envelope in the requested error format, then
//!    in whatever format the body appears to be in.
//! 2. A recognized envelope is a `RecognizedServiceError` regardless of
//!    status.
//! 3. Otherwise a 2xx is a success (body returned verbatim, never parsed),
//!    and anything else is an `UnrecognizedError` with the body preserved.
//!
//! A body that is confidently in a different format than requested is still
//! returned, tagged with `format_mismatch`.

use std::sync::Arc;

use crate::endpoint::{OperationDescriptor, ResponseBody};
use crate::error::DomainError;
use crate::http::{FileMetadata, RawResponse};
use crate::log::{CallSite, LogSink, Severity};
use crate::types::ReturnFormat;

/// What a successful response is expected to contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    /// Text, in the given format when the operation negotiates one.
    Text(Option<ReturnFormat>),
    Binary,
}

impl Expected {
    pub fn for_descriptor(descriptor: &OperationDescriptor) -> Self {
        match descriptor.endpoint().response {
            ResponseBody::Text => Expected::Text(descriptor.format()),
            ResponseBody::Binary => Expected::Binary,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePayload {
    Text(String),
    File { bytes: Vec<u8>, metadata: FileMetadata },
}

/// Outcome of one response. Built once by the classifier, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultEnvelope {
    Success {
        status: u16,
        body: ResponsePayload,
        format: Option<ReturnFormat>,
        format_mismatch: bool,
    },
    Failure {
        status: u16,
        error: DomainError,
        /// Response bytes exactly as received.
        raw_body: Option<Vec<u8>>,
        format_mismatch: bool,
    },
}

impl ResultEnvelope {
    pub fn is_success(&self) -> bool {
        matches!(self, ResultEnvelope::Success { .. })
    }

    pub fn format_mismatch(&self) -> bool {
        match self {
            ResultEnvelope::Success { format_mismatch, .. }
            | ResultEnvelope::Failure { format_mismatch, .. } => *format_mismatch,
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            ResultEnvelope::Success { status, .. } | ResultEnvelope::Failure { status, .. } => *status,
        }
    }
}

/// Classify one response. Pure; see the module docs for the rules.
pub fn classify(raw: &RawResponse, expected: Expected, error_format: ReturnFormat) -> ResultEnvelope {
    let sniffed = sniff_format(raw);

    if expected == Expected::Binary && raw.is_success() {
        let metadata = raw.file_metadata();
        if metadata.file_name.is_some() {
            return ResultEnvelope::Success {
                status: raw.status,
                body: ResponsePayload::File { bytes: raw.body.clone(), metadata },
                format: None,
                format_mismatch: false,
            };
        }
    }

    let text = raw.text();
    // A 2xx csv export whose only column is named `error` is data.
    let csv_header_form = !(raw.is_success() && expected == Expected::Text(Some(ReturnFormat::Csv)));
    let recognize = |format| recognize_in(&text, format, csv_header_form);
    let recognized = recognize(error_format).map(|m| (m, error_format)).or_else(|| {
        sniffed
            .filter(|format| *format != error_format)
            .and_then(|format| recognize(format).map(|m| (m, format)))
    });

    if let Some((message, found_in)) = recognized {
        return ResultEnvelope::Failure {
            status: raw.status,
            error: DomainError::RecognizedServiceError(message),
            raw_body: Some(raw.body.clone()),
            format_mismatch: found_in != error_format,
        };
    }

    if !raw.is_success() {
        return ResultEnvelope::Failure {
            status: raw.status,
            error: DomainError::UnrecognizedError(raw.body.clone()),
            raw_body: Some(raw.body.clone()),
            format_mismatch: false,
        };
    }

    match expected {
        Expected::Binary => ResultEnvelope::Success {
            status: raw.status,
            body: ResponsePayload::File { bytes: raw.body.clone(), metadata: raw.file_metadata() },
            format: None,
            format_mismatch: false,
        },
        Expected::Text(format) => ResultEnvelope::Success {
            status: raw.status,
            body: ResponsePayload::Text(text),
            format,
            format_mismatch: match (format, sniffed) {
                (Some(want), Some(got)) => !same_family(want, got),
                _ => false,
            },
        },
    }
}

/// Classifier that reports what it decided to a log sink.
#[derive(Clone)]
pub struct Classifier {
    sink: Arc<dyn LogSink>,
}

impl Classifier {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }

    pub fn classify(
        &self,
        raw: &RawResponse,
        expected: Expected,
        error_format: ReturnFormat,
        site: &CallSite,
    ) -> ResultEnvelope {
        let envelope = classify(raw, expected, error_format);
        match &envelope {
            ResultEnvelope::Success { format_mismatch: true, format, .. } => self.sink.log(
                Severity::Warn,
                &format!(
                    "response format differs from requested {}",
                    format.map(ReturnFormat::wire_token).unwrap_or("text")
                ),
                site,
            ),
            ResultEnvelope::Success { status, .. } => {
                self.sink.log(Severity::Debug, &format!("success (HTTP {status})"), site)
            }
            ResultEnvelope::Failure { status, error, .. } => {
                let kind = match error {
                    DomainError::RecognizedServiceError(_) => "service error",
                    DomainError::UnrecognizedError(_) => "unrecognized error body",
                };
                self.sink.log(Severity::Warn, &format!("{kind} (HTTP {status})"), site)
            }
        }
        envelope
    }
}

fn same_family(a: ReturnFormat, b: ReturnFormat) -> bool {
    let family = |f: ReturnFormat| if f == ReturnFormat::Odm { ReturnFormat::Xml } else { f };
    family(a) == family(b)
}

/// Best guess at the body's format; `None` when there is no confident signal.
fn sniff_format(raw: &RawResponse) -> Option<ReturnFormat> {
    let by_header = raw.media_type().and_then(|mime| match mime.as_str() {
        "application/json" => Some(ReturnFormat::Json),
        "text/csv" | "application/csv" => Some(ReturnFormat::Csv),
        "text/xml" | "application/xml" => Some(ReturnFormat::Xml),
        _ => None,
    });
    if by_header.is_some() {
        return by_header;
    }

    let text = std::str::from_utf8(&raw.body).ok()?.trim_start();
    if text.starts_with('<') {
        return Some(ReturnFormat::Xml);
    }
    if (text.starts_with('{') || text.starts_with('['))
        && serde_json::from_str::<serde_json::Value>(text).is_ok()
    {
        return Some(ReturnFormat::Json);
    }
    None
}

/// Extract the message of an error envelope in `format`, if `body` is one.
pub fn recognize_envelope(body: &str, format: ReturnFormat) -> Option<String> {
    recognize_in(body, format, true)
}

fn recognize_in(body: &str, format: ReturnFormat, csv_header_form: bool) -> Option<String> {
    match format {
        ReturnFormat::Json => json_envelope(body),
        ReturnFormat::Xml | ReturnFormat::Odm => xml_envelope(body),
        ReturnFormat::Csv => csv_envelope(body, csv_header_form),
    }
}

/// `{"error": "message"}`
fn json_envelope(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body.trim()).ok()?;
    match value.as_object()?.get("error")? {
        serde_json::Value::String(message) => Some(message.clone()),
        other => Some(other.to_string()),
    }
}

/// `<?xml ...?><hash><error>message</error></hash>`, prolog and wrapper
/// optional.
fn xml_envelope(body: &str) -> Option<String> {
    let mut rest = body.trim();
    if rest.starts_with("<?xml") {
        let end = rest.find("?>")?;
        rest = rest[end + 2..].trim();
    }
    if let Some(inner) = rest.strip_prefix("<hash>").and_then(|r| r.strip_suffix("</hash>")) {
        rest = inner.trim();
    }
    let inner = rest.strip_prefix("<error>")?.strip_suffix("</error>")?;
    let inner = inner
        .trim()
        .strip_prefix("<![CDATA[")
        .and_then(|r| r.strip_suffix("]]>"))
        .map(str::to_string)
        .unwrap_or_else(|| xml_unescape(inner.trim()));
    Some(inner)
}

fn xml_unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Either an `error` header line followed by exactly one message line, or a
/// single `ERROR: message` line. The header form is only accepted when
/// `header_form` is set.
fn csv_envelope(body: &str, header_form: bool) -> Option<String> {
    let lines: Vec<&str> = body.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    match lines.as_slice() {
        [header, message] if header_form && unquote(header).eq_ignore_ascii_case("error") => {
            Some(unquote(message))
        }
        [single] => single.strip_prefix("ERROR:").map(|m| m.trim().to_string()),
        _ => None,
    }
}

fn unquote(cell: &str) -> String {
    cell.strip_prefix('"')
        .and_then(|c| c.strip_suffix('"'))
        .map(|c| c.replace("\"\"", "\""))
        .unwrap_or_else(|| cell.to_string())
}
