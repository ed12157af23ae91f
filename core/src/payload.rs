//! Payloads carried by import operations.
//!
//! # Design
//! Records are held as `serde_json` objects (field order preserved) and only
//! rendered into json/csv/xml text when the encoder knows the declared
//! format. Callers with text already in the right format use
//! `Payload::Text`, which is sent verbatim.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::EncodingError;
use crate::types::{CsvDelimiter, ReturnFormat};

/// A binary attachment for file import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    pub file_name: String,
    /// Defaults to `application/octet-stream` when unset.
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl FileUpload {
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: None,
            bytes: bytes.into(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum Payload {
    #[default]
    None,
    Records(Vec<Map<String, Value>>),
    Text(String),
    File(FileUpload),
}

impl Payload {
    /// Capture any serializable collection of flat records.
    pub fn records<T: Serialize>(items: &[T]) -> Result<Self, EncodingError> {
        let records = items
            .iter()
            .map(|item| match serde_json::to_value(item) {
                Ok(Value::Object(map)) => Ok(map),
                Ok(other) => Err(EncodingError::Unserializable {
                    format: ReturnFormat::Json,
                    reason: format!("record is not an object: {other}"),
                }),
                Err(e) => Err(EncodingError::Unserializable {
                    format: ReturnFormat::Json,
                    reason: e.to_string(),
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Payload::Records(records))
    }

    pub fn text(body: impl Into<String>) -> Self {
        Payload::Text(body.into())
    }

    pub fn file(upload: FileUpload) -> Self {
        Payload::File(upload)
    }

    pub(crate) fn describe(&self) -> &'static str {
        match self {
            Payload::None => "empty",
            Payload::Records(_) | Payload::Text(_) => "record",
            Payload::File(_) => "file",
        }
    }
}

/// Render records as the text the service expects under `data`.
pub fn serialize_records(
    records: &[Map<String, Value>],
    format: ReturnFormat,
    delimiter: CsvDelimiter,
) -> Result<String, EncodingError> {
    match format {
        ReturnFormat::Json => {
            serde_json::to_string(records).map_err(|e| EncodingError::Unserializable {
                format,
                reason: e.to_string(),
            })
        }
        ReturnFormat::Csv => to_csv(records, delimiter.as_char()),
        ReturnFormat::Xml => to_xml(records),
        ReturnFormat::Odm => Err(EncodingError::Unserializable {
            format,
            reason: "records cannot be expressed as a project archive".to_string(),
        }),
    }
}

fn scalar(value: &Value, format: ReturnFormat, field: &str) -> Result<String, EncodingError> {
    match value {
        Value::Null => Ok(String::new()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => Ok(s.clone()),
        Value::Array(_) | Value::Object(_) => Err(EncodingError::Unserializable {
            format,
            reason: format!("field '{field}' holds a nested value"),
        }),
    }
}

fn to_csv(records: &[Map<String, Value>], delimiter: char) -> Result<String, EncodingError> {
    let mut columns: Vec<&str> = Vec::new();
    for record in records {
        for key in record.keys() {
            if !columns.contains(&key.as_str()) {
                columns.push(key);
            }
        }
    }

    let separator = delimiter.to_string();
    let mut out = String::new();
    let header: Vec<String> = columns.iter().map(|c| csv_cell(c, delimiter)).collect();
    out.push_str(&header.join(&separator));
    out.push('\n');

    for record in records {
        let mut row = Vec::with_capacity(columns.len());
        for column in &columns {
            let cell = match record.get(*column) {
                Some(value) => scalar(value, ReturnFormat::Csv, column)?,
                None => String::new(),
            };
            row.push(csv_cell(&cell, delimiter));
        }
        out.push_str(&row.join(&separator));
        out.push('\n');
    }
    Ok(out)
}

fn csv_cell(value: &str, delimiter: char) -> String {
    let needs_quotes = value.contains(delimiter)
        || value.contains('"')
        || value.contains('\n')
        || value.contains('\r');
    if needs_quotes {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn to_xml(records: &[Map<String, Value>]) -> Result<String, EncodingError> {
    let mut out = String::from(r#"<?xml version="1.0" encoding="UTF-8" ?><records>"#);
    for record in records {
        out.push_str("<item>");
        for (key, value) in record {
            if !is_xml_name(key) {
                return Err(EncodingError::Unserializable {
                    format: ReturnFormat::Xml,
                    reason: format!("'{key}' is not a valid element name"),
                });
            }
            let text = scalar(value, ReturnFormat::Xml, key)?;
            out.push_str(&format!("<{key}>{}</{key}>", xml_escape(&text)));
        }
        out.push_str("</item>");
    }
    out.push_str("</records>");
    Ok(out)
}

fn is_xml_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

pub(crate) fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
