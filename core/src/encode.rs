//! Request encoder: descriptor + parameters + payload + credential → bytes.
//!
//! # Design
//! Encoding is a pure, synchronous function of its inputs, so calling it
//! twice with the same arguments yields byte-identical requests (the
//! multipart boundary is derived, not random).
//!
//! Field order is fixed: `token`, `content`, `action`, `format`,
//! `returnFormat`, then in-scope options in `OptionKey` order, then `data`.
//! Options the endpoint table does not list for the operation are dropped
//! entirely; they are never sent empty.

use url::form_urlencoded;

use crate::endpoint::{OperationDescriptor, PayloadRule, Transfer};
use crate::error::EncodingError;
use crate::http::WireRequest;
use crate::options::{OptionKey, OptionValue, ParameterSet, Rendered};
use crate::payload::{serialize_records, FileUpload, Payload};
use crate::types::{ApiToken, CsvDelimiter, ReturnFormat};

/// Form field that carries record payloads.
pub const DATA_FIELD: &str = "data";

/// Multipart section name of an uploaded file.
pub const FILE_FIELD: &str = "file";

pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

const BOUNDARY_STEM: &str = "redcap-core-boundary-7d1f0c";

/// Encodes requests for one API endpoint URI.
#[derive(Debug, Clone)]
pub struct RequestEncoder {
    uri: String,
}

impl RequestEncoder {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn encode(
        &self,
        descriptor: &OperationDescriptor,
        params: &ParameterSet,
        payload: &Payload,
        token: &ApiToken,
    ) -> Result<WireRequest, EncodingError> {
        let row = descriptor.endpoint();
        check_payload(row.payload, payload)?;

        for key in row.required {
            let present = match params.get(*key) {
                Some(OptionValue::List(items)) => !items.is_empty(),
                Some(_) => true,
                None => false,
            };
            if !present {
                return Err(EncodingError::MissingField(key.wire_token()));
            }
        }

        let mut fields: Vec<(String, String)> = Vec::new();
        fields.push(("content".to_string(), descriptor.kind().wire_token().to_string()));
        if row.sends_action {
            fields.push(("action".to_string(), descriptor.action().wire_token().to_string()));
        }
        if row.emits_format {
            if let Some(format) = descriptor.format() {
                fields.push((OptionKey::Format.wire_token().to_string(), format.wire_token().to_string()));
            }
        }
        if let Some(error_format) = descriptor.error_format() {
            fields.push((
                OptionKey::ErrorFormat.wire_token().to_string(),
                error_format.wire_token().to_string(),
            ));
        }

        for (key, value) in params.iter() {
            if matches!(key, OptionKey::Format | OptionKey::ErrorFormat) || !row.in_scope(key, params) {
                continue;
            }
            match value.render(key) {
                Rendered::Scalar(text) => fields.push((key.wire_token().to_string(), text)),
                Rendered::List(items) => {
                    for (i, item) in items.into_iter().enumerate() {
                        fields.push((format!("{}[{i}]", key.wire_token()), item));
                    }
                }
            }
        }

        match payload {
            Payload::Records(records) => {
                let format = descriptor.format().unwrap_or(ReturnFormat::Json);
                let delimiter = if row.in_scope(OptionKey::CsvDelimiter, params) {
                    params.csv_delimiter_value().unwrap_or(CsvDelimiter::Comma)
                } else {
                    CsvDelimiter::Comma
                };
                fields.push((DATA_FIELD.to_string(), serialize_records(records, format, delimiter)?));
            }
            Payload::Text(text) => fields.push((DATA_FIELD.to_string(), text.clone())),
            Payload::None | Payload::File(_) => {}
        }

        let upload = match payload {
            Payload::File(upload) => Some(upload),
            _ => None,
        };

        let (content_type, body) = match row.transfer {
            Transfer::Form => {
                let mut pairs: Vec<(&str, &str)> = vec![("token", token.expose())];
                pairs.extend(fields.iter().map(|(k, v)| (k.as_str(), v.as_str())));
                (FORM_CONTENT_TYPE.to_string(), form_urlencode(&pairs).into_bytes())
            }
            Transfer::Multipart => multipart_body(token, &fields, upload),
        };

        Ok(WireRequest {
            uri: self.uri.clone(),
            content_type,
            accept: descriptor.format().map(|format| format.media_type().to_string()),
            body,
            fields,
        })
    }
}

fn check_payload(rule: PayloadRule, payload: &Payload) -> Result<(), EncodingError> {
    match (rule, payload) {
        (PayloadRule::None, Payload::None)
        | (PayloadRule::Records, Payload::Records(_) | Payload::Text(_))
        | (PayloadRule::File, Payload::File(_)) => Ok(()),
        (PayloadRule::None, other) => Err(EncodingError::UnexpectedPayload(other.describe())),
        (PayloadRule::Records, _) => Err(EncodingError::MissingPayload("record")),
        (PayloadRule::File, _) => Err(EncodingError::MissingPayload("file")),
    }
}

/// `application/x-www-form-urlencoded` with `+` for space and upper-case
/// `%XX` escapes of each UTF-8 byte.
pub fn form_urlencode(pairs: &[(&str, &str)]) -> String {
    form_urlencoded::Serializer::new(String::new()).extend_pairs(pairs).finish()
}

fn multipart_body(
    token: &ApiToken,
    fields: &[(String, String)],
    upload: Option<&FileUpload>,
) -> (String, Vec<u8>) {
    let boundary = choose_boundary(token, fields, upload);
    let mut body = Vec::new();

    let mut text_part = |name: &str, value: &str| {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", quote_safe(name)).as_bytes(),
        );
        body.extend_from_slice(value.as_bytes());
        body.extend_from_slice(b"\r\n");
    };
    text_part("token", token.expose());
    for (name, value) in fields {
        text_part(name, value);
    }

    if let Some(upload) = upload {
        let content_type = upload.content_type.as_deref().unwrap_or("application/octet-stream");
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{FILE_FIELD}\"; filename=\"{}\"\r\n",
                quote_safe(&upload.file_name)
            )
            .as_bytes(),
        );
        body.extend_from_slice(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
        body.extend_from_slice(&upload.bytes);
        body.extend_from_slice(b"\r\n");
    }

    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    (format!("multipart/form-data; boundary={boundary}"), body)
}

/// Deterministic boundary that does not occur in any part.
fn choose_boundary(token: &ApiToken, fields: &[(String, String)], upload: Option<&FileUpload>) -> String {
    let collides = |candidate: &str| {
        let needle = candidate.as_bytes();
        let hit = |haystack: &[u8]| haystack.windows(needle.len()).any(|window| window == needle);
        hit(token.expose().as_bytes())
            || fields.iter().any(|(k, v)| hit(k.as_bytes()) || hit(v.as_bytes()))
            || upload.is_some_and(|u| hit(&u.bytes) || hit(u.file_name.as_bytes()))
    };

    let mut candidate = BOUNDARY_STEM.to_string();
    let mut attempt = 0u32;
    while collides(&candidate) {
        attempt += 1;
        candidate = format!("{BOUNDARY_STEM}-{attempt}");
    }
    candidate
}

fn quote_safe(value: &str) -> String {
    value.replace('"', "%22").replace(['\r', '\n'], "")
}
