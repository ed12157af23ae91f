//! Wire-level request and response values.
//!
//! # Design
//! These types describe the HTTP exchange as plain data. The encoder builds a
//! `WireRequest`; the dispatcher consumes it (it is never reused) and hands
//! back a `RawResponse`; the classifier reads that response without touching
//! the network. Keeping the I/O at one seam makes the encoder and classifier
//! pure and easy to test.

/// An encoded request, ready to POST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRequest {
    pub uri: String,
    pub content_type: String,
    /// Negotiated `Accept` header, when the operation has a response format.
    pub accept: Option<String>,
    pub body: Vec<u8>,
    /// Descriptive key/value fields in emission order, credential excluded.
    /// The binary part of a file upload is not listed.
    pub fields: Vec<(String, String)>,
}

impl WireRequest {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }
}

/// A response as received: status, lower-cased header names, body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Media type without parameters, lower-cased.
    pub fn media_type(&self) -> Option<String> {
        self.header("content-type")
            .and_then(|value| value.split(';').next())
            .map(|mime| mime.trim().to_ascii_lowercase())
            .filter(|mime| !mime.is_empty())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Out-of-band metadata of a downloaded file.
    ///
    /// The service puts the file name in a `name` parameter of
    /// `content-type`; `content-disposition` `filename` is the fallback.
    pub fn file_metadata(&self) -> FileMetadata {
        let content_type = self.header("content-type");
        let name = content_type
            .and_then(|value| header_parameter(value, "name"))
            .or_else(|| {
                self.header("content-disposition")
                    .and_then(|value| header_parameter(value, "filename"))
            });
        FileMetadata {
            mime_type: self.media_type(),
            file_name: name,
        }
    }
}

/// File details carried in response headers rather than the body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileMetadata {
    pub mime_type: Option<String>,
    pub file_name: Option<String>,
}

/// Extract `param` from a header such as `image/png; name="scan.png"`.
pub(crate) fn header_parameter(header: &str, param: &str) -> Option<String> {
    parameters(header)
        .into_iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(param))
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

/// `key=value` pairs after the first `;`. Quoted values may contain `;`
/// and `\"`.
fn parameters(header: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut chars = header.chars().peekable();
    for c in chars.by_ref() {
        if c == ';' {
            break;
        }
    }

    while chars.peek().is_some() {
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ';' {
                break;
            }
            key.push(c);
            chars.next();
        }

        let mut value = String::new();
        if chars.next() == Some('=') {
            while chars.next_if(|c| c.is_whitespace()).is_some() {}
            if chars.next_if_eq(&'"').is_some() {
                while let Some(c) = chars.next() {
                    match c {
                        '"' => break,
                        '\\' => match chars.next_if(|next| *next == '"' || *next == '\\') {
                            Some(escaped) => value.push(escaped),
                            None => value.push(c),
                        },
                        _ => value.push(c),
                    }
                }
                for c in chars.by_ref() {
                    if c == ';' {
                        break;
                    }
                }
            } else {
                for c in chars.by_ref() {
                    if c == ';' {
                        break;
                    }
                    value.push(c);
                }
                value = value.trim().to_string();
            }
        }

        let key = key.trim();
        if !key.is_empty() {
            params.push((key.to_string(), value));
        }
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(headers: &[(&str, &str)]) -> RawResponse {
        RawResponse {
            status: 200,
            headers: headers.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            body: Vec::new(),
        }
    }

    #[test]
    fn file_name_comes_from_content_type_name_parameter() {
        let meta = response(&[("content-type", "application/pdf; name=\"consent form.pdf\"")])
            .file_metadata();
        assert_eq!(meta.mime_type.as_deref(), Some("application/pdf"));
        assert_eq!(meta.file_name.as_deref(), Some("consent form.pdf"));
    }

    #[test]
    fn quoted_file_name_may_contain_separators() {
        let meta = response(&[("content-type", "application/pdf; name=\"consent; v2.pdf\"; charset=binary")])
            .file_metadata();
        assert_eq!(meta.file_name.as_deref(), Some("consent; v2.pdf"));

        let meta = response(&[("content-type", r#"text/plain; name="say \"hi\".txt""#)]).file_metadata();
        assert_eq!(meta.file_name.as_deref(), Some("say \"hi\".txt"));

        let meta = response(&[("content-type", r#"image/png; name="C:\scans\a.png""#)]).file_metadata();
        assert_eq!(meta.file_name.as_deref(), Some(r"C:\scans\a.png"));
    }

    #[test]
    fn file_name_falls_back_to_content_disposition() {
        let meta = response(&[
            ("Content-Type", "text/plain"),
            ("Content-Disposition", "attachment; filename=notes.txt"),
        ])
        .file_metadata();
        assert_eq!(meta.mime_type.as_deref(), Some("text/plain"));
        assert_eq!(meta.file_name.as_deref(), Some("notes.txt"));
    }

    #[test]
    fn missing_headers_yield_empty_metadata() {
        assert_eq!(response(&[]).file_metadata(), FileMetadata::default());
    }

    #[test]
    fn wire_request_field_lookup() {
        let request = WireRequest {
            uri: "http://localhost/api/".into(),
            content_type: "application/x-www-form-urlencoded".into(),
            accept: None,
            body: Vec::new(),
            fields: vec![("content".into(), "arm".into())],
        };
        assert_eq!(request.field("content"), Some("arm"));
        assert!(!request.has_field("format"));
    }
}
