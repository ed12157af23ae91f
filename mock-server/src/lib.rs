//! In-memory emulator of the REDCap API.
//!
//! Serves `POST /api/` with form-urlencoded or multipart bodies. One project
//! is held in memory and guarded by a single fixed token. Failures are
//! answered in the `returnFormat` the request asked for, the way the real
//! service reports them.
//!
//! Supported operations: version, arms, metadata, records, files and
//! next-record-name. Imports accept json data only.

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{FromRequest, Multipart, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Form, Router,
};
use serde_json::{json, Map, Value};
use tokio::{net::TcpListener, sync::RwLock};

pub const API_TOKEN: &str = "0123456789ABCDEF0123456789ABCDEF";

pub const VERSION: &str = "14.0.1";

type Row = Map<String, Value>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredFile {
    pub name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
pub struct Project {
    pub arms: Vec<Row>,
    pub metadata: Vec<Row>,
    pub records: Vec<Row>,
    /// Keyed by (record, field).
    pub files: HashMap<(String, String), StoredFile>,
}

impl Default for Project {
    fn default() -> Self {
        let rows = |value: Value| -> Vec<Row> {
            match value {
                Value::Array(items) => items.into_iter().filter_map(|v| v.as_object().cloned()).collect(),
                _ => Vec::new(),
            }
        };
        Self {
            arms: rows(json!([{ "arm_num": "1", "name": "Arm 1" }])),
            metadata: rows(json!([
                { "field_name": "record_id", "form_name": "enrollment", "field_type": "text" },
                { "field_name": "age", "form_name": "enrollment", "field_type": "text" },
                { "field_name": "consent", "form_name": "enrollment", "field_type": "file" },
            ])),
            records: rows(json!([{ "record_id": "1", "age": "34", "consent": "" }])),
            files: HashMap::new(),
        }
    }
}

pub type Db = Arc<RwLock<Project>>;

pub fn app() -> Router {
    let db: Db = Arc::new(RwLock::new(Project::default()));
    Router::new()
        .route("/api/", post(api))
        .route("/api", post(api))
        .with_state(db)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

/// A decoded request: text fields in arrival order plus an optional upload.
#[derive(Debug, Default)]
struct ApiRequest {
    fields: Vec<(String, String)>,
    upload: Option<StoredFile>,
}

impl ApiRequest {
    fn get(&self, name: &str) -> Option<&str> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    /// Values of `name[0]`, `name[1]`, ... in arrival order.
    fn list(&self, name: &str) -> Vec<String> {
        let prefix = format!("{name}[");
        self.fields
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix) && k.ends_with(']'))
            .map(|(_, v)| v.clone())
            .collect()
    }

    fn format(&self) -> &str {
        self.get("format").unwrap_or("json")
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: message.into() }
    }
}

async fn api(State(db): State<Db>, request: Request) -> Response {
    let parsed = match read_request(request, &db).await {
        Ok(parsed) => parsed,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, &message, "json"),
    };
    let error_format = parsed.get("returnFormat").unwrap_or("json").to_string();

    tracing::debug!(
        content = parsed.get("content").unwrap_or_default(),
        action = parsed.get("action").unwrap_or("export"),
        "api request"
    );
    match dispatch(&db, &parsed).await {
        Ok(response) => response,
        Err(err) => {
            tracing::info!(status = err.status.as_u16(), message = %err.message, "api error");
            error_response(err.status, &err.message, &error_format)
        }
    }
}

async fn read_request(request: Request, db: &Db) -> Result<ApiRequest, String> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if !content_type.starts_with("multipart/form-data") {
        let Form(fields) = Form::<Vec<(String, String)>>::from_request(request, db)
            .await
            .map_err(|e| e.body_text())?;
        return Ok(ApiRequest { fields, upload: None });
    }

    let mut multipart = Multipart::from_request(request, db).await.map_err(|e| e.body_text())?;
    let mut parsed = ApiRequest::default();
    while let Some(field) = multipart.next_field().await.map_err(|e| e.body_text())? {
        let name = field.name().unwrap_or_default().to_string();
        match field.file_name().map(str::to_string) {
            Some(file_name) => {
                let content_type = field.content_type().unwrap_or("application/octet-stream").to_string();
                let bytes = field.bytes().await.map_err(|e| e.body_text())?.to_vec();
                parsed.upload = Some(StoredFile { name: file_name, content_type, bytes });
            }
            None => {
                let value = field.text().await.map_err(|e| e.body_text())?;
                parsed.fields.push((name, value));
            }
        }
    }
    Ok(parsed)
}

async fn dispatch(db: &Db, req: &ApiRequest) -> Result<Response, ApiError> {
    if req.get("token") != Some(API_TOKEN) {
        return Err(ApiError {
            status: StatusCode::FORBIDDEN,
            message: "You do not have permissions to use the API".to_string(),
        });
    }

    let content = req.get("content").unwrap_or_default();
    let action = req.get("action").unwrap_or("export");
    match (content, action) {
        ("version", "export") => Ok(plain(VERSION)),
        ("arm", "export") => {
            let project = db.read().await;
            let wanted = req.list("arms");
            let rows: Vec<&Row> = project
                .arms
                .iter()
                .filter(|arm| wanted.is_empty() || wanted.contains(&cell(arm, "arm_num")))
                .collect();
            render(&rows, req.format())
        }
        ("arm", "import") => {
            let incoming = import_rows(req)?;
            let mut project = db.write().await;
            if req.get("override") == Some("1") {
                project.arms.clear();
            }
            for arm in &incoming {
                let number = cell(arm, "arm_num");
                match project.arms.iter_mut().find(|a| cell(a, "arm_num") == number) {
                    Some(existing) => *existing = arm.clone(),
                    None => project.arms.push(arm.clone()),
                }
            }
            Ok(plain(&incoming.len().to_string()))
        }
        ("arm", "delete") => {
            let targets = req.list("arms");
            let mut project = db.write().await;
            let unknown: Vec<&String> = targets
                .iter()
                .filter(|t| !project.arms.iter().any(|a| &cell(a, "arm_num") == *t))
                .collect();
            if targets.is_empty() || !unknown.is_empty() {
                return Err(ApiError::bad_request(format!(
                    "The following values in the parameter 'arms' are not valid: {}",
                    join(&unknown)
                )));
            }
            project.arms.retain(|a| !targets.contains(&cell(a, "arm_num")));
            Ok(plain(&targets.len().to_string()))
        }
        ("metadata", "export") => {
            let project = db.read().await;
            let rows: Vec<&Row> = project.metadata.iter().collect();
            render(&rows, req.format())
        }
        ("record", "export") => export_records(db, req).await,
        ("record", "import") => import_records(db, req).await,
        ("record", "delete") => {
            let targets = req.list("records");
            let mut project = db.write().await;
            let unknown: Vec<&String> = targets
                .iter()
                .filter(|t| !project.records.iter().any(|r| &cell(r, "record_id") == *t))
                .collect();
            if targets.is_empty() || !unknown.is_empty() {
                return Err(ApiError::bad_request(format!(
                    "One or more of the records provided cannot be deleted because they do not exist in the project. The following records do not exist: {}",
                    join(&unknown)
                )));
            }
            project.records.retain(|r| !targets.contains(&cell(r, "record_id")));
            project.files.retain(|(record, _), _| !targets.contains(record));
            Ok(plain(&targets.len().to_string()))
        }
        ("generateNextRecordName", "export") => {
            let project = db.read().await;
            let next = project
                .records
                .iter()
                .filter_map(|r| cell(r, "record_id").parse::<u64>().ok())
                .max()
                .unwrap_or(0)
                + 1;
            Ok(plain(&next.to_string()))
        }
        ("file", _) => file_operation(db, req, action).await,
        (_, "export" | "import" | "delete") => {
            Err(ApiError::bad_request("The value of the parameter \"content\" is not valid"))
        }
        _ => Err(ApiError::bad_request("The value of the parameter \"action\" is not valid")),
    }
}

async fn export_records(db: &Db, req: &ApiRequest) -> Result<Response, ApiError> {
    let project = db.read().await;
    let wanted_records = req.list("records");
    let wanted_fields = req.list("fields");

    let selected = project
        .records
        .iter()
        .filter(|r| wanted_records.is_empty() || wanted_records.contains(&cell(r, "record_id")))
        .map(|r| {
            r.iter()
                .filter(|(k, _)| wanted_fields.is_empty() || wanted_fields.contains(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Row>()
        });

    let rows: Vec<Row> = if req.get("type") == Some("eav") {
        selected
            .flat_map(|row| {
                let record = cell(&row, "record_id");
                row.into_iter()
                    .filter(|(k, _)| k != "record_id")
                    .map(|(field, value)| {
                        let mut eav = Row::new();
                        eav.insert("record".into(), Value::String(record.clone()));
                        eav.insert("field_name".into(), Value::String(field));
                        eav.insert("value".into(), value);
                        eav
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    } else {
        selected.collect()
    };

    let refs: Vec<&Row> = rows.iter().collect();
    render(&refs, req.format())
}

async fn import_records(db: &Db, req: &ApiRequest) -> Result<Response, ApiError> {
    let incoming = import_rows(req)?;
    if let Some(row) = incoming.iter().find(|r| cell(r, "record_id").is_empty()) {
        return Err(ApiError::bad_request(format!(
            "The record identifier field 'record_id' is missing in {}",
            Value::Object(row.clone())
        )));
    }

    let mut project = db.write().await;
    let known: Vec<String> = project
        .metadata
        .iter()
        .map(|m| cell(m, "field_name"))
        .collect();
    if let Some(field) = incoming.iter().flat_map(|r| r.keys()).find(|k| !known.contains(*k)) {
        return Err(ApiError::bad_request(format!(
            "The following fields were not found in the project as real data fields: {field}"
        )));
    }

    let overwrite = req.get("overwriteBehavior") == Some("overwrite");
    let mut ids = Vec::new();
    for row in incoming {
        let id = cell(&row, "record_id");
        match project.records.iter_mut().find(|r| cell(r, "record_id") == id) {
            Some(existing) => {
                for (key, value) in row {
                    let blank = value.as_str().is_some_and(str::is_empty);
                    if overwrite || !blank {
                        existing.insert(key, value);
                    }
                }
            }
            None => project.records.push(row),
        }
        if !ids.contains(&id) {
            ids.push(id);
        }
    }

    match req.get("returnContent").unwrap_or("count") {
        "ids" | "auto_ids" => Ok(with_type("application/json", serde_json::to_vec(&ids).unwrap_or_default())),
        "nothing" => Ok(plain("")),
        _ => {
            let count = ids.len();
            Ok(match req.format() {
                "csv" => with_type("text/csv; charset=utf-8", format!("count\n{count}\n").into_bytes()),
                "xml" => with_type(
                    "text/xml; charset=utf-8",
                    format!("<?xml version=\"1.0\" encoding=\"UTF-8\" ?>\n<count>{count}</count>").into_bytes(),
                ),
                _ => with_type("application/json", json!({ "count": count }).to_string().into_bytes()),
            })
        }
    }
}

async fn file_operation(db: &Db, req: &ApiRequest, action: &str) -> Result<Response, ApiError> {
    let record = req.get("record").unwrap_or_default().to_string();
    let field = req.get("field").unwrap_or_default().to_string();
    if record.is_empty() || field.is_empty() {
        return Err(ApiError::bad_request("The parameters 'record' and 'field' are required"));
    }

    let mut project = db.write().await;
    let is_file_field = project
        .metadata
        .iter()
        .any(|m| cell(m, "field_name") == field && cell(m, "field_type") == "file");
    if !is_file_field {
        return Err(ApiError::bad_request(format!(
            "The field '{field}' does not exist or is not a 'file' field"
        )));
    }
    if !project.records.iter().any(|r| cell(r, "record_id") == record) {
        return Err(ApiError::bad_request(format!("The record '{record}' does not exist")));
    }

    let key = (record, field);
    match action {
        "export" => {
            let stored = project
                .files
                .get(&key)
                .ok_or_else(|| ApiError::bad_request("There is no file to download for this record"))?;
            let content_type = format!("{}; name=\"{}\"", stored.content_type, stored.name);
            Ok(with_type(&content_type, stored.bytes.clone()))
        }
        "import" => {
            let upload = req
                .upload
                .clone()
                .ok_or_else(|| ApiError::bad_request("No valid file was uploaded"))?;
            project.files.insert(key, upload);
            Ok(plain(""))
        }
        "delete" => match project.files.remove(&key) {
            Some(_) => Ok(plain("")),
            None => Err(ApiError::bad_request("There is no file to delete for this record")),
        },
        _ => Err(ApiError::bad_request("The value of the parameter \"action\" is not valid")),
    }
}

/// Rows of the `data` field. Only json is accepted here.
fn import_rows(req: &ApiRequest) -> Result<Vec<Row>, ApiError> {
    if req.format() != "json" {
        return Err(ApiError::bad_request("This server only accepts json data"));
    }
    let data = req.get("data").ok_or_else(|| ApiError::bad_request("The parameter 'data' is missing"))?;
    let parsed: Value = serde_json::from_str(data)
        .map_err(|e| ApiError::bad_request(format!("The data being imported is not formatted correctly: {e}")))?;
    let items = match parsed {
        Value::Array(items) => items,
        other => vec![other],
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::Object(map) => Ok(map.into_iter().map(|(k, v)| (k, Value::String(text_of(&v)))).collect()),
            other => Err(ApiError::bad_request(format!("Expected an object, found {other}"))),
        })
        .collect()
}

fn cell(row: &Row, key: &str) -> String {
    row.get(key).map(text_of).unwrap_or_default()
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn join(items: &[&String]) -> String {
    items.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
}

fn render(rows: &[&Row], format: &str) -> Result<Response, ApiError> {
    match format {
        "json" => {
            let body = serde_json::to_vec(rows)
                .map_err(|e| ApiError { status: StatusCode::INTERNAL_SERVER_ERROR, message: e.to_string() })?;
            Ok(with_type("application/json", body))
        }
        "csv" => {
            let mut header: Vec<&String> = Vec::new();
            for key in rows.iter().flat_map(|r| r.keys()) {
                if !header.contains(&key) {
                    header.push(key);
                }
            }
            let mut out = header.iter().map(|k| csv_cell(k)).collect::<Vec<_>>().join(",");
            out.push('\n');
            for row in rows {
                let line = header.iter().map(|k| csv_cell(&cell(row, k))).collect::<Vec<_>>().join(",");
                out.push_str(&line);
                out.push('\n');
            }
            Ok(with_type("text/csv; charset=utf-8", out.into_bytes()))
        }
        "xml" => {
            let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\" ?>\n<records>\n");
            for row in rows {
                out.push_str("<item>");
                for (key, value) in row.iter() {
                    out.push_str(&format!("<{key}><![CDATA[{}]]></{key}>", text_of(value)));
                }
                out.push_str("</item>\n");
            }
            out.push_str("</records>\n");
            Ok(with_type("text/xml; charset=utf-8", out.into_bytes()))
        }
        other => Err(ApiError::bad_request(format!("The format '{other}' is not valid"))),
    }
}

fn csv_cell(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn error_response(status: StatusCode, message: &str, format: &str) -> Response {
    let (content_type, body) = match format {
        "xml" => (
            "text/xml; charset=utf-8",
            format!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\" ?>\n<hash>\n  <error>{}</error>\n</hash>",
                xml_escape(message)
            ),
        ),
        "csv" => ("text/csv; charset=utf-8", format!("error\n{}\n", csv_cell(message))),
        _ => ("application/json", json!({ "error": message }).to_string()),
    };
    (status, [(header::CONTENT_TYPE, content_type.to_string())], body).into_response()
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;").replace('"', "&quot;")
}

fn plain(body: &str) -> Response {
    with_type("text/html; charset=UTF-8", body.as_bytes().to_vec())
}

fn with_type(content_type: &str, body: Vec<u8>) -> Response {
    (StatusCode::OK, [(header::CONTENT_TYPE, content_type.to_string())], body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(fields: &[(&str, &str)]) -> ApiRequest {
        ApiRequest {
            fields: fields.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            upload: None,
        }
    }

    #[test]
    fn list_collects_indexed_fields_in_order() {
        let req = request(&[("records[0]", "3"), ("fields[0]", "age"), ("records[1]", "1")]);
        assert_eq!(req.list("records"), vec!["3", "1"]);
        assert_eq!(req.list("fields"), vec!["age"]);
        assert!(req.list("arms").is_empty());
    }

    #[test]
    fn import_rows_stringifies_values() {
        let req = request(&[("format", "json"), ("data", r#"[{"record_id":2,"age":null}]"#)]);
        let rows = import_rows(&req).unwrap();
        assert_eq!(cell(&rows[0], "record_id"), "2");
        assert_eq!(cell(&rows[0], "age"), "");
    }

    #[test]
    fn import_rows_rejects_csv_and_malformed_json() {
        let err = import_rows(&request(&[("format", "csv"), ("data", "record_id\n1")])).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(import_rows(&request(&[("data", "[{")])).is_err());
        assert!(import_rows(&request(&[("data", "[1]")])).is_err());
    }

    #[test]
    fn csv_cells_are_quoted_when_needed() {
        assert_eq!(csv_cell("plain"), "plain");
        assert_eq!(csv_cell("a,b"), "\"a,b\"");
        assert_eq!(csv_cell("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn default_project_is_seeded() {
        let project = Project::default();
        assert_eq!(project.arms.len(), 1);
        assert_eq!(cell(&project.records[0], "record_id"), "1");
        assert!(project.metadata.iter().any(|m| cell(m, "field_type") == "file"));
    }
}
