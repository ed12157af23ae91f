//! Public facade: one method per service operation.
//!
//! # Design
//! Every method runs the same pipeline: merge the caller's options over the
//! operation defaults, validate a descriptor, encode, dispatch, classify.
//! `RedcapClient` owns no per-call state; the token is passed on every call
//! and is never stored, so one client can serve several projects at once.
//! Cloning is cheap (shared transport and log sink).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::classify::{Classifier, Expected, ResponsePayload, ResultEnvelope};
use crate::config::ClientConfig;
use crate::encode::RequestEncoder;
use crate::endpoint::OperationDescriptor;
use crate::error::RedcapError;
use crate::http::FileMetadata;
use crate::log::{CallSite, LogSink, Severity, Stage, TracingLogSink};
use crate::options::ParameterSet;
use crate::payload::{FileUpload, Payload};
use crate::storage::{target_path, FileStore};
use crate::transport::{Deadline, Dispatcher, HttpTransport, Transport};
use crate::types::{
    Action, ApiToken, DataShape, OverrideMode, OverwriteBehavior, RawOrLabel, ResourceKind, ReturnContent,
    ReturnFormat,
};

/// A downloaded file and the metadata the service sent with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDownload {
    pub bytes: Vec<u8>,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
}

impl FileDownload {
    fn from_parts(bytes: Vec<u8>, metadata: FileMetadata) -> Self {
        Self { bytes, file_name: metadata.file_name, mime_type: metadata.mime_type }
    }
}

/// Asynchronous client for a REDCap-style data API.
#[derive(Clone)]
pub struct RedcapClient {
    encoder: RequestEncoder,
    dispatcher: Dispatcher,
    classifier: Classifier,
    sink: Arc<dyn LogSink>,
    deadline: Deadline,
}

impl RedcapClient {
    /// Client over HTTP(S) that logs through `tracing`.
    pub fn new(config: ClientConfig) -> Result<Self, RedcapError> {
        let transport = HttpTransport::new(&config.user_agent)
            .map_err(|source| RedcapError::Transport { operation: "client setup".to_string(), source })?;
        Ok(Self::with_transport(config, Arc::new(transport), Arc::new(TracingLogSink)))
    }

    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            encoder: RequestEncoder::new(config.endpoint.as_str()),
            dispatcher: Dispatcher::new(transport, sink.clone()),
            classifier: Classifier::new(sink.clone()),
            sink,
            deadline: Deadline { timeout: config.timeout, cancel: None },
        }
    }

    /// A copy of this client whose calls abort when `token` is cancelled.
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        let mut client = self.clone();
        client.deadline = client.deadline.cancelled_by(token);
        client
    }

    pub fn endpoint(&self) -> &str {
        self.encoder.uri()
    }

    /// Run one operation and return its envelope without interpreting it.
    ///
    /// Errors are limited to failures before a response exists (encoding
    /// and transport); in-band service errors come back as
    /// [`ResultEnvelope::Failure`].
    pub async fn execute(
        &self,
        descriptor: &OperationDescriptor,
        params: &ParameterSet,
        payload: &Payload,
        token: &ApiToken,
    ) -> Result<ResultEnvelope, RedcapError> {
        self.execute_as(Uuid::new_v4(), descriptor, params, payload, token).await
    }

    /// `execute` with log entries filed under `request_id`.
    async fn execute_as(
        &self,
        request_id: Uuid,
        descriptor: &OperationDescriptor,
        params: &ParameterSet,
        payload: &Payload,
        token: &ApiToken,
    ) -> Result<ResultEnvelope, RedcapError> {
        let operation = descriptor.to_string();
        let site = CallSite::new(request_id, operation.as_str(), Stage::Encode);

        let request = self.encoder.encode(descriptor, params, payload, token).map_err(|source| {
            self.sink.log(Severity::Warn, &format!("encoding failed: {source}"), &site);
            RedcapError::Encoding { operation: operation.clone(), source }
        })?;

        let raw = self
            .dispatcher
            .send(request, &self.deadline, &site.at(Stage::Dispatch))
            .await
            .map_err(|source| RedcapError::Transport { operation: operation.clone(), source })?;

        Ok(self.classifier.classify(
            &raw,
            Expected::for_descriptor(descriptor),
            descriptor.effective_error_format(),
            &site.at(Stage::Classify),
        ))
    }

    async fn run(
        &self,
        request_id: Uuid,
        kind: ResourceKind,
        action: Action,
        token: &ApiToken,
        params: ParameterSet,
        payload: Payload,
    ) -> Result<ResponsePayload, RedcapError> {
        let descriptor = OperationDescriptor::from_params(kind, action, &params)?;
        match self.execute_as(request_id, &descriptor, &params, &payload, token).await? {
            ResultEnvelope::Success { body, .. } => Ok(body),
            ResultEnvelope::Failure { status, error, .. } => {
                Err(RedcapError::Domain { operation: descriptor.to_string(), status, source: error })
            }
        }
    }

    async fn text(
        &self,
        kind: ResourceKind,
        action: Action,
        token: &ApiToken,
        params: ParameterSet,
        payload: Payload,
    ) -> Result<String, RedcapError> {
        Ok(match self.run(Uuid::new_v4(), kind, action, token, params, payload).await? {
            ResponsePayload::Text(text) => text,
            ResponsePayload::File { bytes, .. } => String::from_utf8_lossy(&bytes).into_owned(),
        })
    }

    async fn file(
        &self,
        request_id: Uuid,
        kind: ResourceKind,
        action: Action,
        token: &ApiToken,
        params: ParameterSet,
    ) -> Result<FileDownload, RedcapError> {
        Ok(match self.run(request_id, kind, action, token, params, Payload::None).await? {
            ResponsePayload::File { bytes, metadata } => FileDownload::from_parts(bytes, metadata),
            ResponsePayload::Text(text) => FileDownload::from_parts(text.into_bytes(), FileMetadata::default()),
        })
    }

    // Arms

    pub async fn export_arms(&self, token: &ApiToken, options: ParameterSet) -> Result<String, RedcapError> {
        self.text(ResourceKind::Arm, Action::Export, token, options.merged_over(json()), Payload::None)
            .await
    }

    pub async fn import_arms(
        &self,
        token: &ApiToken,
        payload: Payload,
        options: ParameterSet,
    ) -> Result<String, RedcapError> {
        let defaults = json().override_mode(OverrideMode::Merge);
        self.text(ResourceKind::Arm, Action::Import, token, options.merged_over(defaults), payload).await
    }

    pub async fn delete_arms<I, S>(&self, token: &ApiToken, arms: I) -> Result<String, RedcapError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let params = ParameterSet::new().arms(arms);
        self.text(ResourceKind::Arm, Action::Delete, token, params, Payload::None).await
    }

    // Data access groups

    pub async fn export_dags(&self, token: &ApiToken, options: ParameterSet) -> Result<String, RedcapError> {
        self.text(ResourceKind::Dag, Action::Export, token, options.merged_over(json()), Payload::None)
            .await
    }

    pub async fn import_dags(
        &self,
        token: &ApiToken,
        payload: Payload,
        options: ParameterSet,
    ) -> Result<String, RedcapError> {
        self.text(ResourceKind::Dag, Action::Import, token, options.merged_over(json()), payload).await
    }

    pub async fn delete_dags<I, S>(&self, token: &ApiToken, dags: I) -> Result<String, RedcapError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let params = ParameterSet::new().dags(dags);
        self.text(ResourceKind::Dag, Action::Delete, token, params, Payload::None).await
    }

    pub async fn export_user_dag_mappings(
        &self,
        token: &ApiToken,
        options: ParameterSet,
    ) -> Result<String, RedcapError> {
        let params = options.merged_over(json());
        self.text(ResourceKind::UserDagMapping, Action::Export, token, params, Payload::None).await
    }

    pub async fn import_user_dag_mappings(
        &self,
        token: &ApiToken,
        payload: Payload,
        options: ParameterSet,
    ) -> Result<String, RedcapError> {
        let params = options.merged_over(json());
        self.text(ResourceKind::UserDagMapping, Action::Import, token, params, payload).await
    }

    // Events

    pub async fn export_events(&self, token: &ApiToken, options: ParameterSet) -> Result<String, RedcapError> {
        self.text(ResourceKind::Event, Action::Export, token, options.merged_over(json()), Payload::None)
            .await
    }

    pub async fn import_events(
        &self,
        token: &ApiToken,
        payload: Payload,
        options: ParameterSet,
    ) -> Result<String, RedcapError> {
        let defaults = json().override_mode(OverrideMode::Merge);
        self.text(ResourceKind::Event, Action::Import, token, options.merged_over(defaults), payload).await
    }

    pub async fn delete_events<I, S>(&self, token: &ApiToken, events: I) -> Result<String, RedcapError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let params = ParameterSet::new().events(events);
        self.text(ResourceKind::Event, Action::Delete, token, params, Payload::None).await
    }

    /// Export the variable names the service expects on import, including
    /// the expanded `field___code` names of checkbox fields.
    pub async fn export_field_names(
        &self,
        token: &ApiToken,
        options: ParameterSet,
    ) -> Result<String, RedcapError> {
        let params = options.merged_over(json());
        self.text(ResourceKind::FieldNames, Action::Export, token, params, Payload::None).await
    }

    // Files

    pub async fn export_file(
        &self,
        token: &ApiToken,
        record: &str,
        field: &str,
        options: ParameterSet,
    ) -> Result<FileDownload, RedcapError> {
        let params = options.record(record).field(field);
        self.file(Uuid::new_v4(), ResourceKind::File, Action::Export, token, params).await
    }

    /// Download a file field into `dir` through `store`.
    ///
    /// The server-suggested name is used (last path component only), falling
    /// back to `{record}_{field}`. Returns the written path.
    #[allow(clippy::too_many_arguments)]
    pub async fn export_file_to(
        &self,
        token: &ApiToken,
        record: &str,
        field: &str,
        options: ParameterSet,
        store: &dyn FileStore,
        dir: &Path,
        overwrite: bool,
    ) -> Result<PathBuf, RedcapError> {
        let request_id = Uuid::new_v4();
        let params = options.record(record).field(field);
        let download = self.file(request_id, ResourceKind::File, Action::Export, token, params).await?;
        let path = target_path(dir, download.file_name.as_deref(), &format!("{record}_{field}"));

        let operation = "file/export";
        let site = CallSite::new(request_id, operation, Stage::Store);
        if let Err(source) = store.write(&download.bytes, &path, overwrite).await {
            self.sink.log(Severity::Warn, &format!("storing download failed: {source}"), &site);
            return Err(RedcapError::Storage { operation: operation.to_string(), source });
        }
        self.sink.log(Severity::Info, &format!("stored {} bytes at {}", download.bytes.len(), path.display()), &site);
        Ok(path)
    }

    pub async fn import_file(
        &self,
        token: &ApiToken,
        record: &str,
        field: &str,
        upload: FileUpload,
        options: ParameterSet,
    ) -> Result<String, RedcapError> {
        let params = options.record(record).field(field);
        self.text(ResourceKind::File, Action::Import, token, params, Payload::File(upload)).await
    }

    pub async fn delete_file(
        &self,
        token: &ApiToken,
        record: &str,
        field: &str,
        options: ParameterSet,
    ) -> Result<String, RedcapError> {
        let params = options.record(record).field(field);
        self.text(ResourceKind::File, Action::Delete, token, params, Payload::None).await
    }

    // Instrument-event mappings

    pub async fn export_instrument_event_mappings(
        &self,
        token: &ApiToken,
        options: ParameterSet,
    ) -> Result<String, RedcapError> {
        let params = options.merged_over(json());
        self.text(ResourceKind::FormEventMapping, Action::Export, token, params, Payload::None).await
    }

    pub async fn import_instrument_event_mappings(
        &self,
        token: &ApiToken,
        payload: Payload,
        options: ParameterSet,
    ) -> Result<String, RedcapError> {
        let params = options.merged_over(json());
        self.text(ResourceKind::FormEventMapping, Action::Import, token, params, payload).await
    }

    pub async fn generate_next_record_name(&self, token: &ApiToken) -> Result<String, RedcapError> {
        let name = self
            .text(ResourceKind::NextRecordName, Action::Export, token, ParameterSet::new(), Payload::None)
            .await?;
        Ok(name.trim().to_string())
    }

    pub async fn export_instruments(
        &self,
        token: &ApiToken,
        options: ParameterSet,
    ) -> Result<String, RedcapError> {
        let params = options.merged_over(json());
        self.text(ResourceKind::Instrument, Action::Export, token, params, Payload::None).await
    }

    /// Export instruments as PDF: blank forms, one record, or every record
    /// (`all_records`).
    pub async fn export_pdf(&self, token: &ApiToken, options: ParameterSet) -> Result<FileDownload, RedcapError> {
        self.file(Uuid::new_v4(), ResourceKind::InstrumentPdf, Action::Export, token, options).await
    }

    pub async fn export_logging(&self, token: &ApiToken, options: ParameterSet) -> Result<String, RedcapError> {
        self.text(ResourceKind::Log, Action::Export, token, options.merged_over(json()), Payload::None)
            .await
    }

    // Metadata

    pub async fn export_metadata(
        &self,
        token: &ApiToken,
        options: ParameterSet,
    ) -> Result<String, RedcapError> {
        let params = options.merged_over(json());
        self.text(ResourceKind::Metadata, Action::Export, token, params, Payload::None).await
    }

    pub async fn import_metadata(
        &self,
        token: &ApiToken,
        payload: Payload,
        options: ParameterSet,
    ) -> Result<String, RedcapError> {
        let params = options.merged_over(json());
        self.text(ResourceKind::Metadata, Action::Import, token, params, payload).await
    }

    pub async fn export_participant_list(
        &self,
        token: &ApiToken,
        instrument: &str,
        options: ParameterSet,
    ) -> Result<String, RedcapError> {
        let params = options.merged_over(json()).instrument(instrument);
        self.text(ResourceKind::ParticipantList, Action::Export, token, params, Payload::None).await
    }

    // Projects

    pub async fn export_project_info(
        &self,
        token: &ApiToken,
        options: ParameterSet,
    ) -> Result<String, RedcapError> {
        let params = options.merged_over(json());
        self.text(ResourceKind::Project, Action::Export, token, params, Payload::None).await
    }

    pub async fn import_project_settings(
        &self,
        token: &ApiToken,
        payload: Payload,
        options: ParameterSet,
    ) -> Result<String, RedcapError> {
        let params = options.merged_over(json());
        self.text(ResourceKind::ProjectSettings, Action::Import, token, params, payload).await
    }

    /// Create a project. Requires a super token; the response is the new
    /// project's token.
    pub async fn create_project(
        &self,
        super_token: &ApiToken,
        payload: Payload,
        options: ParameterSet,
    ) -> Result<String, RedcapError> {
        let params = options.merged_over(json());
        let token = self.text(ResourceKind::Project, Action::Import, super_token, params, payload).await?;
        Ok(token.trim().to_string())
    }

    /// Export the whole project as a CDISC ODM document.
    pub async fn export_project_xml(
        &self,
        token: &ApiToken,
        options: ParameterSet,
    ) -> Result<String, RedcapError> {
        self.text(ResourceKind::ProjectXml, Action::Export, token, options, Payload::None).await
    }

    // Records

    pub async fn export_records(&self, token: &ApiToken, options: ParameterSet) -> Result<String, RedcapError> {
        let defaults = json().data_shape(DataShape::Flat).raw_or_label(RawOrLabel::Raw);
        self.text(ResourceKind::Record, Action::Export, token, options.merged_over(defaults), Payload::None)
            .await
    }

    pub async fn import_records(
        &self,
        token: &ApiToken,
        payload: Payload,
        options: ParameterSet,
    ) -> Result<String, RedcapError> {
        let defaults = json()
            .data_shape(DataShape::Flat)
            .overwrite_behavior(OverwriteBehavior::Normal)
            .return_content(ReturnContent::Count);
        self.text(ResourceKind::Record, Action::Import, token, options.merged_over(defaults), payload).await
    }

    pub async fn delete_records<I, S>(
        &self,
        token: &ApiToken,
        records: I,
        options: ParameterSet,
    ) -> Result<String, RedcapError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let params = options.records(records);
        self.text(ResourceKind::Record, Action::Delete, token, params, Payload::None).await
    }

    pub async fn export_report(
        &self,
        token: &ApiToken,
        report_id: u64,
        options: ParameterSet,
    ) -> Result<String, RedcapError> {
        let params = options.merged_over(json().raw_or_label(RawOrLabel::Raw)).report_id(report_id);
        self.text(ResourceKind::Report, Action::Export, token, params, Payload::None).await
    }

    // Repeating instruments and events

    pub async fn export_repeating_instruments_events(
        &self,
        token: &ApiToken,
        options: ParameterSet,
    ) -> Result<String, RedcapError> {
        let params = options.merged_over(json());
        self.text(ResourceKind::RepeatingFormsEvents, Action::Export, token, params, Payload::None).await
    }

    pub async fn import_repeating_instruments_events(
        &self,
        token: &ApiToken,
        payload: Payload,
        options: ParameterSet,
    ) -> Result<String, RedcapError> {
        let params = options.merged_over(json());
        self.text(ResourceKind::RepeatingFormsEvents, Action::Import, token, params, payload).await
    }

    // Surveys

    pub async fn export_survey_link(
        &self,
        token: &ApiToken,
        record: &str,
        instrument: &str,
        options: ParameterSet,
    ) -> Result<String, RedcapError> {
        let params = options.record(record).instrument(instrument);
        let link = self.text(ResourceKind::SurveyLink, Action::Export, token, params, Payload::None).await?;
        Ok(link.trim().to_string())
    }

    pub async fn export_survey_queue_link(
        &self,
        token: &ApiToken,
        record: &str,
    ) -> Result<String, RedcapError> {
        let params = ParameterSet::new().record(record);
        let link = self
            .text(ResourceKind::SurveyQueueLink, Action::Export, token, params, Payload::None)
            .await?;
        Ok(link.trim().to_string())
    }

    pub async fn export_survey_return_code(
        &self,
        token: &ApiToken,
        record: &str,
        instrument: &str,
        options: ParameterSet,
    ) -> Result<String, RedcapError> {
        let params = options.record(record).instrument(instrument);
        let code = self
            .text(ResourceKind::SurveyReturnCode, Action::Export, token, params, Payload::None)
            .await?;
        Ok(code.trim().to_string())
    }

    // Users

    pub async fn export_users(&self, token: &ApiToken, options: ParameterSet) -> Result<String, RedcapError> {
        self.text(ResourceKind::User, Action::Export, token, options.merged_over(json()), Payload::None)
            .await
    }

    pub async fn import_users(
        &self,
        token: &ApiToken,
        payload: Payload,
        options: ParameterSet,
    ) -> Result<String, RedcapError> {
        self.text(ResourceKind::User, Action::Import, token, options.merged_over(json()), payload).await
    }

    pub async fn delete_users<I, S>(&self, token: &ApiToken, users: I) -> Result<String, RedcapError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let params = ParameterSet::new().users(users);
        self.text(ResourceKind::User, Action::Delete, token, params, Payload::None).await
    }

    // User roles

    pub async fn export_user_roles(
        &self,
        token: &ApiToken,
        options: ParameterSet,
    ) -> Result<String, RedcapError> {
        let params = options.merged_over(json());
        self.text(ResourceKind::UserRole, Action::Export, token, params, Payload::None).await
    }

    pub async fn import_user_roles(
        &self,
        token: &ApiToken,
        payload: Payload,
        options: ParameterSet,
    ) -> Result<String, RedcapError> {
        let params = options.merged_over(json());
        self.text(ResourceKind::UserRole, Action::Import, token, params, payload).await
    }

    pub async fn delete_user_roles<I, S>(&self, token: &ApiToken, roles: I) -> Result<String, RedcapError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let params = ParameterSet::new().roles(roles);
        self.text(ResourceKind::UserRole, Action::Delete, token, params, Payload::None).await
    }

    pub async fn export_user_role_mappings(
        &self,
        token: &ApiToken,
        options: ParameterSet,
    ) -> Result<String, RedcapError> {
        let params = options.merged_over(json());
        self.text(ResourceKind::UserRoleMapping, Action::Export, token, params, Payload::None).await
    }

    pub async fn import_user_role_mappings(
        &self,
        token: &ApiToken,
        payload: Payload,
        options: ParameterSet,
    ) -> Result<String, RedcapError> {
        let params = options.merged_over(json());
        self.text(ResourceKind::UserRoleMapping, Action::Import, token, params, payload).await
    }

    pub async fn export_version(&self, token: &ApiToken) -> Result<String, RedcapError> {
        let version = self
            .text(ResourceKind::Version, Action::Export, token, ParameterSet::new(), Payload::None)
            .await?;
        Ok(version.trim().to_string())
    }
}

fn json() -> ParameterSet {
    ParameterSet::new().format_as(ReturnFormat::Json)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::error::{DomainError, EncodingError, StorageError, TransportError};
    use crate::http::{RawResponse, WireRequest};
    use crate::log::testing::RecordingSink;
    use crate::storage::FsFileStore;

    /// Replays canned responses and keeps every request it saw.
    #[derive(Default)]
    struct FakeTransport {
        responses: Mutex<Vec<RawResponse>>,
        seen: Mutex<Vec<WireRequest>>,
    }

    impl FakeTransport {
        fn answering(responses: Vec<RawResponse>) -> Arc<Self> {
            let mut responses = responses;
            responses.reverse();
            Arc::new(Self { responses: Mutex::new(responses), seen: Mutex::default() })
        }

        fn requests(&self) -> Vec<WireRequest> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn execute(&self, request: WireRequest) -> Result<RawResponse, TransportError> {
            self.seen.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| TransportError::ConnectionFailed("no canned response".to_string()))
        }
    }

    /// Never answers.
    struct StalledTransport;

    #[async_trait]
    impl Transport for StalledTransport {
        async fn execute(&self, _request: WireRequest) -> Result<RawResponse, TransportError> {
            std::future::pending().await
        }
    }

    fn ok(content_type: &str, body: &str) -> RawResponse {
        RawResponse {
            status: 200,
            headers: vec![("content-type".to_string(), content_type.to_string())],
            body: body.as_bytes().to_vec(),
        }
    }

    fn token() -> ApiToken {
        ApiToken::new("0123456789ABCDEF0123456789ABCDEF").unwrap()
    }

    fn client(transport: Arc<dyn Transport>) -> (RedcapClient, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let config = ClientConfig::builder("https://redcap.example.org/api/")
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        (RedcapClient::with_transport(config, transport, sink.clone()), sink)
    }

    #[tokio::test]
    async fn export_records_applies_defaults() {
        let transport = FakeTransport::answering(vec![ok("application/json", r#"[{"record_id":"1"}]"#)]);
        let (client, _) = client(transport.clone());

        let body = client.export_records(&token(), ParameterSet::new()).await.unwrap();
        assert_eq!(body, r#"[{"record_id":"1"}]"#);

        let sent = &transport.requests()[0];
        assert_eq!(sent.uri, "https://redcap.example.org/api/");
        assert_eq!(
            String::from_utf8(sent.body.clone()).unwrap(),
            "token=0123456789ABCDEF0123456789ABCDEF&content=record&format=json&type=flat&rawOrLabel=raw"
        );
    }

    #[tokio::test]
    async fn caller_options_override_defaults() {
        let transport = FakeTransport::answering(vec![ok("text/csv", "record_id\n1\n")]);
        let (client, _) = client(transport.clone());

        let options = ParameterSet::new().format_as(ReturnFormat::Csv).raw_or_label(RawOrLabel::Label);
        client.export_records(&token(), options).await.unwrap();

        let sent = &transport.requests()[0];
        assert_eq!(sent.field("format"), Some("csv"));
        assert_eq!(sent.field("rawOrLabel"), Some("label"));
    }

    #[tokio::test]
    async fn in_band_error_with_success_status_is_a_domain_error() {
        let transport = FakeTransport::answering(vec![ok(
            "text/xml",
            "<?xml version=\"1.0\" encoding=\"UTF-8\" ?><hash><error>You do not have permissions to use the API</error></hash>",
        )]);
        let (client, _) = client(transport);

        let options = ParameterSet::new().error_format_as(ReturnFormat::Xml);
        let err = client.export_arms(&token(), options).await.unwrap_err();
        match err {
            RedcapError::Domain { operation, status, source } => {
                assert_eq!(operation, "arm/export");
                assert_eq!(status, 200);
                assert_eq!(
                    source,
                    DomainError::RecognizedServiceError("You do not have permissions to use the API".into())
                );
            }
            other => panic!("expected domain error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_payload_fails_before_dispatch() {
        let transport = FakeTransport::answering(Vec::new());
        let (client, sink) = client(transport.clone());

        let err = client.import_records(&token(), Payload::None, ParameterSet::new()).await.unwrap_err();
        assert!(matches!(
            err,
            RedcapError::Encoding { source: EncodingError::MissingPayload(_), .. }
        ));
        assert!(transport.requests().is_empty());
        assert!(sink.messages().iter().any(|m| m.starts_with("encoding failed")));
    }

    #[tokio::test]
    async fn illegal_format_is_invalid_configuration() {
        let transport = FakeTransport::answering(Vec::new());
        let (client, _) = client(transport.clone());

        let options = ParameterSet::new().format_as(ReturnFormat::Odm);
        let err = client.export_records(&token(), options).await.unwrap_err();
        match err {
            RedcapError::InvalidConfiguration(invalid) => {
                assert_eq!(invalid.option, "format");
                assert_eq!(invalid.value, "odm");
                assert_eq!(invalid.legal, vec!["json", "csv", "xml"]);
            }
            other => panic!("expected invalid configuration, got {other:?}"),
        }
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn export_file_returns_bytes_and_name() {
        let transport = FakeTransport::answering(vec![RawResponse {
            status: 200,
            headers: vec![("content-type".to_string(), "image/png; name=\"scan.png\"".to_string())],
            body: vec![0x89, b'P', b'N', b'G'],
        }]);
        let (client, _) = client(transport.clone());

        let file = client.export_file(&token(), "7", "upload", ParameterSet::new()).await.unwrap();
        assert_eq!(file.bytes, vec![0x89, b'P', b'N', b'G']);
        assert_eq!(file.file_name.as_deref(), Some("scan.png"));
        assert_eq!(file.mime_type.as_deref(), Some("image/png"));

        let sent = &transport.requests()[0];
        assert!(sent.content_type.starts_with("multipart/form-data; boundary="));
        assert_eq!(sent.field("action"), Some("export"));
        assert_eq!(sent.field("record"), Some("7"));
        assert_eq!(sent.field("field"), Some("upload"));
    }

    #[tokio::test]
    async fn export_file_to_writes_into_directory() {
        let transport = FakeTransport::answering(vec![
            RawResponse {
                status: 200,
                headers: vec![("content-type".to_string(), "text/plain; name=\"../notes.txt\"".to_string())],
                body: b"hello".to_vec(),
            },
            RawResponse {
                status: 200,
                headers: vec![("content-type".to_string(), "text/plain; name=\"notes.txt\"".to_string())],
                body: b"again".to_vec(),
            },
        ]);
        let (client, _) = client(transport);
        let dir = tempfile::tempdir().unwrap();

        let path = client
            .export_file_to(&token(), "1", "notes", ParameterSet::new(), &FsFileStore, dir.path(), false)
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("notes.txt"));
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");

        let err = client
            .export_file_to(&token(), "1", "notes", ParameterSet::new(), &FsFileStore, dir.path(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, RedcapError::Storage { source: StorageError::AlreadyExists(_), .. }));
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn stored_download_logs_under_the_export_request_id() {
        let transport = FakeTransport::answering(vec![RawResponse {
            status: 200,
            headers: vec![("content-type".to_string(), "text/plain; name=\"notes.txt\"".to_string())],
            body: b"hello".to_vec(),
        }]);
        let (client, sink) = client(transport);
        let dir = tempfile::tempdir().unwrap();

        client
            .export_file_to(&token(), "1", "notes", ParameterSet::new(), &FsFileStore, dir.path(), false)
            .await
            .unwrap();

        let entries = sink.entries.lock().unwrap();
        let id = entries[0].2.request_id;
        assert!(entries.iter().all(|(_, _, site)| site.request_id == id));
        assert!(entries.iter().any(|(_, _, site)| site.stage == Stage::Store));
        assert!(entries.iter().any(|(_, _, site)| site.stage == Stage::Dispatch));
    }

    #[tokio::test]
    async fn delete_sends_list_and_no_format() {
        let transport = FakeTransport::answering(vec![ok("text/html", "2")]);
        let (client, _) = client(transport.clone());

        let count = client.delete_arms(&token(), ["1", "2"]).await.unwrap();
        assert_eq!(count, "2");

        let sent = &transport.requests()[0];
        assert_eq!(sent.field("action"), Some("delete"));
        assert_eq!(sent.field("arms[0]"), Some("1"));
        assert_eq!(sent.field("arms[1]"), Some("2"));
        assert!(!sent.has_field("format"));
    }

    #[tokio::test]
    async fn version_is_trimmed() {
        let transport = FakeTransport::answering(vec![ok("text/html; charset=UTF-8", "14.0.1\n")]);
        let (client, _) = client(transport);
        assert_eq!(client.export_version(&token()).await.unwrap(), "14.0.1");
    }

    #[tokio::test]
    async fn cancellation_reaches_the_dispatcher() {
        let (client, _) = client(Arc::new(StalledTransport));
        let cancel = CancellationToken::new();
        let client = client.with_cancellation(cancel.clone());
        cancel.cancel();

        let err = client.export_version(&token()).await.unwrap_err();
        assert_eq!(err.transport(), Some(&TransportError::Cancelled));
    }

    #[tokio::test]
    async fn every_log_entry_of_a_call_shares_a_request_id() {
        let transport = FakeTransport::answering(vec![ok("application/json", "[]")]);
        let (client, sink) = client(transport);
        client.export_events(&token(), ParameterSet::new()).await.unwrap();

        let entries = sink.entries.lock().unwrap();
        assert!(entries.len() >= 2);
        let id = entries[0].2.request_id;
        assert!(entries.iter().all(|(_, _, site)| site.request_id == id && site.operation == "event/export"));
    }
}
