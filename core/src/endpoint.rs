//! Endpoint table and operation descriptors.
//!
//! # Design
//! Every legal (resource kind, action) pair has exactly one row in
//! `ENDPOINTS`. The row says how the request is shaped (action token, format
//! negotiation, form vs multipart, text vs binary response, payload rule),
//! which identifying options are mandatory, and which options are *in scope*.
//!
//! The scope lists are the option-scoping contract: the encoder emits an
//! option only when the row lists it, and silently drops it otherwise. The
//! remote service ignores unknown options, so dropping keeps requests minimal
//! without changing behaviour. These lists were reconstructed from the
//! service's per-method documentation and should be reviewed against the
//! live service when it changes.
//!
//! `returnFormat` is in scope for every row and `format` is emitted from the
//! descriptor, so neither appears in the scope lists.

use std::fmt;

use crate::error::InvalidConfiguration;
use crate::options::{OptionKey, OptionValue, ParameterSet};
use crate::types::{Action, DataShape, ResourceKind, ReturnFormat};

/// How the request body is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    Form,
    Multipart,
}

/// What a successful response body contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseBody {
    Text,
    Binary,
}

/// Which payload, if any, the operation takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadRule {
    None,
    /// Records (or pre-serialized text) under the `data` field.
    Records,
    /// A binary attachment in its own multipart section.
    File,
}

/// Extra condition an in-scope option must meet to be emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// Only honoured for flat exports (`type` unset or `flat`).
    FlatShape,
}

impl Condition {
    fn holds(self, params: &ParameterSet) -> bool {
        match self {
            Condition::FlatShape => match params.get(OptionKey::Type) {
                None => true,
                Some(OptionValue::Token(token)) => *token == DataShape::Flat.wire_token(),
                Some(_) => false,
            },
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct EndpointSpec {
    pub kind: ResourceKind,
    pub action: Action,
    pub sends_action: bool,
    /// Legal response formats; the first is the default. Empty when the
    /// response is plain text or binary regardless of format.
    pub formats: &'static [ReturnFormat],
    pub emits_format: bool,
    pub transfer: Transfer,
    pub response: ResponseBody,
    pub payload: PayloadRule,
    pub required: &'static [OptionKey],
    pub scope: &'static [OptionKey],
    pub conditional: &'static [(OptionKey, Condition)],
}

const JCX: &[ReturnFormat] = &[ReturnFormat::Json, ReturnFormat::Csv, ReturnFormat::Xml];

const FILE_FIELDS: &[OptionKey] =
    &[OptionKey::Record, OptionKey::Field, OptionKey::Event, OptionKey::RepeatInstance];

const FILE_REQUIRED: &[OptionKey] = &[OptionKey::Record, OptionKey::Field];

const SURVEY_FIELDS: &[OptionKey] =
    &[OptionKey::Record, OptionKey::Instrument, OptionKey::Event, OptionKey::RepeatInstance];

impl EndpointSpec {
    const fn new(kind: ResourceKind, action: Action) -> Self {
        let exporting = matches!(action, Action::Export);
        let deleting = matches!(action, Action::Delete);
        Self {
            kind,
            action,
            sends_action: !exporting,
            formats: if deleting { &[] } else { JCX },
            emits_format: !deleting,
            transfer: Transfer::Form,
            response: ResponseBody::Text,
            payload: if matches!(action, Action::Import) { PayloadRule::Records } else { PayloadRule::None },
            required: &[],
            scope: &[],
            conditional: &[],
        }
    }

    const fn scope(mut self, scope: &'static [OptionKey]) -> Self {
        self.scope = scope;
        self
    }

    /// Required keys are always in scope as well.
    const fn required(mut self, required: &'static [OptionKey]) -> Self {
        self.required = required;
        self
    }

    const fn conditional(mut self, conditional: &'static [(OptionKey, Condition)]) -> Self {
        self.conditional = conditional;
        self
    }

    const fn with_action(mut self) -> Self {
        self.sends_action = true;
        self
    }

    const fn without_action(mut self) -> Self {
        self.sends_action = false;
        self
    }

    const fn unformatted(mut self) -> Self {
        self.formats = &[];
        self.emits_format = false;
        self
    }

    /// The response is always in `format`, and `format` is not sent.
    const fn fixed_format(mut self, formats: &'static [ReturnFormat]) -> Self {
        self.formats = formats;
        self.emits_format = false;
        self
    }

    const fn multipart(mut self) -> Self {
        self.transfer = Transfer::Multipart;
        self
    }

    const fn binary(mut self) -> Self {
        self.response = ResponseBody::Binary;
        self
    }

    const fn file_payload(mut self) -> Self {
        self.payload = PayloadRule::File;
        self
    }

    /// Whether `key` may appear on the wire for this endpoint given the
    /// other values in `params`.
    pub fn in_scope(&self, key: OptionKey, params: &ParameterSet) -> bool {
        match key {
            OptionKey::Format => false,
            OptionKey::ErrorFormat => true,
            _ => {
                let listed = self.scope.contains(&key) || self.required.contains(&key);
                listed
                    && self
                        .conditional
                        .iter()
                        .filter(|(conditioned, _)| *conditioned == key)
                        .all(|(_, condition)| condition.holds(params))
            }
        }
    }

    pub fn default_format(&self) -> Option<ReturnFormat> {
        self.formats.first().copied()
    }
}

use Action::{Delete, Export, Import};
use OptionKey as K;
use ResourceKind as R;

/// Every legal (resource kind, action) pair.
pub static ENDPOINTS: &[EndpointSpec] = &[
    EndpointSpec::new(R::Arm, Export).scope(&[K::Arms]),
    EndpointSpec::new(R::Arm, Import).scope(&[K::Override]),
    EndpointSpec::new(R::Arm, Delete).required(&[K::Arms]),
    EndpointSpec::new(R::Dag, Export),
    EndpointSpec::new(R::Dag, Import),
    EndpointSpec::new(R::Dag, Delete).required(&[K::Dags]),
    EndpointSpec::new(R::UserDagMapping, Export),
    EndpointSpec::new(R::UserDagMapping, Import),
    EndpointSpec::new(R::Event, Export).scope(&[K::Arms]),
    EndpointSpec::new(R::Event, Import).scope(&[K::Override]),
    EndpointSpec::new(R::Event, Delete).required(&[K::Events]),
    EndpointSpec::new(R::FieldNames, Export).scope(&[K::Field]),
    EndpointSpec::new(R::File, Export)
        .with_action()
        .unformatted()
        .multipart()
        .binary()
        .required(FILE_REQUIRED)
        .scope(FILE_FIELDS),
    EndpointSpec::new(R::File, Import)
        .unformatted()
        .multipart()
        .file_payload()
        .required(FILE_REQUIRED)
        .scope(FILE_FIELDS),
    EndpointSpec::new(R::File, Delete).multipart().required(FILE_REQUIRED).scope(FILE_FIELDS),
    EndpointSpec::new(R::FormEventMapping, Export).scope(&[K::Arms]),
    EndpointSpec::new(R::FormEventMapping, Import),
    EndpointSpec::new(R::NextRecordName, Export).unformatted(),
    EndpointSpec::new(R::Instrument, Export),
    EndpointSpec::new(R::InstrumentPdf, Export).unformatted().binary().scope(&[
        K::Record,
        K::Event,
        K::Instrument,
        K::RepeatInstance,
        K::AllRecords,
    ]),
    EndpointSpec::new(R::Log, Export).scope(&[
        K::LogType,
        K::User,
        K::Record,
        K::Dag,
        K::BeginTime,
        K::EndTime,
    ]),
    EndpointSpec::new(R::Metadata, Export).scope(&[K::Fields, K::Forms]),
    EndpointSpec::new(R::Metadata, Import),
    EndpointSpec::new(R::ParticipantList, Export)
        .required(&[K::Instrument])
        .scope(&[K::Event]),
    EndpointSpec::new(R::Project, Export),
    EndpointSpec::new(R::Project, Import).without_action().scope(&[K::Odm]),
    EndpointSpec::new(R::ProjectSettings, Import).without_action(),
    EndpointSpec::new(R::ProjectXml, Export).fixed_format(&[ReturnFormat::Odm]).scope(&[
        K::ReturnMetadataOnly,
        K::Records,
        K::Fields,
        K::Events,
        K::ExportSurveyFields,
        K::ExportDataAccessGroups,
        K::FilterLogic,
        K::ExportFiles,
    ]),
    EndpointSpec::new(R::Record, Export)
        .scope(&[
            K::Type,
            K::RawOrLabel,
            K::RawOrLabelHeaders,
            K::ExportCheckboxLabel,
            K::ExportSurveyFields,
            K::ExportDataAccessGroups,
            K::ExportBlankForGrayFormStatus,
            K::FilterLogic,
            K::DateRangeBegin,
            K::DateRangeEnd,
            K::CsvDelimiter,
            K::DecimalCharacter,
            K::Records,
            K::Fields,
            K::Forms,
            K::Events,
        ])
        .conditional(&[(K::ExportCheckboxLabel, Condition::FlatShape)]),
    EndpointSpec::new(R::Record, Import).scope(&[
        K::Type,
        K::OverwriteBehavior,
        K::ForceAutoNumber,
        K::DateFormat,
        K::CsvDelimiter,
        K::ReturnContent,
    ]),
    EndpointSpec::new(R::Record, Delete)
        .required(&[K::Records])
        .scope(&[K::Arm, K::Instrument, K::Event, K::RepeatInstance]),
    EndpointSpec::new(R::Report, Export).required(&[K::ReportId]).scope(&[
        K::RawOrLabel,
        K::RawOrLabelHeaders,
        K::ExportCheckboxLabel,
        K::CsvDelimiter,
        K::DecimalCharacter,
    ]),
    EndpointSpec::new(R::RepeatingFormsEvents, Export),
    EndpointSpec::new(R::RepeatingFormsEvents, Import),
    EndpointSpec::new(R::SurveyLink, Export)
        .unformatted()
        .required(&[K::Record, K::Instrument])
        .scope(SURVEY_FIELDS),
    EndpointSpec::new(R::SurveyQueueLink, Export).unformatted().required(&[K::Record]),
    EndpointSpec::new(R::SurveyReturnCode, Export)
        .unformatted()
        .required(&[K::Record, K::Instrument])
        .scope(SURVEY_FIELDS),
    EndpointSpec::new(R::User, Export),
    EndpointSpec::new(R::User, Import),
    EndpointSpec::new(R::User, Delete).required(&[K::Users]),
    EndpointSpec::new(R::UserRole, Export),
    EndpointSpec::new(R::UserRole, Import),
    EndpointSpec::new(R::UserRole, Delete).required(&[K::Roles]),
    EndpointSpec::new(R::UserRoleMapping, Export),
    EndpointSpec::new(R::UserRoleMapping, Import),
    EndpointSpec::new(R::Version, Export).unformatted(),
];

pub fn endpoint(kind: ResourceKind, action: Action) -> Option<&'static EndpointSpec> {
    ENDPOINTS.iter().find(|row| row.kind == kind && row.action == action)
}

/// Identifies one logical operation and the formats it negotiates.
///
/// Only constructible through [`OperationDescriptor::new`], so every
/// descriptor maps to exactly one row of the endpoint table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationDescriptor {
    endpoint: &'static EndpointSpec,
    format: Option<ReturnFormat>,
    error_format: Option<ReturnFormat>,
}

impl OperationDescriptor {
    /// Validate a (kind, action) pair and its formats against the endpoint
    /// table.
    ///
    /// A `format` is ignored by endpoints whose response format is fixed;
    /// elsewhere it must be one of the endpoint's formats. `None` selects the
    /// endpoint default. An unset `error_format` is not sent.
    pub fn new(
        kind: ResourceKind,
        action: Action,
        format: Option<ReturnFormat>,
        error_format: Option<ReturnFormat>,
    ) -> Result<Self, InvalidConfiguration> {
        let endpoint = endpoint(kind, action).ok_or_else(|| {
            let legal = ENDPOINTS
                .iter()
                .filter(|row| row.kind == kind)
                .map(|row| row.action.wire_token());
            InvalidConfiguration::new(Action::OPTION_NAME, action.wire_token(), legal)
                .in_scope(format!("content={kind}"))
        })?;

        let format = match format {
            Some(requested) if endpoint.emits_format => {
                if !endpoint.formats.contains(&requested) {
                    return Err(InvalidConfiguration::new(
                        ReturnFormat::OPTION_NAME,
                        requested.wire_token(),
                        endpoint.formats.iter().map(|f| f.wire_token()),
                    )
                    .in_scope(format!("{kind}/{action}")));
                }
                Some(requested)
            }
            _ => endpoint.default_format(),
        };

        if let Some(requested) = error_format.filter(|f| !f.is_error_format()) {
            return Err(InvalidConfiguration::new(
                OptionKey::ErrorFormat.wire_token(),
                requested.wire_token(),
                ["json", "csv", "xml"],
            ));
        }

        Ok(Self { endpoint, format, error_format })
    }

    /// Build from the `format`/`returnFormat` entries of a parameter set.
    pub fn from_params(
        kind: ResourceKind,
        action: Action,
        params: &ParameterSet,
    ) -> Result<Self, InvalidConfiguration> {
        Self::new(kind, action, params.format(), params.error_format())
    }

    pub fn kind(&self) -> ResourceKind {
        self.endpoint.kind
    }

    pub fn action(&self) -> Action {
        self.endpoint.action
    }

    /// Format of a successful text response, if the endpoint negotiates one.
    pub fn format(&self) -> Option<ReturnFormat> {
        self.format
    }

    pub fn error_format(&self) -> Option<ReturnFormat> {
        self.error_format
    }

    /// Error envelope format the service will use (its default is json).
    pub fn effective_error_format(&self) -> ReturnFormat {
        self.error_format.unwrap_or(ReturnFormat::Json)
    }

    pub fn endpoint(&self) -> &'static EndpointSpec {
        self.endpoint
    }
}

impl fmt::Display for OperationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind(), self.action())
    }
}
