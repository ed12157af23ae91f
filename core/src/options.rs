//! The parameter set: every named option an operation can carry.
//!
//! # Design
//! Instead of one call signature per operation, every cross-cutting option
//! lives in a single `ParameterSet` keyed by `OptionKey`. Each key declares
//! the kind of value it holds; typed setters make mismatches impossible and
//! `set_raw` validates untyped caller strings against the same declaration.
//! Whether a key is *meaningful* for a given operation is decided elsewhere,
//! by the endpoint table in `endpoint.rs`.
//!
//! Storage is a `BTreeMap` ordered by `OptionKey` declaration order, so
//! iteration (and therefore encoding) is deterministic.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;

use crate::error::InvalidConfiguration;
use crate::types::{
    wire_enum, CsvDelimiter, DataShape, DateFormat, DecimalCharacter, LogType, OverrideMode,
    OverwriteBehavior, RawOrLabel, RawOrLabelHeaders, ReturnContent, ReturnFormat,
};

/// Timestamp layout for the record export date-range bounds.
pub const DATE_RANGE_LAYOUT: &str = "%Y-%m-%d %H:%M:%S";

/// Timestamp layout for the logging time window.
pub const LOG_TIME_LAYOUT: &str = "%Y-%m-%d %H:%M";

wire_enum! {
    /// Name of an option as it appears on the wire.
    pub enum OptionKey as "option" {
        Format => "format",
        ErrorFormat => "returnFormat",
        Type => "type",
        RawOrLabel => "rawOrLabel",
        RawOrLabelHeaders => "rawOrLabelHeaders",
        ExportCheckboxLabel => "exportCheckboxLabel",
        ExportSurveyFields => "exportSurveyFields",
        ExportDataAccessGroups => "exportDataAccessGroups",
        ExportBlankForGrayFormStatus => "exportBlankForGrayFormStatus",
        FilterLogic => "filterLogic",
        DateRangeBegin => "dateRangeBegin",
        DateRangeEnd => "dateRangeEnd",
        CsvDelimiter => "csvDelimiter",
        DecimalCharacter => "decimalCharacter",
        Records => "records",
        Fields => "fields",
        Forms => "forms",
        Events => "events",
        Arms => "arms",
        Dags => "dags",
        Users => "users",
        Roles => "roles",
        OverwriteBehavior => "overwriteBehavior",
        ForceAutoNumber => "forceAutoNumber",
        DateFormat => "dateFormat",
        ReturnContent => "returnContent",
        Override => "override",
        Record => "record",
        Field => "field",
        Event => "event",
        RepeatInstance => "repeat_instance",
        Instrument => "instrument",
        Arm => "arm",
        ReportId => "report_id",
        ReturnMetadataOnly => "returnMetadataOnly",
        ExportFiles => "exportFiles",
        AllRecords => "allRecords",
        Odm => "odm",
        LogType => "logtype",
        User => "user",
        Dag => "dag",
        BeginTime => "beginTime",
        EndTime => "endTime",
    }
}

/// The shape of value an option accepts.
#[derive(Debug, Clone, Copy)]
pub enum ValueKind {
    Flag,
    Text,
    Integer,
    List,
    /// A timestamp rendered with the given `chrono` layout.
    Timestamp(&'static str),
    /// One of a closed set of wire tokens.
    Token(fn() -> Vec<&'static str>),
}

fn error_format_tokens() -> Vec<&'static str> {
    ReturnFormat::ALL
        .iter()
        .filter(|format| format.is_error_format())
        .map(|format| format.wire_token())
        .collect()
}

impl OptionKey {
    pub fn value_kind(self) -> ValueKind {
        use OptionKey as K;
        match self {
            K::Format => ValueKind::Token(ReturnFormat::legal_tokens),
            K::ErrorFormat => ValueKind::Token(error_format_tokens),
            K::Type => ValueKind::Token(DataShape::legal_tokens),
            K::RawOrLabel => ValueKind::Token(RawOrLabel::legal_tokens),
            K::RawOrLabelHeaders => ValueKind::Token(RawOrLabelHeaders::legal_tokens),
            K::CsvDelimiter => ValueKind::Token(CsvDelimiter::legal_tokens),
            K::DecimalCharacter => ValueKind::Token(DecimalCharacter::legal_tokens),
            K::OverwriteBehavior => ValueKind::Token(OverwriteBehavior::legal_tokens),
            K::DateFormat => ValueKind::Token(DateFormat::legal_tokens),
            K::ReturnContent => ValueKind::Token(ReturnContent::legal_tokens),
            K::Override => ValueKind::Token(OverrideMode::legal_tokens),
            K::LogType => ValueKind::Token(LogType::legal_tokens),
            K::ExportCheckboxLabel
            | K::ExportSurveyFields
            | K::ExportDataAccessGroups
            | K::ExportBlankForGrayFormStatus
            | K::ForceAutoNumber
            | K::ReturnMetadataOnly
            | K::ExportFiles
            | K::AllRecords => ValueKind::Flag,
            K::Records | K::Fields | K::Forms | K::Events | K::Arms | K::Dags | K::Users | K::Roles => {
                ValueKind::List
            }
            K::RepeatInstance | K::ReportId => ValueKind::Integer,
            K::DateRangeBegin | K::DateRangeEnd => ValueKind::Timestamp(DATE_RANGE_LAYOUT),
            K::BeginTime | K::EndTime => ValueKind::Timestamp(LOG_TIME_LAYOUT),
            K::FilterLogic
            | K::Record
            | K::Field
            | K::Event
            | K::Instrument
            | K::Arm
            | K::Odm
            | K::User
            | K::Dag => ValueKind::Text,
        }
    }
}

/// A validated option value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Flag(bool),
    Text(String),
    Integer(u64),
    List(Vec<String>),
    Timestamp(NaiveDateTime),
    Token(&'static str),
}

/// Wire rendering of one option: a single field, or an indexed list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rendered {
    Scalar(String),
    List(Vec<String>),
}

impl OptionValue {
    pub fn render(&self, key: OptionKey) -> Rendered {
        match self {
            OptionValue::Flag(flag) => Rendered::Scalar(flag.to_string()),
            OptionValue::Text(text) => Rendered::Scalar(text.clone()),
            OptionValue::Integer(n) => Rendered::Scalar(n.to_string()),
            OptionValue::List(items) => Rendered::List(items.clone()),
            OptionValue::Timestamp(at) => {
                let layout = match key.value_kind() {
                    ValueKind::Timestamp(layout) => layout,
                    _ => DATE_RANGE_LAYOUT,
                };
                Rendered::Scalar(at.format(layout).to_string())
            }
            OptionValue::Token(token) => Rendered::Scalar((*token).to_string()),
        }
    }

    fn token(&self) -> Option<&'static str> {
        match self {
            OptionValue::Token(token) => Some(token),
            _ => None,
        }
    }
}

/// Named option values for one call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSet {
    values: BTreeMap<OptionKey, OptionValue>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: OptionKey) -> Option<&OptionValue> {
        self.values.get(&key)
    }

    /// Entries in `OptionKey` declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (OptionKey, &OptionValue)> {
        self.values.iter().map(|(key, value)| (*key, value))
    }

    /// Parse an untyped caller argument, e.g. `("rawOrLabel", "label")`.
    ///
    /// Fails with `InvalidConfiguration` naming the option and its legal
    /// values when either the name or the value is outside its domain.
    pub fn set_raw(mut self, name: &str, value: &str) -> Result<Self, InvalidConfiguration> {
        let key = name.parse::<OptionKey>()?;
        let parsed = parse_value(key, value)?;
        self.values.insert(key, parsed);
        Ok(self)
    }

    /// Caller values win; anything the caller left unset comes from
    /// `defaults`.
    pub fn merged_over(self, defaults: ParameterSet) -> ParameterSet {
        let mut values = defaults.values;
        values.extend(self.values);
        ParameterSet { values }
    }

    pub fn format(&self) -> Option<ReturnFormat> {
        self.token_of(OptionKey::Format).and_then(ReturnFormat::from_token)
    }

    pub fn error_format(&self) -> Option<ReturnFormat> {
        self.token_of(OptionKey::ErrorFormat).and_then(ReturnFormat::from_token)
    }

    pub fn csv_delimiter_value(&self) -> Option<CsvDelimiter> {
        self.token_of(OptionKey::CsvDelimiter).and_then(CsvDelimiter::from_token)
    }

    fn token_of(&self, key: OptionKey) -> Option<&'static str> {
        self.values.get(&key).and_then(OptionValue::token)
    }

    fn with(mut self, key: OptionKey, value: OptionValue) -> Self {
        self.values.insert(key, value);
        self
    }

    fn with_list<I, S>(self, key: OptionKey, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with(key, OptionValue::List(items.into_iter().map(Into::into).collect()))
    }

    pub fn format_as(self, format: ReturnFormat) -> Self {
        self.with(OptionKey::Format, OptionValue::Token(format.wire_token()))
    }

    /// Format of error envelopes. `Odm` is not an error format and is ignored.
    pub fn error_format_as(self, format: ReturnFormat) -> Self {
        if !format.is_error_format() {
            return self;
        }
        self.with(OptionKey::ErrorFormat, OptionValue::Token(format.wire_token()))
    }

    pub fn data_shape(self, shape: DataShape) -> Self {
        self.with(OptionKey::Type, OptionValue::Token(shape.wire_token()))
    }

    pub fn raw_or_label(self, value: RawOrLabel) -> Self {
        self.with(OptionKey::RawOrLabel, OptionValue::Token(value.wire_token()))
    }

    pub fn raw_or_label_headers(self, value: RawOrLabelHeaders) -> Self {
        self.with(OptionKey::RawOrLabelHeaders, OptionValue::Token(value.wire_token()))
    }

    pub fn export_checkbox_label(self, enabled: bool) -> Self {
        self.with(OptionKey::ExportCheckboxLabel, OptionValue::Flag(enabled))
    }

    pub fn export_survey_fields(self, enabled: bool) -> Self {
        self.with(OptionKey::ExportSurveyFields, OptionValue::Flag(enabled))
    }

    pub fn export_data_access_groups(self, enabled: bool) -> Self {
        self.with(OptionKey::ExportDataAccessGroups, OptionValue::Flag(enabled))
    }

    pub fn export_blank_for_gray_form_status(self, enabled: bool) -> Self {
        self.with(OptionKey::ExportBlankForGrayFormStatus, OptionValue::Flag(enabled))
    }

    pub fn filter_logic(self, expression: impl Into<String>) -> Self {
        self.with(OptionKey::FilterLogic, OptionValue::Text(expression.into()))
    }

    pub fn date_range_begin(self, at: NaiveDateTime) -> Self {
        self.with(OptionKey::DateRangeBegin, OptionValue::Timestamp(at))
    }

    pub fn date_range_end(self, at: NaiveDateTime) -> Self {
        self.with(OptionKey::DateRangeEnd, OptionValue::Timestamp(at))
    }

    pub fn csv_delimiter(self, delimiter: CsvDelimiter) -> Self {
        self.with(OptionKey::CsvDelimiter, OptionValue::Token(delimiter.wire_token()))
    }

    pub fn decimal_character(self, decimal: DecimalCharacter) -> Self {
        self.with(OptionKey::DecimalCharacter, OptionValue::Token(decimal.wire_token()))
    }

    pub fn records<I: IntoIterator<Item = S>, S: Into<String>>(self, records: I) -> Self {
        self.with_list(OptionKey::Records, records)
    }

    pub fn fields<I: IntoIterator<Item = S>, S: Into<String>>(self, fields: I) -> Self {
        self.with_list(OptionKey::Fields, fields)
    }

    pub fn forms<I: IntoIterator<Item = S>, S: Into<String>>(self, forms: I) -> Self {
        self.with_list(OptionKey::Forms, forms)
    }

    pub fn events<I: IntoIterator<Item = S>, S: Into<String>>(self, events: I) -> Self {
        self.with_list(OptionKey::Events, events)
    }

    pub fn arms<I: IntoIterator<Item = S>, S: Into<String>>(self, arms: I) -> Self {
        self.with_list(OptionKey::Arms, arms)
    }

    pub fn dags<I: IntoIterator<Item = S>, S: Into<String>>(self, dags: I) -> Self {
        self.with_list(OptionKey::Dags, dags)
    }

    pub fn users<I: IntoIterator<Item = S>, S: Into<String>>(self, users: I) -> Self {
        self.with_list(OptionKey::Users, users)
    }

    pub fn roles<I: IntoIterator<Item = S>, S: Into<String>>(self, roles: I) -> Self {
        self.with_list(OptionKey::Roles, roles)
    }

    pub fn overwrite_behavior(self, behavior: OverwriteBehavior) -> Self {
        self.with(OptionKey::OverwriteBehavior, OptionValue::Token(behavior.wire_token()))
    }

    pub fn force_auto_number(self, enabled: bool) -> Self {
        self.with(OptionKey::ForceAutoNumber, OptionValue::Flag(enabled))
    }

    pub fn date_format(self, format: DateFormat) -> Self {
        self.with(OptionKey::DateFormat, OptionValue::Token(format.wire_token()))
    }

    pub fn return_content(self, content: ReturnContent) -> Self {
        self.with(OptionKey::ReturnContent, OptionValue::Token(content.wire_token()))
    }

    pub fn override_mode(self, mode: OverrideMode) -> Self {
        self.with(OptionKey::Override, OptionValue::Token(mode.wire_token()))
    }

    pub fn record(self, record: impl Into<String>) -> Self {
        self.with(OptionKey::Record, OptionValue::Text(record.into()))
    }

    pub fn field(self, field: impl Into<String>) -> Self {
        self.with(OptionKey::Field, OptionValue::Text(field.into()))
    }

    pub fn event(self, event: impl Into<String>) -> Self {
        self.with(OptionKey::Event, OptionValue::Text(event.into()))
    }

    pub fn repeat_instance(self, instance: u32) -> Self {
        self.with(OptionKey::RepeatInstance, OptionValue::Integer(u64::from(instance)))
    }

    pub fn instrument(self, instrument: impl Into<String>) -> Self {
        self.with(OptionKey::Instrument, OptionValue::Text(instrument.into()))
    }

    pub fn arm(self, arm: impl Into<String>) -> Self {
        self.with(OptionKey::Arm, OptionValue::Text(arm.into()))
    }

    pub fn report_id(self, id: u64) -> Self {
        self.with(OptionKey::ReportId, OptionValue::Integer(id))
    }

    pub fn return_metadata_only(self, enabled: bool) -> Self {
        self.with(OptionKey::ReturnMetadataOnly, OptionValue::Flag(enabled))
    }

    pub fn export_files(self, enabled: bool) -> Self {
        self.with(OptionKey::ExportFiles, OptionValue::Flag(enabled))
    }

    pub fn all_records(self, enabled: bool) -> Self {
        self.with(OptionKey::AllRecords, OptionValue::Flag(enabled))
    }

    /// Project XML (ODM) used as the template when creating a project.
    pub fn odm(self, document: impl Into<String>) -> Self {
        self.with(OptionKey::Odm, OptionValue::Text(document.into()))
    }

    pub fn log_type(self, log_type: LogType) -> Self {
        self.with(OptionKey::LogType, OptionValue::Token(log_type.wire_token()))
    }

    pub fn user(self, user: impl Into<String>) -> Self {
        self.with(OptionKey::User, OptionValue::Text(user.into()))
    }

    pub fn dag(self, dag: impl Into<String>) -> Self {
        self.with(OptionKey::Dag, OptionValue::Text(dag.into()))
    }

    pub fn begin_time(self, at: NaiveDateTime) -> Self {
        self.with(OptionKey::BeginTime, OptionValue::Timestamp(at))
    }

    pub fn end_time(self, at: NaiveDateTime) -> Self {
        self.with(OptionKey::EndTime, OptionValue::Timestamp(at))
    }
}

fn parse_value(key: OptionKey, raw: &str) -> Result<OptionValue, InvalidConfiguration> {
    let name = key.wire_token();
    match key.value_kind() {
        ValueKind::Flag => match raw {
            "true" => Ok(OptionValue::Flag(true)),
            "false" => Ok(OptionValue::Flag(false)),
            _ => Err(InvalidConfiguration::new(name, raw, ["true", "false"])),
        },
        ValueKind::Integer => raw
            .parse::<u64>()
            .map(OptionValue::Integer)
            .map_err(|_| InvalidConfiguration::new(name, raw, ["a non-negative integer"])),
        ValueKind::Timestamp(layout) => NaiveDateTime::parse_from_str(raw, layout)
            .map(OptionValue::Timestamp)
            .map_err(|_| InvalidConfiguration::new(name, raw, [layout])),
        ValueKind::List => {
            let items: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect();
            if items.is_empty() {
                return Err(InvalidConfiguration::new(name, raw, ["a comma-separated list"]));
            }
            Ok(OptionValue::List(items))
        }
        ValueKind::Text => {
            if raw.is_empty() {
                return Err(InvalidConfiguration::new(name, raw, ["a non-empty value"]));
            }
            Ok(OptionValue::Text(raw.to_string()))
        }
        ValueKind::Token(legal) => {
            let tokens = legal();
            tokens
                .iter()
                .copied()
                .find(|token| *token == raw)
                .map(OptionValue::Token)
                .ok_or_else(|| InvalidConfiguration::new(name, raw, tokens))
        }
    }
}
