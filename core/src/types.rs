//! Configuration model: every closed enumeration the remote API accepts.
//!
//! # Design
//! Each enumeration is declared once through `wire_enum!`, which generates
//! both directions of the logical-value ↔ wire-token mapping from the same
//! list. That list is the single source of truth for wire compatibility:
//! `wire_token` and `from_token` can never disagree, and a token outside the
//! list is rejected rather than coerced (`"01"` is not `"1"`, `"JSON"` is not
//! `"json"`).

use std::fmt;

use crate::error::InvalidConfiguration;

/// Declare a closed enumeration together with its wire tokens.
///
/// The generated type gets `ALL`, `wire_token`, `from_token`, `legal_tokens`,
/// `Display` (the wire token) and a validating `FromStr`.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident as $option:literal {
            $(
                $(#[$vmeta:meta])*
                $variant:ident => $token:literal
            ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        $vis enum $name {
            $(
                $(#[$vmeta])*
                $variant
            ),+
        }

        impl $name {
            /// Every value, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Option name used when a token for this enumeration is rejected.
            pub const OPTION_NAME: &'static str = $option;

            /// The literal sent on the wire for this value.
            pub fn wire_token(self) -> &'static str {
                match self {
                    $($name::$variant => $token),+
                }
            }

            /// Inverse of [`Self::wire_token`]. Exact, case-sensitive match.
            pub fn from_token(token: &str) -> Option<Self> {
                Self::ALL.iter().copied().find(|value| value.wire_token() == token)
            }

            pub fn legal_tokens() -> Vec<&'static str> {
                Self::ALL.iter().map(|value| value.wire_token()).collect()
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.wire_token())
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = $crate::error::InvalidConfiguration;

            fn from_str(token: &str) -> Result<Self, Self::Err> {
                Self::from_token(token).ok_or_else(|| {
                    $crate::error::InvalidConfiguration::new($option, token, Self::legal_tokens())
                })
            }
        }
    };
}

pub(crate) use wire_enum;

wire_enum! {
    /// The logical entity an operation targets (`content` on the wire).
    pub enum ResourceKind as "content" {
        Arm => "arm",
        Dag => "dag",
        UserDagMapping => "userDagMapping",
        Event => "event",
        FieldNames => "exportFieldNames",
        File => "file",
        FormEventMapping => "formEventMapping",
        NextRecordName => "generateNextRecordName",
        Instrument => "instrument",
        InstrumentPdf => "pdf",
        Log => "log",
        Metadata => "metadata",
        ParticipantList => "participantList",
        Project => "project",
        ProjectSettings => "project_settings",
        ProjectXml => "project_xml",
        Record => "record",
        RepeatingFormsEvents => "repeatingFormsEvents",
        Report => "report",
        SurveyLink => "surveyLink",
        SurveyQueueLink => "surveyQueueLink",
        SurveyReturnCode => "surveyReturnCode",
        User => "user",
        UserRole => "userRole",
        UserRoleMapping => "userRoleMapping",
        Version => "version",
    }
}

wire_enum! {
    pub enum Action as "action" {
        Export => "export",
        Import => "import",
        Delete => "delete",
    }
}

wire_enum! {
    /// Response (and, for imports, input) format. `Odm` is the XML-based
    /// interchange format, legal only for project archive operations.
    pub enum ReturnFormat as "format" {
        Json => "json",
        Csv => "csv",
        Xml => "xml",
        Odm => "odm",
    }
}

impl ReturnFormat {
    /// Value for the `Accept` header when this format is requested.
    pub fn media_type(self) -> &'static str {
        match self {
            ReturnFormat::Json => "application/json",
            ReturnFormat::Csv => "text/csv",
            ReturnFormat::Xml | ReturnFormat::Odm => "text/xml",
        }
    }

    /// Formats an error envelope can be requested in (`returnFormat`).
    pub fn is_error_format(self) -> bool {
        !matches!(self, ReturnFormat::Odm)
    }
}

wire_enum! {
    /// Flat (one row per record) or entity-attribute-value (one row per
    /// data point).
    pub enum DataShape as "type" {
        Flat => "flat",
        Eav => "eav",
    }
}

wire_enum! {
    pub enum RawOrLabel as "rawOrLabel" {
        Raw => "raw",
        Label => "label",
    }
}

wire_enum! {
    pub enum RawOrLabelHeaders as "rawOrLabelHeaders" {
        Raw => "raw",
        Label => "label",
    }
}

wire_enum! {
    /// Whether blank values in an import overwrite stored values.
    pub enum OverwriteBehavior as "overwriteBehavior" {
        Normal => "normal",
        Overwrite => "overwrite",
    }
}

wire_enum! {
    pub enum ReturnContent as "returnContent" {
        Count => "count",
        Ids => "ids",
        AutoIds => "auto_ids",
        Nothing => "nothing",
    }
}

wire_enum! {
    pub enum DateFormat as "dateFormat" {
        Mdy => "MDY",
        Dmy => "DMY",
        Ymd => "YMD",
    }
}

wire_enum! {
    pub enum CsvDelimiter as "csvDelimiter" {
        Comma => ",",
        Tab => "tab",
        Semicolon => ";",
        Pipe => "|",
        Caret => "^",
    }
}

impl CsvDelimiter {
    /// The character actually written between csv cells.
    pub fn as_char(self) -> char {
        match self {
            CsvDelimiter::Comma => ',',
            CsvDelimiter::Tab => '\t',
            CsvDelimiter::Semicolon => ';',
            CsvDelimiter::Pipe => '|',
            CsvDelimiter::Caret => '^',
        }
    }
}

wire_enum! {
    pub enum DecimalCharacter as "decimalCharacter" {
        Comma => ",",
        Period => ".",
    }
}

wire_enum! {
    /// Arm/event import mode. `Override` deletes everything not present in
    /// the payload; `Merge` only adds and renames.
    pub enum OverrideMode as "override" {
        Merge => "0",
        Override => "1",
    }
}

wire_enum! {
    pub enum LogType as "logtype" {
        Export => "export",
        Manage => "manage",
        User => "user",
        Record => "record",
        RecordAdd => "record_add",
        RecordEdit => "record_edit",
        RecordDelete => "record_delete",
        LockRecord => "lock_record",
        PageView => "page_view",
    }
}

/// API token sent as the `token` field on every request.
///
/// Supplied by the caller per call; the engine never caches or mutates it.
/// `Debug` is redacted so tokens cannot leak through logging.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiToken(String);

impl ApiToken {
    pub fn new(token: impl Into<String>) -> Result<Self, InvalidConfiguration> {
        let token = token.into();
        if token.is_empty() || token.chars().any(char::is_whitespace) {
            return Err(InvalidConfiguration::new(
                "token",
                "<redacted>",
                vec!["a non-empty token without whitespace".to_string()],
            ));
        }
        Ok(Self(token))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiToken(<redacted>)")
    }
}
