//! Error kinds observed by the worker core.

use std::io;
use std::result;

/// Reasons a request fails to parse, reported back to the controller
/// with the offending parameter name and value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseErrKind {
    WrongFormat,
    UnknownCmd,
    NoParam,
    InvalidType,
    InvalidValue,
}

/// Detailed parse failure carrying a short message (usually the parameter
/// name) and the offending value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseErr {
    pub kind: ParseErrKind,
    pub msg: String,
    pub details: String,
}

impl ParseErr {
    pub fn new(kind: ParseErrKind, msg: &str, details: &str) -> Self {
        ParseErr {
            kind,
            msg: msg.into(),
            details: details.into(),
        }
    }

    pub fn invalid_value(name: &str, value: &str) -> Self {
        Self::new(ParseErrKind::InvalidValue, name, value)
    }

    /// Render the message the controller sees in `error_details`.
    pub fn message(&self) -> String {
        match self.kind {
            ParseErrKind::WrongFormat => "Wrong message format".into(),
            ParseErrKind::UnknownCmd => format!("Unknown command({})", self.details),
            ParseErrKind::NoParam => {
                format!("No or insufficient number of params ({})", self.msg)
            }
            ParseErrKind::InvalidType => format!("Invalid value type ({})", self.msg),
            ParseErrKind::InvalidValue => format!("Invalid value ({})", self.msg),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{}", .0.message())]
    Parse(ParseErr),

    #[error("component name '{0}' is already used")]
    DuplicateName(String),

    #[error("unknown component '{0}'")]
    NameNotFound(String),

    #[error("port {0} is already in use")]
    PortBusy(String),

    #[error("no space of port ability on {0}")]
    PortAbilityFull(String),

    #[error("cannot assign component over the maximum number")]
    CompCountOverflow,

    #[error("cannot assign port over the maximum number")]
    PortCountOverflow,

    #[error("lcore {0} is not available")]
    LcoreUnavailable(u32),

    #[error("port {0} does not exist")]
    PortNotFound(String),

    #[error("failed to create PMD for {0}")]
    PmdCreateFailed(String),

    #[error("mempool '{0}' exhausted")]
    MempoolAllocFailed(String),

    #[error("status check timed out waiting for {0}")]
    StatusWaitTimeout(&'static str),

    #[error("classifier table conflict on {0}")]
    ClsTableConflict(String),

    #[error("invalid MAC address '{0}'")]
    BadMacAddr(String),

    #[error("LZ4 compression error: {0}")]
    Lz4(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<ParseErr> for Error {
    fn from(err: ParseErr) -> Self {
        Error::Parse(err)
    }
}

pub type Result<T> = result::Result<T, Error>;
