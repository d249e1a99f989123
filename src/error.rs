//! Error types for the pump protocol engine.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::address::PumpAddress;
use crate::frame::{AlarmKind, ErrorCode, Prompt};

/// Every failure the engine can report.
#[derive(Debug, Error)]
pub enum PumpError {
    /// Pump index outside `0..=99`.
    #[error("pump address {0} is outside 0..=99")]
    InvalidAddress(i64),

    /// A command argument was missing, out of range or of the wrong type.
    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument { name: String, reason: String },

    /// The command name is not in the catalogue.
    #[error("unknown command `{0}`")]
    UnknownCommand(String),

    /// The response could not be parsed for the issued command.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The pump answered with a status the engine does not know.
    #[error("unrecognised pump status {raw:?}")]
    UnknownStatus { raw: String },

    /// No terminator arrived before the deadline.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The serial line failed; the session stays unusable until reopened.
    #[error("transport failure: {0}")]
    TransportFailure(#[source] std::io::Error),

    /// The pump reported an alarm condition.
    #[error("pump {address} alarm: {alarm}")]
    PumpAlarm {
        address: PumpAddress,
        alarm: AlarmKind,
    },

    /// The pump refused the command (`?`, `?NA`, `?OOR`, ...).
    #[error("pump {address} rejected command: {code}")]
    CommandRejected {
        address: PumpAddress,
        code: ErrorCode,
    },

    /// A wait condition was not met within its step timeout.
    #[error("pump {address} did not reach {expected:?} within {waited:?}")]
    ReadyTimeout {
        address: PumpAddress,
        expected: Vec<Prompt>,
        waited: Duration,
    },

    /// The program was cancelled between steps.
    #[error("program cancelled")]
    Cancelled,

    /// A program step failed; later steps were not sent.
    #[error("program halted at step {step}: {source}")]
    ProgramHalted {
        step: usize,
        address: Option<PumpAddress>,
        #[source]
        source: Box<PumpError>,
    },

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("invalid program document: {0}")]
    Document(#[from] serde_json::Error),

    #[error("cannot read {path:?}: {source}")]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PumpError {
    pub(crate) fn invalid_argument(name: &str, reason: impl Into<String>) -> Self {
        PumpError::InvalidArgument {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        PumpError::MalformedFrame(reason.into())
    }
}

/// Result type alias using PumpError.
pub type Result<T> = std::result::Result<T, PumpError>;
