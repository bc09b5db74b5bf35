//! CLI Exit Codes
//!
//! Standard exit codes for CLI operations and automation.

use crate::config::ConfigError;
use crate::core::transaction::{FailureKind, TransactionError};
use crate::core::transport::TransportError;
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Slave did not answer
    pub const NO_RESPONSE: u8 = 3;

    /// Response failed validation
    pub const MALFORMED_RESPONSE: u8 = 4;

    /// Transmission not confirmed
    pub const TRANSMIT_TIMEOUT: u8 = 5;

    /// Overall deadline exceeded
    pub const DEADLINE_EXCEEDED: u8 = 6;

    /// Permission denied
    pub const PERMISSION_DENIED: u8 = 7;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 8;

    /// Line or adapter failure
    pub const TRANSPORT_ERROR: u8 = 9;

    /// User cancelled
    pub const CANCELLED: u8 = 11;

    /// Port not found
    pub const PORT_NOT_FOUND: u8 = 14;

    /// Internal error
    pub const INTERNAL_ERROR: u8 = 127;

    /// Exit code for a failure category
    pub fn for_failure(kind: FailureKind) -> u8 {
        match kind {
            FailureKind::Configuration => Self::CONFIG_ERROR,
            FailureKind::InvalidRequest => Self::INVALID_ARGS,
            FailureKind::TransmitTimeout => Self::TRANSMIT_TIMEOUT,
            FailureKind::NoResponse => Self::NO_RESPONSE,
            FailureKind::MalformedResponse => Self::MALFORMED_RESPONSE,
            FailureKind::Cancelled => Self::CANCELLED,
            FailureKind::DeadlineExceeded => Self::DEADLINE_EXCEEDED,
            FailureKind::Transport => Self::TRANSPORT_ERROR,
        }
    }

    /// Exit code for a transport error
    pub fn for_transport(err: &TransportError) -> u8 {
        match err {
            TransportError::Configuration(_) => Self::CONFIG_ERROR,
            TransportError::PortNotFound(_) => Self::PORT_NOT_FOUND,
            TransportError::PermissionDenied(_) => Self::PERMISSION_DENIED,
            TransportError::TransmitTimeout(_) => Self::TRANSMIT_TIMEOUT,
            TransportError::Io(_) | TransportError::Disconnected => Self::TRANSPORT_ERROR,
        }
    }
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success
    Success,

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    pub fn success() -> Self {
        Self::Success
    }

    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Error(_, msg) => Some(msg),
            Self::Success => None,
        }
    }

    /// Convert to ExitCode
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl From<&TransactionError> for CliResult {
    fn from(err: &TransactionError) -> Self {
        let code = match err {
            TransactionError::Transport(inner) => ExitCodes::for_transport(inner),
            other => ExitCodes::for_failure(other.kind()),
        };
        Self::Error(code, err.to_string())
    }
}

impl From<TransactionError> for CliResult {
    fn from(err: TransactionError) -> Self {
        Self::from(&err)
    }
}

impl From<TransportError> for CliResult {
    fn from(err: TransportError) -> Self {
        Self::Error(ExitCodes::for_transport(&err), err.to_string())
    }
}

impl From<ConfigError> for CliResult {
    fn from(err: ConfigError) -> Self {
        Self::Error(ExitCodes::CONFIG_ERROR, err.to_string())
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "General error",
        2 => "Invalid arguments",
        3 => "No response",
        4 => "Malformed response",
        5 => "Transmit timeout",
        6 => "Deadline exceeded",
        7 => "Permission denied",
        8 => "Configuration error",
        9 => "Transport error",
        11 => "Operation cancelled",
        14 => "Port not found",
        127 => "Internal error",
        _ => "Unknown error",
    }
}

/// Print exit code table
pub fn print_exit_codes() {
    println!("Exit Codes:");
    for code in [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 11, 14, 127] {
        println!("  {:>3}  {}", code, exit_code_description(code));
    }
}
