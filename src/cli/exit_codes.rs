//! CLI Exit Codes
//!
//! Stable exit codes for scripted use of `sensorlink-cli`.

use crate::config::ConfigError;
use crate::core::session::SessionError;
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

    /// Connection failed
    pub const CONNECTION_FAILED: u8 = 3;

    /// Timeout
    pub const TIMEOUT: u8 = 4;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 8;

    /// Device not found
    pub const DEVICE_NOT_FOUND: u8 = 12;

    /// Device busy
    pub const DEVICE_BUSY: u8 = 13;
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    /// Plain success
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Failure with an explicit code
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) => Some(msg),
            Self::Error(_, msg) => Some(msg),
            _ => None,
        }
    }

    /// Convert to ExitCode
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Exit code for a transport failure
pub fn transport_exit_code(err: &TransportError) -> u8 {
    match err {
        TransportError::DeviceNotFound(_) | TransportError::AdapterNotFound => {
            ExitCodes::DEVICE_NOT_FOUND
        }
        TransportError::ConnectionFailed(_)
        | TransportError::CharacteristicNotFound(_)
        | TransportError::NotReady
        | TransportError::NotInitialized => ExitCodes::CONNECTION_FAILED,
        TransportError::Timeout(_) => ExitCodes::TIMEOUT,
        TransportError::InvalidConfiguration(_) => ExitCodes::CONFIG_ERROR,
        TransportError::SendFailed(_) => ExitCodes::ERROR,
    }
}

/// Exit code for a session failure
pub fn session_exit_code(err: &SessionError) -> u8 {
    match err {
        SessionError::Busy => ExitCodes::DEVICE_BUSY,
        SessionError::Transport(e) => transport_exit_code(e),
        SessionError::NoTransportBound | SessionError::NotOpen => ExitCodes::CONNECTION_FAILED,
        SessionError::AlreadyOpen | SessionError::State(_) => ExitCodes::ERROR,
    }
}

/// Exit code for any error chain produced by the CLI
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<SessionError>() {
            return session_exit_code(e);
        }
        if let Some(e) = cause.downcast_ref::<TransportError>() {
            return transport_exit_code(e);
        }
        if cause.downcast_ref::<ConfigError>().is_some() {
            return ExitCodes::CONFIG_ERROR;
        }
    }
    ExitCodes::ERROR
}

impl From<anyhow::Error> for CliResult {
    fn from(err: anyhow::Error) -> Self {
        Self::Error(exit_code_for(&err), format!("{:#}", err))
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "General error",
        2 => "Invalid arguments",
        3 => "Connection failed",
        4 => "Timeout",
        8 => "Configuration error",
        12 => "Device not found",
        13 => "Device busy",
        _ => "Unknown error",
    }
}
