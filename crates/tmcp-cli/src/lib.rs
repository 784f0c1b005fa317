//! TMCP CLI - operator tool for the trust transport bridge
//!
//! This crate provides a command-line interface for:
//! - Creating, listing and retiring local identities
//! - Resolving peer DIDs through the registry
//! - Running an in-process client/server demo session

pub mod cli;
pub mod config;
pub mod demo;
pub mod identity;
pub mod output;

pub use cli::Cli;
pub use config::{CliOverrides, Config};
pub use output::{JsonResponse, OutputFormat, OutputFormatter, SuccessMessage};

use tmcp_core::{BridgeError, ErrorCategory, SessionFailure};

/// Exit codes for CLI operations
///
/// Exit codes provide machine-readable status for scripting and automation:
/// - 0: Success - operation completed successfully
/// - 1: General error - unspecified error occurred
/// - 2: Authentication failed - a peer failed verification
/// - 3: Timeout - operation timed out
/// - 4: Connection failed - peer could not be resolved or reached
/// - 5: Invalid input - bad arguments or data provided
/// - 6: Cancelled - interrupted before completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Operation completed successfully (exit code 0)
    Success = 0,
    /// General error (exit code 1)
    GeneralError = 1,
    /// Authentication failed (exit code 2)
    AuthenticationFailed = 2,
    /// Operation timed out (exit code 3)
    Timeout = 3,
    /// Connection failed (exit code 4)
    ConnectionFailed = 4,
    /// Invalid input provided (exit code 5)
    InvalidInput = 5,
    /// Interrupted (exit code 6)
    Cancelled = 6,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl From<ErrorCategory> for ExitCode {
    fn from(category: ErrorCategory) -> Self {
        match category {
            ErrorCategory::PeerUnreachable => ExitCode::ConnectionFailed,
            ErrorCategory::SecurityViolation => ExitCode::AuthenticationFailed,
            ErrorCategory::Timeout => ExitCode::Timeout,
            ErrorCategory::Local => ExitCode::GeneralError,
        }
    }
}

impl ExitCode {
    /// Convert to process exit code
    pub fn to_exit_code(self) -> std::process::ExitCode {
        std::process::ExitCode::from(self as u8)
    }

    /// Exit code for an error returned by a command.
    ///
    /// Bridge errors map through their category; anything else is a
    /// general error.
    pub fn for_error(error: &anyhow::Error) -> Self {
        let bridge = error
            .downcast_ref::<SessionFailure>()
            .map(|f| &f.error)
            .or_else(|| error.downcast_ref::<BridgeError>());
        match bridge {
            Some(BridgeError::Cancelled) => ExitCode::Cancelled,
            Some(e) => e.category().into(),
            None => ExitCode::GeneralError,
        }
    }

    /// Get the exit code name as a string
    pub fn name(&self) -> &'static str {
        match self {
            ExitCode::Success => "SUCCESS",
            ExitCode::GeneralError => "GENERAL_ERROR",
            ExitCode::AuthenticationFailed => "AUTH_FAILED",
            ExitCode::Timeout => "TIMEOUT",
            ExitCode::ConnectionFailed => "CONNECTION_FAILED",
            ExitCode::InvalidInput => "INVALID_INPUT",
            ExitCode::Cancelled => "CANCELLED",
        }
    }

    /// Get a human-readable description of the exit code
    pub fn description(&self) -> &'static str {
        match self {
            ExitCode::Success => "Operation completed successfully",
            ExitCode::GeneralError => "An unspecified error occurred",
            ExitCode::AuthenticationFailed => "A peer failed authentication or verification",
            ExitCode::Timeout => "Operation timed out",
            ExitCode::ConnectionFailed => "Peer could not be resolved or reached",
            ExitCode::InvalidInput => "Invalid arguments or data provided",
            ExitCode::Cancelled => "Interrupted before completion",
        }
    }
}
