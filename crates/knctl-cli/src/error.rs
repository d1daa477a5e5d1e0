//! CLI error types with exit code handling
//!
//! Library errors are folded into a [`CliError`] so every failure is printed
//! as a single diagnostic naming the object and the problem.

use knctl_core::CoreError;
use knctl_kube::KubeError;
use miette::Diagnostic;
use thiserror::Error;

use crate::exit_codes;

/// CLI-specific error type
#[derive(Error, Debug, Diagnostic)]
pub enum CliError {
    /// Invalid flag values or combinations, detected before any request
    #[error("{message}")]
    #[diagnostic(code(knctl::cli::input))]
    Input {
        message: String,
        #[help]
        help: Option<String>,
    },

    /// The backend rejected or failed the operation
    #[error("{message}")]
    #[diagnostic(code(knctl::cli::backend))]
    Backend {
        message: String,
        #[help]
        help: Option<String>,
    },

    /// Configuration file could not be loaded
    #[error("Configuration error: {message}")]
    #[diagnostic(code(knctl::cli::config))]
    Config { message: String },

    /// IO error (file not found, permissions, etc.)
    #[error("IO error: {message}")]
    #[diagnostic(code(knctl::cli::io))]
    Io { message: String },

    /// Wrapped error for passthrough (stores the formatted message)
    #[error("{message}")]
    #[diagnostic(code(knctl::cli::error))]
    Other { message: String },
}

impl CliError {
    /// Exit code for this error
    pub fn exit_code(&self) -> i32 {
        exit_codes::ERROR
    }

    /// Create an input error
    pub fn input(message: impl Into<String>) -> Self {
        Self::Input {
            message: message.into(),
            help: None,
        }
    }

    /// Create an input error with help text
    pub fn input_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Input {
            message: message.into(),
            help: Some(help.into()),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

impl From<KubeError> for CliError {
    fn from(err: KubeError) -> Self {
        let message = err.to_string();
        if err.is_user_input() {
            return CliError::Input {
                message,
                help: Some("Run with --help to see the accepted flag syntax".to_string()),
            };
        }
        let help = match &err {
            KubeError::AlreadyExists { .. } => {
                Some("Use --force to replace the existing service".to_string())
            }
            KubeError::RetriesExhausted { .. } => {
                Some("Another client keeps modifying the object; try again".to_string())
            }
            KubeError::Unsupported { .. } => {
                Some("Drop --target to run against the cluster".to_string())
            }
            KubeError::Unauthorized { .. } => {
                Some("Check the credentials of the selected kubeconfig context".to_string())
            }
            _ => None,
        };
        CliError::Backend { message, help }
    }
}

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        if err.is_user_input() {
            CliError::input(err.to_string())
        } else {
            CliError::Other {
                message: err.to_string(),
            }
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        CliError::Io {
            message: err.to_string(),
        }
    }
}

impl From<miette::Report> for CliError {
    fn from(err: miette::Report) -> Self {
        CliError::Other {
            message: format!("{:?}", err),
        }
    }
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
