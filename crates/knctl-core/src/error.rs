//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    /// A flag value or flag combination the user supplied cannot be used
    #[error("{message}")]
    UserInput { message: String },

    #[error("Invalid traffic instruction: {0}")]
    Traffic(#[from] crate::traffic::TrafficError),

    #[error("Invalid quantity '{value}' for {flag}")]
    InvalidQuantity { flag: String, value: String },

    #[error("Invalid export document: {message}")]
    InvalidExport { message: String },

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Missing required field: {field}")]
    MissingField { field: String },
}

impl CoreError {
    /// Create a user input error
    pub fn user_input(message: impl Into<String>) -> Self {
        Self::UserInput {
            message: message.into(),
        }
    }

    /// Whether this error was caused by user input (detected before any RPC)
    pub fn is_user_input(&self) -> bool {
        matches!(
            self,
            CoreError::UserInput { .. }
                | CoreError::Traffic(_)
                | CoreError::InvalidQuantity { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
