//! Error types for knctl-kube

use thiserror::Error;

/// Result type for knctl-kube operations
pub type Result<T> = std::result::Result<T, KubeError>;

/// Errors surfaced by gateways and the service lifecycle coordinator
///
/// Orchestrator failures are classified once, at the gateway boundary, so
/// callers can match on the variant instead of inspecting status codes.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KubeError {
    /// Object does not exist
    #[error("{kind} '{name}' not found")]
    NotFound { kind: String, name: String },

    /// Object with the same name already exists
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: String, name: String },

    /// Optimistic concurrency check failed
    #[error("conflict while modifying {kind} '{name}': {message}")]
    Conflict {
        kind: String,
        name: String,
        message: String,
    },

    /// Rejected by server-side validation
    #[error("invalid value for {field}: {detail}")]
    Invalid { field: String, detail: String },

    /// Credentials missing or insufficient
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// Temporary failure, worth retrying
    #[error("temporary failure: {message}")]
    Transient { message: String },

    /// An operation did not finish in time
    #[error("timeout: {operation} did not complete within {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// Invalid flags or flag values
    #[error("{message}")]
    UserInput { message: String },

    /// The Ready condition resolved to False
    #[error("{name} failed to become ready: {reason}: {message}")]
    ReadinessFailed {
        name: String,
        reason: String,
        message: String,
    },

    /// The serving API is not installed on the cluster
    #[error("Knative serving is not available: {message}\nHint: check that Knative Serving is installed and the kubeconfig points at the right cluster")]
    PlatformUnavailable { message: String },

    /// A bounded conflict retry loop gave up
    #[error("{operation} of '{name}' failed after {attempts} attempts because of conflicting updates")]
    RetriesExhausted {
        operation: String,
        name: String,
        attempts: u32,
    },

    /// Object is already being deleted
    #[error("{kind} '{name}' is being deleted and cannot be modified")]
    Terminating { kind: String, name: String },

    /// The backend cannot perform this operation
    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        operation: String,
        backend: &'static str,
    },

    /// Unclassified orchestrator client error
    #[error("Kubernetes API error: {0}")]
    Api(#[source] kube::Error),

    /// Core (non-input) error
    #[error(transparent)]
    Core(knctl_core::CoreError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for KubeError {
    fn from(e: serde_json::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for KubeError {
    fn from(e: serde_yaml::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl From<knctl_core::CoreError> for KubeError {
    fn from(e: knctl_core::CoreError) -> Self {
        if e.is_user_input() {
            KubeError::UserInput {
                message: e.to_string(),
            }
        } else {
            KubeError::Core(e)
        }
    }
}

impl From<kube::Error> for KubeError {
    fn from(e: kube::Error) -> Self {
        KubeError::classify(e, "object", "")
    }
}

impl KubeError {
    /// Classify an orchestrator error for an object of `kind` named `name`
    pub fn classify(err: kube::Error, kind: &str, name: &str) -> Self {
        if matches!(err, kube::Error::HyperError(_) | kube::Error::Service(_)) {
            return KubeError::Transient {
                message: err.to_string(),
            };
        }
        let resp = match err {
            kube::Error::Api(resp) => resp,
            kube::Error::Auth(e) => {
                return KubeError::Unauthorized {
                    message: e.to_string(),
                };
            }
            other => return KubeError::Api(other),
        };

        match resp.code {
            404 => KubeError::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            409 if resp.reason == "AlreadyExists" => KubeError::AlreadyExists {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            409 => KubeError::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
                message: resp.message,
            },
            400 | 422 => {
                let (field, detail) = split_invalid_message(&resp.message);
                KubeError::Invalid { field, detail }
            }
            401 | 403 => KubeError::Unauthorized {
                message: resp.message,
            },
            429 | 500 | 502 | 503 | 504 => KubeError::Transient {
                message: resp.message,
            },
            _ => KubeError::Api(kube::Error::Api(resp)),
        }
    }

    /// Check if this is a Not Found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, KubeError::NotFound { .. })
    }

    /// Check if this is a conflict error
    pub fn is_conflict(&self) -> bool {
        matches!(self, KubeError::Conflict { .. })
    }

    /// Check if this is a transient error
    pub fn is_transient(&self) -> bool {
        matches!(self, KubeError::Transient { .. })
    }

    /// Check if this error was caused by user input
    pub fn is_user_input(&self) -> bool {
        matches!(self, KubeError::UserInput { .. })
    }

    pub(crate) fn not_found(kind: &str, name: &str) -> Self {
        KubeError::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }
}

/// Split `Kind "name" is invalid: spec.field: detail` into field and detail
fn split_invalid_message(message: &str) -> (String, String) {
    let tail = message
        .split_once("is invalid: ")
        .map(|(_, tail)| tail)
        .unwrap_or(message);
    match tail.split_once(": ") {
        Some((field, detail)) if !field.contains(' ') => (field.to_string(), detail.to_string()),
        _ => (String::new(), tail.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str, message: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: message.to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_classify_by_status_code() {
        assert!(KubeError::classify(api_error(404, "NotFound", ""), "service", "foo").is_not_found());
        assert!(KubeError::classify(api_error(409, "Conflict", ""), "service", "foo").is_conflict());
        assert!(matches!(
            KubeError::classify(api_error(409, "AlreadyExists", ""), "service", "foo"),
            KubeError::AlreadyExists { .. }
        ));
        assert!(KubeError::classify(api_error(503, "ServiceUnavailable", ""), "service", "foo")
            .is_transient());
        assert!(matches!(
            KubeError::classify(api_error(403, "Forbidden", "no"), "service", "foo"),
            KubeError::Unauthorized { .. }
        ));
        assert!(matches!(
            KubeError::classify(api_error(418, "Teapot", ""), "service", "foo"),
            KubeError::Api(_)
        ));
    }

    #[test]
    fn test_classify_invalid_extracts_field() {
        let err = KubeError::classify(
            api_error(
                422,
                "Invalid",
                "Service.serving.knative.dev \"foo\" is invalid: spec.template.spec.containers[0].image: Required value",
            ),
            "service",
            "foo",
        );
        match err {
            KubeError::Invalid { field, detail } => {
                assert_eq!(field, "spec.template.spec.containers[0].image");
                assert_eq!(detail, "Required value");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_core_user_input_maps_to_user_input() {
        let err: KubeError = knctl_core::CoreError::user_input("bad flag").into();
        assert!(err.is_user_input());
        assert_eq!(err.to_string(), "bad flag");
    }

    #[test]
    fn test_retries_exhausted_mentions_count() {
        let err = KubeError::RetriesExhausted {
            operation: "update".into(),
            name: "foo".into(),
            attempts: 3,
        };
        assert!(err.to_string().contains("3 attempts"));
    }
}
