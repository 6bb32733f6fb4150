use std::fmt;

use crate::storage::StorageError;

/// VRM integration error type
///
/// Every operation of the integration reports one of these four classes.
/// `Auth` and `Network` read the same to a user but stay distinguishable in
/// logs; `Persistence` is the serious one, since it can leave a token that
/// exists on the portal but is not referenced locally.
#[derive(Debug)]
pub enum VrmError {
    /// Caller input rejected before any network call
    Validation(String),
    /// The portal reported a failure, or local credentials are missing
    Auth(String),
    /// Transport failure or a response that does not match the protocol
    Network(ApiError),
    /// The credential document could not be read or written
    Persistence(StorageError),
}

impl VrmError {
    /// Message suitable for a status event shown to the user
    pub fn user_message(&self) -> String {
        match self {
            VrmError::Validation(msg) | VrmError::Auth(msg) => msg.clone(),
            VrmError::Network(err) => err.to_string(),
            VrmError::Persistence(err) => format!("Unable to write secrets file: {}", err),
        }
    }

    /// True for failures reported by the portal or caused by missing credentials
    pub fn is_auth(&self) -> bool {
        matches!(self, VrmError::Auth(_))
    }
}

impl fmt::Display for VrmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VrmError::Validation(msg) => write!(f, "Validation failed: {}", msg),
            VrmError::Auth(msg) => write!(f, "Authentication failed: {}", msg),
            VrmError::Network(err) => write!(f, "API error: {}", err),
            VrmError::Persistence(err) => write!(f, "Persistence error: {}", err),
        }
    }
}

impl std::error::Error for VrmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VrmError::Network(err) => Some(err),
            VrmError::Persistence(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ApiError> for VrmError {
    fn from(err: ApiError) -> Self {
        VrmError::Network(err)
    }
}

impl From<StorageError> for VrmError {
    fn from(err: StorageError) -> Self {
        VrmError::Persistence(err)
    }
}

impl From<reqwest::Error> for VrmError {
    fn from(err: reqwest::Error) -> Self {
        VrmError::Network(ApiError::from(err))
    }
}

/// Transport-level errors
#[derive(Debug)]
pub enum ApiError {
    /// Network error (connection, timeout, TLS, etc.)
    Network(String),
    /// HTTP error status without a portal error payload
    Http { status: u16, message: String },
    /// Response body did not match the documented shape
    Parse(String),
    /// Request could not be built
    Request(String),
}

impl ApiError {
    /// Prefix the message with `context`, keeping the variant
    pub fn context(self, context: &str) -> Self {
        match self {
            ApiError::Network(msg) => ApiError::Network(format!("{}: {}", context, msg)),
            ApiError::Http { status, message } => ApiError::Http {
                status,
                message: format!("{}: {}", context, message),
            },
            ApiError::Parse(msg) => ApiError::Parse(format!("{}: {}", context, msg)),
            ApiError::Request(msg) => ApiError::Request(format!("{}: {}", context, msg)),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Network(msg) => write!(f, "Network error: {}", msg),
            ApiError::Http { status, message } => {
                write!(f, "HTTP {} error: {}", status, message)
            }
            ApiError::Parse(msg) => write!(f, "Parse error: {}", msg),
            ApiError::Request(msg) => write!(f, "Request error: {}", msg),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Network("Request timeout".to_string())
        } else if err.is_connect() {
            ApiError::Network(format!("Connection failed: {}", err))
        } else if err.is_builder() {
            ApiError::Request(err.to_string())
        } else if let Some(status) = err.status() {
            ApiError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            ApiError::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_passes_portal_detail_through() {
        let err = VrmError::Auth("Invalid credentials".to_string());
        assert_eq!(err.user_message(), "Invalid credentials");
        assert!(err.is_auth());
        assert_eq!(err.to_string(), "Authentication failed: Invalid credentials");
    }

    #[test]
    fn test_api_error_context_keeps_variant() {
        let err = ApiError::Network("Connection failed".to_string())
            .context("Broker token request failed");
        assert!(matches!(err, ApiError::Network(_)));
        assert_eq!(
            err.to_string(),
            "Network error: Broker token request failed: Connection failed"
        );
    }

    #[test]
    fn test_network_error_wraps_api_error() {
        let err: VrmError = ApiError::Http {
            status: 502,
            message: "Bad Gateway".to_string(),
        }
        .into();
        assert!(!err.is_auth());
        assert_eq!(err.user_message(), "HTTP 502 error: Bad Gateway");
    }

    #[test]
    fn test_persistence_error_mentions_secrets_file() {
        let err: VrmError = StorageError::Config("disk full".to_string()).into();
        assert!(err.user_message().contains("Unable to write secrets file"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
