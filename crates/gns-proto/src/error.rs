//! Structured error model.
//!
//! Every tool failure is reported as an [`ErrorEnvelope`] with a stable
//! machine-readable code. Codes are the primary branch point for callers;
//! the human-readable `error` text may change between releases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ─── Error codes ──────────────────────────────────────────────────────────────

/// Coarse classification of an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    NotFound,
    Validation,
    Connection,
    Authentication,
    Internal,
}

/// The closed set of stable error codes.
///
/// Adding a code is a compatible change; renaming or removing one is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Not found
    ProjectNotFound,
    NodeNotFound,
    LinkNotFound,
    TemplateNotFound,
    SnapshotNotFound,
    DrawingNotFound,
    SessionNotFound,
    JobNotFound,
    FileNotFound,
    // Validation
    MissingParameter,
    InvalidParameter,
    InvalidAction,
    InvalidAdapter,
    InvalidPort,
    PortInUse,
    // Connection
    Gns3Unreachable,
    Gns3ApiError,
    ConsoleConnectionFailed,
    ConsoleDisconnected,
    SshConnectionFailed,
    SshDisconnected,
    SshProxyUnreachable,
    Timeout,
    // Authentication
    AuthenticationFailed,
    TokenExpired,
    // Internal
    InternalError,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 26] = [
        Self::ProjectNotFound,
        Self::NodeNotFound,
        Self::LinkNotFound,
        Self::TemplateNotFound,
        Self::SnapshotNotFound,
        Self::DrawingNotFound,
        Self::SessionNotFound,
        Self::JobNotFound,
        Self::FileNotFound,
        Self::MissingParameter,
        Self::InvalidParameter,
        Self::InvalidAction,
        Self::InvalidAdapter,
        Self::InvalidPort,
        Self::PortInUse,
        Self::Gns3Unreachable,
        Self::Gns3ApiError,
        Self::ConsoleConnectionFailed,
        Self::ConsoleDisconnected,
        Self::SshConnectionFailed,
        Self::SshDisconnected,
        Self::SshProxyUnreachable,
        Self::Timeout,
        Self::AuthenticationFailed,
        Self::TokenExpired,
        Self::InternalError,
    ];

    pub fn class(self) -> ErrorClass {
        match self {
            Self::ProjectNotFound
            | Self::NodeNotFound
            | Self::LinkNotFound
            | Self::TemplateNotFound
            | Self::SnapshotNotFound
            | Self::DrawingNotFound
            | Self::SessionNotFound
            | Self::JobNotFound
            | Self::FileNotFound => ErrorClass::NotFound,
            Self::MissingParameter
            | Self::InvalidParameter
            | Self::InvalidAction
            | Self::InvalidAdapter
            | Self::InvalidPort
            | Self::PortInUse => ErrorClass::Validation,
            Self::Gns3Unreachable
            | Self::Gns3ApiError
            | Self::ConsoleConnectionFailed
            | Self::ConsoleDisconnected
            | Self::SshConnectionFailed
            | Self::SshDisconnected
            | Self::SshProxyUnreachable
            | Self::Timeout => ErrorClass::Connection,
            Self::AuthenticationFailed | Self::TokenExpired => ErrorClass::Authentication,
            Self::InternalError => ErrorClass::Internal,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProjectNotFound => "PROJECT_NOT_FOUND",
            Self::NodeNotFound => "NODE_NOT_FOUND",
            Self::LinkNotFound => "LINK_NOT_FOUND",
            Self::TemplateNotFound => "TEMPLATE_NOT_FOUND",
            Self::SnapshotNotFound => "SNAPSHOT_NOT_FOUND",
            Self::DrawingNotFound => "DRAWING_NOT_FOUND",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::JobNotFound => "JOB_NOT_FOUND",
            Self::FileNotFound => "FILE_NOT_FOUND",
            Self::MissingParameter => "MISSING_PARAMETER",
            Self::InvalidParameter => "INVALID_PARAMETER",
            Self::InvalidAction => "INVALID_ACTION",
            Self::InvalidAdapter => "INVALID_ADAPTER",
            Self::InvalidPort => "INVALID_PORT",
            Self::PortInUse => "PORT_IN_USE",
            Self::Gns3Unreachable => "GNS3_UNREACHABLE",
            Self::Gns3ApiError => "GNS3_API_ERROR",
            Self::ConsoleConnectionFailed => "CONSOLE_CONNECTION_FAILED",
            Self::ConsoleDisconnected => "CONSOLE_DISCONNECTED",
            Self::SshConnectionFailed => "SSH_CONNECTION_FAILED",
            Self::SshDisconnected => "SSH_DISCONNECTED",
            Self::SshProxyUnreachable => "SSH_PROXY_UNREACHABLE",
            Self::Timeout => "TIMEOUT",
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Envelope ─────────────────────────────────────────────────────────────────

/// The error payload returned by every failing tool call.
///
/// `context` carries enough information to form the next action — lists of
/// valid alternatives, the failing batch index, connection coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: String,
    pub error_code: ErrorCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
    pub server_version: String,
    pub timestamp: DateTime<Utc>,
}

impl ErrorEnvelope {
    pub fn new(code: ErrorCode, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            error_code: code,
            details: None,
            suggested_action: None,
            context: None,
            server_version: crate::SERVER_VERSION.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_suggested_action(mut self, action: impl Into<String>) -> Self {
        self.suggested_action = Some(action.into());
        self
    }

    /// Add one key to the context map, creating it if absent.
    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            // Envelope fields are all serializable; this branch is unreachable
            // unless a context value is pathological.
            serde_json::json!({
                "error": self.error,
                "error_code": self.error_code.as_str(),
            })
        })
    }
}

impl std::fmt::Display for ErrorEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_code, self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_count_is_closed_at_26() {
        assert_eq!(ErrorCode::ALL.len(), 26);
    }

    #[test]
    fn test_every_code_has_a_class() {
        let mut classes = std::collections::HashSet::new();
        for code in ErrorCode::ALL {
            classes.insert(code.class());
        }
        // All five classes are populated.
        assert_eq!(classes.len(), 5);
    }

    #[test]
    fn test_code_serializes_screaming_snake() {
        let v = serde_json::to_value(ErrorCode::PortInUse).expect("serialize");
        assert_eq!(v, serde_json::json!("PORT_IN_USE"));
        assert_eq!(ErrorCode::Gns3Unreachable.as_str(), "GNS3_UNREACHABLE");
    }

    #[test]
    fn test_as_str_matches_serde_for_all_codes() {
        for code in ErrorCode::ALL {
            let v = serde_json::to_value(code).expect("serialize");
            assert_eq!(v, serde_json::json!(code.as_str()));
        }
    }

    #[test]
    fn test_envelope_required_fields() {
        let env = ErrorEnvelope::new(ErrorCode::NodeNotFound, "node 'R9' not found")
            .with_context("available_nodes", serde_json::json!(["R1", "R2"]));
        let v = env.to_value();
        assert_eq!(v["error_code"], "NODE_NOT_FOUND");
        assert!(v["error"].is_string());
        assert!(v["server_version"].is_string());
        assert!(v["timestamp"].is_string());
        assert_eq!(v["context"]["available_nodes"][0], "R1");
        // Optional fields are omitted, not null.
        assert!(v.get("details").is_none());
    }

    #[test]
    fn test_envelope_roundtrip() {
        let env = ErrorEnvelope::new(ErrorCode::Timeout, "pattern wait timed out")
            .with_details("waited 30s for '#'")
            .with_suggested_action("increase timeout or check the device prompt");
        let json = serde_json::to_string(&env).expect("serialize");
        let back: ErrorEnvelope = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.error_code, ErrorCode::Timeout);
        assert_eq!(back.details.as_deref(), Some("waited 30s for '#'"));
    }
}
