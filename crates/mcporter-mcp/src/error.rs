//! Error types and failure classification.

use thiserror::Error;

/// Result type for MCP operations.
pub type McpResult<T> = Result<T, McpError>;

/// Errors that can occur during MCP operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// Server not found.
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// Tool not found.
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Server process failed.
    #[error("Server process error: {0}")]
    ProcessError(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Tool execution failed.
    #[error("Tool execution failed: {0}")]
    ToolError(String),

    /// Invalid server definition or placeholder.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// An operation ran past its deadline.
    #[error("Timed out after {after_ms}ms while {operation}")]
    Timeout { operation: String, after_ms: u64 },

    /// The interactive authorization wait ran past its deadline.
    #[error("OAuth authorization for '{server_name}' timed out after {timeout_ms}ms")]
    OAuthTimeout { server_name: String, timeout_ms: u64 },

    /// Authentication required.
    #[error("Authentication required")]
    AuthRequired,

    /// Authentication failed.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),
}

impl McpError {
    /// Create a connection failed error.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed(message.into())
    }

    /// Create a protocol error.
    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::ProtocolError(message.into())
    }

    /// Create a tool error.
    pub fn tool_error(message: impl Into<String>) -> Self {
        Self::ToolError(message.into())
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}

/// Coarse failure classification driving connect-retry, OAuth promotion, and
/// status rendering. `ErrorKind::of` is the only place that inspects error
/// strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The server demands authorization (HTTP 401).
    Auth,
    /// The server is unreachable.
    Offline,
    /// A non-401 HTTP status.
    Http(u16),
    /// Anything else.
    Other,
}

const OFFLINE_MARKERS: &[&str] = &[
    "ECONNREFUSED",
    "ENOTFOUND",
    "EAI_AGAIN",
    "fetch failed",
    "Connection refused",
    "tcp connect error",
    "dns error",
];

impl ErrorKind {
    /// Classify a runtime error.
    pub fn of(error: &McpError) -> Self {
        match error {
            McpError::AuthRequired => return Self::Auth,
            McpError::Http(e) => {
                if e.status().map(|s| s.as_u16()) == Some(401) {
                    return Self::Auth;
                }
                if e.is_connect() {
                    return Self::Offline;
                }
                if let Some(status) = e.status() {
                    return Self::Http(status.as_u16());
                }
            }
            _ => {}
        }
        Self::of_message(&error.to_string())
    }

    /// Classify from a raw message, applying the rules in order: auth,
    /// offline, extractable status, other.
    pub fn of_message(message: &str) -> Self {
        if message.contains("Non-200 status code (401)")
            || message.contains("HTTP 401")
            || message.contains("Unauthorized")
        {
            return Self::Auth;
        }
        if OFFLINE_MARKERS.iter().any(|m| message.contains(m)) {
            return Self::Offline;
        }
        if let Some(code) = extract_status_code(message) {
            if code == 401 {
                return Self::Auth;
            }
            return Self::Http(code);
        }
        Self::Other
    }

    /// Whether this kind should trigger the OAuth path.
    pub fn is_auth(self) -> bool {
        matches!(self, Self::Auth)
    }
}

/// Extract a plausible 3-digit HTTP status from a message. A parenthesized
/// status such as `Non-200 status code (404)` wins over incidental digits.
fn extract_status_code(message: &str) -> Option<u16> {
    let bytes = message.as_bytes();
    for i in 0..bytes.len() {
        if bytes[i] == b'('
            && i + 4 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(u8::is_ascii_digit)
            && bytes[i + 4] == b')'
        {
            if let Ok(code) = message[i + 1..i + 4].parse::<u16>() {
                if (100..=599).contains(&code) {
                    return Some(code);
                }
            }
        }
    }

    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i - start == 3 {
                if let Ok(code) = message[start..i].parse::<u16>() {
                    if (100..=599).contains(&code) {
                        return Some(code);
                    }
                }
            }
        } else {
            i += 1;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_auth_variants() {
        assert_eq!(ErrorKind::of(&McpError::AuthRequired), ErrorKind::Auth);
        assert_eq!(
            ErrorKind::of_message("Non-200 status code (401)"),
            ErrorKind::Auth
        );
        assert_eq!(ErrorKind::of_message("HTTP 401"), ErrorKind::Auth);
        assert_eq!(
            ErrorKind::of_message("server said: Unauthorized"),
            ErrorKind::Auth
        );
        assert_eq!(
            ErrorKind::of_message("request rejected with 401"),
            ErrorKind::Auth
        );
    }

    #[test]
    fn test_classify_offline() {
        assert_eq!(
            ErrorKind::of_message("connect ECONNREFUSED 127.0.0.1:9"),
            ErrorKind::Offline
        );
        assert_eq!(
            ErrorKind::of_message("getaddrinfo ENOTFOUND nope.invalid"),
            ErrorKind::Offline
        );
        assert_eq!(ErrorKind::of_message("EAI_AGAIN lookup"), ErrorKind::Offline);
        assert_eq!(ErrorKind::of_message("fetch failed"), ErrorKind::Offline);
    }

    #[test]
    fn test_classify_http_status_extraction() {
        assert_eq!(
            ErrorKind::of_message("Server returned 503 Service Unavailable"),
            ErrorKind::Http(503)
        );
        assert_eq!(
            ErrorKind::of_message("Non-200 status code (404)"),
            ErrorKind::Http(404)
        );
    }

    #[test]
    fn test_classify_other() {
        assert_eq!(ErrorKind::of_message("something broke"), ErrorKind::Other);
        // 4-digit runs are not statuses
        assert_eq!(ErrorKind::of_message("code 5030 seen"), ErrorKind::Other);
        // out-of-range 3-digit runs are not statuses
        assert_eq!(ErrorKind::of_message("got 999 problems"), ErrorKind::Other);
    }

    #[test]
    fn test_classify_order_auth_before_offline() {
        // A message matching both auth and offline rules classifies as auth.
        assert_eq!(
            ErrorKind::of_message("HTTP 401 after fetch failed"),
            ErrorKind::Auth
        );
    }

    #[test]
    fn test_classify_order_offline_before_http() {
        assert_eq!(
            ErrorKind::of_message("ECONNREFUSED (status 503)"),
            ErrorKind::Offline
        );
    }

    #[test]
    fn test_oauth_timeout_carries_fields() {
        let err = McpError::OAuthTimeout {
            server_name: "x".to_string(),
            timeout_ms: 1000,
        };
        assert!(err.to_string().contains("'x'"));
        assert!(err.to_string().contains("1000ms"));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            McpError::ServerNotFound("test".to_string()).to_string(),
            "Server not found: test"
        );
        assert_eq!(
            McpError::ToolNotFound("tool".to_string()).to_string(),
            "Tool not found: tool"
        );
        assert_eq!(McpError::AuthRequired.to_string(), "Authentication required");
    }
}
