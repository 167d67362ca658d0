//! Error types for XA resource operations.

use std::fmt;
use thiserror::Error;

/// Result type for resource operations.
pub type ResourceResult<T> = Result<T, ResourceError>;

/// XA error codes reported by a resource manager.
///
/// The numeric values follow the X/Open XA return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XaErrorCode {
    /// The branch was rolled back by the resource manager (`XA_RBROLLBACK`).
    RolledBack,
    /// The resource manager is unavailable (`XAER_RMFAIL`).
    ResourceManagerFailed,
    /// The XID is not known to the resource manager (`XAER_NOTA`).
    UnknownXid,
    /// The call was made in an improper context (`XAER_PROTO`).
    Protocol,
    /// The XID already exists (`XAER_DUPID`).
    DuplicateXid,
}

impl XaErrorCode {
    /// Returns the X/Open numeric value of this code.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        match self {
            Self::RolledBack => 100,
            Self::ResourceManagerFailed => -7,
            Self::UnknownXid => -4,
            Self::Protocol => -6,
            Self::DuplicateXid => -8,
        }
    }
}

impl fmt::Display for XaErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RolledBack => "XA_RBROLLBACK",
            Self::ResourceManagerFailed => "XAER_RMFAIL",
            Self::UnknownXid => "XAER_NOTA",
            Self::Protocol => "XAER_PROTO",
            Self::DuplicateXid => "XAER_DUPID",
        };
        write!(f, "{name}({})", self.as_i32())
    }
}

/// Errors that can occur while talking to an XA resource.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// The backing resource could not be reached.
    #[error("resource {endpoint} unavailable: {message}")]
    Unavailable {
        /// Endpoint of the resource.
        endpoint: String,
        /// Description of the failure.
        message: String,
    },

    /// The resource rejected the supplied credentials.
    #[error("authentication failed for user {user}")]
    AuthenticationFailed {
        /// The user that was rejected.
        user: String,
    },

    /// The connection has been closed.
    #[error("connection is closed")]
    Closed,

    /// The connection no longer responds.
    #[error("connection is broken")]
    Broken,

    /// An XA protocol call failed.
    #[error("XA error {code}: {message}")]
    Xa {
        /// The XA return code.
        code: XaErrorCode,
        /// Description of the failure.
        message: String,
    },

    /// A statement failed.
    #[error("statement failed: {0}")]
    Statement(String),
}

impl ResourceError {
    /// Creates an unavailable error.
    pub fn unavailable(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Creates an XA error.
    pub fn xa(code: XaErrorCode, message: impl Into<String>) -> Self {
        Self::Xa {
            code,
            message: message.into(),
        }
    }

    /// Returns the XA error code, if this is an XA error.
    #[must_use]
    pub fn xa_code(&self) -> Option<XaErrorCode> {
        match self {
            Self::Xa { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns true if retrying the operation later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. }
                | Self::Broken
                | Self::Xa {
                    code: XaErrorCode::ResourceManagerFailed,
                    ..
                }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xa_code_display() {
        assert_eq!(XaErrorCode::UnknownXid.to_string(), "XAER_NOTA(-4)");
        assert_eq!(XaErrorCode::RolledBack.as_i32(), 100);
    }

    #[test]
    fn retryable_errors() {
        assert!(ResourceError::unavailable("db1", "refused").is_retryable());
        assert!(ResourceError::xa(XaErrorCode::ResourceManagerFailed, "down").is_retryable());
        assert!(!ResourceError::xa(XaErrorCode::UnknownXid, "gone").is_retryable());
        assert!(!ResourceError::Closed.is_retryable());
    }
}
