//! Credentials and resource descriptors.

use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A user/password pair used to log into a resource.
///
/// The password is wiped from memory when the value is dropped and is never
/// printed by `Debug`.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    user: String,
    password: String,
}

impl Credentials {
    /// Creates a new credentials pair.
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    /// Returns the user name.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Returns the password.
    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Identifies an XA-capable backing resource.
///
/// The endpoint doubles as the resource key used by the transaction and
/// recovery registries, so two descriptors with the same endpoint refer to
/// the same resource manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    endpoint: String,
    credentials: Credentials,
}

impl ResourceDescriptor {
    /// Creates a new descriptor.
    pub fn new(endpoint: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            endpoint: endpoint.into(),
            credentials,
        }
    }

    /// Returns the resource endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Returns the primary credentials.
    #[must_use]
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }
}
