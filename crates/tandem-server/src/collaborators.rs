//! Admission collaborators.
//!
//! The gateway does not know where users, documents or access rules live.
//! It authenticates, resolves and authorizes through these traits; the host
//! plugs in implementations backed by its session store and database.

use async_trait::async_trait;
use std::fmt;
use tandem_core::DocumentId;
use thiserror::Error;

/// Credentials presented on the upgrade request.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Bearer token, from the `Authorization` header or the `token` query
    /// parameter.
    pub token: Option<String>,
}

impl Credentials {
    /// Credentials carrying a bearer token.
    #[must_use]
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    /// No credentials.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// An authenticated user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    /// Stable user id.
    pub id: String,
    /// Admitted without credentials.
    pub anonymous: bool,
}

impl User {
    /// User id given to anonymous connections.
    pub const ANONYMOUS_ID: &'static str = "anonymous";

    /// An authenticated user.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            anonymous: false,
        }
    }

    /// The anonymous user.
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            id: Self::ANONYMOUS_ID.to_string(),
            anonymous: true,
        }
    }
}

/// A resolved document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentHandle {
    /// Canonical id; the key of the document's hub.
    pub id: DocumentId,
    /// Readable by every user.
    pub public: bool,
}

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No credentials and anonymous access is disabled.
    #[error("Missing credentials")]
    MissingCredentials,

    /// The token is not known.
    #[error("Invalid token")]
    InvalidToken,

    /// The authentication backend failed.
    #[error("Authentication backend error: {0}")]
    Backend(String),
}

/// Document lookup errors.
#[derive(Debug, Error)]
pub enum LookupError {
    /// No document has this id or alias.
    #[error("Document not found: {0}")]
    NotFound(String),

    /// The lookup backend failed.
    #[error("Document lookup error: {0}")]
    Backend(String),
}

/// Authenticates the user behind an upgrade request.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Authenticate `credentials`.
    async fn authenticate(&self, credentials: &Credentials) -> Result<User, AuthError>;
}

/// Resolves a document id or alias to a canonical document.
#[async_trait]
pub trait DocumentLookup: Send + Sync {
    /// Resolve `reference`, an id or alias as sent by the client.
    async fn resolve(&self, reference: &str) -> Result<DocumentHandle, LookupError>;
}

/// Decides who may join a document.
///
/// Evaluated once at admission.
#[async_trait]
pub trait PermissionPolicy: Send + Sync {
    /// Whether `user` may read `document`.
    async fn can_read(&self, user: &User, document: &DocumentHandle) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_redacts_token() {
        let credentials = Credentials::bearer("s3cret");
        let printed = format!("{:?}", credentials);
        assert!(!printed.contains("s3cret"));
        assert!(printed.contains("redacted"));
    }

    #[test]
    fn test_anonymous_user() {
        let user = User::anonymous();
        assert!(user.anonymous);
        assert_eq!(user.id, User::ANONYMOUS_ID);
        assert!(!User::new("alice").anonymous);
    }
}
