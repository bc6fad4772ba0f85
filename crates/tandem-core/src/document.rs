//! Document identifiers.

use std::borrow::Borrow;
use std::fmt;

/// Maximum document identifier length.
pub const MAX_DOCUMENT_ID_LENGTH: usize = 256;

/// Validate a document identifier or alias as received from a client.
///
/// # Errors
///
/// Returns an error message if the identifier is invalid.
pub fn validate_document_id(id: &str) -> Result<(), &'static str> {
    if id.is_empty() {
        return Err("Document id cannot be empty");
    }
    if id.len() > MAX_DOCUMENT_ID_LENGTH {
        return Err("Document id too long");
    }
    if id.starts_with('$') {
        return Err("Document ids starting with '$' are reserved");
    }
    if !id.chars().all(|c| c.is_ascii() && !c.is_ascii_control() && c != ' ') {
        return Err("Document id contains invalid characters");
    }
    Ok(())
}

/// Canonical identifier of a document, used as the registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(String);

impl DocumentId {
    /// Wrap an identifier that was already resolved by a document lookup.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parse an identifier supplied by a client.
    ///
    /// # Errors
    ///
    /// Returns an error message if the identifier is invalid.
    pub fn parse(id: &str) -> Result<Self, &'static str> {
        validate_document_id(id)?;
        Ok(Self(id.to_string()))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for DocumentId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
