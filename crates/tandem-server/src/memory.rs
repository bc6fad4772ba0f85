//! In-memory admission collaborators, configured from the config file.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tandem_core::{validate_document_id, DocumentId};
use tracing::debug;

use crate::collaborators::{
    AuthError, Authenticator, Credentials, DocumentHandle, DocumentLookup, LookupError,
    PermissionPolicy, User,
};
use crate::config::{AuthConfig, DocumentEntry, DocumentsConfig};

/// Authenticates against a static token table.
#[derive(Debug, Clone, Default)]
pub struct TokenAuthenticator {
    tokens: HashMap<String, String>,
    allow_anonymous: bool,
}

impl TokenAuthenticator {
    /// Create an authenticator with no tokens.
    #[must_use]
    pub fn new(allow_anonymous: bool) -> Self {
        Self {
            tokens: HashMap::new(),
            allow_anonymous,
        }
    }

    /// Build from the `[auth]` config section.
    #[must_use]
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            tokens: config
                .tokens
                .iter()
                .map(|entry| (entry.token.clone(), entry.user.clone()))
                .collect(),
            allow_anonymous: config.allow_anonymous,
        }
    }

    /// Register `token` for `user`.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, user: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), user.into());
        self
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> Result<User, AuthError> {
        match &credentials.token {
            Some(token) => self
                .tokens
                .get(token)
                .map(User::new)
                .ok_or(AuthError::InvalidToken),
            None if self.allow_anonymous => Ok(User::anonymous()),
            None => Err(AuthError::MissingCredentials),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    readers: HashSet<String>,
    public: bool,
}

#[derive(Debug, Default)]
struct Directory {
    documents: HashMap<DocumentId, Entry>,
    aliases: HashMap<String, DocumentId>,
}

/// Document directory held in memory.
///
/// Serves both as [`DocumentLookup`] and [`PermissionPolicy`]. In open mode
/// every well-formed id that is not a known alias resolves to itself and is
/// readable by everyone.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    inner: RwLock<Directory>,
    open: bool,
}

impl MemoryDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new(open: bool) -> Self {
        Self {
            inner: RwLock::new(Directory::default()),
            open,
        }
    }

    /// Build from the `[documents]` config section.
    #[must_use]
    pub fn from_config(config: &DocumentsConfig) -> Self {
        let directory = Self::new(config.open);
        for entry in &config.entries {
            directory.insert(entry);
        }
        directory
    }

    /// Add or replace a document.
    pub fn insert(&self, entry: &DocumentEntry) {
        let id = DocumentId::new(entry.id.clone());
        let mut inner = self.inner.write();
        for alias in &entry.aliases {
            inner.aliases.insert(alias.clone(), id.clone());
        }
        inner.documents.insert(
            id,
            Entry {
                readers: entry.readers.iter().cloned().collect(),
                public: entry.public,
            },
        );
    }

    /// Remove a document and its aliases.
    ///
    /// Live sessions are unaffected; pair with
    /// `HubRegistry::document_deleted` to close them.
    pub fn remove(&self, id: &str) -> bool {
        let mut inner = self.inner.write();
        inner.aliases.retain(|_, target| target.as_str() != id);
        inner.documents.remove(id).is_some()
    }

    /// Allow `user` to read document `id`.
    pub fn grant(&self, id: &str, user: impl Into<String>) -> bool {
        match self.inner.write().documents.get_mut(id) {
            Some(entry) => entry.readers.insert(user.into()),
            None => false,
        }
    }

    /// Stop `user` from joining document `id`.
    ///
    /// Only affects future admissions; pair with
    /// `HubRegistry::disconnect_user` to end live sessions.
    pub fn revoke(&self, id: &str, user: &str) -> bool {
        match self.inner.write().documents.get_mut(id) {
            Some(entry) => entry.readers.remove(user),
            None => false,
        }
    }
}

#[async_trait]
impl DocumentLookup for MemoryDirectory {
    async fn resolve(&self, reference: &str) -> Result<DocumentHandle, LookupError> {
        let inner = self.inner.read();

        let id = if inner.documents.contains_key(reference) {
            Some(DocumentId::from(reference))
        } else {
            inner.aliases.get(reference).cloned()
        };

        if let Some(id) = id {
            let public = inner.documents.get(&id).is_some_and(|e| e.public);
            return Ok(DocumentHandle { id, public });
        }

        if self.open && validate_document_id(reference).is_ok() {
            debug!(document = %reference, "Resolved unknown document in open mode");
            return Ok(DocumentHandle {
                id: DocumentId::from(reference),
                public: true,
            });
        }

        Err(LookupError::NotFound(reference.to_string()))
    }
}

#[async_trait]
impl PermissionPolicy for MemoryDirectory {
    async fn can_read(&self, user: &User, document: &DocumentHandle) -> bool {
        if document.public {
            return true;
        }
        if user.anonymous {
            return false;
        }
        self.inner
            .read()
            .documents
            .get(&document.id)
            .is_some_and(|e| e.readers.contains(&user.id))
    }
}
