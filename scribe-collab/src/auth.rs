//! Authentication and per-document authorization.
//!
//! The server asks an [`Authorizer`] who a token belongs to once per
//! connection, and whether that user may touch a document before every
//! Join, Submit and GetSteps. Entitlement can therefore be revoked while a
//! session is open.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use scribe_core::DocumentId;

pub type UserId = String;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid or unknown token")]
    InvalidToken,
    #[error("{user} may not access {document_id}")]
    Forbidden {
        user: UserId,
        document_id: DocumentId,
    },
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Resolve a credential to a user.
    async fn authenticate(&self, token: &str) -> Result<UserId, AuthError>;

    /// Check that `user` may read and edit `document_id`.
    async fn authorize(&self, user: &UserId, document_id: DocumentId) -> Result<(), AuthError>;

    /// Whether connections must authenticate before using documents.
    fn requires_authentication(&self) -> bool {
        true
    }
}

/// No access control. Every connection acts as `anonymous`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

pub const ANONYMOUS: &str = "anonymous";

#[async_trait]
impl Authorizer for AllowAll {
    async fn authenticate(&self, _token: &str) -> Result<UserId, AuthError> {
        Ok(ANONYMOUS.to_string())
    }

    async fn authorize(&self, _user: &UserId, _document_id: DocumentId) -> Result<(), AuthError> {
        Ok(())
    }

    fn requires_authentication(&self) -> bool {
        false
    }
}

/// Static tokens plus a member set per document.
///
/// A document's owner and collaborators are both plain members here.
#[derive(Default)]
pub struct AccessList {
    tokens: RwLock<HashMap<String, UserId>>,
    members: RwLock<HashMap<DocumentId, HashSet<UserId>>>,
}

impl AccessList {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_token(&self, token: impl Into<String>, user: impl Into<UserId>) {
        self.tokens.write().await.insert(token.into(), user.into());
    }

    pub async fn grant(&self, user: impl Into<UserId>, document_id: DocumentId) {
        self.members
            .write()
            .await
            .entry(document_id)
            .or_default()
            .insert(user.into());
    }

    pub async fn revoke(&self, user: &str, document_id: DocumentId) {
        let mut members = self.members.write().await;
        if let Some(set) = members.get_mut(&document_id) {
            set.remove(user);
            if set.is_empty() {
                members.remove(&document_id);
            }
        }
    }
}

#[async_trait]
impl Authorizer for AccessList {
    async fn authenticate(&self, token: &str) -> Result<UserId, AuthError> {
        self.tokens
            .read()
            .await
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }

    async fn authorize(&self, user: &UserId, document_id: DocumentId) -> Result<(), AuthError> {
        let members = self.members.read().await;
        match members.get(&document_id) {
            Some(set) if set.contains(user) => Ok(()),
            _ => Err(AuthError::Forbidden {
                user: user.clone(),
                document_id,
            }),
        }
    }
}
