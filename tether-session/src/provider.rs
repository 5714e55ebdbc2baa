//! Authentication provider contract.
//!
//! The provider is the single source of truth for who is signed in. It
//! pushes every change of the signed-in user to its subscribers and answers
//! `current_user()` synchronously.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// The signed-in user as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub uid: String,
    pub email: Option<String>,
    pub is_anonymous: bool,
}

/// Proof of identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Email { email: String, password: String },
}

impl Credential {
    pub fn email(email: impl Into<String>, password: impl Into<String>) -> Self {
        Credential::Email {
            email: email.into(),
            password: password.into(),
        }
    }
}

/// Stream of auth-state pushes. The current state arrives first.
pub type AuthStateReceiver = mpsc::UnboundedReceiver<Option<CurrentUser>>;

/// Errors reported by an auth provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    InvalidCredentials,
    UserNotFound,
    EmailAlreadyInUse,
    WeakPassword,
    /// The credential already belongs to another account
    CredentialAlreadyInUse,
    NoCurrentUser,
    /// The account was disabled or deleted remotely
    UserRevoked,
    Network(String),
    Other(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::InvalidCredentials => write!(f, "Invalid credentials"),
            AuthError::UserNotFound => write!(f, "No account for this email"),
            AuthError::EmailAlreadyInUse => write!(f, "Email already in use"),
            AuthError::WeakPassword => write!(f, "Password too weak"),
            AuthError::CredentialAlreadyInUse => {
                write!(f, "Credential already linked to another account")
            }
            AuthError::NoCurrentUser => write!(f, "No user signed in"),
            AuthError::UserRevoked => write!(f, "User account revoked"),
            AuthError::Network(e) => write!(f, "Network error: {e}"),
            AuthError::Other(e) => write!(f, "Auth error: {e}"),
        }
    }
}

impl std::error::Error for AuthError {}

/// An authentication backend.
///
/// Sign-in style operations return `Ok(None)` when the backend reported
/// neither a user nor an error.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Subscribe to auth-state changes.
    fn subscribe(&self) -> AuthStateReceiver;

    fn current_user(&self) -> Option<CurrentUser>;

    async fn sign_in_anonymously(&self) -> Result<Option<CurrentUser>, AuthError>;

    async fn sign_in_with_email(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<CurrentUser>, AuthError>;

    async fn create_user_with_email(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<CurrentUser>, AuthError>;

    /// Attach a credential to the signed-in account.
    async fn link_current_user(
        &self,
        credential: Credential,
    ) -> Result<Option<CurrentUser>, AuthError>;

    async fn reauthenticate(&self, credential: Credential) -> Result<(), AuthError>;

    async fn update_password(&self, new_password: &str) -> Result<(), AuthError>;

    async fn send_password_reset(&self, email: &str) -> Result<(), AuthError>;

    async fn delete_user(&self, user: &CurrentUser) -> Result<(), AuthError>;

    fn sign_out(&self) -> Result<(), AuthError>;
}
