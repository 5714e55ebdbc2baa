//! In-process [`AuthProvider`].
//!
//! Accounts live in a map keyed by uid. Every change of the signed-in user
//! is pushed to all subscribers; linking a credential keeps the same user
//! and pushes nothing.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::provider::{AuthError, AuthProvider, AuthStateReceiver, CurrentUser, Credential};
use crate::util;

const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Clone)]
struct Account {
    uid: String,
    email: Option<String>,
    password: Option<String>,
    anonymous: bool,
}

impl Account {
    fn user(&self) -> CurrentUser {
        CurrentUser {
            uid: self.uid.clone(),
            email: self.email.clone(),
            is_anonymous: self.anonymous,
        }
    }
}

#[derive(Default)]
struct AuthState {
    accounts: HashMap<String, Account>,
    current: Option<String>,
    listeners: Vec<mpsc::UnboundedSender<Option<CurrentUser>>>,
    failures: VecDeque<AuthError>,
    revoked: HashSet<String>,
    deleted: Vec<String>,
    resets: Vec<String>,
}

impl AuthState {
    fn current_user(&self) -> Option<CurrentUser> {
        self.current
            .as_ref()
            .and_then(|uid| self.accounts.get(uid))
            .map(Account::user)
    }

    fn account_by_email(&self, email: &str) -> Option<&Account> {
        self.accounts
            .values()
            .find(|a| a.email.as_deref() == Some(email))
    }

    fn take_failure(&mut self) -> Result<(), AuthError> {
        match self.failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Switch the signed-in user, pushing only on an actual change.
    fn set_current(&mut self, uid: Option<String>) {
        if self.current == uid {
            return;
        }
        self.current = uid;
        let user = self.current_user();
        self.notify(user);
    }

    fn notify(&mut self, user: Option<CurrentUser>) {
        self.listeners.retain(|tx| tx.send(user.clone()).is_ok());
    }
}

/// In-memory accounts with push notifications and failure injection.
#[derive(Default)]
pub struct MemoryAuth {
    state: Mutex<AuthState>,
}

impl MemoryAuth {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, AuthState> {
        util::lock(&self.state)
    }

    /// Register an email account without signing it in.
    pub fn add_account(&self, email: &str, password: &str) -> CurrentUser {
        let account = Account {
            uid: Uuid::new_v4().to_string(),
            email: Some(email.to_string()),
            password: Some(password.to_string()),
            anonymous: false,
        };
        let user = account.user();
        self.lock().accounts.insert(account.uid.clone(), account);
        user
    }

    /// Make the next fallible operation fail with `error`.
    pub fn fail_next(&self, error: AuthError) {
        self.lock().failures.push_back(error);
    }

    /// Disable an account remotely. The signed-in state is left alone, as a
    /// real backend only notices on the next call.
    pub fn revoke(&self, uid: &str) {
        self.lock().revoked.insert(uid.to_string());
    }

    /// Push a raw auth state to every subscriber.
    pub fn push(&self, user: Option<CurrentUser>) {
        self.lock().notify(user);
    }

    /// Uids removed through `delete_user`, in order.
    pub fn deleted_users(&self) -> Vec<String> {
        self.lock().deleted.clone()
    }

    /// Emails a reset was sent to, in order.
    pub fn password_resets(&self) -> Vec<String> {
        self.lock().resets.clone()
    }

    pub fn listener_count(&self) -> usize {
        let mut state = self.lock();
        state.listeners.retain(|tx| !tx.is_closed());
        state.listeners.len()
    }

    /// Whether `uid` still exists.
    pub fn has_account(&self, uid: &str) -> bool {
        self.lock().accounts.contains_key(uid)
    }

    fn check_live(state: &AuthState) -> Result<String, AuthError> {
        let uid = state.current.clone().ok_or(AuthError::NoCurrentUser)?;
        if state.revoked.contains(&uid) {
            return Err(AuthError::UserRevoked);
        }
        Ok(uid)
    }
}

#[async_trait]
impl AuthProvider for MemoryAuth {
    fn subscribe(&self) -> AuthStateReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        let _ = tx.send(state.current_user());
        state.listeners.push(tx);
        rx
    }

    fn current_user(&self) -> Option<CurrentUser> {
        self.lock().current_user()
    }

    async fn sign_in_anonymously(&self) -> Result<Option<CurrentUser>, AuthError> {
        let mut state = self.lock();
        state.take_failure()?;
        let account = Account {
            uid: Uuid::new_v4().to_string(),
            email: None,
            password: None,
            anonymous: true,
        };
        let user = account.user();
        log::debug!("MemoryAuth: anonymous account {}", user.uid);
        state.accounts.insert(account.uid.clone(), account);
        state.set_current(Some(user.uid.clone()));
        Ok(Some(user))
    }

    async fn sign_in_with_email(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<CurrentUser>, AuthError> {
        let mut state = self.lock();
        state.take_failure()?;
        let account = state.account_by_email(email).ok_or(AuthError::UserNotFound)?;
        if state.revoked.contains(&account.uid) {
            return Err(AuthError::UserRevoked);
        }
        if account.password.as_deref() != Some(password) {
            return Err(AuthError::InvalidCredentials);
        }
        let user = account.user();
        state.set_current(Some(user.uid.clone()));
        Ok(Some(user))
    }

    async fn create_user_with_email(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<CurrentUser>, AuthError> {
        let mut state = self.lock();
        state.take_failure()?;
        if state.account_by_email(email).is_some() {
            return Err(AuthError::EmailAlreadyInUse);
        }
        if password.len() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword);
        }
        let account = Account {
            uid: Uuid::new_v4().to_string(),
            email: Some(email.to_string()),
            password: Some(password.to_string()),
            anonymous: false,
        };
        let user = account.user();
        state.accounts.insert(account.uid.clone(), account);
        state.set_current(Some(user.uid.clone()));
        Ok(Some(user))
    }

    async fn link_current_user(
        &self,
        credential: Credential,
    ) -> Result<Option<CurrentUser>, AuthError> {
        let mut state = self.lock();
        state.take_failure()?;
        let uid = Self::check_live(&state)?;
        let Credential::Email { email, password } = credential;

        if let Some(owner) = state.account_by_email(&email) {
            if owner.uid != uid {
                return Err(AuthError::CredentialAlreadyInUse);
            }
        }
        if password.len() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword);
        }

        let account = state.accounts.get_mut(&uid).ok_or(AuthError::UserNotFound)?;
        account.email = Some(email);
        account.password = Some(password);
        account.anonymous = false;
        Ok(Some(account.user()))
    }

    async fn reauthenticate(&self, credential: Credential) -> Result<(), AuthError> {
        let mut state = self.lock();
        state.take_failure()?;
        let uid = Self::check_live(&state)?;
        let Credential::Email { email, password } = credential;
        let account = state.accounts.get(&uid).ok_or(AuthError::UserNotFound)?;
        if account.email.as_deref() != Some(email.as_str())
            || account.password.as_deref() != Some(password.as_str())
        {
            return Err(AuthError::InvalidCredentials);
        }
        Ok(())
    }

    async fn update_password(&self, new_password: &str) -> Result<(), AuthError> {
        let mut state = self.lock();
        state.take_failure()?;
        let uid = Self::check_live(&state)?;
        if new_password.len() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword);
        }
        let account = state.accounts.get_mut(&uid).ok_or(AuthError::UserNotFound)?;
        account.password = Some(new_password.to_string());
        Ok(())
    }

    async fn send_password_reset(&self, email: &str) -> Result<(), AuthError> {
        let mut state = self.lock();
        state.take_failure()?;
        if state.account_by_email(email).is_none() {
            return Err(AuthError::UserNotFound);
        }
        state.resets.push(email.to_string());
        Ok(())
    }

    async fn delete_user(&self, user: &CurrentUser) -> Result<(), AuthError> {
        let mut state = self.lock();
        state.take_failure()?;
        if state.accounts.remove(&user.uid).is_none() {
            return Err(AuthError::UserNotFound);
        }
        state.deleted.push(user.uid.clone());
        if state.current.as_deref() == Some(user.uid.as_str()) {
            state.set_current(None);
        }
        Ok(())
    }

    fn sign_out(&self) -> Result<(), AuthError> {
        let mut state = self.lock();
        state.take_failure()?;
        state.set_current(None);
        Ok(())
    }
}
