//! Session state machine.
//!
//! ```text
//!                  ┌──────────────┐
//!                  │ Initializing │
//!                  └──────┬───────┘
//!          user pushed    │    no user pushed
//!        ┌────────────────┴────────────────┐
//!        ▼                                 ▼
//! ┌───────────────┐   user signs out  ┌─────────────────┐
//! │ Authenticated │ ────────────────► │ Unauthenticated │
//! │               │ ◄──────────────── │                 │
//! └───────────────┘    user pushed    └─────────────────┘
//! ```
//!
//! With `anonymous_fallback`, a push of "no user" signs in anonymously
//! instead of ending the session. Lifecycle hooks go to registered
//! [`SessionObserver`]s, awaited in registration order.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, Weak};
use tether_sync::SyncError;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::provider::{AuthError, AuthProvider, Credential, CurrentUser};
use crate::util::lock;

/// Authentication state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No auth state received yet
    Initializing,
    Authenticated,
    Unauthenticated,
}

/// Published session fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub user_id: Option<String>,
    /// Account not yet linked or committed
    pub is_new: bool,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: SessionState::Initializing,
            user_id: None,
            is_new: false,
        }
    }
}

impl SessionSnapshot {
    pub fn is_ready(&self) -> bool {
        self.user_id.is_some()
    }

    pub fn is_initialized(&self) -> bool {
        self.state != SessionState::Initializing
    }
}

/// Configuration for a [`Session`].
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Sign in anonymously whenever no user is signed in
    pub anonymous_fallback: bool,
}

impl SessionConfig {
    pub fn with_anonymous_fallback() -> Self {
        Self {
            anonymous_fallback: true,
        }
    }
}

/// Errors surfaced by session operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The provider reported neither a user nor an error
    UnknownAuth,
    /// The operation needs a signed-in user
    MissingUser,
    Auth(AuthError),
    Sync(SyncError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::UnknownAuth => write!(f, "Unknown authentication error"),
            SessionError::MissingUser => write!(f, "No user signed in"),
            SessionError::Auth(e) => write!(f, "{e}"),
            SessionError::Sync(e) => write!(f, "Profile sync failed: {e}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Auth(e) => Some(e),
            SessionError::Sync(e) => Some(e),
            _ => None,
        }
    }
}

impl From<AuthError> for SessionError {
    fn from(e: AuthError) -> Self {
        SessionError::Auth(e)
    }
}

impl From<SyncError> for SessionError {
    fn from(e: SyncError) -> Self {
        SessionError::Sync(e)
    }
}

/// Session lifecycle hooks. All default to doing nothing.
#[async_trait]
pub trait SessionObserver: Send + Sync {
    /// A user was pushed by the provider; the session is Authenticated.
    async fn session_started(&self, _user: &CurrentUser) {}

    /// The anonymous fallback signed in a fresh anonymous account.
    async fn anonymous_session_started(&self) {}

    /// An authenticated user signed out.
    async fn session_ended(&self) {}
}

struct SessionInner {
    auth: Arc<dyn AuthProvider>,
    config: SessionConfig,
    snapshot: watch::Sender<SessionSnapshot>,
    observers: Mutex<Vec<Arc<dyn SessionObserver>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(listener) = lock(&self.listener).take() {
            listener.abort();
        }
    }
}

/// Tracks who is signed in and drives the session lifecycle.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(auth: Arc<dyn AuthProvider>, config: SessionConfig) -> Self {
        let (snapshot, _) = watch::channel(SessionSnapshot::default());
        Self {
            inner: Arc::new(SessionInner {
                auth,
                config,
                snapshot,
                observers: Mutex::new(Vec::new()),
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn SessionObserver>) {
        lock(&self.inner.observers).push(observer);
    }

    /// Follow the provider's auth-state pushes. Replaces a running listener.
    pub fn start(&self) {
        let mut rx = self.inner.auth.subscribe();
        let weak: Weak<SessionInner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            while let Some(user) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Session { inner }.apply_auth_change(user).await;
            }
        });
        if let Some(previous) = lock(&self.inner.listener).replace(handle) {
            previous.abort();
        }
        log::info!("Session: auth listener started");
    }

    pub fn stop(&self) {
        if let Some(listener) = lock(&self.inner.listener).take() {
            listener.abort();
            log::info!("Session: auth listener stopped");
        }
    }

    pub fn is_listening(&self) -> bool {
        lock(&self.inner.listener)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Apply one auth-state push.
    pub async fn apply_auth_change(&self, user: Option<CurrentUser>) {
        match user {
            Some(user) => {
                log::info!("Session: started for {}", user.uid);
                self.publish(|s| {
                    s.user_id = Some(user.uid.clone());
                    s.state = SessionState::Authenticated;
                });
                for observer in self.observers() {
                    observer.session_started(&user).await;
                }
            }
            None if self.inner.config.anonymous_fallback => {
                self.start_anonymous_session().await;
            }
            None if self.state() == SessionState::Authenticated => {
                log::info!("Session: ended");
                self.publish(|s| {
                    s.user_id = None;
                    s.state = SessionState::Unauthenticated;
                });
                for observer in self.observers() {
                    observer.session_ended().await;
                }
            }
            None => {
                log::debug!("Session: no user");
                self.publish(|s| {
                    s.user_id = None;
                    s.state = SessionState::Unauthenticated;
                });
            }
        }
    }

    async fn start_anonymous_session(&self) {
        log::info!("Session: starting anonymous session");
        match self.inner.auth.sign_in_anonymously().await {
            Ok(_) => {
                self.publish(|s| {
                    s.state = SessionState::Authenticated;
                    s.is_new = true;
                });
                for observer in self.observers() {
                    observer.anonymous_session_started().await;
                }
            }
            Err(e) => {
                log::warn!("Session: anonymous sign-in failed: {e}");
                self.publish(|s| s.state = SessionState::Unauthenticated);
            }
        }
    }

    /// Create an account, or link the anonymous one when running with the
    /// anonymous fallback.
    pub async fn signup(&self, email: &str, password: &str) -> Result<(), SessionError> {
        if self.inner.config.anonymous_fallback {
            log::info!("Session: signing up by linking the anonymous account");
            return self.link_credentials(email, password).await;
        }

        log::info!("Session: signing up new user");
        self.publish(|s| s.is_new = true);
        match self.inner.auth.create_user_with_email(email, password).await {
            Ok(Some(user)) => {
                self.publish(|s| s.user_id = Some(user.uid));
                Ok(())
            }
            Ok(None) => {
                self.publish(|s| s.is_new = false);
                Err(SessionError::UnknownAuth)
            }
            Err(e) => {
                log::warn!("Session: signup failed: {e}");
                self.publish(|s| s.is_new = false);
                Err(e.into())
            }
        }
    }

    /// Sign in with email. A previously signed-in anonymous account is
    /// deleted afterwards, best effort.
    pub async fn login(&self, email: &str, password: &str) -> Result<CurrentUser, SessionError> {
        log::info!("Session: logging in");
        let previous = self.inner.auth.current_user();
        // cleared up front: the provider's push for the new user may be
        // applied before sign-in returns
        let was_new = self.is_new();
        self.publish(|s| s.is_new = false);
        let user = match self.inner.auth.sign_in_with_email(email, password).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                self.publish(|s| s.is_new = was_new);
                return Err(SessionError::UnknownAuth);
            }
            Err(e) => {
                log::warn!("Session: login failed: {e}");
                self.publish(|s| s.is_new = was_new);
                return Err(e.into());
            }
        };
        self.publish(|s| s.user_id = Some(user.uid.clone()));

        if let Some(previous) = previous.filter(|p| p.is_anonymous && p.uid != user.uid) {
            match self.inner.auth.delete_user(&previous).await {
                Ok(()) => log::info!("Session: deleted anonymous account {}", previous.uid),
                Err(e) => log::warn!(
                    "Session: failed to delete anonymous account {}: {e}",
                    previous.uid
                ),
            }
        }

        Ok(user)
    }

    pub async fn change_password(&self, old: &str, new: &str) -> Result<(), SessionError> {
        let user = self.current_user().ok_or(SessionError::MissingUser)?;
        let email = user.email.unwrap_or_default();
        self.inner
            .auth
            .reauthenticate(Credential::email(email, old))
            .await?;
        self.inner.auth.update_password(new).await?;
        Ok(())
    }

    pub async fn forget_password(&self, email: &str) -> Result<(), SessionError> {
        self.inner.auth.send_password_reset(email).await.map_err(|e| {
            log::warn!("Session: password reset failed: {e}");
            SessionError::from(e)
        })
    }

    /// Attach an email credential to the signed-in account.
    pub async fn link_credentials(&self, email: &str, password: &str) -> Result<(), SessionError> {
        if self.current_user().is_none() {
            return Err(SessionError::MissingUser);
        }
        self.inner
            .auth
            .link_current_user(Credential::email(email, password))
            .await
            .map_err(|e| {
                log::warn!("Session: linking failed: {e}");
                SessionError::from(e)
            })?;
        self.publish(|s| s.is_new = false);
        Ok(())
    }

    pub fn signout(&self) -> Result<(), SessionError> {
        log::info!("Session: signing out");
        self.inner.auth.sign_out()?;
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.inner.snapshot.borrow().state
    }

    pub fn user_id(&self) -> Option<String> {
        self.inner.snapshot.borrow().user_id.clone()
    }

    pub fn is_new(&self) -> bool {
        self.inner.snapshot.borrow().is_new
    }

    pub fn is_ready(&self) -> bool {
        self.inner.snapshot.borrow().is_ready()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.snapshot.borrow().is_initialized()
    }

    /// Read from the provider on every call.
    pub fn is_anonymous(&self) -> bool {
        self.current_user().is_some_and(|u| u.is_anonymous)
    }

    /// Read from the provider on every call.
    pub fn email(&self) -> Option<String> {
        self.current_user().and_then(|u| u.email)
    }

    pub fn current_user(&self) -> Option<CurrentUser> {
        self.inner.auth.current_user()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn auth(&self) -> &Arc<dyn AuthProvider> {
        &self.inner.auth
    }

    fn observers(&self) -> Vec<Arc<dyn SessionObserver>> {
        lock(&self.inner.observers).clone()
    }

    fn publish(&self, f: impl FnOnce(&mut SessionSnapshot)) {
        self.inner.snapshot.send_if_modified(|s| {
            let before = s.clone();
            f(s);
            *s != before
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryAuth;

    fn session(auth: &Arc<MemoryAuth>, config: SessionConfig) -> Session {
        Session::new(auth.clone(), config)
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SessionObserver for Recorder {
        async fn session_started(&self, user: &CurrentUser) {
            self.events.lock().unwrap().push(format!("start:{}", user.uid));
        }

        async fn anonymous_session_started(&self) {
            self.events.lock().unwrap().push("anonymous".to_string());
        }

        async fn session_ended(&self) {
            self.events.lock().unwrap().push("end".to_string());
        }
    }

    fn user(uid: &str) -> CurrentUser {
        CurrentUser {
            uid: uid.to_string(),
            email: None,
            is_anonymous: false,
        }
    }

    #[tokio::test]
    async fn test_transitions_none_user_none() {
        let auth = Arc::new(MemoryAuth::new());
        let session = session(&auth, SessionConfig::default());
        let recorder = Arc::new(Recorder::default());
        session.add_observer(recorder.clone());
        assert_eq!(session.state(), SessionState::Initializing);

        let mut states = Vec::new();
        for push in [None, Some(user("u1")), None] {
            session.apply_auth_change(push).await;
            states.push(session.state());
        }

        assert_eq!(
            states,
            vec![
                SessionState::Unauthenticated,
                SessionState::Authenticated,
                SessionState::Unauthenticated,
            ]
        );
        assert_eq!(*recorder.events.lock().unwrap(), vec!["start:u1", "end"]);
        assert_eq!(session.user_id(), None);
    }

    #[tokio::test]
    async fn test_none_while_unauthenticated_does_not_end_session() {
        let auth = Arc::new(MemoryAuth::new());
        let session = session(&auth, SessionConfig::default());
        let recorder = Arc::new(Recorder::default());
        session.add_observer(recorder.clone());

        session.apply_auth_change(None).await;
        session.apply_auth_change(None).await;
        assert!(recorder.events.lock().unwrap().is_empty());
        assert!(session.is_initialized());
        assert!(!session.is_ready());
    }

    #[tokio::test]
    async fn test_anonymous_fallback_signs_in() {
        let auth = Arc::new(MemoryAuth::new());
        let session = session(&auth, SessionConfig::with_anonymous_fallback());
        let recorder = Arc::new(Recorder::default());
        session.add_observer(recorder.clone());

        session.apply_auth_change(None).await;
        assert_eq!(session.state(), SessionState::Authenticated);
        assert!(session.is_new());
        assert!(session.is_anonymous());
        assert_eq!(*recorder.events.lock().unwrap(), vec!["anonymous"]);
    }

    #[tokio::test]
    async fn test_anonymous_fallback_failure_is_unauthenticated() {
        let auth = Arc::new(MemoryAuth::new());
        auth.fail_next(AuthError::Network("down".into()));
        let session = session(&auth, SessionConfig::with_anonymous_fallback());

        session.apply_auth_change(None).await;
        assert_eq!(session.state(), SessionState::Unauthenticated);
        assert!(!session.is_new());
    }

    #[tokio::test]
    async fn test_signup_failure_resets_is_new() {
        let auth = Arc::new(MemoryAuth::new());
        let session = session(&auth, SessionConfig::default());
        let err = session.signup("ada@example.com", "123").await.unwrap_err();
        assert_eq!(err, SessionError::Auth(AuthError::WeakPassword));
        assert!(!session.is_new());

        session.signup("ada@example.com", "secret-1").await.unwrap();
        assert!(session.is_new());
        assert_eq!(session.email().as_deref(), Some("ada@example.com"));
    }

    #[tokio::test]
    async fn test_login_deletes_previous_anonymous_account() {
        let auth = Arc::new(MemoryAuth::new());
        let ada = auth.add_account("ada@example.com", "secret-1");
        let anon = auth.sign_in_anonymously().await.unwrap().unwrap();
        let session = session(&auth, SessionConfig::default());

        let user = session.login("ada@example.com", "secret-1").await.unwrap();
        assert_eq!(user, ada);
        assert_eq!(session.user_id(), Some(ada.uid));
        assert_eq!(auth.deleted_users(), vec![anon.uid]);
        assert!(!session.is_new());
    }

    #[tokio::test]
    async fn test_failed_login_keeps_identity() {
        let auth = Arc::new(MemoryAuth::new());
        auth.add_account("ada@example.com", "secret-1");
        let anon = auth.sign_in_anonymously().await.unwrap().unwrap();
        let session = session(&auth, SessionConfig::default());
        session.apply_auth_change(Some(anon.clone())).await;

        assert_eq!(
            session.login("ada@example.com", "wrong").await,
            Err(SessionError::Auth(AuthError::InvalidCredentials))
        );
        assert_eq!(session.user_id(), Some(anon.uid.clone()));
        assert!(auth.deleted_users().is_empty());
        assert!(auth.has_account(&anon.uid));
    }

    #[tokio::test]
    async fn test_change_password_requires_user() {
        let auth = Arc::new(MemoryAuth::new());
        let session = session(&auth, SessionConfig::default());
        assert_eq!(
            session.change_password("old", "new-secret").await,
            Err(SessionError::MissingUser)
        );

        auth.add_account("ada@example.com", "secret-1");
        session.login("ada@example.com", "secret-1").await.unwrap();
        assert_eq!(
            session.change_password("nope", "new-secret").await,
            Err(SessionError::Auth(AuthError::InvalidCredentials))
        );
        session.change_password("secret-1", "new-secret").await.unwrap();
        session.signout().unwrap();
        session.login("ada@example.com", "new-secret").await.unwrap();
    }

    #[tokio::test]
    async fn test_link_requires_user() {
        let auth = Arc::new(MemoryAuth::new());
        let session = session(&auth, SessionConfig::with_anonymous_fallback());
        assert_eq!(
            session.signup("ada@example.com", "secret-1").await,
            Err(SessionError::MissingUser)
        );
    }

    #[tokio::test]
    async fn test_signup_after_anonymous_account_revoked() {
        let auth = Arc::new(MemoryAuth::new());
        let session = session(&auth, SessionConfig::with_anonymous_fallback());
        session.apply_auth_change(None).await;
        let anon = auth.current_user().unwrap();
        assert!(session.is_new());

        auth.revoke(&anon.uid);
        assert_eq!(
            session.signup("ada@example.com", "secret-1").await,
            Err(SessionError::Auth(AuthError::UserRevoked))
        );
        assert!(session.is_new());
        assert!(session.is_anonymous());
        assert_eq!(session.email(), None);
    }

    #[tokio::test]
    async fn test_forget_password() {
        let auth = Arc::new(MemoryAuth::new());
        auth.add_account("ada@example.com", "secret-1");
        let session = session(&auth, SessionConfig::default());
        session.forget_password("ada@example.com").await.unwrap();
        assert_eq!(
            session.forget_password("bob@example.com").await,
            Err(SessionError::Auth(AuthError::UserNotFound))
        );
        assert_eq!(auth.password_resets(), vec!["ada@example.com"]);
    }

    #[tokio::test]
    async fn test_listener_follows_provider() {
        let auth = Arc::new(MemoryAuth::new());
        let session = session(&auth, SessionConfig::default());
        let mut snapshots = session.subscribe();
        session.start();

        snapshots
            .wait_for(|s| s.state == SessionState::Unauthenticated)
            .await
            .unwrap();
        let anon = auth.sign_in_anonymously().await.unwrap().unwrap();
        let ready = snapshots.wait_for(|s| s.is_ready()).await.unwrap().clone();
        assert_eq!(ready.user_id, Some(anon.uid));

        session.stop();
        assert!(!session.is_listening());
    }
}
