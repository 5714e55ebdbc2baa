//! Per-user profile document bound to the session lifecycle.
//!
//! ```text
//! session_started(user) ──► end previous mirror
//!                           seed (new anonymous → default_profile,
//!                                 new account   → profile_for) + commit
//!                           start DocumentMirror on "<collection>/<uid>"
//! mirror Ok(profile)    ──► publish, on_profile_change
//! mirror Err            ──► sign the user out
//! session_ended         ──► end mirror, profile = None
//! ```

use async_trait::async_trait;
use std::sync::{Arc, Mutex, Weak};
use tether_sync::{CollectionRef, DocumentMirror, Record, RemoteStore, SyncConfig, SyncError};
use tokio::sync::watch;

use crate::provider::{AuthProvider, CurrentUser};
use crate::session::{Session, SessionConfig, SessionError, SessionObserver};
use crate::util::lock;

/// Builds and adjusts profiles for users.
pub trait ProfileFactory<P>: Send + Sync {
    /// Profile seeded for a fresh anonymous account.
    fn default_profile(&self, user: &CurrentUser) -> P;

    /// Profile seeded for a freshly created account.
    fn profile_for(&self, user: &CurrentUser) -> P;

    /// Applied after signup or login, before the profile is committed.
    fn update_profile(&self, _profile: &mut P, _user: &CurrentUser) {}

    /// Called whenever a new profile value arrives from the store.
    fn on_profile_change(&self, _profile: &P) {}
}

/// Configuration for a [`ProfileSession`].
#[derive(Debug, Clone)]
pub struct ProfileConfig {
    /// Collection holding one profile document per uid
    pub collection: String,
    pub session: SessionConfig,
    pub sync: SyncConfig,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            collection: "profile".to_string(),
            session: SessionConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

/// Published profile state.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileSnapshot<P> {
    /// Owner of the profile document being mirrored
    pub user_id: Option<String>,
    pub profile: Option<P>,
}

impl<P> Default for ProfileSnapshot<P> {
    fn default() -> Self {
        Self {
            user_id: None,
            profile: None,
        }
    }
}

impl<P> ProfileSnapshot<P> {
    pub fn is_ready(&self) -> bool {
        self.user_id.is_some() && self.profile.is_some()
    }
}

struct ProfileInner<P: Record> {
    session: Session,
    store: Arc<dyn RemoteStore>,
    factory: Arc<dyn ProfileFactory<P>>,
    config: ProfileConfig,
    mirror: Mutex<Option<DocumentMirror<P>>>,
    snapshot: watch::Sender<ProfileSnapshot<P>>,
}

/// A [`Session`] plus the signed-in user's profile document.
///
/// Cloning yields another handle to the same profile session.
pub struct ProfileSession<P: Record> {
    inner: Arc<ProfileInner<P>>,
}

impl<P: Record> Clone for ProfileSession<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Record> ProfileSession<P> {
    pub fn new(
        auth: Arc<dyn AuthProvider>,
        store: Arc<dyn RemoteStore>,
        factory: Arc<dyn ProfileFactory<P>>,
        config: ProfileConfig,
    ) -> Self {
        let session = Session::new(auth, config.session.clone());
        let (snapshot, _) = watch::channel(ProfileSnapshot::default());
        let inner = Arc::new(ProfileInner {
            session: session.clone(),
            store,
            factory,
            config,
            mirror: Mutex::new(None),
            snapshot,
        });
        session.add_observer(Arc::new(ProfileHooks {
            inner: Arc::downgrade(&inner),
        }));
        Self { inner }
    }

    /// Start following the provider's auth state.
    pub fn start(&self) {
        self.inner.session.start();
    }

    pub fn stop(&self) {
        self.inner.session.stop();
        self.inner.end_profile_session();
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    pub fn profile(&self) -> Option<P> {
        self.inner.snapshot.borrow().profile.clone()
    }

    /// Identity present and its profile loaded.
    pub fn is_ready(&self) -> bool {
        self.inner.session.is_ready() && self.inner.snapshot.borrow().is_ready()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProfileSnapshot<P>> {
        self.inner.snapshot.subscribe()
    }

    /// Write the local profile back to the store.
    pub async fn commit_profile(&self) -> Result<(), SessionError> {
        self.inner.commit_profile().await
    }

    /// Edit the local profile. Returns `false` when no profile is loaded.
    pub fn update<F: FnOnce(&mut P)>(&self, f: F) -> bool {
        self.inner.update(f)
    }

    /// Sign up, wait for the new profile, then apply `update_profile` and
    /// commit it.
    pub async fn signup(&self, email: &str, password: &str) -> Result<(), SessionError> {
        self.inner.session.signup(email, password).await?;
        let user = self
            .inner
            .session
            .current_user()
            .ok_or(SessionError::UnknownAuth)?;
        self.finish_credential_change(&user).await
    }

    /// Log in, wait for the user's profile, then apply `update_profile` and
    /// commit it.
    pub async fn login(&self, email: &str, password: &str) -> Result<CurrentUser, SessionError> {
        let user = self.inner.session.login(email, password).await?;
        self.finish_credential_change(&user).await?;
        Ok(user)
    }

    pub fn signout(&self) -> Result<(), SessionError> {
        self.inner.signout()
    }

    async fn finish_credential_change(&self, user: &CurrentUser) -> Result<(), SessionError> {
        if !self.inner.session.is_listening() {
            // nobody else will apply the provider's push
            self.inner.session.apply_auth_change(Some(user.clone())).await;
        }
        self.wait_for_profile(&user.uid).await?;

        let factory = Arc::clone(&self.inner.factory);
        self.inner.update(|profile| factory.update_profile(profile, user));
        self.inner.commit_profile().await
    }

    /// Wait until the profile of `uid` is loaded. Fails once `uid` is no
    /// longer the provider's signed-in user.
    async fn wait_for_profile(&self, uid: &str) -> Result<(), SessionError> {
        let mut profiles = self.inner.snapshot.subscribe();
        let mut sessions = self.inner.session.subscribe();
        loop {
            if self.inner.ready_for(uid) {
                return Ok(());
            }
            let current = self.inner.session.current_user();
            if current.as_ref().map(|u| u.uid.as_str()) != Some(uid) {
                log::warn!("ProfileSession: {uid} signed out before its profile loaded");
                return Err(SessionError::MissingUser);
            }
            tokio::select! {
                changed = profiles.changed() => changed.map_err(|_| SessionError::MissingUser)?,
                changed = sessions.changed() => changed.map_err(|_| SessionError::MissingUser)?,
            }
        }
    }
}

impl<P: Record> ProfileInner<P> {
    async fn begin(self: Arc<Self>, user: &CurrentUser) {
        self.end_profile_session();

        let doc = CollectionRef::new(self.config.collection.as_str()).doc(user.uid.as_str());
        let mirror = DocumentMirror::new(Arc::clone(&self.store), doc, self.config.sync.clone());

        let seed = match (self.session.is_new(), user.is_anonymous) {
            (true, true) => Some(self.factory.default_profile(user)),
            (true, false) => Some(self.factory.profile_for(user)),
            (false, _) => None,
        };
        if let Some(profile) = seed {
            log::info!("ProfileSession: seeding profile for {}", user.uid);
            mirror.set_value(profile);
            if let Err(e) = mirror.commit().await {
                log::warn!("ProfileSession: failed to seed profile for {}: {e}", user.uid);
            }
        }

        let weak = Arc::downgrade(&self);
        let uid = user.uid.clone();
        mirror.on_change(move |result: &Result<P, SyncError>| {
            if let Some(inner) = weak.upgrade() {
                inner.profile_changed(&uid, result);
            }
        });

        *lock(&self.mirror) = Some(mirror.clone());
        log::info!("ProfileSession: starting profile session for {}", user.uid);
        if let Err(e) = mirror.start().await {
            log::warn!("ProfileSession: profile listener for {} failed: {e}", user.uid);
        }
    }

    fn profile_changed(&self, uid: &str, result: &Result<P, SyncError>) {
        match result {
            Ok(profile) => {
                log::debug!("ProfileSession: profile changed for {uid}");
                self.snapshot.send_replace(ProfileSnapshot {
                    user_id: Some(uid.to_string()),
                    profile: Some(profile.clone()),
                });
                self.factory.on_profile_change(profile);
            }
            Err(e) => {
                log::warn!("ProfileSession: profile for {uid} unreadable, signing out: {e}");
                if let Err(e) = self.signout() {
                    log::warn!("ProfileSession: sign-out failed: {e}");
                }
            }
        }
    }

    fn end_profile_session(&self) {
        // the guard must be gone before stop(): a dispatch that is signing
        // the user out takes this lock while holding the mirror's gate
        let mirror = lock(&self.mirror).take();
        if let Some(mirror) = mirror {
            log::info!("ProfileSession: ending profile session for {}", mirror.doc_ref().id());
            mirror.stop();
        }
        self.snapshot.send_replace(ProfileSnapshot::default());
    }

    fn signout(&self) -> Result<(), SessionError> {
        let result = self.session.signout();
        self.end_profile_session();
        result
    }

    fn ready_for(&self, uid: &str) -> bool {
        let snapshot = self.snapshot.borrow();
        snapshot.profile.is_some() && snapshot.user_id.as_deref() == Some(uid)
    }

    fn update<F: FnOnce(&mut P)>(&self, f: F) -> bool {
        let Some(mirror) = lock(&self.mirror).clone() else {
            return false;
        };
        if !mirror.update(f) {
            return false;
        }
        let profile = mirror.value();
        self.snapshot.send_modify(|s| s.profile = profile);
        true
    }

    async fn commit_profile(&self) -> Result<(), SessionError> {
        let mirror = lock(&self.mirror).clone();
        match mirror {
            Some(mirror) => {
                log::debug!("ProfileSession: committing profile {}", mirror.doc_ref());
                mirror.commit().await.map_err(SessionError::from)
            }
            None => Err(SessionError::Sync(SyncError::NothingToCommit)),
        }
    }
}

/// Session observer driving the profile lifecycle.
struct ProfileHooks<P: Record> {
    inner: Weak<ProfileInner<P>>,
}

#[async_trait]
impl<P: Record> SessionObserver for ProfileHooks<P> {
    async fn session_started(&self, user: &CurrentUser) {
        if let Some(inner) = self.inner.upgrade() {
            inner.begin(user).await;
        }
    }

    async fn session_ended(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.end_profile_session();
        }
    }
}
